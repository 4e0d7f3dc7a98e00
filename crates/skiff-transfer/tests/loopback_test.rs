//! End-to-end transfers over loopback UDP.

use std::net::{SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use skiff_transfer::protocol::{REQUEST_LEN, encode_request};
use skiff_transfer::{
    CallbackLogger, DispatchMode, NullLogger, RequestConfig, Responder, ResponderConfig,
    ShutdownHandle, TracingLogger, TransferError, request,
};

/// Route library logs to the test harness; `RUST_LOG=skiff_transfer=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct TestServer {
    addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: JoinHandle<Result<(), TransferError>>,
}

impl TestServer {
    fn start(root: &Path, mode: DispatchMode) -> Self {
        Self::start_with(ResponderConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            root: root.to_path_buf(),
            ack_timeout: Duration::from_millis(50),
            max_retries: Some(20),
            mode,
            logger: Arc::new(NullLogger),
        })
    }

    fn start_with(config: ResponderConfig) -> Self {
        let responder = Responder::bind(config).unwrap();
        let addr = responder.local_addr();
        let shutdown = responder.shutdown_handle();
        let thread = thread::spawn(move || responder.serve());
        Self {
            addr,
            shutdown,
            thread,
        }
    }

    fn stop(self) {
        self.shutdown.shutdown();
        self.thread.join().unwrap().unwrap();
    }
}

fn client_config(name: &str, server: SocketAddr, out_dir: &Path) -> RequestConfig {
    let mut config = RequestConfig::new(name, server, out_dir.join(name));
    config.timeout = Duration::from_millis(100);
    config.linger = Duration::from_millis(300);
    config.max_retries = Some(20);
    config.logger = Arc::new(NullLogger);
    config
}

fn sample(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random()).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[test]
fn transfers_file_in_three_chunks() {
    let served = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let data = sample(2500, 1);
    std::fs::write(served.path().join("report.bin"), &data).unwrap();

    let server = TestServer::start(served.path(), DispatchMode::Sequential);

    let lines = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut config = client_config("report.bin", server.addr, out.path());
    config.logger = {
        let lines = lines.clone();
        Arc::new(CallbackLogger::new(move |line| lines.lock().unwrap().push(line.to_string())))
    };

    let summary = request(&config).unwrap();
    assert_eq!(summary.file_size, 2500);
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.sha256, sha256_hex(&data));
    assert_eq!(std::fs::read(out.path().join("report.bin")).unwrap(), data);

    let lines = lines.lock().unwrap();
    assert!(lines.iter().any(|l| l.contains("file is 2500 bytes in 3 packets")));
    assert!(lines.last().unwrap().contains("transfer complete: 2500 bytes"));

    server.stop();
}

#[test]
fn transfers_empty_file() {
    let served = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    std::fs::write(served.path().join("empty.txt"), b"").unwrap();

    let server = TestServer::start(served.path(), DispatchMode::Sequential);
    let summary = request(&client_config("empty.txt", server.addr, out.path())).unwrap();

    assert_eq!(summary.file_size, 0);
    assert_eq!(summary.chunks, 0);
    assert_eq!(std::fs::metadata(out.path().join("empty.txt")).unwrap().len(), 0);
    server.stop();
}

#[test]
fn missing_file_is_reported_without_creating_output() {
    let served = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    let server = TestServer::start(served.path(), DispatchMode::Sequential);
    let err = request(&client_config("ghost.bin", server.addr, out.path())).unwrap_err();

    assert!(matches!(err, TransferError::FileNotFound(_)));
    assert!(!out.path().join("ghost.bin").exists());
    server.stop();
}

/// Forwards datagrams between one client and the server, dropping and
/// duplicating some in both directions.
struct LossyRelay {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl LossyRelay {
    fn start(server: SocketAddr, seed: u64, drop_rate: f64, dup_rate: f64) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let addr = socket.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = stop.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut client: Option<SocketAddr> = None;
                let mut buf = [0u8; 2048];
                while !stop.load(Ordering::Relaxed) {
                    let Ok((len, from)) = socket.recv_from(&mut buf) else {
                        continue;
                    };
                    let dest = if from == server {
                        match client {
                            Some(client) => client,
                            None => continue,
                        }
                    } else {
                        client = Some(from);
                        server
                    };
                    if rng.random_bool(drop_rate) {
                        continue;
                    }
                    let copies = if rng.random_bool(dup_rate) { 2 } else { 1 };
                    for _ in 0..copies {
                        let _ = socket.send_to(&buf[..len], dest);
                    }
                }
            })
        };

        Self { addr, stop, thread }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.thread.join().unwrap();
    }
}

#[test]
fn survives_loss_and_duplication() {
    let served = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let data = sample(64 * 1024 + 17, 2);
    std::fs::write(served.path().join("lossy.bin"), &data).unwrap();

    let server = TestServer::start(served.path(), DispatchMode::Sequential);
    let relay = LossyRelay::start(server.addr, 42, 0.15, 0.1);

    let summary = request(&client_config("lossy.bin", relay.addr, out.path())).unwrap();
    assert_eq!(summary.file_size, data.len() as u64);
    assert_eq!(summary.sha256, sha256_hex(&data));
    assert_eq!(std::fs::read(out.path().join("lossy.bin")).unwrap(), data);

    relay.stop();
    server.stop();
}

#[test]
fn duplicated_datagrams_do_not_multiply_traffic() {
    init_tracing();
    let served = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let data = sample(200 * 1024, 6);
    std::fs::write(served.path().join("dup.bin"), &data).unwrap();

    let mismatches = Arc::new(Mutex::new(0usize));
    let server = TestServer::start_with(ResponderConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        root: served.path().to_path_buf(),
        ack_timeout: Duration::from_millis(50),
        max_retries: Some(20),
        mode: DispatchMode::Sequential,
        logger: {
            let mismatches = mismatches.clone();
            Arc::new(CallbackLogger::new(move |line| {
                if line.contains("while waiting for ack") {
                    *mismatches.lock().unwrap() += 1;
                }
            }))
        },
    });
    // Duplicates only, nothing is lost.
    let relay = LossyRelay::start(server.addr, 7, 0.0, 0.05);

    let mut config = client_config("dup.bin", relay.addr, out.path());
    config.logger = Arc::new(TracingLogger);
    let summary = request(&config).unwrap();
    assert_eq!(summary.sha256, sha256_hex(&data));
    assert_eq!(std::fs::read(out.path().join("dup.bin")).unwrap(), data);
    assert_eq!(*mismatches.lock().unwrap(), 0);

    relay.stop();
    server.stop();
}

#[test]
fn concurrent_server_handles_two_requesters() {
    let served = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let first = sample(20_000, 3);
    let second = sample(9_000, 4);
    std::fs::write(served.path().join("first.bin"), &first).unwrap();
    std::fs::write(served.path().join("second.bin"), &second).unwrap();

    let server = TestServer::start(served.path(), DispatchMode::Concurrent { max_sessions: 4 });

    let clients: Vec<_> = ["first.bin", "second.bin"]
        .into_iter()
        .map(|name| {
            let config = client_config(name, server.addr, out.path());
            thread::spawn(move || request(&config))
        })
        .collect();
    for client in clients {
        client.join().unwrap().unwrap();
    }

    assert_eq!(std::fs::read(out.path().join("first.bin")).unwrap(), first);
    assert_eq!(std::fs::read(out.path().join("second.bin")).unwrap(), second);
    server.stop();
}

#[test]
fn shutdown_unblocks_idle_server_promptly() {
    let served = tempfile::tempdir().unwrap();
    for mode in [DispatchMode::Sequential, DispatchMode::Concurrent { max_sessions: 2 }] {
        let server = TestServer::start(served.path(), mode);
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        server.stop();
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_secs(1), "{mode:?} took {elapsed:?}");
    }
}

#[test]
fn sequential_server_survives_abandoned_transfer() {
    let served = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let data = sample(5000, 5);
    std::fs::write(served.path().join("data.bin"), &data).unwrap();

    let server = TestServer::start_with(ResponderConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        root: served.path().to_path_buf(),
        ack_timeout: Duration::from_millis(20),
        max_retries: Some(2),
        mode: DispatchMode::Sequential,
        logger: Arc::new(NullLogger),
    });

    // Ask for the file, then never acknowledge anything.
    let quitter = UdpSocket::bind("127.0.0.1:0").unwrap();
    quitter.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    quitter.send_to(&encode_request("data.bin").unwrap(), server.addr).unwrap();
    let mut buf = [0u8; REQUEST_LEN];
    let (len, _) = quitter.recv_from(&mut buf).unwrap();
    assert_eq!(len, 8);
    drop(quitter);

    let summary = request(&client_config("data.bin", server.addr, out.path())).unwrap();
    assert_eq!(summary.sha256, sha256_hex(&data));
    server.stop();
}
