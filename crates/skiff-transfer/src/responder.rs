//! Responder: serve files from a root directory, one chunk at a time.
//!
//! Each request runs the same session: resolve the name, announce the size
//! (or the not-found sentinel), then send chunk `n` and resend it until
//! `Ack(n)` arrives. Sessions run either one after another on the listening
//! thread ([`DispatchMode::Sequential`]) or on a worker thread per requester
//! ([`DispatchMode::Concurrent`]), where a dispatcher routes inbound
//! datagrams to workers by source address.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError, bounded, unbounded};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{TransferError, TransportError};
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::*;
use crate::requester::DEFAULT_MAX_RETRIES;
use crate::transport::{ChannelLink, DatagramSocket, Link, PeerLink, ShutdownHandle};
use crate::validation::resolve_served_path;

const COMPONENT: &str = "responder";

/// Datagrams queued per session before the dispatcher starts dropping them.
const SESSION_INBOX: usize = 64;

/// How often the concurrent dispatcher wakes up to reap finished sessions.
const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Default cap on concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 16;

/// How requests are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Finish one transfer before accepting the next request.
    Sequential,
    /// One worker thread per requester, at most `max_sessions` at a time.
    Concurrent { max_sessions: usize },
}

/// Responder configuration.
pub struct ResponderConfig {
    pub bind_addr: SocketAddr,
    /// Directory requested names are resolved against.
    pub root: PathBuf,
    pub ack_timeout: Duration,
    /// Resends of one chunk before the requester is declared unreachable.
    /// `None` resends forever.
    pub max_retries: Option<u32>,
    pub mode: DispatchMode,
    pub logger: Arc<dyn TransferLogger>,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            root: PathBuf::from("."),
            ack_timeout: DEFAULT_TIMEOUT,
            max_retries: Some(DEFAULT_MAX_RETRIES),
            mode: DispatchMode::Sequential,
            logger: Arc::new(TracingLogger),
        }
    }
}

impl ResponderConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            root: self.root.clone(),
            ack_timeout: self.ack_timeout,
            max_retries: self.max_retries,
            logger: self.logger.clone(),
        }
    }
}

/// Per-session settings, shared by value with worker threads.
#[derive(Clone)]
pub struct SessionOptions {
    pub root: PathBuf,
    pub ack_timeout: Duration,
    pub max_retries: Option<u32>,
    pub logger: Arc<dyn TransferLogger>,
}

impl SessionOptions {
    fn log(&self, peer: SocketAddr, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            peer,
            event,
        });
    }
}

/// Result of one served request.
#[derive(Debug, Clone)]
pub struct ServeSummary {
    pub file_size: u64,
    pub chunks: u64,
    pub retransmits: u64,
    pub sha256: String,
    pub elapsed: Duration,
}

/// A bound responder. [`Responder::serve`] blocks until the socket is closed
/// through a [`ShutdownHandle`].
pub struct Responder {
    socket: Arc<DatagramSocket>,
    config: ResponderConfig,
}

impl Responder {
    pub fn bind(config: ResponderConfig) -> Result<Self, TransferError> {
        let socket = DatagramSocket::open(config.bind_addr)?;
        let local_addr = socket.local_addr();
        config.logger.log(TransferLog {
            component: COMPONENT,
            peer: local_addr,
            event: TransferEvent::Listening {
                bind_addr: local_addr,
            },
        });
        Ok(Self {
            socket: Arc::new(socket),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.socket.shutdown_handle()
    }

    /// Serve requests until shut down. A failed transfer is logged and the
    /// loop moves on to the next request.
    pub fn serve(&self) -> Result<(), TransferError> {
        let result = match self.config.mode {
            DispatchMode::Sequential => self.serve_sequential(),
            DispatchMode::Concurrent { max_sessions } => self.serve_concurrent(max_sessions.max(1)),
        };
        info!("responder on {} stopped", self.local_addr());
        result
    }

    fn serve_sequential(&self) -> Result<(), TransferError> {
        let opts = self.config.session_options();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf, None) {
                Ok(received) => received,
                Err(TransportError::Closed) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let mut link = PeerLink::new(&self.socket, peer);
            let result = serve_request(&mut link, &buf[..len], &opts);
            if report(result, peer, &opts) {
                return Ok(());
            }
        }
    }

    fn serve_concurrent(&self, max_sessions: usize) -> Result<(), TransferError> {
        let opts = self.config.session_options();
        let (done_tx, done_rx) = unbounded::<(SocketAddr, u64)>();
        let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
        let mut next_id = 0u64;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        let result = loop {
            for (peer, id) in done_rx.try_iter() {
                // A newer session for the same peer may already hold the slot.
                if sessions.get(&peer).is_some_and(|s| s.id == id) {
                    if let Some(session) = sessions.remove(&peer) {
                        session.join();
                    }
                }
            }

            let (len, peer) = match self.socket.recv_from(&mut buf, Some(REAP_INTERVAL)) {
                Ok(received) => received,
                Err(TransportError::Timeout) => continue,
                Err(TransportError::Closed) => break Ok(()),
                Err(e) => break Err(e.into()),
            };
            let mut datagram = buf[..len].to_vec();

            if let Some(session) = sessions.get(&peer) {
                match session.inbox.try_send(datagram) {
                    Ok(()) => continue,
                    Err(TrySendError::Full(_)) => {
                        debug!("session inbox for {} full, dropping datagram", peer);
                        continue;
                    }
                    // Worker exited but has not been reaped yet.
                    Err(TrySendError::Disconnected(returned)) => {
                        if let Some(session) = sessions.remove(&peer) {
                            session.join();
                        }
                        datagram = returned;
                    }
                }
            }

            if !is_request(&datagram) {
                debug!("ignoring {} byte datagram from {} outside a session", len, peer);
                continue;
            }
            if sessions.len() >= max_sessions {
                opts.log(
                    peer,
                    TransferEvent::SessionRejected {
                        active: sessions.len(),
                    },
                );
                continue;
            }

            next_id += 1;
            match spawn_session(
                next_id,
                peer,
                datagram,
                self.socket.clone(),
                opts.clone(),
                done_tx.clone(),
            ) {
                Ok(session) => {
                    sessions.insert(peer, session);
                }
                Err(e) => warn!("cannot start session for {}: {}", peer, e),
            }
        };

        // Dropping the inboxes ends workers blocked on a receive.
        for (_, session) in sessions.drain() {
            session.join();
        }
        result
    }
}

struct Session {
    id: u64,
    inbox: Sender<Vec<u8>>,
    handle: JoinHandle<()>,
}

impl Session {
    fn join(self) {
        let Session { id, inbox, handle } = self;
        drop(inbox);
        if handle.join().is_err() {
            warn!("session {} panicked", id);
        }
    }
}

fn spawn_session(
    id: u64,
    peer: SocketAddr,
    request: Vec<u8>,
    socket: Arc<DatagramSocket>,
    opts: SessionOptions,
    done_tx: Sender<(SocketAddr, u64)>,
) -> std::io::Result<Session> {
    let (inbox, inbox_rx) = bounded::<Vec<u8>>(SESSION_INBOX);
    let handle = thread::Builder::new()
        .name(format!("skiff-session-{id}"))
        .spawn(move || {
            let mut link = ChannelLink::new(socket, peer, inbox_rx);
            let result = serve_request(&mut link, &request, &opts);
            report(result, peer, &opts);
            let _ = done_tx.send((peer, id));
        })?;
    Ok(Session { id, inbox, handle })
}

/// Log a session outcome. Returns true when the socket was closed.
fn report(
    result: Result<Option<ServeSummary>, TransferError>,
    peer: SocketAddr,
    opts: &SessionOptions,
) -> bool {
    match result {
        Ok(_) => false,
        Err(e) if e.is_closed() => true,
        // Already reported as FileRejected.
        Err(TransferError::FileNotFound(_)) => false,
        Err(e) => {
            opts.log(
                peer,
                TransferEvent::Error {
                    message: e.to_string(),
                },
            );
            false
        }
    }
}

/// Acks are four bytes; anything else that decodes as a name is a request.
fn is_request(datagram: &[u8]) -> bool {
    datagram.len() != ACK_LEN && decode_request(datagram).is_ok()
}

/// Bind `0.0.0.0:port` with default settings and serve until shut down.
pub fn serve(port: u16, logger: Arc<dyn TransferLogger>) -> Result<(), TransferError> {
    if port == 0 {
        return Err(TransferError::InvalidArgument(
            "port must be between 1 and 65535".into(),
        ));
    }
    let config = ResponderConfig {
        bind_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
        logger,
        ..Default::default()
    };
    Responder::bind(config)?.serve()
}

/// Handle one request datagram end to end.
///
/// Returns `Ok(None)` when the datagram is not a file request; nothing is
/// sent back in that case. A name that cannot be served gets the not-found
/// sentinel and returns [`TransferError::FileNotFound`].
pub fn serve_request<L: Link>(
    link: &mut L,
    request: &[u8],
    opts: &SessionOptions,
) -> Result<Option<ServeSummary>, TransferError> {
    let peer = link.peer();
    if !is_request(request) {
        debug!("ignoring {} byte datagram from {}: not a file request", request.len(), peer);
        return Ok(None);
    }
    let file_name = decode_request(request)?;
    opts.log(
        peer,
        TransferEvent::RequestReceived {
            file_name: file_name.clone(),
        },
    );

    let (file, file_size) = match open_served_file(&opts.root, &file_name) {
        Ok(opened) => opened,
        Err(e) => {
            link.send(&encode_size_reply(NOT_FOUND))?;
            opts.log(
                peer,
                TransferEvent::FileRejected {
                    file_name,
                    reason: e.to_string(),
                },
            );
            return Err(e);
        }
    };

    let announce = encode_size_reply(file_size as i64);
    link.send(&announce)?;
    let sender = ChunkSender::new(file, file_size);
    opts.log(
        peer,
        TransferEvent::SizeAnnounced {
            file_size,
            chunks: sender.total_chunks(),
        },
    );

    send_file(link, sender, &announce, opts).map(Some)
}

fn open_served_file(root: &Path, name: &str) -> Result<(File, u64), TransferError> {
    let path = resolve_served_path(root, name)?;
    let file = File::open(&path).map_err(|e| TransferError::FileNotFound(format!("{name}: {e}")))?;
    let file_size = file
        .metadata()
        .map_err(|e| TransferError::FileNotFound(format!("{name}: {e}")))?
        .len();

    if i64::try_from(file_size).is_err() || chunk_count(file_size) > u64::from(u32::MAX) + 1 {
        return Err(TransferError::FileNotFound(format!(
            "{name}: {file_size} bytes is too large to send"
        )));
    }
    Ok((file, file_size))
}

/// Send every chunk from `sender`, resending each until it is acknowledged.
///
/// `announce` is the size reply already sent; a repeated request while
/// chunk 0 is outstanding means it was lost, so it is sent again.
pub fn send_file<L: Link, R: Read>(
    link: &mut L,
    mut sender: ChunkSender<R>,
    announce: &[u8],
    opts: &SessionOptions,
) -> Result<ServeSummary, TransferError> {
    let started = Instant::now();
    let peer = link.peer();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut retransmits = 0u64;

    while let Some(chunk) = sender.next_chunk()? {
        let seq = chunk.seq;
        link.send(&chunk.datagram)?;
        opts.log(peer, TransferEvent::ChunkSent { seq });

        let mut attempts = 0u32;
        let mut deadline = Instant::now() + opts.ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = if remaining.is_zero() {
                Err(TransportError::Timeout)
            } else {
                link.recv(&mut buf, Some(remaining))
            };

            match received {
                Ok(len) if len == REQUEST_LEN => {
                    if seq != 0 {
                        continue;
                    }
                    link.send(announce)?;
                }
                Ok(len) if len != ACK_LEN => {
                    debug!("ignoring {} byte datagram while waiting for ack {}", len, seq);
                    continue;
                }
                Ok(len) => {
                    let got = decode_ack(&buf[..len])?;
                    if got == seq {
                        break;
                    }
                    // Re-ack of a duplicate of an earlier chunk; never a resend.
                    if got < seq {
                        debug!("ignoring stale ack {} while waiting for ack {}", got, seq);
                        continue;
                    }
                    opts.log(peer, TransferEvent::AckMismatch { expected: seq, got });
                }
                Err(TransportError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }

            attempts += 1;
            if opts.max_retries.is_some_and(|max| attempts > max) {
                return Err(TransferError::PeerUnreachable {
                    waiting_for: format!("ack {seq}"),
                    attempts: attempts - 1,
                });
            }
            link.send(&chunk.datagram)?;
            retransmits += 1;
            deadline = Instant::now() + opts.ack_timeout;
            opts.log(peer, TransferEvent::ChunkRetransmitted { seq, attempt: attempts });
        }
    }

    let chunks = sender.total_chunks();
    let file_size = sender.file_size();
    let sha256 = sender.finish();
    let elapsed = started.elapsed();
    opts.log(
        peer,
        TransferEvent::TransferComplete {
            total_bytes: file_size,
            chunks,
            retransmits,
            duration_ms: elapsed.as_millis() as u64,
            sha256: sha256.clone(),
        },
    );

    Ok(ServeSummary {
        file_size,
        chunks,
        retransmits,
        sha256,
        elapsed,
    })
}

/// One encoded chunk, kept around for retransmission.
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    pub seq: u32,
    pub datagram: Vec<u8>,
}

/// Reads a file sequentially and frames it into padded chunk datagrams.
pub struct ChunkSender<R: Read> {
    reader: BufReader<R>,
    file_size: u64,
    total_chunks: u64,
    next_seq: u64,
    hasher: Sha256,
}

impl<R: Read> ChunkSender<R> {
    pub fn new(reader: R, file_size: u64) -> Self {
        Self {
            reader: BufReader::new(reader),
            file_size,
            total_chunks: chunk_count(file_size),
            next_seq: 0,
            hasher: Sha256::new(),
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Read and frame the next chunk. `None` once every chunk was produced.
    pub fn next_chunk(&mut self) -> Result<Option<OutboundChunk>, TransferError> {
        if self.next_seq >= self.total_chunks {
            return Ok(None);
        }
        let seq = u32::try_from(self.next_seq).map_err(|_| {
            TransferError::Protocol(format!("sequence number {} out of range", self.next_seq))
        })?;
        let len = chunk_len(self.file_size, self.next_seq);

        let mut payload = [0u8; CHUNK_PAYLOAD];
        self.reader
            .read_exact(&mut payload[..len])
            .map_err(TransferError::Read)?;
        self.hasher.update(&payload[..len]);
        self.next_seq += 1;

        Ok(Some(OutboundChunk {
            seq,
            datagram: encode_chunk(seq, &payload)?,
        }))
    }

    /// Hex SHA-256 of the bytes read so far.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
