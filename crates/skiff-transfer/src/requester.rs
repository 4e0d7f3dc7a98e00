//! Requester: ask a responder for a file and reassemble it on disk.
//!
//! ```text
//! Idle --request--> AwaitingSizeReply --size--> ReceivingChunk(0..n) --> Done
//!                          |                            |
//!                          +---------> Failed <---------+
//! ```
//!
//! The responder owns retransmission. This side only acknowledges the chunk
//! it expects next, re-acknowledges chunks it already wrote (their ack was
//! lost), and drops anything ahead of the expected sequence number without
//! acknowledging it, so the responder's timer resends the right chunk.

use std::fs::File;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::{TransferError, TransportError};
use crate::logging::{TracingLogger, TransferEvent, TransferLog, TransferLogger};
use crate::protocol::*;
use crate::transport::{DatagramSocket, Link, PeerLink};

const COMPONENT: &str = "requester";

/// Chunks written between fsyncs of the output file.
pub const DEFAULT_FLUSH_EVERY: u32 = 10;

/// Consecutive timeouts tolerated in one state before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 20;

/// Configuration for one file request.
pub struct RequestConfig {
    pub file_name: String,
    pub server_addr: SocketAddr,
    pub output_path: PathBuf,
    /// Local bind address. `None` picks an ephemeral port on the unspecified
    /// address of the server's family.
    pub bind_addr: Option<SocketAddr>,
    pub timeout: Duration,
    /// `None` waits forever.
    pub max_retries: Option<u32>,
    /// Quiet period after the last chunk during which retransmissions of the
    /// final chunk are still acknowledged.
    pub linger: Duration,
    pub flush_every: u32,
    pub logger: Arc<dyn TransferLogger>,
}

impl RequestConfig {
    pub fn new(
        file_name: impl Into<String>,
        server_addr: SocketAddr,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            server_addr,
            output_path: output_path.into(),
            bind_addr: None,
            timeout: DEFAULT_TIMEOUT,
            max_retries: Some(DEFAULT_MAX_RETRIES),
            linger: DEFAULT_TIMEOUT * 2,
            flush_every: DEFAULT_FLUSH_EVERY,
            logger: Arc::new(TracingLogger),
        }
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: COMPONENT,
            peer: self.server_addr,
            event,
        });
    }
}

/// Result of a completed request.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub file_size: u64,
    pub chunks: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub sha256: String,
    pub elapsed: Duration,
}

/// Validate a host/port pair and resolve it to a socket address.
pub fn resolve_endpoint(host: &str, port: u16) -> Result<SocketAddr, TransferError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(TransferError::InvalidArgument("server address is empty".into()));
    }
    if port == 0 {
        return Err(TransferError::InvalidArgument(
            "port must be between 1 and 65535".into(),
        ));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| TransferError::InvalidArgument(format!("cannot resolve {host}: {e}")))?
        .next()
        .ok_or_else(|| TransferError::InvalidArgument(format!("no address for {host}")))
}

/// Request a file and write it to `config.output_path`.
///
/// Arguments are validated before any socket is opened.
pub fn request(config: &RequestConfig) -> Result<TransferSummary, TransferError> {
    validate(config)?;

    let bind_addr = config.bind_addr.unwrap_or_else(|| {
        let ip = match config.server_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, 0)
    });
    let socket = DatagramSocket::open(bind_addr)?;
    let mut link = PeerLink::new(&socket, config.server_addr);
    receive_file(&mut link, config)
}

fn validate(config: &RequestConfig) -> Result<(), TransferError> {
    if config.file_name.trim().is_empty() {
        return Err(TransferError::InvalidArgument("file name is empty".into()));
    }
    if config.server_addr.port() == 0 {
        return Err(TransferError::InvalidArgument(
            "port must be between 1 and 65535".into(),
        ));
    }
    encode_request(&config.file_name)?;
    Ok(())
}

/// Run the requester state machine over an already-open link.
pub fn receive_file<L: Link>(
    link: &mut L,
    config: &RequestConfig,
) -> Result<TransferSummary, TransferError> {
    let started = Instant::now();
    let request = encode_request(&config.file_name)?;

    link.send(&request)?;
    config.log(TransferEvent::RequestSent {
        file_name: config.file_name.clone(),
    });

    let file_size = await_size_reply(link, &request, config)?;
    let total_chunks = chunk_count(file_size);
    if total_chunks > u64::from(u32::MAX) + 1 {
        return Err(TransferError::Protocol(format!(
            "file of {file_size} bytes needs more sequence numbers than the protocol has"
        )));
    }
    config.log(TransferEvent::SizeAnnounced {
        file_size,
        chunks: total_chunks,
    });

    let file = File::create(&config.output_path).map_err(TransferError::Write)?;
    let mut receiver = ChunkReceiver::new(file, file_size, config.flush_every);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut idle = 0u32;

    while !receiver.is_complete() {
        let len = match link.recv(&mut buf, Some(config.timeout)) {
            Ok(len) => len,
            Err(TransportError::Timeout) => {
                idle += 1;
                let seq = receiver.expected_seq();
                if exhausted(idle, config.max_retries) {
                    return Err(TransferError::PeerUnreachable {
                        waiting_for: format!("packet {seq}"),
                        attempts: idle - 1,
                    });
                }
                config.log(TransferEvent::WaitingForChunk { seq });
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        idle = 0;

        match receiver.accept(&buf[..len])? {
            ChunkVerdict::Accepted { seq, bytes } => {
                link.send(&encode_ack(seq))?;
                config.log(TransferEvent::ChunkWritten { seq, bytes });
            }
            ChunkVerdict::Duplicate { seq } => {
                link.send(&encode_ack(seq))?;
                config.log(TransferEvent::DuplicateChunk { seq });
            }
            ChunkVerdict::OutOfOrder { seq, expected } => {
                config.log(TransferEvent::OutOfOrderChunk { seq, expected });
            }
            ChunkVerdict::Malformed { len } => {
                tracing::debug!("ignoring {} byte datagram that is not a data chunk", len);
            }
        }
    }

    let (_file, stats) = receiver.finish()?;
    if stats.chunks > 0 {
        linger(link, stats.chunks, config);
    }

    let elapsed = started.elapsed();
    config.log(TransferEvent::TransferComplete {
        total_bytes: stats.bytes_written,
        chunks: stats.chunks,
        retransmits: stats.duplicates,
        duration_ms: elapsed.as_millis() as u64,
        sha256: stats.sha256.clone(),
    });

    Ok(TransferSummary {
        file_size,
        chunks: stats.chunks,
        duplicates: stats.duplicates,
        out_of_order: stats.out_of_order,
        sha256: stats.sha256,
        elapsed,
    })
}

/// Wait for the size reply, resending the request on every timeout.
fn await_size_reply<L: Link>(
    link: &mut L,
    request: &[u8],
    config: &RequestConfig,
) -> Result<u64, TransferError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut attempts = 0u32;

    loop {
        match link.recv(&mut buf, Some(config.timeout)) {
            Ok(len) if len == SIZE_REPLY_LEN => {
                return match decode_size_reply(&buf[..len])? {
                    NOT_FOUND => Err(TransferError::FileNotFound(config.file_name.clone())),
                    size if size < 0 => {
                        Err(TransferError::Protocol(format!("negative file size {size}")))
                    }
                    size => Ok(size as u64),
                };
            }
            // A chunk before any size reply: the reply was lost. Asking
            // again makes the responder repeat it.
            Ok(len) => {
                tracing::debug!("got {} byte datagram while awaiting size reply", len);
            }
            Err(TransportError::Timeout) => {}
            Err(e) => return Err(e.into()),
        }

        attempts += 1;
        if exhausted(attempts, config.max_retries) {
            return Err(TransferError::PeerUnreachable {
                waiting_for: "size reply".into(),
                attempts: attempts - 1,
            });
        }
        link.send(request)?;
        config.log(TransferEvent::RequestRetransmitted { attempt: attempts });
    }
}

/// Keep acknowledging retransmitted chunks until the responder goes quiet.
fn linger<L: Link>(link: &mut L, total_chunks: u64, config: &RequestConfig) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while let Ok(len) = link.recv(&mut buf, Some(config.linger)) {
        let Ok((seq, _)) = decode_chunk(&buf[..len]) else {
            continue;
        };
        if len == SIZE_REPLY_LEN || u64::from(seq) >= total_chunks {
            continue;
        }
        if let Err(e) = link.send(&encode_ack(seq)) {
            tracing::debug!("could not re-acknowledge packet {}: {}", seq, e);
            return;
        }
        config.log(TransferEvent::DuplicateChunk { seq });
    }
}

fn exhausted(attempts: u32, max_retries: Option<u32>) -> bool {
    max_retries.is_some_and(|max| attempts > max)
}

/// Destination for reassembled file bytes.
pub trait ChunkSink: Write {
    /// Push written bytes to durable storage.
    fn sync(&mut self) -> io::Result<()>;
}

impl ChunkSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

impl ChunkSink for Vec<u8> {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// What the receiver did with one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// Expected chunk: written, must be acknowledged.
    Accepted { seq: u32, bytes: usize },
    /// Already written: acknowledge again, write nothing.
    Duplicate { seq: u32 },
    /// Ahead of the expected chunk: neither written nor acknowledged.
    OutOfOrder { seq: u32, expected: u32 },
    /// Not a usable chunk.
    Malformed { len: usize },
}

/// Totals reported by [`ChunkReceiver::finish`].
#[derive(Debug, Clone)]
pub struct ReceiveStats {
    pub bytes_written: u64,
    pub chunks: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub sha256: String,
}

/// Ordered, write-once reassembly of a chunk stream.
///
/// Only the chunk equal to the expected sequence number is written, so a
/// chunk delivered any number of times lands in the sink exactly once.
pub struct ChunkReceiver<W: ChunkSink> {
    sink: W,
    file_size: u64,
    total_chunks: u64,
    next_seq: u64,
    bytes_written: u64,
    flush_every: u32,
    since_sync: u32,
    duplicates: u64,
    out_of_order: u64,
    hasher: Sha256,
}

impl<W: ChunkSink> ChunkReceiver<W> {
    pub fn new(sink: W, file_size: u64, flush_every: u32) -> Self {
        Self {
            sink,
            file_size,
            total_chunks: chunk_count(file_size),
            next_seq: 0,
            bytes_written: 0,
            flush_every,
            since_sync: 0,
            duplicates: 0,
            out_of_order: 0,
            hasher: Sha256::new(),
        }
    }

    pub fn expected_seq(&self) -> u32 {
        self.next_seq as u32
    }

    pub fn is_complete(&self) -> bool {
        self.next_seq >= self.total_chunks
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Classify an inbound datagram and write it if it is the expected chunk.
    pub fn accept(&mut self, datagram: &[u8]) -> Result<ChunkVerdict, TransferError> {
        // A stray size reply would otherwise decode as a tiny chunk.
        if datagram.len() == SIZE_REPLY_LEN {
            return Ok(ChunkVerdict::Malformed { len: datagram.len() });
        }
        let Ok((seq, payload)) = decode_chunk(datagram) else {
            return Ok(ChunkVerdict::Malformed { len: datagram.len() });
        };

        let seq_index = u64::from(seq);
        if seq_index < self.next_seq {
            self.duplicates += 1;
            return Ok(ChunkVerdict::Duplicate { seq });
        }
        if seq_index > self.next_seq || self.is_complete() {
            self.out_of_order += 1;
            return Ok(ChunkVerdict::OutOfOrder {
                seq,
                expected: self.expected_seq(),
            });
        }

        let bytes = chunk_len(self.file_size, seq_index);
        if payload.len() < bytes {
            return Ok(ChunkVerdict::Malformed { len: datagram.len() });
        }

        let data = &payload[..bytes];
        self.sink.write_all(data).map_err(TransferError::Write)?;
        self.hasher.update(data);
        self.bytes_written += bytes as u64;
        self.next_seq += 1;
        self.since_sync += 1;

        if self.flush_every > 0 && self.since_sync >= self.flush_every {
            self.sync()?;
        }

        Ok(ChunkVerdict::Accepted { seq, bytes })
    }

    /// Flush and sync the sink, returning it with the transfer totals.
    pub fn finish(mut self) -> Result<(W, ReceiveStats), TransferError> {
        self.sync()?;
        let stats = ReceiveStats {
            bytes_written: self.bytes_written,
            chunks: self.next_seq,
            duplicates: self.duplicates,
            out_of_order: self.out_of_order,
            sha256: hex::encode(self.hasher.finalize()),
        };
        Ok((self.sink, stats))
    }

    fn sync(&mut self) -> Result<(), TransferError> {
        self.sink.flush().map_err(TransferError::Write)?;
        self.sink.sync().map_err(TransferError::Write)?;
        self.since_sync = 0;
        Ok(())
    }
}
