//! Diagnostics sink for transfer progress.
//!
//! Sessions report what they are doing as structured [`TransferLog`]
//! entries. A sink renders them however it likes: into `tracing`, into a
//! caller-supplied callback (a UI log pane), or nowhere. Sinks are write-only;
//! nothing in the protocol reads them back.

use std::fmt;
use std::net::SocketAddr;

/// Structured log entry for one transfer step.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub peer: SocketAddr,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Responder: socket bound and waiting for requests
    Listening { bind_addr: SocketAddr },
    /// Requester: file request sent
    RequestSent { file_name: String },
    /// Requester: no size reply yet, request sent again
    RequestRetransmitted { attempt: u32 },
    /// Responder: file request received
    RequestReceived { file_name: String },
    /// Responder: request could not be resolved, not-found sentinel sent
    FileRejected { file_name: String, reason: String },
    /// Both: file size announced / learned
    SizeAnnounced { file_size: u64, chunks: u64 },
    /// Responder: chunk sent for the first time
    ChunkSent { seq: u32 },
    /// Responder: chunk sent again after a timeout or a wrong ack
    ChunkRetransmitted { seq: u32, attempt: u32 },
    /// Responder: ack for a different sequence number arrived
    AckMismatch { expected: u32, got: u32 },
    /// Requester: receive timed out while waiting for a chunk
    WaitingForChunk { seq: u32 },
    /// Requester: chunk written and acknowledged
    ChunkWritten { seq: u32, bytes: usize },
    /// Requester: chunk already written, acknowledged again
    DuplicateChunk { seq: u32 },
    /// Requester: chunk ahead of the expected one, dropped without ack
    OutOfOrderChunk { seq: u32, expected: u32 },
    /// Responder: concurrent session limit reached, request dropped
    SessionRejected { active: usize },
    /// Transfer complete
    TransferComplete {
        total_bytes: u64,
        chunks: u64,
        retransmits: u64,
        duration_ms: u64,
        sha256: String,
    },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { bind_addr } => write!(f, "listening on {}", bind_addr),
            Self::RequestSent { file_name } => write!(f, "requested {}", file_name),
            Self::RequestRetransmitted { attempt } => {
                write!(f, "no size reply, resending request (attempt {})", attempt)
            }
            Self::RequestReceived { file_name } => write!(f, "received request for {}", file_name),
            Self::FileRejected { file_name, reason } => {
                write!(f, "cannot serve {}: {}", file_name, reason)
            }
            Self::SizeAnnounced { file_size, chunks } => {
                write!(f, "file is {} bytes in {} packets", file_size, chunks)
            }
            Self::ChunkSent { seq } => write!(f, "sending packet {}", seq),
            Self::ChunkRetransmitted { seq, attempt } => {
                write!(f, "no acknowledgment for packet {}, resending (attempt {})", seq, attempt)
            }
            Self::AckMismatch { expected, got } => {
                write!(f, "got ack {} while waiting for ack {}", got, expected)
            }
            Self::WaitingForChunk { seq } => write!(f, "waiting for packet {}", seq),
            Self::ChunkWritten { seq, bytes } => {
                write!(f, "wrote packet {} ({} bytes)", seq, bytes)
            }
            Self::DuplicateChunk { seq } => write!(f, "duplicate packet {}, re-acknowledged", seq),
            Self::OutOfOrderChunk { seq, expected } => {
                write!(f, "dropped packet {} while expecting {}", seq, expected)
            }
            Self::SessionRejected { active } => {
                write!(f, "busy with {} transfers, request dropped", active)
            }
            Self::TransferComplete {
                total_bytes,
                chunks,
                retransmits,
                duration_ms,
                sha256,
            } => write!(
                f,
                "transfer complete: {} bytes, {} packets, {} retransmits in {} ms (sha256 {})",
                total_bytes, chunks, retransmits, duration_ms, sha256
            ),
            Self::Error { message } => write!(f, "error: {}", message),
        }
    }
}

impl fmt::Display for TransferLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}] {}", self.component, self.peer, self.event)
    }
}

/// Trait for transfer diagnostics. Implementations can forward to `tracing`,
/// to a UI callback, or discard entries.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        let peer = entry.peer.to_string();
        // Use info for lifecycle events, debug for per-packet spam
        match &entry.event {
            TransferEvent::Listening { .. }
            | TransferEvent::RequestSent { .. }
            | TransferEvent::RequestReceived { .. }
            | TransferEvent::FileRejected { .. }
            | TransferEvent::SizeAnnounced { .. }
            | TransferEvent::TransferComplete { .. } => {
                tracing::info!(component = entry.component, peer = %peer, "{}", entry.event);
            }
            TransferEvent::RequestRetransmitted { .. }
            | TransferEvent::ChunkRetransmitted { .. }
            | TransferEvent::SessionRejected { .. }
            | TransferEvent::Error { .. } => {
                tracing::warn!(component = entry.component, peer = %peer, "{}", entry.event);
            }
            _ => {
                tracing::debug!(component = entry.component, peer = %peer, "{}", entry.event);
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Logger that hands each rendered status line to a callback.
pub struct CallbackLogger {
    callback: Box<dyn Fn(&str) + Send + Sync>,
}

impl CallbackLogger {
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl TransferLogger for CallbackLogger {
    fn log(&self, entry: TransferLog) {
        (self.callback)(&entry.to_string());
    }
}
