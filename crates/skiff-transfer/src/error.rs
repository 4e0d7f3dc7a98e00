//! Error types for the transfer library.

use std::io;
use std::net::SocketAddr;

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("file name is {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("chunk payload is {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("{kind} needs {expected} bytes, got {actual}")]
    Truncated {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("file name is not printable UTF-8")]
    InvalidName,
}

/// Errors produced by the datagram transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("receive timed out")]
    Timeout,

    #[error("socket closed")]
    Closed,
}

/// Errors that end a single transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("encoding error: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("peer unreachable: no {waiting_for} after {attempts} attempts")]
    PeerUnreachable { waiting_for: String, attempts: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransferError {
    /// True when the socket was closed underneath the transfer (shutdown).
    pub fn is_closed(&self) -> bool {
        matches!(self, TransferError::Transport(TransportError::Closed))
    }
}
