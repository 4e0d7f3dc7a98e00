/// Skiff Transfer: stop-and-wait file transfer over UDP.
///
/// Provides reliable delivery of a single named file over a lossy datagram
/// transport with:
/// - Fixed 1024-byte datagrams: request, size reply, data chunk, ack
/// - One chunk in flight, resent until its ack arrives
/// - Ordered write-once reassembly on the requesting side
/// - Bounded retries on both sides
/// - Sequential or thread-per-session serving
/// - SHA-256 of the transferred bytes for diagnostics

pub mod error;
pub mod logging;
pub mod protocol;
pub mod requester;
pub mod responder;
pub mod transport;
pub mod validation;

#[cfg(test)]
mod testing;

// Re-export key types for convenience.
pub use error::{CodecError, TransferError, TransportError};
pub use logging::{
    CallbackLogger, NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger,
};
pub use protocol::{CHUNK_PAYLOAD, DEFAULT_PORT, DEFAULT_TIMEOUT, MAX_DATAGRAM, NOT_FOUND};
pub use requester::{
    ChunkReceiver, ChunkVerdict, RequestConfig, TransferSummary, request, resolve_endpoint,
};
pub use responder::{
    ChunkSender, DispatchMode, Responder, ResponderConfig, ServeSummary, SessionOptions, serve,
    serve_request,
};
pub use transport::{DatagramSocket, Link, ShutdownHandle};
