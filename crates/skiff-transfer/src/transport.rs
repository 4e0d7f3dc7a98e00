//! Datagram transport.
//!
//! [`DatagramSocket`] is a blocking UDP socket whose receives take an
//! optional deadline. Receives wait in short slices of [`POLL_INTERVAL`] and
//! check a close flag between slices, so [`ShutdownHandle::shutdown`] from
//! another thread makes an in-flight receive fail with
//! [`TransportError::Closed`] instead of hanging.
//!
//! [`Link`] is the per-session view used by the state machines: one peer,
//! send and receive-with-timeout. [`PeerLink`] reads straight from a socket
//! and drops datagrams from other endpoints. [`ChannelLink`] reads from a
//! channel fed by the concurrent dispatcher and only shares the socket for
//! sending.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::error::TransportError;

/// Longest uninterrupted wait inside a receive.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest read timeout handed to the OS (zero would mean "block forever").
const MIN_SLICE: Duration = Duration::from_millis(1);

/// OS socket buffer size (1 MB).
const SOCKET_BUFFER: usize = 1024 * 1024;

/// Retries for a send that hits a full OS buffer.
const SEND_RETRIES: u32 = 50;

/// Cloneable handle that closes a [`DatagramSocket`] from any thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    closed: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Close the socket. Idempotent.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A connectionless UDP socket with deadline-based receives.
#[derive(Debug)]
pub struct DatagramSocket {
    inner: UdpSocket,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
}

impl DatagramSocket {
    /// Bind a socket. Port 0 asks the OS for an ephemeral port.
    pub fn open(bind_addr: SocketAddr) -> Result<Self, TransportError> {
        let bind_err = |source: io::Error| TransportError::Bind {
            addr: bind_addr,
            source,
        };

        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_err)?;
        socket.set_nonblocking(false).map_err(bind_err)?;
        if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER) {
            warn!("failed to set UDP recv buffer: {}", e);
        }
        socket.set_read_timeout(Some(POLL_INTERVAL)).map_err(bind_err)?;
        socket.bind(&bind_addr.into()).map_err(bind_err)?;

        let inner: UdpSocket = socket.into();
        let local_addr = inner.local_addr().map_err(bind_err)?;
        debug!("UDP socket bound on {}", local_addr);

        Ok(Self {
            inner,
            local_addr,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            closed: self.closed.clone(),
        }
    }

    /// Close the socket. Idempotent; pending receives return `Closed` within one poll slice.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one datagram. Best effort: success means the OS accepted it.
    pub fn send_to(&self, bytes: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        // ENOBUFS means the send buffer is full; back off briefly and retry.
        let mut retries = 0;
        loop {
            match self.inner.send_to(bytes, dest) {
                Ok(_) => return Ok(()),
                Err(ref e)
                    if retries < SEND_RETRIES
                        && (e.kind() == io::ErrorKind::WouldBlock
                            || e.raw_os_error() == Some(105)
                            || e.raw_os_error() == Some(10055)) =>
                {
                    retries += 1;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(TransportError::Send(e)),
            }
        }
    }

    /// Receive one datagram into `buf`.
    ///
    /// `timeout` of `None` or zero blocks until a datagram arrives or the
    /// socket is closed.
    pub fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<(usize, SocketAddr), TransportError> {
        let deadline = timeout.filter(|t| !t.is_zero()).map(|t| Instant::now() + t);

        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            self.inner
                .set_read_timeout(Some(slice.max(MIN_SLICE)))
                .map_err(TransportError::Receive)?;

            match self.inner.recv_from(buf) {
                Ok(received) => {
                    if self.is_closed() {
                        return Err(TransportError::Closed);
                    }
                    return Ok(received);
                }
                // Windows returns TimedOut, Unix returns WouldBlock
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                // ICMP port unreachable from an earlier send; the peer is gone, not us.
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    trace!("ignoring ICMP error on receive: {}", e);
                }
                Err(e) => return Err(TransportError::Receive(e)),
            }
        }
    }
}

/// One side of a transfer session: a single peer and a timed receive.
pub trait Link {
    fn peer(&self) -> SocketAddr;

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Receive the next datagram from the peer. `None` blocks indefinitely.
    fn recv(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError>;
}

/// Link that reads directly from a socket, ignoring other endpoints.
pub struct PeerLink<'a> {
    socket: &'a DatagramSocket,
    peer: SocketAddr,
}

impl<'a> PeerLink<'a> {
    pub fn new(socket: &'a DatagramSocket, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl Link for PeerLink<'_> {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(bytes, self.peer)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let deadline = timeout.filter(|t| !t.is_zero()).map(|t| Instant::now() + t);
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            let (len, from) = self.socket.recv_from(buf, remaining)?;
            if from == self.peer {
                return Ok(len);
            }
            debug!("dropping {} byte datagram from {} (session peer is {})", len, from, self.peer);
        }
    }
}

/// Link fed by the concurrent dispatcher. The socket is shared for sending only.
pub struct ChannelLink {
    socket: Arc<DatagramSocket>,
    peer: SocketAddr,
    inbox: Receiver<Vec<u8>>,
}

impl ChannelLink {
    pub fn new(socket: Arc<DatagramSocket>, peer: SocketAddr, inbox: Receiver<Vec<u8>>) -> Self {
        Self {
            socket,
            peer,
            inbox,
        }
    }
}

impl Link for ChannelLink {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(bytes, self.peer)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, TransportError> {
        let datagram = match timeout.filter(|t| !t.is_zero()) {
            Some(timeout) => self.inbox.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => TransportError::Timeout,
                RecvTimeoutError::Disconnected => TransportError::Closed,
            })?,
            None => self.inbox.recv().map_err(|_| TransportError::Closed)?,
        };
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }
}
