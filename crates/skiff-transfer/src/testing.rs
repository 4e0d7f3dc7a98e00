//! In-memory [`Link`] for driving the state machines without sockets.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::Link;

/// Replays a fixed script of inbound datagrams and records everything sent.
/// An exhausted script behaves like a silent peer: every receive times out.
pub(crate) struct ScriptedLink {
    pub inbound: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub timeouts: u32,
}

/// Marker in a script for "this receive times out".
pub(crate) const TIMEOUT: Vec<u8> = Vec::new();

impl ScriptedLink {
    pub fn new(script: Vec<Vec<u8>>) -> Self {
        Self {
            inbound: script.into(),
            sent: Vec::new(),
            timeouts: 0,
        }
    }
}

impl Link for ScriptedLink {
    fn peer(&self) -> SocketAddr {
        "127.0.0.1:9876".parse().expect("static address")
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.sent.push(bytes.to_vec());
        Ok(())
    }

    fn recv(
        &mut self,
        buf: &mut [u8],
        _timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        match self.inbound.pop_front() {
            Some(datagram) if !datagram.is_empty() => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(len)
            }
            _ => {
                self.timeouts += 1;
                Err(TransportError::Timeout)
            }
        }
    }
}
