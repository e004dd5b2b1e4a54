//! UDP transport
//!
//! One socket per node, shared by the engine worker. Reads carry a short
//! deadline so the cooperative manager loop keeps ticking even when the
//! network is silent.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};
use tracing::trace;

/// The node's UDP endpoint.
#[derive(Debug)]
pub struct Transport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

// === impl Transport ===

impl Transport {
    /// Binds the local port and enables broadcasting.
    pub fn bind(port: u16, read_deadline: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(read_deadline))?;
        let local_addr = socket.local_addr()?;
        trace!(target: "transport", %local_addr, "socket bound");
        Ok(Self { socket, local_addr })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends one datagram.
    pub fn send(&self, data: &[u8], target: SocketAddr) -> io::Result<()> {
        self.socket.send_to(data, target).map(|_| ())
    }

    /// Receives one datagram, waiting at most the configured read
    /// deadline. Returns `None` when the deadline elapses.
    pub fn recv(&self, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
        match self.socket.recv_from(buf) {
            Ok(received) => Some(received),
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(err) => {
                trace!(target: "transport", %err, "recv failed");
                None
            }
        }
    }
}
