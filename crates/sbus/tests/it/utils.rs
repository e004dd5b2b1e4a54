//! Test helpers: a scripted UDP peer standing in for a controller, a
//! shrunk-timer configuration, and polling helpers.

use sbus::NodeConfig;
use sbus_core::{Frame, FrameKind};
use std::{
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use bytes::Bytes;

/// A configuration with all protocol deadlines shrunk so failure paths
/// run in test time. The wire semantics stay untouched.
pub fn fast_config() -> NodeConfig {
    let mut config = NodeConfig::default()
        .with_port(0)
        .with_auto_device_info(false)
        .with_tick_interval(Duration::from_millis(5));
    config.response_timeout = Duration::from_millis(150);
    config.watchdog_timeout = Duration::from_millis(600);
    config.error_holdoff = Duration::from_millis(50);
    config.pause_duration = Duration::from_millis(400);
    config.status_refresh_period = Duration::from_secs(30);
    config
}

/// Polls `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// A minimal scripted stand-in for a PCD: one loopback socket the tests
/// drive explicitly.
pub struct FakePcd {
    socket: UdpSocket,
}

impl FakePcd {
    pub fn spawn() -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind test peer");
        socket.set_read_timeout(Some(Duration::from_millis(50))).expect("read timeout");
        Self { socket }
    }

    pub fn port(&self) -> u16 {
        self.socket.local_addr().expect("local addr").port()
    }

    /// One receive attempt; `None` on deadline or undecodable data.
    pub fn recv(&self) -> Option<(Frame, SocketAddr)> {
        let mut buf = [0u8; 2048];
        let (size, from) = self.socket.recv_from(&mut buf).ok()?;
        Some((Frame::decode(&buf[..size]).ok()?, from))
    }

    /// Waits for the next request frame, transparently answering CPU
    /// status polls (which the engine schedules on its own) with `Run`.
    pub fn recv_data_request(&self, timeout: Duration) -> Option<(Frame, SocketAddr)> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let Some((frame, from)) = self.recv() else { continue };
            if frame.kind != FrameKind::Request {
                continue;
            }
            if frame.payload.first() == Some(&0x19) {
                self.respond(from, frame.sequence, &[0x52]);
                continue;
            }
            return Some((frame, from));
        }
        None
    }

    pub fn respond(&self, to: SocketAddr, sequence: u16, payload: &[u8]) {
        let frame = Frame::response(sequence, Bytes::copy_from_slice(payload));
        self.socket.send_to(&frame.encode(), to).expect("send response");
    }

    pub fn ack(&self, to: SocketAddr, sequence: u16) {
        let frame = Frame::ack_nak(sequence, 0);
        self.socket.send_to(&frame.encode(), to).expect("send ack");
    }

    pub fn nak(&self, to: SocketAddr, sequence: u16) {
        let frame = Frame::ack_nak(sequence, 1);
        self.socket.send_to(&frame.encode(), to).expect("send nak");
    }
}
