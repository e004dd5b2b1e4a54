//! The node
//!
//! Process-wide singleton: one UDP socket, the server registry, the local
//! pseudo-server and the engine worker. `tick()` drains inbound datagrams
//! (dispatching them by source host) and advances every state machine;
//! `start()` runs it from a background thread at the configured cadence.

use crate::{
    config::NodeConfig,
    error::Error,
    server::{Server, Servers},
    transport::Transport,
};
use sbus_core::{Frame, FrameKind, LID_BROADCAST, UDP_DEFAULT_PORT};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

/// The local Ether-S-Bus endpoint and its declared servers.
pub struct Node {
    config: Arc<NodeConfig>,
    transport: Transport,
    servers: Servers,
    local: Arc<Server>,
    stopped: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

// === impl Node ===

impl Node {
    /// Binds the socket and brings up the local pseudo-server.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, Error> {
        let config = Arc::new(config);
        let transport = Transport::bind(config.local_port, config.tick_interval)?;
        let local = Arc::new(Server::new(
            config.clone(),
            Ipv4Addr::LOCALHOST.to_string(),
            transport.local_addr().port(),
            true,
            None,
        )?);

        let node = Arc::new(Self {
            config,
            transport,
            servers: Servers::default(),
            local,
            stopped: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        });
        let lid = node.config.local_lid;
        if let Err(err) = node.servers.assign_lid(&node.local, lid, node.config.pause_duration) {
            warn!(target: "node", lid, %err, "cannot claim local station id");
        }
        info!(target: "node", addr = %node.transport.local_addr(), lid, "node up");
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The bound local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// The local pseudo-server (broadcast source, local memory image).
    pub fn local_server(&self) -> &Arc<Server> {
        &self.local
    }

    /// The declared remote servers.
    pub fn servers(&self) -> &Servers {
        &self.servers
    }

    /// Convenience lookup by logical station id.
    pub fn get_from_lid(&self, lid: u8) -> Option<Arc<Server>> {
        self.servers.get_from_lid(lid)
    }

    /// Declares a remote controller by host, with the protocol default
    /// port and no station id yet (it will be asked for one).
    pub fn declare_server(&self, host: &str) -> Option<Arc<Server>> {
        self.declare_server_with(host, None, UDP_DEFAULT_PORT, None)
    }

    /// Declares a remote controller with everything explicit.
    pub fn declare_server_with(
        &self,
        host: &str,
        lid: Option<u8>,
        port: u16,
        map_file: Option<&str>,
    ) -> Option<Arc<Server>> {
        if let Some(server) = self.servers.get_from_host(host) {
            return Some(server);
        }
        if self.is_local_address(host) {
            debug!(target: "node", host, "not declaring the node itself as a server");
            return None;
        }
        let server = match Server::new(
            self.config.clone(),
            host,
            port,
            false,
            map_file.map(str::to_string),
        ) {
            Ok(server) => Arc::new(server),
            Err(err) => {
                warn!(target: "node", host, %err, "cannot declare server");
                return None;
            }
        };
        self.servers.insert(server.clone());
        if let Some(lid) = lid {
            let _ = self.servers.assign_lid(&server, lid, self.config.pause_duration);
        }
        info!(target: "node", host, port, ?lid, "server declared");
        Some(server)
    }

    /// Declares `count` controllers on consecutive IPv4 addresses,
    /// assigning consecutive station ids when a base id is given.
    pub fn declare_server_range(
        &self,
        first: Ipv4Addr,
        count: usize,
        lid: Option<u8>,
    ) -> Vec<Arc<Server>> {
        let mut address = u32::from(first);
        let mut lid = lid;
        let mut servers = Vec::new();
        for _ in 0..count {
            let host = Ipv4Addr::from(address).to_string();
            if let Some(server) = self.declare_server_with(&host, lid, UDP_DEFAULT_PORT, None) {
                servers.push(server);
            }
            address = address.wrapping_add(1);
            lid = lid.and_then(|l| l.checked_add(1));
        }
        servers
    }

    /// Claims a station id for a server, honoring the first claimant on
    /// duplicates.
    pub fn assign_server_lid(&self, server: &Arc<Server>, lid: u8) {
        let _ = self.servers.assign_lid(server, lid, self.config.pause_duration);
    }

    /// Enables the periodic broadcast discovery of controllers.
    pub fn enable_network_scanner(&self, enabled: bool) {
        self.local.enable_network_scanner(enabled);
    }

    pub(crate) fn send(&self, data: &[u8], target: SocketAddr) -> std::io::Result<()> {
        self.transport.send(data, target)
    }

    /// Where broadcasts go: the configured subnet broadcast address on
    /// the protocol port.
    pub(crate) fn broadcast_target(&self) -> SocketAddr {
        let port = match self.config.local_port {
            0 => UDP_DEFAULT_PORT,
            port => port,
        };
        SocketAddr::from((self.config.broadcast_address, port))
    }

    fn is_local_address(&self, host: &str) -> bool {
        match host.parse::<IpAddr>() {
            Ok(ip) => !ip.is_unspecified() && ip == self.transport.local_addr().ip(),
            Err(_) => false,
        }
    }

    /// Decodes one datagram and dispatches it by source host. Unknown
    /// hosts answering with a station number are discovery responses and
    /// declare themselves into the registry.
    pub fn handle_datagram(self: &Arc<Self>, data: &[u8], source: SocketAddr) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "node", %source, %err, "malformed frame dropped");
                return;
            }
        };
        trace!(target: "node", %source, kind = ?frame.kind, sequence = frame.sequence, "datagram");

        let host = source.ip().to_string();
        if let Some(server) = self.servers.get_from_host(&host) {
            server.on_frame(self, &frame);
            return;
        }

        if frame.kind == FrameKind::Response && frame.payload.len() == 1 {
            self.discovered(source, frame.payload[0]);
            return;
        }
        trace!(target: "node", %source, "datagram from unknown host dropped");
    }

    /// A station answered the discovery broadcast: auto-declare it.
    fn discovered(self: &Arc<Self>, source: SocketAddr, station: u8) {
        if station >= LID_BROADCAST || self.is_local_address(&source.ip().to_string()) {
            return;
        }
        let host = source.ip().to_string();
        info!(target: "node", host, station, "node discovered");
        if let Some(server) =
            self.declare_server_with(&host, Some(station), source.port(), None)
        {
            // it just answered, so it is demonstrably there
            server.mark_alive();
        }
    }

    /// One engine tick: drain the socket (the read deadline paces the
    /// loop), then advance the local server and the registry batch.
    pub fn tick(self: &Arc<Self>) {
        let mut buf = [0u8; 2048];
        while let Some((size, source)) = self.transport.recv(&mut buf) {
            self.handle_datagram(&buf[..size], source);
        }
        self.local.manager(self);
        self.servers.manager(self);
    }

    /// Spawns the engine worker. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        self.stopped.store(false, SeqCst);
        let node = self.clone();
        *worker = Some(std::thread::spawn(move || {
            debug!(target: "node", "engine worker up");
            while !node.stopped.load(SeqCst) {
                node.tick();
            }
            debug!(target: "node", "engine worker down");
        }));
    }

    /// Stops the engine worker and waits for it to exit.
    pub fn stop(&self) {
        self.stopped.store(true, SeqCst);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
