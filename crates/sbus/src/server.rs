//! Servers
//!
//! A server is the client-side aggregate for one controller: identity
//! (host, port, logical station id), CPU status, device information, the
//! link, the mirrored memory, the transfer queue and the symbol table.
//! The registry keys servers by host and by station id and advances a
//! bounded batch of them per engine tick.

use crate::{
    config::{NodeConfig, SERVERS_PER_TICK},
    containers::ItemContainer,
    error::Error,
    items::Item,
    link::Link,
    memory::Memory,
    node::Node,
    request::{CpuControl, ReadPcdStatusOwn, ReadStationNumber, ResponseContext},
    symbol::SymbolTable,
    transfer::{Transfer, TransferQueue},
};
use sbus_core::{command::AddressSpace, CpuStatus, Frame, LID_BROADCAST};
use std::{
    collections::HashMap,
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

/// One controller as seen by this node, or the node's own local
/// pseudo-server.
pub struct Server {
    host: String,
    target: SocketAddr,
    local: bool,
    lid: Mutex<Option<u8>>,
    status: Mutex<CpuStatus>,
    device_info: Mutex<HashMap<String, String>>,
    map_file: Mutex<Option<String>>,
    pause_until: Mutex<Option<Instant>>,
    next_status_refresh: Mutex<Instant>,
    scanner_enabled: AtomicBool,
    next_discovery: Mutex<Instant>,
    alive: Arc<AtomicBool>,
    link: Mutex<Link>,
    memory: Memory,
    transfers: Mutex<TransferQueue>,
    symbols: RwLock<SymbolTable>,
    config: Arc<NodeConfig>,
}

// === impl Server ===

impl Server {
    pub(crate) fn new(
        config: Arc<NodeConfig>,
        host: impl Into<String>,
        port: u16,
        local: bool,
        map_file: Option<String>,
    ) -> Result<Self, Error> {
        let host = host.into();
        let target = (host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Io(std::io::Error::other(format!("cannot resolve {host}"))))?;
        let alive = Arc::new(AtomicBool::new(false));
        let now = Instant::now();

        let server = Self {
            link: Mutex::new(Link::new(config.clone(), alive.clone(), local)),
            memory: Memory::new(local, alive.clone(), config.clone()),
            transfers: Mutex::new(TransferQueue::default()),
            symbols: RwLock::new(SymbolTable::default()),
            lid: Mutex::new(None),
            status: Mutex::new(CpuStatus::UNKNOWN),
            device_info: Mutex::new(HashMap::new()),
            map_file: Mutex::new(map_file),
            pause_until: Mutex::new(None),
            next_status_refresh: Mutex::new(now),
            scanner_enabled: AtomicBool::new(false),
            next_discovery: Mutex::new(now),
            alive,
            host,
            target,
            local,
            config,
        };

        if !server.local && server.config.auto_device_info {
            server.probe_device_info();
        }
        Ok(server)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The resolved UDP endpoint of this controller.
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn lid(&self) -> Option<u8> {
        *self.lid.lock()
    }

    /// The station address used when talking about this server: its
    /// logical id, or the broadcast address while it is still unknown.
    pub fn address(&self) -> u8 {
        self.lid().unwrap_or(LID_BROADCAST)
    }

    pub(crate) fn set_lid_value(&self, lid: u8) {
        *self.lid.lock() = Some(lid);
    }

    pub fn status(&self) -> CpuStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: CpuStatus) {
        let mut current = self.status.lock();
        if *current != status {
            *current = status;
            info!(target: "server", host = %self.host, %status, "status");
        }
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    pub fn is_stopped(&self) -> bool {
        self.status().is_stopped()
    }

    pub fn is_halted(&self) -> bool {
        self.status().is_halted()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(SeqCst)
    }

    /// Marks the server as answering, arming its link watchdog. Used when
    /// a datagram proves the peer is there before any exchange ran.
    pub(crate) fn mark_alive(&self) {
        self.link.lock().mark_alive();
    }

    pub(crate) fn set_device_info(&self, key: &str, value: &str) {
        trace!(target: "server", host = %self.host, key, value, "device info");
        self.device_info.lock().insert(key.to_lowercase(), value.to_string());
    }

    pub fn device_info(&self, key: &str) -> Option<String> {
        self.device_info.lock().get(&key.to_lowercase()).cloned()
    }

    pub fn device_name(&self) -> Option<String> {
        self.device_info("devicename")
    }

    pub fn pcd_type(&self) -> Option<String> {
        self.device_info("pcdtype")
    }

    /// The controller program build timestamp, when the device reported
    /// one in its identification text.
    pub fn build_datetime(&self) -> Option<chrono::NaiveDateTime> {
        let stamp = self.device_info("builddatetime")?;
        chrono::NaiveDateTime::parse_from_str(&stamp, "%Y/%m/%d %H:%M:%S").ok()
    }

    /// Holds all traffic towards this server for `delay`, keeping the
    /// longest pending deadline.
    pub(crate) fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut pause = self.pause_until.lock();
        if pause.map_or(true, |current| until > current) {
            *pause = Some(until);
            warn!(target: "server", host = %self.host, ?delay, "server paused");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_until.lock().map_or(false, |until| Instant::now() < until)
    }

    /// Enables the periodic broadcast discovery. Local pseudo-server
    /// only.
    pub fn enable_network_scanner(&self, enabled: bool) {
        if self.local {
            *self.next_discovery.lock() = Instant::now();
            self.scanner_enabled.store(enabled, SeqCst);
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn inputs(&self) -> &ItemContainer {
        self.memory.inputs()
    }

    pub fn outputs(&self) -> &ItemContainer {
        self.memory.outputs()
    }

    pub fn flags(&self) -> &ItemContainer {
        self.memory.flags()
    }

    pub fn registers(&self) -> &ItemContainer {
        self.memory.registers()
    }

    pub fn timers(&self) -> &ItemContainer {
        self.memory.timers()
    }

    pub fn counters(&self) -> &ItemContainer {
        self.memory.counters()
    }

    /// Declares an item from its textual name: either the short prefix
    /// form (`r8`, `f2001`, `t12`, `c3`, `i5`, `o6`) or a tag from the
    /// loaded symbol table.
    pub fn declare(&self, name: &str) -> Option<Arc<Item>> {
        let name = name.trim();
        if let Some(item) = self.declare_prefixed(name) {
            return Some(item);
        }
        let (space, index) = self.symbols.read().lookup(name)?;
        let item = self.memory.container(space).declare(index)?;
        item.set_tag(name.to_lowercase());
        Some(item)
    }

    fn declare_prefixed(&self, name: &str) -> Option<Arc<Item>> {
        let mut chars = name.chars();
        let space = AddressSpace::from_letter(chars.next()?)?;
        let rest = chars.as_str();
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        self.memory.container(space).declare(rest.parse().ok()?)
    }

    /// The loaded symbol table.
    pub fn symbols(&self) -> &RwLock<SymbolTable> {
        &self.symbols
    }

    /// Loads the symbol map file: the explicit one when configured, else
    /// `<deviceName>.map` from the configured map directory.
    pub(crate) fn load_symbols(&self) {
        if self.local {
            return;
        }
        let file = self
            .map_file
            .lock()
            .clone()
            .or_else(|| self.device_name().map(|name| format!("{name}.map")));
        let Some(file) = file else { return };
        let path = match &self.config.map_file_path {
            Some(dir) => dir.join(&file),
            None => PathBuf::from(&file),
        };
        let count = self.symbols.write().load(&path);
        if count > 0 {
            info!(target: "server", host = %self.host, count, file, "symbols loaded");
        }
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.memory.set_read_only(read_only);
    }

    /// Schedules a refresh of every declared item.
    pub fn refresh(&self) {
        self.memory.refresh();
    }

    pub fn is_pending_push(&self) -> bool {
        self.memory.is_pending_push()
    }

    fn submit(&self, transfer: Transfer) {
        self.transfers.lock().submit(transfer);
    }

    /// Probes the device identification file.
    pub fn probe_device_info(&self) {
        self.submit(Transfer::device_information());
    }

    /// Puts all CPUs of the controller into run.
    pub fn run(&self) {
        self.submit(Transfer::single(Box::new(CpuControl::run())));
    }

    /// Stops all CPUs of the controller.
    pub fn stop(&self) {
        self.submit(Transfer::single(Box::new(CpuControl::stop())));
    }

    /// Restarts all CPUs of the controller.
    pub fn restart(&self) {
        self.submit(Transfer::single(Box::new(CpuControl::restart())));
    }

    /// Schedules a CPU status poll now.
    pub fn refresh_status(&self) {
        *self.next_status_refresh.lock() = Instant::now() + self.config.status_refresh_period;
        self.submit(Transfer::single(Box::new(ReadPcdStatusOwn)));
    }

    /// Pokes the server and reports whether it currently answers.
    pub fn ping(&self) -> bool {
        self.refresh_status();
        self.is_alive()
    }

    /// Broadcasts one node discovery. Local pseudo-server only.
    pub fn discover(&self) {
        if self.local {
            self.submit(Transfer::single(Box::new(ReadStationNumber::discover())));
        }
    }

    /// Pending transfers, the active one included.
    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().count()
    }

    /// Renders every declared item as a table.
    pub fn table(&self) -> comfy_table::Table {
        self.memory.table()
    }

    /// Prints every declared item.
    pub fn dump(&self) {
        self.memory.dump();
    }

    pub(crate) fn on_frame(self: &Arc<Self>, node: &Node, frame: &Frame) {
        let ctx = ResponseContext { node, server: self };
        self.link.lock().on_frame(frame, &ctx);
    }

    /// One engine tick: advance the link, then — depending on the server
    /// flavor — transfers, memory and the periodic jobs.
    pub(crate) fn manager(self: &Arc<Self>, node: &Node) -> bool {
        let ctx = ResponseContext { node, server: self };
        let mut activity = self.link.lock().manager(&ctx);

        if self.local {
            if self.transfers.lock().manager(&self.link, &ctx) {
                activity = true;
            }
            self.memory.manager();
            if self.submit_memory_request() {
                activity = true;
            }
            if self.scanner_enabled.load(SeqCst) {
                let mut next = self.next_discovery.lock();
                if Instant::now() >= *next {
                    *next = Instant::now() + self.config.discovery_period;
                    drop(next);
                    self.discover();
                }
            }
            return activity;
        }

        // remote servers
        {
            let mut pause = self.pause_until.lock();
            if let Some(until) = *pause {
                if Instant::now() >= until {
                    *pause = None;
                    info!(target: "server", host = %self.host, "server resumed");
                }
                return activity;
            }
        }

        if self.lid().is_some() {
            if self.transfers.lock().manager(&self.link, &ctx) {
                activity = true;
            }
            self.memory.manager();
            if self.submit_memory_request() {
                activity = true;
            }
            if Instant::now() >= *self.next_status_refresh.lock() {
                self.refresh_status();
            }
        } else {
            // nothing sensible can run until the station id is known
            let mut link = self.link.lock();
            if link.is_idle() {
                link.initiate(Box::new(ReadStationNumber::unicast()));
                activity = true;
            }
        }
        activity
    }

    /// Hands the memory optimizer's next request to the link, if any.
    fn submit_memory_request(&self) -> bool {
        let mut link = self.link.lock();
        if !link.is_idle() {
            return false;
        }
        match self.memory.next_request() {
            Some(request) => link.initiate(request),
            None => false,
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("host", &self.host)
            .field("lid", &self.lid())
            .field("status", &self.status())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.address())
    }
}

#[derive(Default)]
struct ServersInner {
    list: Vec<Arc<Server>>,
    by_host: HashMap<String, Arc<Server>>,
    by_lid: HashMap<u8, Arc<Server>>,
    cursor: usize,
}

/// The node's server registry, keyed by host and by logical station id.
#[derive(Default)]
pub struct Servers {
    inner: RwLock<ServersInner>,
}

// === impl Servers ===

impl Servers {
    pub(crate) fn insert(&self, server: Arc<Server>) {
        let mut inner = self.inner.write();
        inner.by_host.insert(server.host().to_string(), server.clone());
        // also index the resolved address so inbound datagrams from a
        // hostname-declared server still find it
        let ip = server.target().ip().to_string();
        inner.by_host.entry(ip).or_insert_with(|| server.clone());
        inner.list.push(server);
    }

    pub fn get_from_host(&self, host: &str) -> Option<Arc<Server>> {
        self.inner.read().by_host.get(host).cloned()
    }

    pub fn get_from_lid(&self, lid: u8) -> Option<Arc<Server>> {
        self.inner.read().by_lid.get(&lid).cloned()
    }

    /// Resolves by host first, then by station id.
    pub fn get(&self, key: &str) -> Option<Arc<Server>> {
        self.get_from_host(key)
            .or_else(|| key.parse().ok().and_then(|lid| self.get_from_lid(lid)))
    }

    pub fn all(&self) -> Vec<Arc<Server>> {
        self.inner.read().list.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.read().list.len()
    }

    pub fn alive(&self) -> Vec<Arc<Server>> {
        self.all().into_iter().filter(|server| server.is_alive()).collect()
    }

    pub fn dead(&self) -> Vec<Arc<Server>> {
        self.all().into_iter().filter(|server| !server.is_alive()).collect()
    }

    /// True when every declared server answers.
    pub fn is_alive(&self) -> bool {
        self.dead().is_empty()
    }

    pub fn is_pending_push(&self) -> bool {
        self.all().iter().any(|server| server.is_pending_push())
    }

    /// Schedules a refresh on every server.
    pub fn refresh(&self) {
        for server in self.all() {
            server.refresh();
        }
    }

    /// Puts every controller into run.
    pub fn run(&self) {
        for server in self.all() {
            server.run();
        }
    }

    /// Stops every controller.
    pub fn stop(&self) {
        for server in self.all() {
            server.stop();
        }
    }

    /// Restarts every controller.
    pub fn restart(&self) {
        for server in self.all() {
            server.restart();
        }
    }

    /// Claims `lid` for `server`.
    ///
    /// A different server already holding the id keeps it; the newcomer
    /// is paused instead of taking over.
    pub(crate) fn assign_lid(
        &self,
        server: &Arc<Server>,
        lid: u8,
        pause: Duration,
    ) -> Result<(), Error> {
        if lid >= LID_BROADCAST {
            debug!(target: "server", lid, "ignoring invalid station id");
            return Ok(());
        }
        let mut inner = self.inner.write();
        if let Some(existing) = inner.by_lid.get(&lid) {
            if Arc::ptr_eq(existing, server) {
                return Ok(());
            }
            error!(
                target: "server",
                lid,
                first = %existing.host(),
                second = %server.host(),
                "duplicate server lid"
            );
            server.pause(pause);
            return Err(Error::DuplicateLid(lid));
        }
        if let Some(previous) = server.lid() {
            if inner.by_lid.get(&previous).is_some_and(|s| Arc::ptr_eq(s, server)) {
                inner.by_lid.remove(&previous);
            }
        }
        inner.by_lid.insert(lid, server.clone());
        server.set_lid_value(lid);
        debug!(target: "server", host = %server.host(), lid, "station id assigned");
        Ok(())
    }

    /// Advances a bounded round-robin batch of servers.
    pub(crate) fn manager(&self, node: &Node) -> bool {
        let batch = {
            let mut inner = self.inner.write();
            if inner.list.is_empty() {
                return false;
            }
            let count = SERVERS_PER_TICK.min(inner.list.len());
            (0..count)
                .map(|_| {
                    if inner.cursor >= inner.list.len() {
                        inner.cursor = 0;
                    }
                    let server = inner.list[inner.cursor].clone();
                    inner.cursor += 1;
                    server
                })
                .collect::<Vec<_>>()
        };

        let mut activity = false;
        for server in batch {
            if server.manager(node) {
                activity = true;
            }
        }
        activity
    }
}
