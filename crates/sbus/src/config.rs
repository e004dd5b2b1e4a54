//! Engine configuration

use sbus_core::UDP_DEFAULT_PORT;
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

/// Default logical station id of the local node.
pub const DEFAULT_LOCAL_LID: u8 = 253;

/// How many items a container manager visits per tick.
pub const ITEMS_PER_TICK: usize = 64;

/// How many servers the registry manager advances per tick.
pub const SERVERS_PER_TICK: usize = 8;

/// Per-request cell maxima accepted by typical PCDs.
///
/// The true bound depends on the controller model; anything it advertises
/// can be configured here, these are only safe defaults.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    /// Analog cells (registers, timers, counters) per request.
    pub analog: usize,
    /// Boolean cells (inputs, outputs, flags) per request.
    pub boolean: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self { analog: 32, boolean: 128 }
    }
}

impl FrameLimits {
    pub(crate) fn for_space(&self, space: sbus_core::command::AddressSpace) -> usize {
        if space.is_boolean() {
            self.boolean
        } else {
            self.analog
        }
    }
}

/// Highest declarable index per address space.
///
/// Bit spaces and registers span 16384 cells on current PCDs; timers and
/// counters share a 1600-slot pool.
#[derive(Debug, Clone, Copy)]
pub struct ContainerSizes {
    pub inputs: u16,
    pub outputs: u16,
    pub flags: u16,
    pub registers: u16,
    pub timers: u16,
    pub counters: u16,
}

impl Default for ContainerSizes {
    fn default() -> Self {
        Self { inputs: 16384, outputs: 16384, flags: 16384, registers: 16384, timers: 1600, counters: 1600 }
    }
}

/// Configuration of the client node.
///
/// All engine timing lives here so tests can shrink the protocol deadlines;
/// the defaults are the on-the-wire values expected by real controllers.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Local UDP port to bind.
    pub local_port: u16,
    /// Logical station id of the local node.
    pub local_lid: u8,
    /// Subnet broadcast address used for node discovery.
    pub broadcast_address: Ipv4Addr,
    /// Directory searched for `.map` symbol files.
    pub map_file_path: Option<PathBuf>,
    /// Declare items on dictionary-style access misses.
    pub on_the_fly_declaration: bool,
    /// Probe device information right after a remote server is declared.
    pub auto_device_info: bool,
    /// Post-send cooldown before the next transmission on a link.
    pub xmit_inhibit_delay: Duration,
    /// Engine worker cadence; also the socket read deadline.
    pub tick_interval: Duration,
    /// How long a link waits for a response before retrying.
    pub response_timeout: Duration,
    /// Traffic silence after which a server is declared dead.
    pub watchdog_timeout: Duration,
    /// How long a link stays in its error state before resetting.
    pub error_holdoff: Duration,
    /// Server pause after a send failure or a duplicate station id.
    pub pause_duration: Duration,
    /// Transmissions attempted per request.
    pub request_retries: u8,
    /// Period of the CPU status poll on remote servers.
    pub status_refresh_period: Duration,
    /// Period of the broadcast discovery while scanning is enabled.
    pub discovery_period: Duration,
    /// Default refresh delay of declared items.
    pub refresh_delay: Duration,
    /// Container re-sort delay after the last declaration.
    pub resort_delay: Duration,
    /// Retry holdoff for items whose server stopped answering.
    pub inhibit_delay: Duration,
    /// Item age beyond which the retry holdoff applies.
    pub stale_age: Duration,
    /// Per-request cell maxima.
    pub frame_limits: FrameLimits,
    /// Per-space index bounds.
    pub container_sizes: ContainerSizes,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_port: UDP_DEFAULT_PORT,
            local_lid: DEFAULT_LOCAL_LID,
            broadcast_address: Ipv4Addr::BROADCAST,
            map_file_path: None,
            on_the_fly_declaration: false,
            auto_device_info: true,
            xmit_inhibit_delay: Duration::ZERO,
            tick_interval: Duration::from_millis(20),
            response_timeout: Duration::from_secs(3),
            watchdog_timeout: Duration::from_secs(20),
            error_holdoff: Duration::from_secs(3),
            pause_duration: Duration::from_secs(15),
            request_retries: 3,
            status_refresh_period: Duration::from_secs(5),
            discovery_period: Duration::from_secs(60),
            refresh_delay: Duration::from_secs(60),
            resort_delay: Duration::from_secs(10),
            inhibit_delay: Duration::from_secs(10),
            stale_age: Duration::from_secs(180),
            frame_limits: FrameLimits::default(),
            container_sizes: ContainerSizes::default(),
        }
    }
}

// === impl NodeConfig ===

impl NodeConfig {
    /// Sets the local UDP port. Port 0 picks an ephemeral port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }

    /// Sets the logical station id of the local node.
    #[must_use]
    pub fn with_lid(mut self, lid: u8) -> Self {
        self.local_lid = lid;
        self
    }

    /// Sets the subnet broadcast address used for discovery.
    #[must_use]
    pub fn with_broadcast_address(mut self, address: Ipv4Addr) -> Self {
        self.broadcast_address = address;
        self
    }

    /// Sets the directory searched for `.map` symbol files.
    #[must_use]
    pub fn with_map_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.map_file_path = Some(path.into());
        self
    }

    /// Enables item declaration on dictionary-style access misses.
    #[must_use]
    pub fn with_on_the_fly_declaration(mut self, enabled: bool) -> Self {
        self.on_the_fly_declaration = enabled;
        self
    }

    /// Enables or disables the automatic device-information probe.
    #[must_use]
    pub fn with_auto_device_info(mut self, enabled: bool) -> Self {
        self.auto_device_info = enabled;
        self
    }

    /// Sets the post-send pacing delay applied to every link.
    #[must_use]
    pub fn with_xmit_inhibit_delay(mut self, delay: Duration) -> Self {
        self.xmit_inhibit_delay = delay;
        self
    }

    /// Sets the engine worker cadence.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the per-request cell maxima advertised by the controllers.
    #[must_use]
    pub fn with_frame_limits(mut self, limits: FrameLimits) -> Self {
        self.frame_limits = limits;
        self
    }
}
