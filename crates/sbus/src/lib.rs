//! Ether-S-Bus client engine
//!
//! Talks to Saia PCD controllers over UDP: read and write their I/O
//! image, query and drive the CPU state, discover stations on the
//! subnet, and keep a continuously refreshed local mirror of each
//! controller's memory.
//!
//! The engine is cooperative: every state machine advances inside
//! [`Node::tick`], which [`Node::start`] runs from a background worker
//! thread. Application threads interact through the shared item handles,
//! which carry their own mutex/condvar boundary.
//!
//! # Example
//!
//! ```no_run
//! use sbus::{Node, NodeConfig};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), sbus::Error> {
//! let node = Node::new(NodeConfig::default())?;
//! node.start();
//!
//! let pcd = node.declare_server("192.168.0.100").expect("declared");
//! let register = pcd.registers().declare(100).expect("in range");
//! if let Some(value) = register.read(Duration::from_secs(15)) {
//!     println!("register 100 = {value}");
//! }
//!
//! node.stop();
//! # Ok(())
//! # }
//! ```

/// engine configuration
pub mod config;
/// per-space item containers
pub mod containers;
/// aggregated error type
mod error;
/// item cells and groups
pub mod items;
/// per-server link state machine
mod link;
/// memory image and request optimizer
pub mod memory;
/// the process-wide node
pub mod node;
/// request objects, one per command
mod request;
/// server aggregate and registry
pub mod server;
/// symbol map files
pub mod symbol;
/// multi-step logical operations
mod transfer;
/// UDP socket wrapper
mod transport;

pub use config::{ContainerSizes, FrameLimits, NodeConfig};
pub use containers::ItemContainer;
pub use error::Error;
pub use items::{Item, ItemGroup};
pub use memory::Memory;
pub use node::Node;
pub use server::{Server, Servers};
pub use symbol::SymbolTable;

pub use sbus_core::{command::AddressSpace, CpuStatus, ValueFormat};
