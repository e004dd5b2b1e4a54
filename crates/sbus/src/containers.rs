//! Item containers
//!
//! One container per address space. Containers hand out shared item
//! handles, keep them indexable, and age them through a round-robin
//! manager bounded per tick so a large declaration set cannot starve the
//! engine loop. The item list is re-sorted by index a little while after
//! the last declaration so the request optimizer finds adjacent cells in
//! order.

use crate::{config::NodeConfig, error::Error, items::Item, memory::PendingQueues};
use sbus_core::command::AddressSpace;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, trace};

/// State shared between a container and its items.
pub(crate) struct ContainerCtl {
    pub(crate) space: AddressSpace,
    pub(crate) local_mode: bool,
    pub(crate) queues: Arc<PendingQueues>,
    pub(crate) config: Arc<NodeConfig>,
    read_only: AtomicBool,
    memory_read_only: Arc<AtomicBool>,
    server_alive: Arc<AtomicBool>,
    refresh_delay: Mutex<Duration>,
}

// === impl ContainerCtl ===

impl ContainerCtl {
    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only.load(SeqCst) || self.memory_read_only.load(SeqCst)
    }

    pub(crate) fn server_alive(&self) -> bool {
        self.server_alive.load(SeqCst)
    }

    pub(crate) fn refresh_delay(&self) -> Duration {
        *self.refresh_delay.lock()
    }
}

#[derive(Default)]
struct ContainerInner {
    items: Vec<Arc<Item>>,
    by_index: HashMap<u16, Arc<Item>>,
    cursor: usize,
    resort_at: Option<Instant>,
}

/// The declared items of one address space.
pub struct ItemContainer {
    ctl: Arc<ContainerCtl>,
    max_size: u16,
    inner: Mutex<ContainerInner>,
}

// === impl ItemContainer ===

impl ItemContainer {
    pub(crate) fn new(
        space: AddressSpace,
        max_size: u16,
        local_mode: bool,
        read_only: bool,
        memory_read_only: Arc<AtomicBool>,
        server_alive: Arc<AtomicBool>,
        queues: Arc<PendingQueues>,
        config: Arc<NodeConfig>,
    ) -> Self {
        let refresh_delay = config.refresh_delay;
        Self {
            ctl: Arc::new(ContainerCtl {
                space,
                local_mode,
                queues,
                config,
                read_only: AtomicBool::new(read_only),
                memory_read_only,
                server_alive,
                refresh_delay: Mutex::new(refresh_delay),
            }),
            max_size,
            inner: Mutex::new(ContainerInner::default()),
        }
    }

    pub fn space(&self) -> AddressSpace {
        self.ctl.space
    }

    /// Highest declarable index plus one.
    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.ctl.read_only.store(read_only, SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.ctl.is_read_only()
    }

    /// Sets the default refresh delay of this container's items.
    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.ctl.refresh_delay.lock() = delay;
    }

    pub fn count(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// The already declared item at `index`, if any.
    pub fn get(&self, index: u16) -> Option<Arc<Item>> {
        self.inner.lock().by_index.get(&index).cloned()
    }

    pub fn is_declared(&self, index: u16) -> bool {
        self.inner.lock().by_index.contains_key(&index)
    }

    /// Declares the item at `index`, scheduling its initial pull.
    ///
    /// Returns the existing handle if the index was declared before, and
    /// `None` (silently) if the index is out of range.
    pub fn declare(&self, index: u16) -> Option<Arc<Item>> {
        match self.try_declare(index) {
            Ok(item) => Some(item),
            Err(err) => {
                debug!(target: "items", %err, "declare rejected");
                None
            }
        }
    }

    /// Declares the item at `index`, failing on out-of-range indices.
    pub fn try_declare(&self, index: u16) -> Result<Arc<Item>, Error> {
        if index >= self.max_size {
            return Err(Error::IndexOutOfRange { space: self.ctl.space, index });
        }

        let item = {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.by_index.get(&index) {
                return Ok(item.clone());
            }
            let item = Arc::new(Item::new(self.ctl.clone(), index));
            inner.items.push(item.clone());
            inner.by_index.insert(index, item.clone());
            inner.resort_at = Some(Instant::now() + self.ctl.config.resort_delay);
            item
        };

        trace!(target: "items", item = %item, "declared");
        item.signal_pull(false);
        Ok(item)
    }

    /// Declares `count` consecutive items starting at `index`.
    pub fn declare_range(&self, index: u16, count: u16) -> Vec<Arc<Item>> {
        (index..index.saturating_add(count)).filter_map(|i| self.declare(i)).collect()
    }

    /// Declares every item between `from` and `to`, both inclusive.
    pub fn declare_from_to(&self, from: u16, to: u16) -> Vec<Arc<Item>> {
        let (from, to) = if from <= to { (from, to) } else { (to, from) };
        self.declare_range(from, to - from + 1)
    }

    /// Clones out every declared item.
    pub fn all(&self) -> Vec<Arc<Item>> {
        self.inner.lock().items.clone()
    }

    /// The declared items whose value is currently trustworthy.
    pub fn alive(&self, max_age: Option<Duration>) -> Vec<Arc<Item>> {
        self.all().into_iter().filter(|item| item.is_alive(max_age)).collect()
    }

    /// The declared items whose value is not.
    pub fn dead(&self, max_age: Option<Duration>) -> Vec<Arc<Item>> {
        self.all().into_iter().filter(|item| !item.is_alive(max_age)).collect()
    }

    /// Schedules a refresh of every declared item.
    pub fn refresh(&self) {
        for item in self.all() {
            item.signal_pull(false);
        }
    }

    /// Ages up to the per-tick item budget, advancing the round-robin
    /// cursor. On wrap-around, re-sorts the list by index once the
    /// post-declaration deadline passed.
    pub(crate) fn manager(&self) {
        let budget = crate::config::ITEMS_PER_TICK.min(self.count());
        for _ in 0..budget {
            let item = {
                let mut inner = self.inner.lock();
                if inner.cursor >= inner.items.len() {
                    inner.cursor = 0;
                    if inner.resort_at.is_some_and(|at| Instant::now() >= at) {
                        inner.items.sort_by_key(|item| item.index());
                        inner.resort_at = None;
                        trace!(target: "items", space = %self.ctl.space, "re-sorted item indexes");
                    }
                    break;
                }
                let item = inner.items[inner.cursor].clone();
                inner.cursor += 1;
                item
            };
            item.manager();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;
    use crate::{config::NodeConfig, memory::Memory};
    use std::sync::{atomic::AtomicBool, Arc};

    fn memory() -> Memory {
        Memory::new(false, Arc::new(AtomicBool::new(true)), Arc::new(NodeConfig::default()))
    }

    #[test]
    fn declare_is_idempotent() {
        let memory = memory();
        let registers = memory.registers();
        let first = registers.declare(8).unwrap();
        let again = registers.declare(8).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(registers.count(), 1);
        assert!(registers.is_declared(8));
    }

    #[test]
    fn declare_out_of_range_returns_none() {
        let memory = memory();
        let registers = memory.registers();
        assert_eq!(registers.max_size(), 16384);
        assert!(registers.declare(16384).is_none());
        assert!(registers.declare(16383).is_some());
        // timers and counters share the smaller pool
        assert!(memory.timers().declare(1600).is_none());
        assert!(memory.counters().declare(1599).is_some());

        // the fallible variant reports the rejection as a typed error
        assert!(matches!(
            registers.try_declare(16384),
            Err(Error::IndexOutOfRange { index: 16384, .. })
        ));
    }

    #[test]
    fn range_helpers() {
        let memory = memory();
        let flags = memory.flags();
        assert_eq!(flags.declare_range(10, 4).len(), 4);
        // bounds are inclusive and direction-agnostic
        let items = flags.declare_from_to(20, 17);
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].index(), 17);
        assert_eq!(items[3].index(), 20);
        assert_eq!(flags.count(), 8);
    }

    #[test]
    fn on_the_fly_declaration_is_opt_in() {
        let memory = memory();
        assert!(memory.get(sbus_core::command::AddressSpace::Register, 5).is_none());
        memory.enable_on_the_fly_declaration(true);
        assert!(memory.get(sbus_core::command::AddressSpace::Register, 5).is_some());
        assert!(memory.registers().is_declared(5));
    }
}
