//! Memory image and request optimizer
//!
//! The memory aggregates the six address-space containers of one server
//! and owns the three pending queues feeding the link: priority pulls,
//! staged pushes, and background pulls, drained in that order. Draining
//! groups head-consecutive indices of the same space into a single range
//! request, bounded by what a PCD accepts per frame; at most one request
//! is produced per tick because the link carries one at a time.

use crate::{
    config::NodeConfig,
    containers::ItemContainer,
    items::Item,
    request::{ReadRange, Request, WriteRange},
};
use sbus_core::command::AddressSpace;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use parking_lot::Mutex;

/// The pending-work queues shared between a memory and its items.
#[derive(Default)]
pub(crate) struct PendingQueues {
    priority_pull: Mutex<VecDeque<Arc<Item>>>,
    pull: Mutex<VecDeque<Arc<Item>>>,
    push: Mutex<VecDeque<Arc<Item>>>,
}

// === impl PendingQueues ===

impl PendingQueues {
    pub(crate) fn enqueue_pull(&self, item: Arc<Item>, urgent: bool) {
        if urgent {
            self.priority_pull.lock().push_back(item);
        } else {
            self.pull.lock().push_back(item);
        }
    }

    pub(crate) fn enqueue_push(&self, item: Arc<Item>) {
        self.push.lock().push_back(item);
    }

    fn is_push_pending(&self) -> bool {
        !self.push.lock().is_empty()
    }
}

/// The mirrored memory image of one server.
pub struct Memory {
    local_mode: bool,
    read_only: Arc<AtomicBool>,
    on_the_fly: AtomicBool,
    queues: Arc<PendingQueues>,
    inputs: ItemContainer,
    outputs: ItemContainer,
    flags: ItemContainer,
    registers: ItemContainer,
    timers: ItemContainer,
    counters: ItemContainer,
    config: Arc<NodeConfig>,
}

// === impl Memory ===

impl Memory {
    pub(crate) fn new(
        local_mode: bool,
        server_alive: Arc<AtomicBool>,
        config: Arc<NodeConfig>,
    ) -> Self {
        let queues = Arc::new(PendingQueues::default());
        let read_only = Arc::new(AtomicBool::new(false));
        let sizes = config.container_sizes;
        let container = |space: AddressSpace, max_size: u16, space_read_only: bool| {
            ItemContainer::new(
                space,
                max_size,
                local_mode,
                space_read_only,
                read_only.clone(),
                server_alive.clone(),
                queues.clone(),
                config.clone(),
            )
        };
        Self {
            local_mode,
            on_the_fly: AtomicBool::new(config.on_the_fly_declaration),
            // physical inputs cannot be written from the bus
            inputs: container(AddressSpace::Input, sizes.inputs, true),
            outputs: container(AddressSpace::Output, sizes.outputs, false),
            flags: container(AddressSpace::Flag, sizes.flags, false),
            registers: container(AddressSpace::Register, sizes.registers, false),
            timers: container(AddressSpace::Timer, sizes.timers, false),
            counters: container(AddressSpace::Counter, sizes.counters, false),
            read_only,
            queues,
            config,
        }
    }

    pub fn is_local_mode(&self) -> bool {
        self.local_mode
    }

    /// Makes every container reject application writes.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(SeqCst)
    }

    /// Enables item declaration on [`Self::get`] misses.
    pub fn enable_on_the_fly_declaration(&self, enabled: bool) {
        self.on_the_fly.store(enabled, SeqCst);
    }

    pub fn inputs(&self) -> &ItemContainer {
        &self.inputs
    }

    pub fn outputs(&self) -> &ItemContainer {
        &self.outputs
    }

    pub fn flags(&self) -> &ItemContainer {
        &self.flags
    }

    pub fn registers(&self) -> &ItemContainer {
        &self.registers
    }

    pub fn timers(&self) -> &ItemContainer {
        &self.timers
    }

    pub fn counters(&self) -> &ItemContainer {
        &self.counters
    }

    pub fn container(&self, space: AddressSpace) -> &ItemContainer {
        match space {
            AddressSpace::Input => &self.inputs,
            AddressSpace::Output => &self.outputs,
            AddressSpace::Flag => &self.flags,
            AddressSpace::Register => &self.registers,
            AddressSpace::Timer => &self.timers,
            AddressSpace::Counter => &self.counters,
        }
    }

    fn containers(&self) -> [&ItemContainer; 6] {
        [&self.inputs, &self.outputs, &self.flags, &self.registers, &self.timers, &self.counters]
    }

    /// Dictionary-style access: the declared item, or a fresh declaration
    /// when on-the-fly mode is enabled.
    pub fn get(&self, space: AddressSpace, index: u16) -> Option<Arc<Item>> {
        let container = self.container(space);
        container.get(index).or_else(|| {
            if self.on_the_fly.load(SeqCst) {
                container.declare(index)
            } else {
                None
            }
        })
    }

    /// Schedules a refresh of every declared item.
    pub fn refresh(&self) {
        for container in self.containers() {
            container.refresh();
        }
    }

    /// Whether writes are staged and not yet on the wire.
    pub fn is_pending_push(&self) -> bool {
        self.queues.is_push_pending()
    }

    /// Ages the containers' items.
    pub(crate) fn manager(&self) {
        for container in self.containers() {
            container.manager();
        }
    }

    /// Builds the next wire request: priority pulls first, then staged
    /// pushes (so written values settle before background reads), then
    /// background pulls.
    pub(crate) fn next_request(&self) -> Option<Box<dyn Request>> {
        if let Some(items) = self.pop_group(&self.queues.priority_pull) {
            return Some(Box::new(ReadRange::new(items)));
        }
        if let Some(items) = self.pop_group(&self.queues.push) {
            return Some(Box::new(WriteRange::new(items)));
        }
        if let Some(items) = self.pop_group(&self.queues.pull) {
            return Some(Box::new(ReadRange::new(items)));
        }
        None
    }

    /// Pops the queue head plus any directly following items that extend
    /// it into a consecutive same-space run, up to the per-frame limit.
    /// Later arrivals inside the range stay queued for the next tick.
    fn pop_group(&self, queue: &Mutex<VecDeque<Arc<Item>>>) -> Option<Vec<Arc<Item>>> {
        let mut queue = queue.lock();
        let first = queue.pop_front()?;
        let space = first.space();
        let limit = self.config.frame_limits.for_space(space);
        let mut last_index = first.index();
        let mut items = vec![first];

        while items.len() < limit {
            let adjacent = queue
                .front()
                .is_some_and(|next| next.space() == space && next.index() == last_index + 1);
            if !adjacent {
                break;
            }
            if let Some(next) = queue.pop_front() {
                last_index = next.index();
                items.push(next);
            }
        }
        Some(items)
    }

    /// Renders every declared item as one table for diagnostics.
    pub fn table(&self) -> comfy_table::Table {
        let mut table = comfy_table::Table::new();
        table.set_header(["space", "index", "tag", "value", "age"]);
        for container in self.containers() {
            for item in container.all() {
                let age = item.age();
                let age = if age == std::time::Duration::MAX {
                    "never".to_string()
                } else {
                    format!("{:.1}s", age.as_secs_f64())
                };
                table.add_row([
                    item.space().to_string(),
                    item.index().to_string(),
                    item.tag().unwrap_or_default(),
                    item.display_value(),
                    age,
                ]);
            }
        }
        table
    }

    /// Prints every declared item.
    pub fn dump(&self) {
        for container in self.containers() {
            for item in container.all() {
                println!("{item}");
            }
        }
    }
}
