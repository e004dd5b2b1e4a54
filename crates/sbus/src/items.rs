//! Items
//!
//! An item is one addressable cell of a controller: a boolean for the bit
//! spaces, a 32-bit word for registers, timers and counters. Items are
//! shared handles: the application reads and writes them while the engine
//! worker refreshes them from the wire.
//!
//! The boundary between the two sides is one mutex-protected cell plus a
//! condvar latch per item. The wire side stamps values in and wakes
//! waiters; the application side stages pushes and awaits arrivals. The
//! event flags (raised, changed, updated, push/pull pending) are atomics
//! with test-and-clear semantics.

use crate::containers::ContainerCtl;
use sbus_core::{command::AddressSpace, ValueFormat};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Floor for the default liveness age cap.
const MIN_ALIVE_AGE: Duration = Duration::from_secs(15);

#[derive(Debug, Default)]
struct Cell {
    value: u32,
    push_value: Option<u32>,
    stamp: Option<Instant>,
    /// One-shot latch released towards `read()` waiters on every wire
    /// update; re-armed when a pull is scheduled.
    arrived: bool,
}

/// One addressable cell of a controller.
pub struct Item {
    space: AddressSpace,
    index: u16,
    tag: Mutex<Option<String>>,
    format: Mutex<Option<ValueFormat>>,
    read_only: AtomicBool,
    refresh_override: Mutex<Option<Duration>>,
    inhibit_until: Mutex<Option<Instant>>,
    cell: Mutex<Cell>,
    value_arrived: Condvar,
    raised: AtomicBool,
    changed: AtomicBool,
    updated: AtomicBool,
    push_pending: AtomicBool,
    pull_pending: AtomicBool,
    ctl: Arc<ContainerCtl>,
}

// === impl Item ===

impl Item {
    pub(crate) fn new(ctl: Arc<ContainerCtl>, index: u16) -> Self {
        Self {
            space: ctl.space,
            index,
            tag: Mutex::new(None),
            format: Mutex::new(None),
            read_only: AtomicBool::new(false),
            refresh_override: Mutex::new(None),
            inhibit_until: Mutex::new(None),
            cell: Mutex::new(Cell::default()),
            value_arrived: Condvar::new(),
            raised: AtomicBool::new(false),
            changed: AtomicBool::new(false),
            updated: AtomicBool::new(false),
            push_pending: AtomicBool::new(false),
            pull_pending: AtomicBool::new(false),
            ctl,
        }
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    /// The symbol tag this item was declared under, if any.
    pub fn tag(&self) -> Option<String> {
        self.tag.lock().clone()
    }

    pub(crate) fn set_tag(&self, tag: impl Into<String>) {
        *self.tag.lock() = Some(tag.into());
    }

    /// Sets how the raw register word is interpreted by [`Self::real`]
    /// and [`Self::set_real`]. Meaningless for boolean items.
    pub fn set_format(&self, format: ValueFormat) {
        *self.format.lock() = Some(format);
    }

    pub fn format(&self) -> Option<ValueFormat> {
        *self.format.lock()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, SeqCst);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(SeqCst) || self.ctl.is_read_only()
    }

    /// Overrides the container refresh delay for this item.
    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_override.lock() = Some(delay);
    }

    /// The effective refresh delay: item override, else container default.
    pub fn refresh_delay(&self) -> Duration {
        self.refresh_override.lock().unwrap_or_else(|| self.ctl.refresh_delay())
    }

    fn validate(&self, raw: u32) -> u32 {
        if self.space.is_boolean() {
            (raw != 0) as u32
        } else {
            raw
        }
    }

    /// The current raw cell value.
    pub fn raw(&self) -> u32 {
        self.cell.lock().value
    }

    /// The current value as the signed 32-bit integer a PCD register is.
    pub fn value_i32(&self) -> i32 {
        self.raw() as i32
    }

    /// The current value of a boolean item.
    pub fn is_on(&self) -> bool {
        self.raw() != 0
    }

    /// The current value run through the item's format; without one the
    /// raw word is read as the plain signed value.
    pub fn real(&self) -> f64 {
        match self.format() {
            Some(format) => format.decode(self.raw()),
            None => self.value_i32() as f64,
        }
    }

    /// The staged, not yet transmitted push value.
    pub fn push_value(&self) -> Option<u32> {
        self.cell.lock().push_value
    }

    /// Writes the item.
    ///
    /// Ignored on read-only items. On a remote server this stages a push
    /// for the memory optimizer (writing the current value again is a
    /// no-op); in local-node mode the cell is mutated directly.
    pub fn set(self: &Arc<Self>, raw: u32) {
        if self.is_read_only() {
            trace!(target: "items", item = %self, "write to read-only item ignored");
            return;
        }
        let raw = self.validate(raw);
        if self.ctl.local_mode {
            self.apply_update(raw, false);
        } else if self.cell.lock().value != raw {
            self.signal_push(raw);
        }
    }

    pub fn set_i32(self: &Arc<Self>, value: i32) {
        self.set(value as u32);
    }

    pub fn set_bool(self: &Arc<Self>, value: bool) {
        self.set(value as u32);
    }

    pub fn on(self: &Arc<Self>) {
        self.set_bool(true);
    }

    pub fn off(self: &Arc<Self>) {
        self.set_bool(false);
    }

    pub fn toggle(self: &Arc<Self>) {
        self.set_bool(!self.is_on());
    }

    /// Writes a decimal value through the item's format; without one the
    /// value is written as the plain signed word.
    pub fn set_real(self: &Arc<Self>, value: f64) {
        match self.format() {
            Some(format) => self.set(format.encode(value)),
            None => self.set((value as i32) as u32),
        }
    }

    /// Applies a value update coming from the wire (or from a local-mode
    /// write), stamping the cell and firing the event flags.
    ///
    /// The raised/changed edges stay silent until a first value is known;
    /// the very first update only stamps.
    pub(crate) fn apply_update(&self, raw: u32, force: bool) {
        if !force && self.is_read_only() {
            return;
        }
        let raw = self.validate(raw);
        {
            let mut cell = self.cell.lock();
            let armed = cell.stamp.is_some() || self.ctl.local_mode;
            if armed {
                if cell.value == 0 && raw != 0 {
                    self.raised.store(true, SeqCst);
                }
                if cell.value != raw {
                    self.changed.store(true, SeqCst);
                }
            }
            cell.value = raw;
            cell.stamp = Some(Instant::now());
            cell.arrived = true;
            self.updated.store(true, SeqCst);
            self.value_arrived.notify_all();
        }
    }

    /// Schedules a refresh of this item. Urgent pulls jump the queue.
    pub(crate) fn signal_pull(self: &Arc<Self>, urgent: bool) {
        if self.ctl.local_mode {
            return;
        }
        if !self.pull_pending.swap(true, SeqCst) {
            self.cell.lock().arrived = false;
            self.ctl.queues.enqueue_pull(self.clone(), urgent);
        }
    }

    pub(crate) fn clear_pull(&self) {
        self.pull_pending.store(false, SeqCst);
    }

    fn signal_push(self: &Arc<Self>, raw: u32) {
        if !self.push_pending.swap(true, SeqCst) {
            self.ctl.queues.enqueue_push(self.clone());
        }
        // coalesce: a later write while queued just replaces the value
        self.cell.lock().push_value = Some(raw);
    }

    /// Called when the write request carrying this item was acknowledged:
    /// the push settles and a confirming pull is scheduled.
    pub(crate) fn confirm_push(self: &Arc<Self>) {
        self.cell.lock().push_value = None;
        self.push_pending.store(false, SeqCst);
        self.signal_pull(true);
    }

    /// Called when the write request carrying this item failed for good.
    pub(crate) fn abort_push(&self) {
        self.push_pending.store(false, SeqCst);
    }

    pub fn is_push_pending(&self) -> bool {
        self.push_pending.load(SeqCst)
    }

    pub fn is_pull_pending(&self) -> bool {
        self.pull_pending.load(SeqCst)
    }

    /// Schedules a refresh.
    pub fn refresh(self: &Arc<Self>, urgent: bool) {
        self.signal_pull(urgent);
    }

    /// Schedules an urgent refresh and blocks until a value arrives from
    /// the wire or the timeout elapses. `None` on timeout.
    pub fn read(self: &Arc<Self>, timeout: Duration) -> Option<u32> {
        self.signal_pull(true);
        let deadline = Instant::now() + timeout;
        let mut cell = self.cell.lock();
        while !cell.arrived {
            if self.value_arrived.wait_until(&mut cell, deadline).timed_out() {
                return None;
            }
        }
        Some(cell.value)
    }

    /// Blocks until the updated flag is set or the deadline passes.
    pub(crate) fn wait_updated(&self, deadline: Instant) -> bool {
        let mut cell = self.cell.lock();
        while !self.updated.load(SeqCst) {
            if self.value_arrived.wait_until(&mut cell, deadline).timed_out() {
                return false;
            }
        }
        true
    }

    /// True once after each false-to-true transition.
    pub fn take_raised(&self) -> bool {
        self.raised.swap(false, SeqCst)
    }

    /// True once after each wire update that changed the value.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, SeqCst)
    }

    /// True once after each wire update.
    pub fn take_updated(&self) -> bool {
        self.updated.swap(false, SeqCst)
    }

    pub fn clear_updated(&self) {
        self.updated.store(false, SeqCst);
    }

    /// Time since the last wire update. Never-updated items age forever.
    pub fn age(&self) -> Duration {
        self.cell.lock().stamp.map_or(Duration::MAX, |stamp| stamp.elapsed())
    }

    /// Whether this item's value can be trusted: its server answers and
    /// the value is no older than `max_age` (default: 1.5 times the
    /// refresh delay, floored at 15 s).
    pub fn is_alive(&self, max_age: Option<Duration>) -> bool {
        if !self.ctl.server_alive() {
            return false;
        }
        let max_age =
            max_age.unwrap_or_else(|| self.refresh_delay().mul_f64(1.5).max(MIN_ALIVE_AGE));
        self.age() <= max_age
    }

    /// Periodic aging: re-pull stale values, with a holdoff once the item
    /// looks unresponsive so dead cells do not monopolize the link.
    pub(crate) fn manager(self: &Arc<Self>) {
        let age = self.age();
        if age < self.refresh_delay() {
            return;
        }
        if age < self.ctl.config.stale_age {
            self.signal_pull(false);
        } else {
            let mut inhibit = self.inhibit_until.lock();
            let now = Instant::now();
            if inhibit.map_or(true, |until| now >= until) {
                *inhibit = Some(now + self.ctl.config.inhibit_delay);
                drop(inhibit);
                self.signal_pull(false);
            }
        }
    }

    /// The value rendered for dumps: ON/OFF, the formatted decimal, or
    /// the raw signed integer.
    pub fn display_value(&self) -> String {
        if self.space.is_boolean() {
            if self.is_on() { "ON".into() } else { "OFF".into() }
        } else {
            self.real().to_string()
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.space, self.index)?;
        if let Some(tag) = self.tag() {
            write!(f, "({tag})")?;
        }
        write!(f, "={}", self.display_value())
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("space", &self.space)
            .field("index", &self.index)
            .field("value", &self.raw())
            .field("push_pending", &self.is_push_pending())
            .field("pull_pending", &self.is_pull_pending())
            .finish()
    }
}

/// An ordered collection of item handles operated on as one unit.
#[derive(Default)]
pub struct ItemGroup {
    items: Vec<Arc<Item>>,
}

// === impl ItemGroup ===

impl ItemGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, item: Arc<Item>) {
        self.items.push(item);
    }

    pub fn remove(&mut self, item: &Arc<Item>) {
        self.items.retain(|other| !Arc::ptr_eq(other, item));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Item>> {
        self.items.iter()
    }

    /// Schedules a refresh of every member, clearing their updated flags
    /// so a subsequent [`Self::read`] observes fresh arrivals only.
    pub fn refresh(&self, urgent: bool) {
        for item in &self.items {
            item.clear_updated();
            item.signal_pull(urgent);
        }
    }

    /// Refreshes the group and waits, under one shared deadline, until
    /// every member was updated from the wire. `false` on timeout.
    pub fn read(&self, timeout: Duration) -> bool {
        if self.items.is_empty() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        self.refresh(true);
        self.items.iter().all(|item| item.wait_updated(deadline))
    }

    /// The first member with a pending raised edge, if any.
    pub fn take_raised(&self) -> Option<&Arc<Item>> {
        self.items.iter().find(|item| item.take_raised())
    }

    /// The first member with a pending change, if any.
    pub fn take_changed(&self) -> Option<&Arc<Item>> {
        self.items.iter().find(|item| item.take_changed())
    }

    /// The first member with a pending update, if any.
    pub fn take_updated(&self) -> Option<&Arc<Item>> {
        self.items.iter().find(|item| item.take_updated())
    }

    /// True when every member is alive.
    pub fn is_alive(&self, max_age: Option<Duration>) -> bool {
        !self.items.is_empty() && self.items.iter().all(|item| item.is_alive(max_age))
    }

    /// Renders the group as a table for diagnostics.
    pub fn table(&self) -> comfy_table::Table {
        let mut table = comfy_table::Table::new();
        table.set_header(["#", "space", "index", "tag", "value", "age"]);
        for (n, item) in self.items.iter().enumerate() {
            let age = item.age();
            let age = if age == Duration::MAX {
                "never".to_string()
            } else {
                format!("{:.1}s", age.as_secs_f64())
            };
            table.add_row([
                n.to_string(),
                item.space().to_string(),
                item.index().to_string(),
                item.tag().unwrap_or_default(),
                item.display_value(),
                age,
            ]);
        }
        table
    }
}
