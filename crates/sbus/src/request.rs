//! Request objects
//!
//! One implementation per S-Bus command. A request builds its payload,
//! decodes the response body, and hears about its terminal outcome from
//! the link. Data requests capture the item handles they cover when the
//! memory optimizer builds them, so decoding writes straight back into
//! the cells without any address lookup.

use crate::{
    error::{Error, Result},
    items::Item,
    node::Node,
    server::Server,
};
use bytes::Bytes;
use sbus_core::{
    command::{
        decode_analog_response, decode_bits_response, plain_request, read_request,
        system_info_request, write_analog_request, write_bits_request, AddressSpace,
    },
    Command, CpuStatus,
};
use std::sync::{
    atomic::{AtomicU8, Ordering::SeqCst},
    Arc,
};

use parking_lot::Mutex;
use tracing::{trace, warn};

/// Engine state a response is decoded against.
pub(crate) struct ResponseContext<'a> {
    pub(crate) node: &'a Node,
    pub(crate) server: &'a Arc<Server>,
}

/// One S-Bus exchange, owned by the link while in flight.
pub(crate) trait Request: Send {
    fn command(&self) -> Command;

    /// Broadcast requests go to the subnet broadcast address and complete
    /// on transmission; nobody answers a broadcast directly.
    fn broadcast(&self) -> bool {
        false
    }

    /// The command payload; the link wraps it into the frame envelope.
    fn payload(&self) -> Bytes;

    /// Decodes a response body. The link has already matched the message
    /// sequence at this point.
    fn process(&mut self, _data: &[u8], _ctx: &ResponseContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Terminal notification: the request succeeded, was rejected, or ran
    /// out of retries.
    fn complete(&mut self, _success: bool) {}
}

/// Shared outcome slot connecting a transfer to its in-flight request.
#[derive(Default)]
pub(crate) struct RequestResult(AtomicU8);

const RESULT_PENDING: u8 = 0;
const RESULT_SUCCESS: u8 = 1;
const RESULT_FAILURE: u8 = 2;

// === impl RequestResult ===

impl RequestResult {
    pub(crate) fn settle(&self, success: bool) {
        self.0.store(if success { RESULT_SUCCESS } else { RESULT_FAILURE }, SeqCst);
    }

    /// `None` while the request is still in flight.
    pub(crate) fn poll(&self) -> Option<bool> {
        match self.0.load(SeqCst) {
            RESULT_PENDING => None,
            RESULT_SUCCESS => Some(true),
            _ => Some(false),
        }
    }
}

/// Delegating wrapper that reports the terminal outcome into a
/// [`RequestResult`] slot.
pub(crate) struct Tracked {
    inner: Box<dyn Request>,
    result: Arc<RequestResult>,
}

impl Tracked {
    pub(crate) fn new(inner: Box<dyn Request>, result: Arc<RequestResult>) -> Self {
        Self { inner, result }
    }
}

impl Request for Tracked {
    fn command(&self) -> Command {
        self.inner.command()
    }

    fn broadcast(&self) -> bool {
        self.inner.broadcast()
    }

    fn payload(&self) -> Bytes {
        self.inner.payload()
    }

    fn process(&mut self, data: &[u8], ctx: &ResponseContext<'_>) -> Result<()> {
        self.inner.process(data, ctx)
    }

    fn complete(&mut self, success: bool) {
        self.inner.complete(success);
        self.result.settle(success);
    }
}

/// Reads a run of consecutive cells in one address space.
pub(crate) struct ReadRange {
    space: AddressSpace,
    start: u16,
    items: Vec<Arc<Item>>,
}

impl ReadRange {
    pub(crate) fn new(items: Vec<Arc<Item>>) -> Self {
        debug_assert!(!items.is_empty());
        Self { space: items[0].space(), start: items[0].index(), items }
    }
}

impl Request for ReadRange {
    fn command(&self) -> Command {
        self.space.read_command()
    }

    fn payload(&self) -> Bytes {
        read_request(self.command(), self.start, self.items.len())
    }

    fn process(&mut self, data: &[u8], _ctx: &ResponseContext<'_>) -> Result<()> {
        let values: Vec<u32> = if self.space.is_boolean() {
            decode_bits_response(data, self.items.len())?
                .into_iter()
                .map(u32::from)
                .collect()
        } else {
            decode_analog_response(data, self.items.len())?
        };
        for (item, value) in self.items.iter().zip(values) {
            item.apply_update(value, true);
        }
        Ok(())
    }

    fn complete(&mut self, _success: bool) {
        // successful or not, release the debounce so the items can be
        // scheduled again
        for item in &self.items {
            item.clear_pull();
        }
    }
}

/// Writes a run of consecutive cells in one address space.
///
/// The values are snapshotted from the items' staged push values when the
/// optimizer builds the request.
pub(crate) struct WriteRange {
    space: AddressSpace,
    start: u16,
    items: Vec<Arc<Item>>,
    values: Vec<u32>,
}

impl WriteRange {
    pub(crate) fn new(items: Vec<Arc<Item>>) -> Self {
        debug_assert!(!items.is_empty());
        let values = items.iter().map(|item| item.push_value().unwrap_or_else(|| item.raw())).collect();
        Self { space: items[0].space(), start: items[0].index(), items, values }
    }
}

impl Request for WriteRange {
    fn command(&self) -> Command {
        // the optimizer never stages pushes for a read-only space
        self.space.write_command().expect("writable address space")
    }

    fn payload(&self) -> Bytes {
        if self.space.is_boolean() {
            let bits: Vec<bool> = self.values.iter().map(|&v| v != 0).collect();
            write_bits_request(self.command(), self.start, &bits)
        } else {
            write_analog_request(self.command(), self.start, &self.values)
        }
    }

    fn complete(&mut self, success: bool) {
        if success {
            // settle the pushes and schedule confirming pulls
            for item in &self.items {
                item.confirm_push();
            }
        } else {
            warn!(target: "memory", space = %self.space, start = self.start, count = self.items.len(), "write request failed");
            for item in &self.items {
                item.abort_push();
            }
        }
    }
}

/// Asks a server for its logical station id; broadcast during discovery.
pub(crate) struct ReadStationNumber {
    broadcast: bool,
}

impl ReadStationNumber {
    pub(crate) fn unicast() -> Self {
        Self { broadcast: false }
    }

    pub(crate) fn discover() -> Self {
        Self { broadcast: true }
    }
}

impl Request for ReadStationNumber {
    fn command(&self) -> Command {
        Command::ReadStationNumber
    }

    fn broadcast(&self) -> bool {
        self.broadcast
    }

    fn payload(&self) -> Bytes {
        plain_request(self.command())
    }

    fn process(&mut self, data: &[u8], ctx: &ResponseContext<'_>) -> Result<()> {
        let station = *data.first().ok_or(Error::Codec(
            sbus_core::CodecError::TruncatedPayload { needed: 1, got: 0 },
        ))?;
        trace!(target: "link", host = %ctx.server.host(), station, "station number");
        ctx.node.assign_server_lid(ctx.server, station);
        Ok(())
    }
}

/// Polls the CPU status byte.
pub(crate) struct ReadPcdStatusOwn;

impl Request for ReadPcdStatusOwn {
    fn command(&self) -> Command {
        Command::ReadPcdStatusOwn
    }

    fn payload(&self) -> Bytes {
        plain_request(self.command())
    }

    fn process(&mut self, data: &[u8], ctx: &ResponseContext<'_>) -> Result<()> {
        let status = *data.first().ok_or(Error::Codec(
            sbus_core::CodecError::TruncatedPayload { needed: 1, got: 0 },
        ))?;
        ctx.server.set_status(CpuStatus::from(status));
        Ok(())
    }
}

/// Run, stop or restart all CPUs. Acknowledged, no response body.
pub(crate) struct CpuControl {
    command: Command,
}

impl CpuControl {
    pub(crate) fn run() -> Self {
        Self { command: Command::RunCpuAll }
    }

    pub(crate) fn stop() -> Self {
        Self { command: Command::StopCpuAll }
    }

    pub(crate) fn restart() -> Self {
        Self { command: Command::RestartCpuAll }
    }
}

impl Request for CpuControl {
    fn command(&self) -> Command {
        self.command
    }

    fn payload(&self) -> Bytes {
        plain_request(self.command)
    }
}

/// Reads one block of the device identification file.
pub(crate) struct ReadSystemInformation {
    block: u8,
    sink: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ReadSystemInformation {
    pub(crate) fn new(block: u8, sink: Arc<Mutex<Vec<Vec<u8>>>>) -> Self {
        Self { block, sink }
    }
}

impl Request for ReadSystemInformation {
    fn command(&self) -> Command {
        Command::ReadSystemInformation
    }

    fn payload(&self) -> Bytes {
        system_info_request(self.block)
    }

    fn process(&mut self, data: &[u8], _ctx: &ResponseContext<'_>) -> Result<()> {
        self.sink.lock().push(data.to_vec());
        Ok(())
    }
}
