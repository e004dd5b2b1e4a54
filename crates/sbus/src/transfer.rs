//! Transfers
//!
//! A transfer is a small programmed sequence of requests implementing one
//! logical operation (probe the device identification file, broadcast a
//! discovery, drive the CPU). The queue keeps at most one transfer
//! active; its current step is handed to the link whenever the link is
//! idle, and a shared result slot reports the step's outcome back. Any
//! failed step aborts the whole transfer.

use crate::{
    link::Link,
    request::{ReadSystemInformation, Request, RequestResult, ResponseContext, Tracked},
};
use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Device-information blocks shorter than this terminate the probe.
const INFO_FULL_BLOCK: usize = 32;

/// Upper bound on identification blocks, in case a device never
/// terminates its info text.
const INFO_MAX_BLOCKS: u8 = 16;

/// One multi-step logical operation.
pub(crate) enum Transfer {
    /// Repeated block-file reads concatenating the device identification
    /// text.
    DeviceInformation(DeviceInfo),
    /// A one-shot wrapper around a single request.
    Single(Option<Box<dyn Request>>),
}

pub(crate) struct DeviceInfo {
    next_block: u8,
    blocks: Arc<Mutex<Vec<Vec<u8>>>>,
    done: bool,
}

// === impl Transfer ===

impl Transfer {
    pub(crate) fn device_information() -> Self {
        Self::DeviceInformation(DeviceInfo {
            next_block: 0,
            blocks: Arc::new(Mutex::new(Vec::new())),
            done: false,
        })
    }

    pub(crate) fn single(request: Box<dyn Request>) -> Self {
        Self::Single(Some(request))
    }

    /// The next request of the sequence, `None` once the transfer ran out
    /// of steps.
    fn next_request(&mut self) -> Option<Box<dyn Request>> {
        match self {
            Self::DeviceInformation(info) => {
                if info.done {
                    return None;
                }
                Some(Box::new(ReadSystemInformation::new(info.next_block, info.blocks.clone())))
            }
            Self::Single(request) => request.take(),
        }
    }

    /// Advances the sequence after a successful step.
    fn on_step_ok(&mut self) {
        if let Self::DeviceInformation(info) = self {
            let blocks = info.blocks.lock();
            let terminal = blocks.last().map_or(true, |block| {
                block.is_empty() || block.len() < INFO_FULL_BLOCK || block.contains(&0)
            });
            drop(blocks);
            if terminal || info.next_block >= INFO_MAX_BLOCKS {
                info.done = true;
            } else {
                info.next_block += 1;
            }
        }
    }

    /// Runs once after the final step succeeded.
    fn on_finish(&mut self, ctx: &ResponseContext<'_>) {
        if let Self::DeviceInformation(info) = self {
            let blocks = info.blocks.lock();
            let text: Vec<u8> = blocks.iter().flatten().copied().collect();
            drop(blocks);
            let text = String::from_utf8_lossy(&text);
            for line in text.lines() {
                let Some((key, value)) = line.split_once([':', '=']) else { continue };
                let (key, value) = (key.trim(), value.trim().trim_matches('\0'));
                if !key.is_empty() && !value.is_empty() {
                    ctx.server.set_device_info(key, value);
                }
            }
            debug!(target: "transfer", host = %ctx.server.host(), device = ?ctx.server.device_name(), "device information read");
            // knowing the device name makes its symbol file loadable
            ctx.server.load_symbols();
        }
    }
}

struct ActiveTransfer {
    transfer: Transfer,
    pending: Option<Arc<RequestResult>>,
}

/// The per-server transfer queue.
#[derive(Default)]
pub(crate) struct TransferQueue {
    queue: VecDeque<Transfer>,
    active: Option<ActiveTransfer>,
}

// === impl TransferQueue ===

impl TransferQueue {
    pub(crate) fn submit(&mut self, transfer: Transfer) {
        self.queue.push_back(transfer);
    }

    /// Queued plus active transfers.
    pub(crate) fn count(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    /// Advances the active transfer: harvest the outcome of its in-flight
    /// step, then submit the next step once the link is idle.
    pub(crate) fn manager(&mut self, link: &Mutex<Link>, ctx: &ResponseContext<'_>) -> bool {
        if self.active.is_none() {
            let Some(transfer) = self.queue.pop_front() else { return false };
            self.active = Some(ActiveTransfer { transfer, pending: None });
        }
        let mut active = self.active.take().expect("just ensured");

        if let Some(result) = &active.pending {
            match result.poll() {
                None => {
                    // step still in flight
                    self.active = Some(active);
                    return false;
                }
                Some(true) => {
                    active.pending = None;
                    active.transfer.on_step_ok();
                }
                Some(false) => {
                    warn!(target: "transfer", host = %ctx.server.host(), "transfer aborted, step failed");
                    return true;
                }
            }
        }

        {
            let mut link = link.lock();
            if !link.is_idle() {
                self.active = Some(active);
                return false;
            }
            if let Some(request) = active.transfer.next_request() {
                let result = Arc::new(RequestResult::default());
                if link.initiate(Box::new(Tracked::new(request, result.clone()))) {
                    active.pending = Some(result);
                }
                drop(link);
                self.active = Some(active);
                return true;
            }
        }

        active.transfer.on_finish(ctx);
        true
    }
}
