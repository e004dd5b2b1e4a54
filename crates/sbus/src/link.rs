//! Link state machine
//!
//! One link per server, driving exactly one request at a time over the
//! shared socket: transmit with pacing, await the matching response,
//! retry on silence, and keep a liveness watchdog on the peer. All
//! transitions happen inside manager ticks or inbound dispatch; nothing
//! here blocks.

use crate::{
    config::NodeConfig,
    error::Error,
    request::{Request, ResponseContext},
};
use sbus_core::{CpuStatus, Frame, FrameKind};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
    time::Instant,
};

use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Idle,
    PendingRequest,
    WaitResponse,
    Error,
    Success,
}

struct Active {
    request: Box<dyn Request>,
    sequence: u16,
    retries: u8,
}

/// Per-server request/response state machine.
pub(crate) struct Link {
    state: LinkState,
    active: Option<Active>,
    /// Deadline of the current state (response wait, error hold-off).
    deadline: Instant,
    /// No transmission before this instant (post-send pacing).
    xmit_inhibit: Instant,
    watchdog: Instant,
    /// Shared with the server's containers for item liveness.
    alive: Arc<AtomicBool>,
    sequence: u16,
    sent: u64,
    local: bool,
    config: Arc<NodeConfig>,
}

// === impl Link ===

impl Link {
    pub(crate) fn new(config: Arc<NodeConfig>, alive: Arc<AtomicBool>, local: bool) -> Self {
        let now = Instant::now();
        Self {
            state: LinkState::Idle,
            active: None,
            deadline: now,
            xmit_inhibit: now,
            watchdog: now + config.watchdog_timeout,
            alive,
            sequence: 0,
            sent: 0,
            local,
            config,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == LinkState::Idle
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(SeqCst)
    }

    /// The next message sequence. Wraps to 1; zero stays reserved for the
    /// counter's initial state and never appears on the wire.
    fn next_sequence(&mut self) -> u16 {
        self.sequence = if self.sequence == u16::MAX { 1 } else { self.sequence + 1 };
        self.sequence
    }

    /// Accepts a request if the link is idle.
    pub(crate) fn initiate(&mut self, request: Box<dyn Request>) -> bool {
        if !self.is_idle() {
            debug!(target: "link", command = ?request.command(), "request denied, link not idle");
            return false;
        }
        let sequence = self.next_sequence();
        self.active =
            Some(Active { request, sequence, retries: self.config.request_retries });
        self.state = LinkState::PendingRequest;
        true
    }

    fn kick_watchdog(&mut self) {
        self.alive.store(true, SeqCst);
        self.watchdog = Instant::now() + self.config.watchdog_timeout;
    }

    /// Arms the watchdog from outside the request/response path, for
    /// peers that proved themselves by answering a broadcast.
    pub(crate) fn mark_alive(&mut self) {
        self.kick_watchdog();
    }

    fn check_alive(&mut self, ctx: &ResponseContext<'_>) {
        if self.is_alive() && Instant::now() >= self.watchdog {
            self.alive.store(false, SeqCst);
            // the status byte cannot be trusted anymore
            ctx.server.set_status(CpuStatus::UNKNOWN);
            if !self.local {
                error!(
                    target: "link",
                    host = %ctx.server.host(),
                    err = %Error::WatchdogExpired,
                    "link dead"
                );
            }
        }
    }

    /// Terminates the active request and returns to idle.
    fn reset(&mut self, success: bool, ctx: &ResponseContext<'_>) {
        if let Some(mut active) = self.active.take() {
            active.request.complete(success);
        }
        self.state = LinkState::Idle;
        self.check_alive(ctx);
    }

    /// Advances the state machine one tick. Returns whether the link did
    /// any work.
    pub(crate) fn manager(&mut self, ctx: &ResponseContext<'_>) -> bool {
        match self.state {
            LinkState::Idle => {
                self.check_alive(ctx);
                false
            }
            LinkState::PendingRequest => self.transmit(ctx),
            LinkState::WaitResponse => {
                if Instant::now() >= self.deadline {
                    warn!(
                        target: "link",
                        host = %ctx.server.host(),
                        command = ?self.active.as_ref().map(|active| active.request.command()),
                        err = %Error::RequestTimeout,
                        "no response, retrying"
                    );
                    self.state = LinkState::PendingRequest;
                }
                true
            }
            LinkState::Error => {
                if Instant::now() >= self.deadline {
                    self.reset(false, ctx);
                }
                false
            }
            LinkState::Success => {
                self.reset(true, ctx);
                true
            }
        }
    }

    fn transmit(&mut self, ctx: &ResponseContext<'_>) -> bool {
        let now = Instant::now();
        if now < self.xmit_inhibit {
            return false;
        }

        let Some(active) = self.active.as_mut() else {
            self.reset(false, ctx);
            return false;
        };
        if active.retries == 0 {
            // retries exhausted without a terminal answer
            warn!(
                target: "link",
                host = %ctx.server.host(),
                command = ?active.request.command(),
                err = %Error::RequestFailed,
                "request abandoned"
            );
            self.reset(false, ctx);
            return false;
        }
        active.retries -= 1;

        let broadcast = active.request.broadcast();
        let frame = Frame::request(active.sequence, active.request.payload());
        let target = if broadcast { ctx.node.broadcast_target() } else { ctx.server.target() };
        trace!(
            target: "link",
            host = %ctx.server.host(),
            command = ?active.request.command(),
            sequence = active.sequence,
            broadcast,
            "transmit"
        );

        match ctx.node.send(&frame.encode(), target) {
            Ok(()) => {
                self.sent += 1;
                self.xmit_inhibit = now + self.config.xmit_inhibit_delay;
                if broadcast {
                    // nobody acknowledges a broadcast
                    self.state = LinkState::Success;
                } else {
                    self.state = LinkState::WaitResponse;
                    self.deadline = now + self.config.response_timeout;
                }
                true
            }
            Err(err) => {
                error!(target: "link", host = %ctx.server.host(), %err, "send failed");
                self.state = LinkState::Error;
                self.deadline = now + self.config.error_holdoff;
                ctx.server.pause(self.config.pause_duration);
                false
            }
        }
    }

    /// Handles one inbound frame addressed to this link's server.
    pub(crate) fn on_frame(&mut self, frame: &Frame, ctx: &ResponseContext<'_>) {
        match frame.kind {
            // we are a client; inbound requests are somebody else's business
            FrameKind::Request => {}
            FrameKind::Response => {
                if !self.matches_active(frame.sequence) {
                    return;
                }
                self.kick_watchdog();
                let result = match self.active.as_mut() {
                    Some(active) => active.request.process(&frame.payload, ctx),
                    None => return,
                };
                match result {
                    Ok(()) => self.reset(true, ctx),
                    Err(err) => {
                        warn!(target: "link", host = %ctx.server.host(), %err, "response processing failed");
                        self.reset(false, ctx);
                    }
                }
            }
            FrameKind::AckNak => {
                if !self.matches_active(frame.sequence) {
                    return;
                }
                // only the first code byte is meaningful; zero acknowledges
                match frame.ack_code() {
                    Some(0) => {
                        self.kick_watchdog();
                        trace!(target: "link", host = %ctx.server.host(), sequence = frame.sequence, "ack");
                        self.reset(true, ctx);
                    }
                    code => {
                        warn!(target: "link", host = %ctx.server.host(), sequence = frame.sequence, ?code, "nak");
                        self.reset(false, ctx);
                    }
                }
            }
        }
    }

    /// A frame counts only while a response is awaited and its sequence
    /// echoes the active request; everything else is dropped silently.
    fn matches_active(&self, sequence: u16) -> bool {
        if self.state != LinkState::WaitResponse {
            trace!(target: "link", sequence, "frame dropped, not waiting");
            return false;
        }
        match &self.active {
            Some(active) if active.sequence == sequence => true,
            Some(active) => {
                trace!(
                    target: "link",
                    err = %Error::SequenceMismatch { expected: active.sequence, got: sequence },
                    "frame dropped"
                );
                false
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("state", &self.state)
            .field("alive", &self.is_alive())
            .field("sequence", &self.sequence)
            .field("sent", &self.sent)
            .finish()
    }
}
