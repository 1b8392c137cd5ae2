//! Outbound packet queue admitted under a fixed-window rate budget.
//!
//! Forced packets never pass through here; the session writes them to the
//! transport directly. Everything else waits its turn in FIFO order and
//! leaves only while the current 60 second window has tokens left.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::Packet;

/// Tokens available per window.
pub const BUDGET_CAPACITY: u32 = 120;

/// Length of one budget window.
pub const BUDGET_WINDOW: Duration = Duration::from_secs(60);

// ── Rate Budget ──────────────────────────────────────────────

/// Token count plus the instant the current window ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RateBudget {
    remaining: u32,
    window_reset_at: Option<Instant>,
}

impl RateBudget {
    pub(crate) fn new() -> Self {
        Self {
            remaining: BUDGET_CAPACITY,
            window_reset_at: None,
        }
    }

    /// Refill and start a fresh window at `now`.
    pub(crate) fn start(&mut self, now: Instant) {
        self.remaining = BUDGET_CAPACITY;
        self.window_reset_at = Some(now.checked_add(BUDGET_WINDOW).unwrap_or(now));
    }

    /// Refill and stop the window clock.
    pub(crate) fn stop(&mut self) {
        self.remaining = BUDGET_CAPACITY;
        self.window_reset_at = None;
    }

    /// Refill if the current window has elapsed. Returns `true` on refill.
    pub(crate) fn roll(&mut self, now: Instant) -> bool {
        match self.window_reset_at {
            Some(at) if now >= at => {
                self.start(now);
                true
            },
            _ => false,
        }
    }

    /// Take one token if any remain.
    pub(crate) fn try_take(&mut self) -> bool {
        match self.remaining.checked_sub(1) {
            Some(left) => {
                self.remaining = left;
                true
            },
            None => false,
        }
    }

    pub(crate) fn remaining(&self) -> u32 {
        self.remaining
    }

    pub(crate) fn window_reset_at(&self) -> Option<Instant> {
        self.window_reset_at
    }
}

// ── Outbound Queue ───────────────────────────────────────────

/// FIFO of packets waiting for budget.
#[derive(Debug)]
pub(crate) struct OutboundQueue {
    pending: VecDeque<Packet>,
    budget: RateBudget,
}

impl OutboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            budget: RateBudget::new(),
        }
    }

    pub(crate) fn push(&mut self, packet: Packet) {
        self.pending.push_back(packet);
    }

    /// Pop every packet the budget admits, in submission order.
    ///
    /// Nothing leaves while the transport is closed. Packets left behind
    /// wait for the next window, reported by [`Self::retry_at`].
    pub(crate) fn drain(&mut self, transport_open: bool) -> Vec<Packet> {
        let mut admitted = Vec::new();
        if !transport_open {
            return admitted;
        }
        while !self.pending.is_empty() && self.budget.try_take() {
            if let Some(packet) = self.pending.pop_front() {
                admitted.push(packet);
            }
        }
        admitted
    }

    /// Start a fresh budget window for a newly opened transport.
    pub(crate) fn open(&mut self, now: Instant) {
        self.budget.start(now);
    }

    /// Refill the budget if its window elapsed.
    pub(crate) fn roll(&mut self, now: Instant) -> bool {
        self.budget.roll(now)
    }

    /// Discard pending packets and stop the window clock.
    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.budget.stop();
    }

    /// When the budget window next ends, if a window is running.
    #[cfg(test)]
    pub(crate) fn window_deadline(&self) -> Option<Instant> {
        self.budget.window_reset_at()
    }

    /// When a drain should be retried: only set while packets are starved.
    pub(crate) fn retry_at(&self) -> Option<Instant> {
        if self.pending.is_empty() || self.budget.remaining() > 0 {
            None
        } else {
            self.budget.window_reset_at()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> u32 {
        self.budget.remaining()
    }
}
