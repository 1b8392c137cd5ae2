//! Heartbeat monitor for dead-link detection.
//!
//! Pure bookkeeping: the session asks [`HeartbeatMonitor::tick`] what to do
//! and performs the send or close itself.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Round-trip samples kept for the latency average.
const PING_HISTORY: usize = 3;

/// Outcome of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Beat {
    /// Send a heartbeat now.
    Send,
    /// The previous heartbeat was never acknowledged.
    DeadLink,
}

/// Tracks the heartbeat timer, ACK state and round-trip history.
#[derive(Debug)]
pub(crate) struct HeartbeatMonitor {
    interval: Option<Duration>,
    next_tick: Option<Instant>,
    ack_received: bool,
    last_ping_sent_at: Option<Instant>,
    history: VecDeque<Duration>,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor with ACK received (no heartbeat sent yet).
    pub(crate) fn new() -> Self {
        Self {
            interval: None,
            next_tick: None,
            ack_received: true,
            last_ping_sent_at: None,
            history: VecDeque::with_capacity(PING_HISTORY),
        }
    }

    /// Start ticking every `interval`, first tick one interval from `now`.
    pub(crate) fn start(&mut self, now: Instant, interval: Duration) {
        self.interval = Some(interval);
        self.next_tick = Some(now.checked_add(interval).unwrap_or(now));
    }

    /// Cancel the timer. ACK state and history are kept.
    pub(crate) fn stop(&mut self) {
        self.interval = None;
        self.next_tick = None;
    }

    /// Treat the link as healthy (new transport).
    pub(crate) fn reset_ack(&mut self) {
        self.ack_received = true;
    }

    /// When the next routine tick is due.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.next_tick
    }

    /// Whether a routine tick is due at `now`.
    pub(crate) fn due(&self, now: Instant) -> bool {
        self.next_tick.is_some_and(|at| now >= at)
    }

    /// Decide what a tick at `now` does.
    ///
    /// A routine tick with an outstanding ACK reports a dead link and stops
    /// the timer, so a stale interval is only reported once. Otherwise the
    /// heartbeat is recorded as sent and the ACK flag cleared.
    pub(crate) fn tick(&mut self, now: Instant, routine: bool) -> Beat {
        if routine {
            self.next_tick = self
                .interval
                .map(|interval| now.checked_add(interval).unwrap_or(now));
        }
        if routine && !self.ack_received {
            self.stop();
            return Beat::DeadLink;
        }
        self.last_ping_sent_at = Some(now);
        self.ack_received = false;
        Beat::Send
    }

    /// Record a heartbeat ACK received at `now`.
    pub(crate) fn ack(&mut self, now: Instant) {
        if let Some(sent) = self.last_ping_sent_at {
            let rtt = now.saturating_duration_since(sent);
            self.history.push_front(rtt);
            self.history.truncate(PING_HISTORY);
            trace!(rtt_ms = rtt.as_millis(), "heartbeat ACK received");
        }
        self.ack_received = true;
    }

    /// Mean of the recorded round trips, zero when none were recorded.
    pub(crate) fn latency(&self) -> Duration {
        let Ok(count) = u32::try_from(self.history.len()) else {
            return Duration::ZERO;
        };
        let total = self
            .history
            .iter()
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(*d));
        total.checked_div(count).unwrap_or(Duration::ZERO)
    }

    #[cfg(test)]
    pub(crate) fn ack_received(&self) -> bool {
        self.ack_received
    }
}
