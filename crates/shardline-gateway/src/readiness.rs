//! Readiness aggregation: decides when a shard's guild set is fully known.

use std::time::Duration;

use tokio::time::Instant;

use crate::cache::GuildSnapshot;

/// Deadline allowance per guild in the initial snapshot.
pub const READY_DEADLINE_PER_GUILD: Duration = Duration::from_millis(1200);

/// Result of a readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Some guilds are still unavailable.
    Waiting {
        /// Number of unavailable guilds owned by the shard.
        unavailable: usize,
    },
    /// Every guild is available. `prefetch` lists the guilds whose members
    /// must be fetched before READY; empty means READY now.
    Nearly {
        /// Guild IDs to prefetch.
        prefetch: Vec<String>,
    },
}

/// Counts unavailable guilds and owns the deadline fallback timer.
#[derive(Debug, Default)]
pub(crate) struct ReadinessAggregator {
    deadline: Option<Instant>,
}

impl ReadinessAggregator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Start the fallback timer, scaled to the initial guild count.
    pub(crate) fn arm(&mut self, now: Instant, guild_count: usize) {
        let factor = u32::try_from(guild_count).unwrap_or(u32::MAX);
        let allowance = READY_DEADLINE_PER_GUILD
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);
        self.deadline = Some(now.checked_add(allowance).unwrap_or(now));
    }

    /// Cancel the fallback timer.
    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|at| now >= at)
    }

    /// Recompute readiness over the guilds owned by the shard.
    pub(crate) fn evaluate(guilds: &[GuildSnapshot], fetch_all_members: bool) -> Readiness {
        let unavailable = unavailable_count(guilds);
        if unavailable > 0 {
            return Readiness::Waiting { unavailable };
        }
        let prefetch = if fetch_all_members {
            guilds.iter().map(|g| g.id.clone()).collect()
        } else {
            Vec::new()
        };
        Readiness::Nearly { prefetch }
    }
}

/// Number of guilds not yet available.
pub(crate) fn unavailable_count(guilds: &[GuildSnapshot]) -> usize {
    guilds.iter().filter(|g| !g.available).count()
}
