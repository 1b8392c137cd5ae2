//! Event types published by gateway shard sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Index of the shard that produced the event.
    pub shard_id: u32,
    /// Source component that generated the event.
    pub source: String,
}

impl EventMetadata {
    /// Create new event metadata for a shard.
    #[must_use]
    pub fn new(shard_id: u32, source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            shard_id,
            source: source.into(),
        }
    }
}

/// Signals emitted by a shard session to the owning client.
///
/// Lifecycle signals (`Opened`, `Closed`, `ShardReady`, `Error`, `Debug`, ...)
/// describe the connection; guild and dispatch signals are produced by the
/// packet dispatcher's handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShardEvent {
    // ========== Connection Lifecycle ==========
    /// Diagnostic message.
    Debug {
        /// Event metadata.
        metadata: EventMetadata,
        /// Human-readable message.
        message: String,
    },

    /// The transport opened.
    Opened {
        /// Event metadata.
        metadata: EventMetadata,
    },

    /// The transport closed.
    Closed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Close code reported by the transport.
        code: u16,
    },

    /// A reconnect attempt was scheduled.
    Reconnecting {
        /// Event metadata.
        metadata: EventMetadata,
    },

    /// A prior session was resumed.
    Resumed {
        /// Event metadata.
        metadata: EventMetadata,
        /// Number of events replayed since the resume was requested.
        replayed: u64,
    },

    /// The gateway accepted an identify and established a session.
    Ready {
        /// Event metadata.
        metadata: EventMetadata,
        /// Resumable session token.
        session_id: String,
        /// Identifier of the connected user, if reported.
        user_id: Option<String>,
        /// Number of guilds in the initial snapshot.
        guild_count: usize,
    },

    /// The shard is fully operational.
    ShardReady {
        /// Event metadata.
        metadata: EventMetadata,
        /// Guilds still unavailable when readiness was reached (non-zero only
        /// when the readiness deadline forced the transition).
        unavailable_guilds: usize,
    },

    /// Non-fatal warning.
    Warn {
        /// Event metadata.
        metadata: EventMetadata,
        /// Warning message.
        message: String,
    },

    /// A connection or protocol error.
    Error {
        /// Event metadata.
        metadata: EventMetadata,
        /// Error description.
        message: String,
    },

    /// The server closed with a non-recoverable code; the shard will not
    /// reconnect.
    Fatal {
        /// Event metadata.
        metadata: EventMetadata,
        /// Close code.
        code: u16,
        /// Error description.
        message: String,
    },

    /// The session was destroyed by its owner.
    Destroyed {
        /// Event metadata.
        metadata: EventMetadata,
    },

    // ========== Guild Events ==========
    /// The shard joined a new guild.
    GuildCreate {
        /// Event metadata.
        metadata: EventMetadata,
        /// Guild ID.
        guild_id: String,
    },

    /// A previously unavailable guild became available.
    GuildAvailable {
        /// Event metadata.
        metadata: EventMetadata,
        /// Guild ID.
        guild_id: String,
    },

    /// A guild became unavailable (outage).
    GuildUnavailable {
        /// Event metadata.
        metadata: EventMetadata,
        /// Guild ID.
        guild_id: String,
    },

    /// A guild was updated.
    GuildUpdate {
        /// Event metadata.
        metadata: EventMetadata,
        /// Guild ID.
        guild_id: String,
    },

    /// The shard left or was removed from a guild.
    GuildDelete {
        /// Event metadata.
        metadata: EventMetadata,
        /// Guild ID.
        guild_id: String,
    },

    // ========== Forwarded Dispatch ==========
    /// A dispatch event forwarded verbatim.
    Dispatch {
        /// Event metadata.
        metadata: EventMetadata,
        /// Event name (`t`).
        name: String,
        /// Event payload (`d`).
        data: Value,
    },
}

impl ShardEvent {
    /// Get the event type as a string.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Debug { .. } => "debug",
            Self::Opened { .. } => "opened",
            Self::Closed { .. } => "closed",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Resumed { .. } => "resumed",
            Self::Ready { .. } => "ready",
            Self::ShardReady { .. } => "shard_ready",
            Self::Warn { .. } => "warn",
            Self::Error { .. } => "error",
            Self::Fatal { .. } => "fatal",
            Self::Destroyed { .. } => "destroyed",
            Self::GuildCreate { .. } => "guild_create",
            Self::GuildAvailable { .. } => "guild_available",
            Self::GuildUnavailable { .. } => "guild_unavailable",
            Self::GuildUpdate { .. } => "guild_update",
            Self::GuildDelete { .. } => "guild_delete",
            Self::Dispatch { .. } => "dispatch",
        }
    }

    /// Get the event metadata.
    #[must_use]
    pub fn metadata(&self) -> &EventMetadata {
        match self {
            Self::Debug { metadata, .. }
            | Self::Opened { metadata }
            | Self::Closed { metadata, .. }
            | Self::Reconnecting { metadata }
            | Self::Resumed { metadata, .. }
            | Self::Ready { metadata, .. }
            | Self::ShardReady { metadata, .. }
            | Self::Warn { metadata, .. }
            | Self::Error { metadata, .. }
            | Self::Fatal { metadata, .. }
            | Self::Destroyed { metadata }
            | Self::GuildCreate { metadata, .. }
            | Self::GuildAvailable { metadata, .. }
            | Self::GuildUnavailable { metadata, .. }
            | Self::GuildUpdate { metadata, .. }
            | Self::GuildDelete { metadata, .. }
            | Self::Dispatch { metadata, .. } => metadata,
        }
    }

    /// Index of the shard that produced this event.
    #[must_use]
    pub fn shard_id(&self) -> u32 {
        self.metadata().shard_id
    }

    /// Check if this is a connection lifecycle event.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Debug { .. }
                | Self::Opened { .. }
                | Self::Closed { .. }
                | Self::Reconnecting { .. }
                | Self::Resumed { .. }
                | Self::Ready { .. }
                | Self::ShardReady { .. }
                | Self::Destroyed { .. }
        )
    }

    /// Check if this event reports a failure.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Fatal { .. })
    }
}
