//! Error types for the gateway session engine.

use crate::protocol::close_code;

/// Errors produced by shard sessions and their transports.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// `WebSocket` transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound packet failed to parse or validate.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// Authentication failed (close code 4004).
    #[error("Authentication failed (close code 4004)")]
    AuthenticationFailed,

    /// Invalid shard or sharding required (close code 4010 or 4011).
    #[error("Invalid shard configuration (close code {0})")]
    InvalidShard(u16),

    /// Invalid gateway API version (close code 4012).
    #[error("Invalid API version (close code 4012)")]
    InvalidApiVersion,

    /// Invalid or disallowed intents (close code 4013 or 4014).
    #[error("Invalid intents configuration (close code {0})")]
    InvalidIntents(u16),

    /// No `HELLO` arrived within the deadline after dialing.
    #[error("Timed out waiting for Hello")]
    HelloTimeout,

    /// Transport failure that is not a `WebSocket` protocol error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A membership prefetch for a guild failed.
    #[error("Member prefetch failed for guild {guild_id}: {message}")]
    Prefetch {
        /// Guild whose members could not be fetched.
        guild_id: String,
        /// Failure description.
        message: String,
    },

    /// Shard configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shard task is no longer running.
    #[error("Shard task is gone")]
    ShardGone,
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Map a non-recoverable close code to its error, or `None` if the
    /// code allows reconnecting. This is the only place the fatal set is
    /// defined.
    #[must_use]
    pub fn from_close_code(code: u16) -> Option<Self> {
        match code {
            close_code::AUTHENTICATION_FAILED => Some(Self::AuthenticationFailed),
            close_code::INVALID_SHARD | close_code::SHARDING_REQUIRED => {
                Some(Self::InvalidShard(code))
            },
            close_code::INVALID_API_VERSION => Some(Self::InvalidApiVersion),
            close_code::INVALID_INTENTS | close_code::DISALLOWED_INTENTS => {
                Some(Self::InvalidIntents(code))
            },
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
