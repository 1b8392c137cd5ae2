//! Per-shard session configuration.

use shardline_config::{Config, DEFAULT_GATEWAY_URL, DEFAULT_INTENTS};

use crate::error::GatewayError;
use crate::protocol::Presence;

/// Client metadata reported in identify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProperties {
    /// Operating system.
    pub os: String,
    /// Library name.
    pub browser: String,
    /// Device name.
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            browser: "shardline".to_owned(),
            device: "shardline".to_owned(),
        }
    }
}

/// Settings for one shard session.
#[derive(Clone)]
pub struct ShardConfig {
    /// Bot token.
    pub token: String,
    /// Index of this shard.
    pub shard_index: u32,
    /// Total number of shards.
    pub shard_count: u32,
    /// Endpoint for identify dials.
    pub url: String,
    /// Gateway intents bitfield.
    pub intents: u64,
    /// Member threshold for large guilds.
    pub large_threshold: u16,
    /// Fetch all members of every guild before reporting ready.
    pub fetch_all_members: bool,
    /// Close dead links with 1000 instead of 1007.
    pub constrained_close_codes: bool,
    /// Client metadata.
    pub properties: ConnectionProperties,
    /// Presence sent with identify.
    pub presence: Option<Presence>,
}

impl std::fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConfig")
            .field("token", &"[REDACTED]")
            .field("shard_index", &self.shard_index)
            .field("shard_count", &self.shard_count)
            .field("url", &self.url)
            .field("intents", &self.intents)
            .field("large_threshold", &self.large_threshold)
            .field("fetch_all_members", &self.fetch_all_members)
            .field("constrained_close_codes", &self.constrained_close_codes)
            .field("properties", &self.properties)
            .field("presence", &self.presence)
            .finish()
    }
}

impl ShardConfig {
    /// Create a config for shard `shard_index` of `shard_count` with
    /// default gateway settings.
    #[must_use]
    pub fn new(token: impl Into<String>, shard_index: u32, shard_count: u32) -> Self {
        Self {
            token: token.into(),
            shard_index,
            shard_count,
            url: DEFAULT_GATEWAY_URL.to_owned(),
            intents: DEFAULT_INTENTS,
            large_threshold: 250,
            fetch_all_members: false,
            constrained_close_codes: false,
            properties: ConnectionProperties::default(),
            presence: None,
        }
    }

    /// Set the gateway URL.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the intents bitfield.
    #[must_use]
    pub fn with_intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    /// Enable or disable member prefetch before readiness.
    #[must_use]
    pub fn with_fetch_all_members(mut self, enabled: bool) -> Self {
        self.fetch_all_members = enabled;
        self
    }

    /// Use the normal close code for dead links.
    #[must_use]
    pub fn with_constrained_close_codes(mut self, enabled: bool) -> Self {
        self.constrained_close_codes = enabled;
        self
    }

    /// Set the presence sent with identify.
    #[must_use]
    pub fn with_presence(mut self, presence: Presence) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Build the config for `shard_index` from a loaded [`Config`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if no token is configured or the
    /// index is outside the configured shard count.
    pub fn from_config(config: &Config, shard_index: u32) -> Result<Self, GatewayError> {
        let token = config
            .gateway
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                GatewayError::Config(
                    "no bot token configured (set SHARDLINE_TOKEN or gateway.token)".to_owned(),
                )
            })?;

        if shard_index >= config.shards.count {
            return Err(GatewayError::Config(format!(
                "shard {shard_index} is outside the shard count {}",
                config.shards.count
            )));
        }

        let gateway = &config.gateway;
        let mut presence = Presence::new(config.presence.status.clone());
        if let Some(activity) = &config.presence.activity {
            presence = presence.playing(activity.clone());
        }

        Ok(Self {
            token,
            shard_index,
            shard_count: config.shards.count,
            url: gateway.url.clone(),
            intents: gateway.intents,
            large_threshold: gateway.large_threshold,
            fetch_all_members: gateway.fetch_all_members,
            constrained_close_codes: gateway.constrained_close_codes,
            properties: ConnectionProperties {
                os: gateway.properties.os.clone(),
                browser: gateway.properties.browser.clone(),
                device: gateway.properties.device.clone(),
            },
            presence: Some(presence),
        })
    }
}
