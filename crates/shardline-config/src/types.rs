//! Configuration types for the shardline gateway client.
//!
//! Every struct implements [`Default`] matching `defaults.toml`, so a bare
//! `[section]` header in TOML produces a working configuration.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gateway connection settings.
    pub gateway: GatewaySection,
    /// Which shards to run.
    pub shards: ShardsSection,
    /// Initial presence sent with identify.
    pub presence: PresenceSection,
    /// Logging settings.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// GatewaySection
// ---------------------------------------------------------------------------

/// Default gateway endpoint.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// `GUILDS | GUILD_MESSAGES | DIRECT_MESSAGES`.
pub const DEFAULT_INTENTS: u64 = 4609;

/// Gateway connection settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Bot token. Prefer `SHARDLINE_TOKEN` over storing this in a file.
    pub token: Option<String>,
    /// Gateway endpoint used for identify dials.
    pub url: String,
    /// Gateway intents bitfield.
    pub intents: u64,
    /// Member count above which guilds are sent without offline members.
    pub large_threshold: u16,
    /// Fetch the full member list of every guild before reporting ready.
    pub fetch_all_members: bool,
    /// Close dead links with 1000 instead of 1007 (for transports that only
    /// allow the normal close code).
    pub constrained_close_codes: bool,
    /// Connection properties reported in identify.
    pub properties: PropertiesSection,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            token: None,
            url: DEFAULT_GATEWAY_URL.to_owned(),
            intents: DEFAULT_INTENTS,
            large_threshold: 250,
            fetch_all_members: false,
            constrained_close_codes: false,
            properties: PropertiesSection::default(),
        }
    }
}

impl std::fmt::Debug for GatewaySection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySection")
            .field("has_token", &self.token.is_some())
            .field("url", &self.url)
            .field("intents", &self.intents)
            .field("large_threshold", &self.large_threshold)
            .field("fetch_all_members", &self.fetch_all_members)
            .field("constrained_close_codes", &self.constrained_close_codes)
            .field("properties", &self.properties)
            .finish()
    }
}

impl Serialize for GatewaySection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("GatewaySection", 6)?;
        // token is omitted (secret).
        state.serialize_field("url", &self.url)?;
        state.serialize_field("intents", &self.intents)?;
        state.serialize_field("large_threshold", &self.large_threshold)?;
        state.serialize_field("fetch_all_members", &self.fetch_all_members)?;
        state.serialize_field("constrained_close_codes", &self.constrained_close_codes)?;
        state.serialize_field("properties", &self.properties)?;
        state.end()
    }
}

/// Connection properties reported in identify.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertiesSection {
    /// Operating system.
    pub os: String,
    /// Library or browser name.
    pub browser: String,
    /// Device name.
    pub device: String,
}

impl Default for PropertiesSection {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            browser: "shardline".to_owned(),
            device: "shardline".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// ShardsSection
// ---------------------------------------------------------------------------

/// Which shards this process runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardsSection {
    /// Total number of shards across all processes.
    pub count: u32,
    /// Shard indexes to run here. Empty means all of `0..count`.
    pub ids: Vec<u32>,
}

impl Default for ShardsSection {
    fn default() -> Self {
        Self {
            count: 1,
            ids: Vec::new(),
        }
    }
}

impl ShardsSection {
    /// Shard indexes to run, in ascending order.
    #[must_use]
    pub fn effective_ids(&self) -> Vec<u32> {
        if self.ids.is_empty() {
            (0..self.count).collect()
        } else {
            let mut ids = self.ids.clone();
            ids.sort_unstable();
            ids.dedup();
            ids
        }
    }
}

// ---------------------------------------------------------------------------
// PresenceSection
// ---------------------------------------------------------------------------

/// Initial presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSection {
    /// `online`, `idle`, `dnd` or `invisible`.
    pub status: String,
    /// Optional "Playing ..." activity name.
    pub activity: Option<String>,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            status: "online".to_owned(),
            activity: None,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging settings, converted to a telemetry `LogConfig` by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Base level filter.
    pub level: String,
    /// `pretty`, `compact`, `json` or `full`.
    pub format: String,
    /// Extra filter directives.
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
