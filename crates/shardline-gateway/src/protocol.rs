//! Gateway wire format: opcodes, close codes, packets and payload builders.
//!
//! Only the fields the session engine acts on are modelled; dispatch
//! payloads stay opaque `serde_json::Value`s.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::{ConnectionProperties, ShardConfig};

// ── Opcodes ──────────────────────────────────────────────────

/// Gateway opcodes.
pub mod opcode {
    /// Event dispatch (receive only).
    pub const DISPATCH: u8 = 0;
    /// Heartbeat (bidirectional).
    pub const HEARTBEAT: u8 = 1;
    /// Identify (send only).
    pub const IDENTIFY: u8 = 2;
    /// Presence update (send only).
    pub const PRESENCE_UPDATE: u8 = 3;
    /// Voice state update (send only).
    pub const VOICE_STATE_UPDATE: u8 = 4;
    /// Resume (send only).
    pub const RESUME: u8 = 6;
    /// Server requests reconnect (receive only).
    pub const RECONNECT: u8 = 7;
    /// Request guild members (send only).
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    /// Invalid session (receive only).
    pub const INVALID_SESSION: u8 = 9;
    /// Hello, carries the heartbeat interval (receive only).
    pub const HELLO: u8 = 10;
    /// Heartbeat ACK (receive only).
    pub const HEARTBEAT_ACK: u8 = 11;
}

// ── Close Codes ──────────────────────────────────────────────

/// Transport close codes used or interpreted by the session.
pub mod close_code {
    /// Normal closure. Never triggers a reconnect when sent by the server.
    pub const NORMAL: u16 = 1000;
    /// Abnormal closure (no close frame).
    pub const ABNORMAL: u16 = 1006;
    /// Used when closing a link whose heartbeat went unacknowledged.
    pub const DEAD_LINK: u16 = 1007;
    /// Application code for a client-initiated close that keeps the
    /// session resumable.
    pub const RECONNECT: u16 = 4900;

    /// Authentication failed, bad token.
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    /// Invalid shard tuple.
    pub const INVALID_SHARD: u16 = 4010;
    /// Too many guilds for a single connection.
    pub const SHARDING_REQUIRED: u16 = 4011;
    /// Unsupported gateway version.
    pub const INVALID_API_VERSION: u16 = 4012;
    /// Invalid intents bitfield.
    pub const INVALID_INTENTS: u16 = 4013;
    /// Intents not enabled for the application.
    pub const DISALLOWED_INTENTS: u16 = 4014;
}

// ── Wire Types ───────────────────────────────────────────────

/// Gateway packet envelope, inbound and outbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Opcode.
    pub op: u8,
    /// Payload (opcode-dependent).
    #[serde(default)]
    pub d: Option<Value>,
    /// Sequence number (inbound dispatch only).
    #[serde(default)]
    pub s: Option<u64>,
    /// Event name (inbound dispatch only).
    #[serde(default)]
    pub t: Option<String>,
}

impl Packet {
    /// Build an outbound packet.
    #[must_use]
    pub fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d: Some(d),
            s: None,
            t: None,
        }
    }
}

/// Hello payload (`op=10`).
#[derive(Debug, Deserialize)]
pub(crate) struct HelloPayload {
    pub(crate) heartbeat_interval: u64,
}

/// The parts of the `READY` dispatch the session consumes.
#[derive(Debug, Deserialize)]
pub(crate) struct ReadyPayload {
    pub(crate) session_id: String,
    #[serde(default)]
    pub(crate) resume_gateway_url: Option<String>,
    #[serde(default)]
    pub(crate) user: Option<Value>,
    #[serde(default)]
    pub(crate) guilds: Vec<Value>,
}

// ── Presence ─────────────────────────────────────────────────

/// Activity shown in a presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Display name.
    pub name: String,
    /// Activity type (0 = playing, 2 = listening, 3 = watching, ...).
    #[serde(rename = "type")]
    pub kind: u8,
}

/// Presence descriptor sent with identify and with `op=3` updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    /// Unix time in milliseconds since the client went idle.
    pub since: Option<u64>,
    /// Current activities.
    pub activities: Vec<Activity>,
    /// `online`, `idle`, `dnd` or `invisible`.
    pub status: String,
    /// Whether the client is AFK.
    pub afk: bool,
}

impl Presence {
    /// Presence with a status and no activity.
    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: status.into(),
            afk: false,
        }
    }

    /// Add a "Playing ..." activity.
    #[must_use]
    pub fn playing(mut self, name: impl Into<String>) -> Self {
        self.activities.push(Activity {
            name: name.into(),
            kind: 0,
        });
        self
    }
}

// ── Payload Builders ─────────────────────────────────────────

fn properties_json(properties: &ConnectionProperties) -> Value {
    json!({
        "os": properties.os,
        "browser": properties.browser,
        "device": properties.device,
    })
}

/// Build an Identify packet (`op=2`).
#[must_use]
pub fn build_identify(config: &ShardConfig) -> Packet {
    let mut d = json!({
        "token": config.token,
        "intents": config.intents,
        "properties": properties_json(&config.properties),
        "large_threshold": config.large_threshold,
    });
    if config.shard_count > 0 {
        d["shard"] = json!([config.shard_index, config.shard_count]);
    }
    if let Some(presence) = &config.presence {
        d["presence"] = json!(presence);
    }
    Packet::new(opcode::IDENTIFY, d)
}

/// Build a Resume packet (`op=6`). `seq` is null when nothing was received.
#[must_use]
pub fn build_resume(token: &str, session_id: &str, sequence: Option<u64>) -> Packet {
    Packet::new(
        opcode::RESUME,
        json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        }),
    )
}

/// Build a Heartbeat packet (`op=1`).
#[must_use]
pub fn build_heartbeat(sequence: Option<u64>) -> Packet {
    Packet {
        op: opcode::HEARTBEAT,
        d: sequence.map(Value::from),
        s: None,
        t: None,
    }
}

/// Build a Presence Update packet (`op=3`).
#[must_use]
pub fn build_presence_update(presence: &Presence) -> Packet {
    Packet::new(opcode::PRESENCE_UPDATE, json!(presence))
}

/// Build a Voice State Update packet (`op=4`). A `None` channel leaves voice.
#[must_use]
pub fn build_voice_state_update(
    guild_id: &str,
    channel_id: Option<&str>,
    self_mute: bool,
    self_deaf: bool,
) -> Packet {
    Packet::new(
        opcode::VOICE_STATE_UPDATE,
        json!({
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }),
    )
}

/// Build a Request Guild Members packet (`op=8`). An empty query with
/// limit 0 requests every member.
#[must_use]
pub fn build_request_guild_members(guild_id: &str, query: &str, limit: u32) -> Packet {
    Packet::new(
        opcode::REQUEST_GUILD_MEMBERS,
        json!({
            "guild_id": guild_id,
            "query": query,
            "limit": limit,
        }),
    )
}

/// Domains a server-advertised resume URL may point at.
pub const ALLOWED_RESUME_DOMAINS: &[&str] = &["discord.gg"];

/// Validate a server-advertised resume URL and build the URL to dial.
///
/// The URL must be `wss` and its host must be an allowed domain (or a
/// subdomain of one) or the configured gateway's own host. The configured
/// gateway's query (`v`, `encoding`) is carried over so a resumed connection
/// speaks the same protocol as the identified one.
#[must_use]
pub fn resume_dial_url(raw: &str, gateway_url: &str) -> Option<String> {
    let mut resume = url::Url::parse(raw).ok()?;
    let gateway = url::Url::parse(gateway_url).ok();
    if resume.scheme() != "wss" {
        return None;
    }
    let host = resume.host_str()?;
    let same_host = gateway
        .as_ref()
        .and_then(url::Url::host_str)
        .is_some_and(|configured| configured.eq_ignore_ascii_case(host));
    let allowed = same_host
        || ALLOWED_RESUME_DOMAINS
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")));
    if !allowed {
        return None;
    }
    if let Some(query) = gateway.as_ref().and_then(url::Url::query) {
        resume.set_query(Some(query));
    }
    Some(resume.into())
}
