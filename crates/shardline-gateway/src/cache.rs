//! Entity cache interface used by dispatch handlers.
//!
//! The session never defines entity schemas. Handlers hand raw payloads to
//! an [`EntityCache`] and get back the little they need: guild identity,
//! owning shard and availability.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::error::GatewayError;

/// What readiness tracking needs to know about a guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSnapshot {
    /// Guild ID.
    pub id: String,
    /// Shard that owns the guild.
    pub shard: u32,
    /// Whether the guild is currently available.
    pub available: bool,
}

/// Externally synchronized entity store shared by every shard of a client.
#[async_trait]
pub trait EntityCache: Send + Sync {
    /// Insert or patch a guild from a gateway payload.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MalformedPacket`] if the payload has no `id`.
    fn upsert_guild(&self, shard: u32, data: &Value) -> Result<GuildSnapshot, GatewayError>;

    /// Patch a guild from a partial payload. A missing `unavailable` field
    /// leaves the cached availability as it was.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MalformedPacket`] if the payload has no `id`.
    fn update_guild(&self, shard: u32, data: &Value) -> Result<GuildSnapshot, GatewayError>;

    /// Look up a guild.
    fn guild(&self, id: &str) -> Option<GuildSnapshot>;

    /// Mark a guild unavailable, returning its previous snapshot.
    fn mark_guild_unavailable(&self, id: &str) -> Option<GuildSnapshot>;

    /// Remove a guild, returning its last snapshot.
    fn remove_guild(&self, id: &str) -> Option<GuildSnapshot>;

    /// Insert or patch a user, returning its ID.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MalformedPacket`] if the payload has no `id`.
    fn upsert_user(&self, data: &Value) -> Result<String, GatewayError>;

    /// Guilds owned by `shard`, ordered by ID.
    fn guilds_for_shard(&self, shard: u32) -> Vec<GuildSnapshot>;

    /// Fetch the full member list of a guild.
    ///
    /// # Errors
    ///
    /// Returns an error if the fetch fails; readiness logs and continues.
    async fn fetch_members(&self, guild_id: &str) -> Result<(), GatewayError>;
}

pub(crate) fn entity_id(data: &Value, kind: &str) -> Result<String, GatewayError> {
    match data.get("id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(GatewayError::MalformedPacket(format!("{kind} payload has no id"))),
    }
}

/// Shallow-merge `patch` into `target`, key by key.
fn patch_object(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(target), Some(patch)) => {
            for (key, value) in patch {
                target.insert(key.clone(), value.clone());
            }
        },
        _ => *target = patch.clone(),
    }
}

// ── Memory Cache ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct GuildEntry {
    shard: u32,
    available: bool,
    data: Value,
}

impl GuildEntry {
    fn snapshot(&self, id: &str) -> GuildSnapshot {
        GuildSnapshot {
            id: id.to_owned(),
            shard: self.shard,
            available: self.available,
        }
    }
}

/// In-process [`EntityCache`] backed by concurrent maps.
///
/// `fetch_members` succeeds without doing anything; member lists arrive
/// through `GUILD_MEMBERS_CHUNK` dispatches the cache does not model.
#[derive(Debug, Default)]
pub struct MemoryCache {
    guilds: DashMap<String, GuildEntry>,
    users: DashMap<String, Value>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw payload of a cached guild.
    #[must_use]
    pub fn guild_data(&self, id: &str) -> Option<Value> {
        self.guilds.get(id).map(|entry| entry.data.clone())
    }

    /// Raw payload of a cached user.
    #[must_use]
    pub fn user(&self, id: &str) -> Option<Value> {
        self.users.get(id).map(|entry| entry.value().clone())
    }

    /// Number of cached guilds.
    #[must_use]
    pub fn guild_count(&self) -> usize {
        self.guilds.len()
    }

    /// Number of cached users.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn merge_guild(
        &self,
        shard: u32,
        data: &Value,
        partial: bool,
    ) -> Result<GuildSnapshot, GatewayError> {
        let id = entity_id(data, "guild")?;
        let flag = data.get("unavailable").and_then(Value::as_bool);

        let mut entry = self.guilds.entry(id.clone()).or_insert_with(|| GuildEntry {
            shard,
            available: !flag.unwrap_or(false),
            data: Value::Object(serde_json::Map::new()),
        });
        entry.shard = shard;
        match flag {
            Some(unavailable) => entry.available = !unavailable,
            None if !partial => entry.available = true,
            None => {},
        }
        patch_object(&mut entry.data, data);
        Ok(entry.snapshot(&id))
    }
}

#[async_trait]
impl EntityCache for MemoryCache {
    fn upsert_guild(&self, shard: u32, data: &Value) -> Result<GuildSnapshot, GatewayError> {
        self.merge_guild(shard, data, false)
    }

    fn update_guild(&self, shard: u32, data: &Value) -> Result<GuildSnapshot, GatewayError> {
        self.merge_guild(shard, data, true)
    }

    fn guild(&self, id: &str) -> Option<GuildSnapshot> {
        self.guilds.get(id).map(|entry| entry.snapshot(id))
    }

    fn mark_guild_unavailable(&self, id: &str) -> Option<GuildSnapshot> {
        self.guilds.get_mut(id).map(|mut entry| {
            let previous = entry.snapshot(id);
            entry.available = false;
            previous
        })
    }

    fn remove_guild(&self, id: &str) -> Option<GuildSnapshot> {
        self.guilds.remove(id).map(|(id, entry)| entry.snapshot(&id))
    }

    fn upsert_user(&self, data: &Value) -> Result<String, GatewayError> {
        let id = entity_id(data, "user")?;
        self.users
            .entry(id.clone())
            .and_modify(|existing| patch_object(existing, data))
            .or_insert_with(|| data.clone());
        Ok(id)
    }

    fn guilds_for_shard(&self, shard: u32) -> Vec<GuildSnapshot> {
        let mut guilds: Vec<GuildSnapshot> = self
            .guilds
            .iter()
            .filter(|entry| entry.shard == shard)
            .map(|entry| entry.snapshot(entry.key()))
            .collect();
        guilds.sort_by(|a, b| a.id.cmp(&b.id));
        guilds
    }

    async fn fetch_members(&self, guild_id: &str) -> Result<(), GatewayError> {
        debug!(guild = guild_id, "member fetch requested");
        Ok(())
    }
}
