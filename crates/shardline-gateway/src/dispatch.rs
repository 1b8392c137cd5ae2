//! Inbound packet routing.
//!
//! [`route`] classifies a packet by opcode. Dispatch packets are then
//! looked up by event name in a [`Dispatcher`] table. Handlers never touch
//! the session directly: they update the [`EntityCache`] and report
//! [`Effect`]s that the session applies afterwards.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use shardline_events::{EventMetadata, ShardEvent};
use tracing::{trace, warn};

use crate::cache::{EntityCache, entity_id};
use crate::error::GatewayError;
use crate::protocol::{HelloPayload, Packet, ReadyPayload, opcode};
use crate::session::Status;

// ── Routing ──────────────────────────────────────────────────

/// A packet classified by opcode.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Route {
    /// `op=10`: start heartbeating at this interval (milliseconds).
    Hello { heartbeat_interval: u64 },
    /// `op=0`: an event to look up by name.
    Dispatch { name: String, data: Value },
    /// `op=1`: the server wants a heartbeat now.
    HeartbeatRequest,
    /// `op=11`.
    HeartbeatAck,
    /// `op=7`: the server asks for a reconnect.
    Reconnect,
    /// `op=9`.
    InvalidSession { resumable: bool },
    /// Any opcode the session does not act on.
    Unknown(u8),
}

/// Classify an inbound packet.
///
/// # Errors
///
/// Returns [`GatewayError::MalformedPacket`] when a required field is
/// missing: `heartbeat_interval` on Hello or `t` on Dispatch.
pub(crate) fn route(packet: Packet) -> Result<Route, GatewayError> {
    match packet.op {
        opcode::HELLO => {
            let d = packet
                .d
                .ok_or_else(|| GatewayError::MalformedPacket("hello without payload".into()))?;
            let hello: HelloPayload = serde_json::from_value(d)
                .map_err(|e| GatewayError::MalformedPacket(format!("hello: {e}")))?;
            if hello.heartbeat_interval == 0 {
                return Err(GatewayError::MalformedPacket(
                    "hello with zero heartbeat interval".into(),
                ));
            }
            Ok(Route::Hello {
                heartbeat_interval: hello.heartbeat_interval,
            })
        },
        opcode::DISPATCH => {
            let name = packet
                .t
                .ok_or_else(|| GatewayError::MalformedPacket("dispatch without event name".into()))?;
            Ok(Route::Dispatch {
                name,
                data: packet.d.unwrap_or(Value::Null),
            })
        },
        opcode::HEARTBEAT => Ok(Route::HeartbeatRequest),
        opcode::HEARTBEAT_ACK => Ok(Route::HeartbeatAck),
        opcode::RECONNECT => Ok(Route::Reconnect),
        opcode::INVALID_SESSION => Ok(Route::InvalidSession {
            resumable: packet.d.as_ref().and_then(Value::as_bool).unwrap_or(false),
        }),
        other => Ok(Route::Unknown(other)),
    }
}

// ── Handler Contract ─────────────────────────────────────────

/// Something a handler asks the session to do once it returns.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Publish a signal to subscribers.
    Emit(ShardEvent),
    /// Identify succeeded: remember the session for resuming.
    SessionEstablished {
        /// Resumable session token.
        session_id: String,
        /// Resume endpoint as advertised by the server, not yet validated.
        resume_url: Option<String>,
    },
    /// A resume completed.
    Resumed,
    /// Re-run the readiness check.
    CheckReadiness,
    /// Send a heartbeat immediately.
    HeartbeatNow,
    /// Start the readiness fallback timer.
    ArmReadyDeadline {
        /// Guilds in the initial snapshot.
        guild_count: usize,
    },
}

/// The view of a shard a dispatch handler works with.
pub struct HandlerContext<'a> {
    /// Index of the receiving shard.
    pub shard_index: u32,
    /// Total shard count.
    pub shard_count: u32,
    /// Session status when the packet arrived.
    pub status: Status,
    /// Name of the event being handled.
    pub event_name: &'a str,
    /// Shared entity cache.
    pub cache: &'a dyn EntityCache,
    effects: Vec<Effect>,
}

impl<'a> HandlerContext<'a> {
    /// Create a context for one dispatch.
    #[must_use]
    pub fn new(
        shard_index: u32,
        shard_count: u32,
        status: Status,
        event_name: &'a str,
        cache: &'a dyn EntityCache,
    ) -> Self {
        Self {
            shard_index,
            shard_count,
            status,
            event_name,
            cache,
            effects: Vec::new(),
        }
    }

    /// Metadata for an event raised by this handler.
    #[must_use]
    pub fn metadata(&self) -> EventMetadata {
        EventMetadata::new(self.shard_index, "dispatch")
    }

    /// Queue a signal for subscribers.
    pub fn emit(&mut self, event: ShardEvent) {
        self.effects.push(Effect::Emit(event));
    }

    /// Queue an effect for the session.
    pub fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Effects reported so far.
    #[must_use]
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// Consume the context, returning its effects in order.
    #[must_use]
    pub fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}

/// A dispatch handler.
pub type EventHandler = fn(&mut HandlerContext<'_>, Value) -> Result<(), GatewayError>;

// ── Dispatcher ───────────────────────────────────────────────

/// Event-name dispatch table.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: HashMap<&'static str, EventHandler>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        f.debug_struct("Dispatcher").field("events", &names).finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Create a dispatcher with the built-in handlers.
    #[must_use]
    pub fn new() -> Self {
        let mut dispatcher = Self::empty();
        dispatcher.register("READY", ready);
        dispatcher.register("RESUMED", resumed);
        dispatcher.register("GUILD_CREATE", guild_create);
        dispatcher.register("GUILD_UPDATE", guild_update);
        dispatcher.register("GUILD_DELETE", guild_delete);
        dispatcher.register("USER_UPDATE", user_update);
        dispatcher.register("PRESENCE_UPDATE", embedded_user);
        dispatcher.register("GUILD_MEMBER_ADD", embedded_user);
        dispatcher.register("MESSAGE_CREATE", forward);
        dispatcher.register("MESSAGE_REACTION_ADD", forward);
        dispatcher.register("INTERACTION_CREATE", forward);
        dispatcher
    }

    /// Create a dispatcher with no handlers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register or replace the handler for `event`.
    pub fn register(&mut self, event: &'static str, handler: EventHandler) {
        self.handlers.insert(event, handler);
    }

    /// Whether a handler exists for `event`.
    #[must_use]
    pub fn handles(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Run the handler for `ctx.event_name`. Unknown events are ignored.
    ///
    /// # Errors
    ///
    /// A handler that fails or panics is reported as
    /// [`GatewayError::MalformedPacket`].
    pub fn dispatch(&self, ctx: &mut HandlerContext<'_>, data: Value) -> Result<(), GatewayError> {
        let name = ctx.event_name;
        let Some(handler) = self.handlers.get(name) else {
            trace!(event = name, "no handler registered, ignoring");
            return Ok(());
        };

        match catch_unwind(AssertUnwindSafe(|| handler(ctx, data))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(GatewayError::MalformedPacket(format!("{name}: {e}"))),
            Err(_) => {
                warn!(event = name, "dispatch handler panicked");
                Err(GatewayError::MalformedPacket(format!(
                    "{name}: handler panicked"
                )))
            },
        }
    }
}

// ── Built-in Handlers ────────────────────────────────────────

fn ready(ctx: &mut HandlerContext<'_>, data: Value) -> Result<(), GatewayError> {
    let ready: ReadyPayload = serde_json::from_value(data)?;

    let user_id = match &ready.user {
        Some(user) => Some(ctx.cache.upsert_user(user)?),
        None => None,
    };
    for guild in &ready.guilds {
        ctx.cache.upsert_guild(ctx.shard_index, guild)?;
    }

    let resume_url = ready.resume_gateway_url;
    let guild_count = ready.guilds.len();

    ctx.push(Effect::SessionEstablished {
        session_id: ready.session_id.clone(),
        resume_url,
    });
    let metadata = ctx.metadata();
    ctx.emit(ShardEvent::Ready {
        metadata,
        session_id: ready.session_id,
        user_id,
        guild_count,
    });
    ctx.push(Effect::HeartbeatNow);
    ctx.push(Effect::ArmReadyDeadline { guild_count });
    ctx.push(Effect::CheckReadiness);
    Ok(())
}

fn resumed(ctx: &mut HandlerContext<'_>, _data: Value) -> Result<(), GatewayError> {
    ctx.push(Effect::Resumed);
    ctx.push(Effect::HeartbeatNow);
    Ok(())
}

fn guild_create(ctx: &mut HandlerContext<'_>, data: Value) -> Result<(), GatewayError> {
    let id = entity_id(&data, "guild")?;
    let previous = ctx.cache.guild(&id);
    let current = ctx.cache.upsert_guild(ctx.shard_index, &data)?;

    match previous {
        Some(previous) if !previous.available && current.available => {
            let metadata = ctx.metadata();
            ctx.emit(ShardEvent::GuildAvailable {
                metadata,
                guild_id: id,
            });
            ctx.push(Effect::CheckReadiness);
        },
        Some(_) => {},
        None if ctx.status == Status::Ready => {
            let metadata = ctx.metadata();
            ctx.emit(ShardEvent::GuildCreate {
                metadata,
                guild_id: id,
            });
        },
        None => {},
    }
    Ok(())
}

fn guild_update(ctx: &mut HandlerContext<'_>, data: Value) -> Result<(), GatewayError> {
    let snapshot = ctx.cache.update_guild(ctx.shard_index, &data)?;
    let metadata = ctx.metadata();
    ctx.emit(ShardEvent::GuildUpdate {
        metadata,
        guild_id: snapshot.id,
    });
    Ok(())
}

fn guild_delete(ctx: &mut HandlerContext<'_>, data: Value) -> Result<(), GatewayError> {
    let id = entity_id(&data, "guild")?;
    let outage = data
        .get("unavailable")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let metadata = ctx.metadata();
    if outage {
        if ctx.cache.mark_guild_unavailable(&id).is_some() {
            ctx.emit(ShardEvent::GuildUnavailable {
                metadata,
                guild_id: id,
            });
        }
    } else if ctx.cache.remove_guild(&id).is_some() {
        ctx.emit(ShardEvent::GuildDelete {
            metadata,
            guild_id: id,
        });
    }
    Ok(())
}

fn user_update(ctx: &mut HandlerContext<'_>, data: Value) -> Result<(), GatewayError> {
    ctx.cache.upsert_user(&data)?;
    Ok(())
}

/// Upsert the `user` object carried by presence and member payloads.
fn embedded_user(ctx: &mut HandlerContext<'_>, data: Value) -> Result<(), GatewayError> {
    if let Some(user) = data.get("user") {
        ctx.cache.upsert_user(user)?;
    }
    Ok(())
}

fn forward(ctx: &mut HandlerContext<'_>, data: Value) -> Result<(), GatewayError> {
    let metadata = ctx.metadata();
    let name = ctx.event_name.to_owned();
    ctx.emit(ShardEvent::Dispatch {
        metadata,
        name,
        data,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use serde_json::json;

    fn packet(value: Value) -> Packet {
        serde_json::from_value(value).unwrap()
    }

    fn run(
        dispatcher: &Dispatcher,
        cache: &MemoryCache,
        status: Status,
        name: &str,
        data: Value,
    ) -> Result<Vec<Effect>, GatewayError> {
        let mut ctx = HandlerContext::new(0, 1, status, name, cache);
        dispatcher.dispatch(&mut ctx, data)?;
        Ok(ctx.into_effects())
    }

    #[test]
    fn route_by_opcode() {
        assert_eq!(
            route(packet(json!({ "op": 10, "d": { "heartbeat_interval": 41250 } }))).unwrap(),
            Route::Hello {
                heartbeat_interval: 41250
            }
        );
        assert_eq!(
            route(packet(json!({ "op": 11 }))).unwrap(),
            Route::HeartbeatAck
        );
        assert_eq!(
            route(packet(json!({ "op": 1, "d": null }))).unwrap(),
            Route::HeartbeatRequest
        );
        assert_eq!(route(packet(json!({ "op": 7 }))).unwrap(), Route::Reconnect);
        assert_eq!(
            route(packet(json!({ "op": 9, "d": true }))).unwrap(),
            Route::InvalidSession { resumable: true }
        );
        assert_eq!(
            route(packet(json!({ "op": 9, "d": false }))).unwrap(),
            Route::InvalidSession { resumable: false }
        );
        assert_eq!(route(packet(json!({ "op": 42 }))).unwrap(), Route::Unknown(42));
    }

    #[test]
    fn malformed_hello_and_dispatch() {
        assert!(matches!(
            route(packet(json!({ "op": 10, "d": {} }))),
            Err(GatewayError::MalformedPacket(_))
        ));
        assert!(route(packet(json!({ "op": 10, "d": { "heartbeat_interval": 0 } }))).is_err());
        assert!(matches!(
            route(packet(json!({ "op": 0, "s": 1, "d": {} }))),
            Err(GatewayError::MalformedPacket(_))
        ));
    }

    #[test]
    fn unknown_event_is_ignored() {
        let cache = MemoryCache::new();
        let effects = run(
            &Dispatcher::new(),
            &cache,
            Status::Ready,
            "TYPING_START",
            json!({}),
        )
        .unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn ready_records_session_and_guilds() {
        let cache = MemoryCache::new();
        let data = json!({
            "session_id": "abc",
            "resume_gateway_url": "wss://resume.example",
            "user": { "id": "99", "username": "bot" },
            "guilds": [{ "id": "1", "unavailable": true }],
        });
        let effects = run(&Dispatcher::new(), &cache, Status::Identifying, "READY", data).unwrap();

        assert!(matches!(
            &effects[0],
            Effect::SessionEstablished { session_id, resume_url }
                if session_id == "abc" && resume_url.as_deref() == Some("wss://resume.example")
        ));
        assert!(matches!(
            &effects[1],
            Effect::Emit(ShardEvent::Ready { user_id: Some(id), guild_count: 1, .. }) if id == "99"
        ));
        assert!(matches!(effects[2], Effect::HeartbeatNow));
        assert!(matches!(effects[3], Effect::ArmReadyDeadline { guild_count: 1 }));
        assert!(matches!(effects[4], Effect::CheckReadiness));

        assert!(!cache.guild("1").unwrap().available);
        assert!(cache.user("99").is_some());
    }

    #[test]
    fn guild_becoming_available_checks_readiness() {
        let cache = MemoryCache::new();
        cache
            .upsert_guild(0, &json!({ "id": "1", "unavailable": true }))
            .unwrap();

        let effects = run(
            &Dispatcher::new(),
            &cache,
            Status::Identifying,
            "GUILD_CREATE",
            json!({ "id": "1", "name": "one" }),
        )
        .unwrap();

        assert!(matches!(
            &effects[0],
            Effect::Emit(ShardEvent::GuildAvailable { guild_id, .. }) if guild_id == "1"
        ));
        assert!(matches!(effects[1], Effect::CheckReadiness));
        assert!(cache.guild("1").unwrap().available);
    }

    #[test]
    fn update_before_create_still_checks_readiness() {
        let cache = MemoryCache::new();
        let dispatcher = Dispatcher::new();
        cache
            .upsert_guild(0, &json!({ "id": "1", "unavailable": true }))
            .unwrap();

        let effects = run(
            &dispatcher,
            &cache,
            Status::Identifying,
            "GUILD_UPDATE",
            json!({ "id": "1", "name": "renamed" }),
        )
        .unwrap();
        assert!(matches!(&effects[0], Effect::Emit(ShardEvent::GuildUpdate { .. })));
        assert!(!cache.guild("1").unwrap().available);

        let effects = run(
            &dispatcher,
            &cache,
            Status::Identifying,
            "GUILD_CREATE",
            json!({ "id": "1", "name": "renamed" }),
        )
        .unwrap();
        assert!(matches!(
            &effects[0],
            Effect::Emit(ShardEvent::GuildAvailable { guild_id, .. }) if guild_id == "1"
        ));
        assert!(matches!(effects[1], Effect::CheckReadiness));
    }

    #[test]
    fn new_guild_emits_create_only_when_ready() {
        let cache = MemoryCache::new();
        let dispatcher = Dispatcher::new();

        let effects = run(
            &dispatcher,
            &cache,
            Status::Nearly,
            "GUILD_CREATE",
            json!({ "id": "5" }),
        )
        .unwrap();
        assert!(effects.is_empty());

        let effects = run(
            &dispatcher,
            &cache,
            Status::Ready,
            "GUILD_CREATE",
            json!({ "id": "6" }),
        )
        .unwrap();
        assert!(matches!(
            &effects[0],
            Effect::Emit(ShardEvent::GuildCreate { guild_id, .. }) if guild_id == "6"
        ));
    }

    #[test]
    fn guild_delete_distinguishes_outage_from_removal() {
        let cache = MemoryCache::new();
        let dispatcher = Dispatcher::new();
        cache.upsert_guild(0, &json!({ "id": "1" })).unwrap();
        cache.upsert_guild(0, &json!({ "id": "2" })).unwrap();

        let effects = run(
            &dispatcher,
            &cache,
            Status::Ready,
            "GUILD_DELETE",
            json!({ "id": "1", "unavailable": true }),
        )
        .unwrap();
        assert!(matches!(&effects[0], Effect::Emit(ShardEvent::GuildUnavailable { .. })));
        assert!(!cache.guild("1").unwrap().available);

        let effects = run(
            &dispatcher,
            &cache,
            Status::Ready,
            "GUILD_DELETE",
            json!({ "id": "2" }),
        )
        .unwrap();
        assert!(matches!(&effects[0], Effect::Emit(ShardEvent::GuildDelete { .. })));
        assert!(cache.guild("2").is_none());
    }

    #[test]
    fn forwarded_events_carry_name_and_payload() {
        let cache = MemoryCache::new();
        let effects = run(
            &Dispatcher::new(),
            &cache,
            Status::Ready,
            "MESSAGE_CREATE",
            json!({ "content": "hi" }),
        )
        .unwrap();
        assert!(matches!(
            &effects[0],
            Effect::Emit(ShardEvent::Dispatch { name, data, .. })
                if name == "MESSAGE_CREATE" && data["content"] == "hi"
        ));
    }

    #[test]
    fn handler_error_is_malformed_packet() {
        let cache = MemoryCache::new();
        let err = run(
            &Dispatcher::new(),
            &cache,
            Status::Identifying,
            "READY",
            json!({ "no_session": true }),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedPacket(msg) if msg.starts_with("READY")));
    }

    #[test]
    fn handler_panic_is_caught() {
        fn explode(_: &mut HandlerContext<'_>, _: Value) -> Result<(), GatewayError> {
            panic!("boom");
        }

        let cache = MemoryCache::new();
        let mut dispatcher = Dispatcher::empty();
        dispatcher.register("EXPLODE", explode);
        assert!(dispatcher.handles("EXPLODE"));

        let err = run(&dispatcher, &cache, Status::Ready, "EXPLODE", Value::Null).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedPacket(_)));
    }
}
