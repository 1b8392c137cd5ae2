//! Server packet fixtures.

use serde_json::{Value, json};
use shardline_gateway::Packet;
use shardline_gateway::protocol::opcode;

/// Resume URL advertised by [`ready`].
pub const RESUME_URL: &str = "wss://gateway-us-east1-b.discord.gg";

/// What a shard on the default gateway dials to resume after [`ready`].
pub const RESUME_DIAL_URL: &str = "wss://gateway-us-east1-b.discord.gg/?v=10&encoding=json";

/// `HELLO` with the given heartbeat interval in milliseconds.
#[must_use]
pub fn hello(heartbeat_interval: u64) -> Packet {
    Packet::new(
        opcode::HELLO,
        json!({ "heartbeat_interval": heartbeat_interval }),
    )
}

/// A dispatch packet.
#[must_use]
pub fn dispatch(name: &str, seq: u64, data: Value) -> Packet {
    Packet {
        op: opcode::DISPATCH,
        d: Some(data),
        s: Some(seq),
        t: Some(name.to_owned()),
    }
}

/// `READY` for `session_id`, listing `guild_ids` as unavailable guilds.
#[must_use]
pub fn ready(session_id: &str, seq: u64, guild_ids: &[&str]) -> Packet {
    let guilds: Vec<Value> = guild_ids
        .iter()
        .map(|id| json!({ "id": id, "unavailable": true }))
        .collect();
    dispatch(
        "READY",
        seq,
        json!({
            "v": 10,
            "session_id": session_id,
            "resume_gateway_url": RESUME_URL,
            "user": { "id": "100", "username": "shardline", "bot": true },
            "guilds": guilds,
        }),
    )
}

/// `GUILD_CREATE` for an available guild.
#[must_use]
pub fn guild_create(guild_id: &str, seq: u64) -> Packet {
    dispatch(
        "GUILD_CREATE",
        seq,
        json!({ "id": guild_id, "name": format!("guild {guild_id}"), "member_count": 2 }),
    )
}

/// `MESSAGE_CREATE` in a guild channel.
#[must_use]
pub fn message_create(seq: u64, content: &str) -> Packet {
    dispatch(
        "MESSAGE_CREATE",
        seq,
        json!({
            "id": format!("m{seq}"),
            "channel_id": "1",
            "content": content,
            "author": { "id": "200", "username": "someone" },
        }),
    )
}

/// `RESUMED`.
#[must_use]
pub fn resumed(seq: u64) -> Packet {
    dispatch("RESUMED", seq, Value::Null)
}

/// Heartbeat acknowledgment (`op=11`).
#[must_use]
pub fn heartbeat_ack() -> Packet {
    Packet::new(opcode::HEARTBEAT_ACK, Value::Null)
}

/// Server heartbeat request (`op=1`).
#[must_use]
pub fn heartbeat_request() -> Packet {
    Packet::new(opcode::HEARTBEAT, Value::Null)
}

/// Invalid session (`op=9`).
#[must_use]
pub fn invalid_session(resumable: bool) -> Packet {
    Packet::new(opcode::INVALID_SESSION, Value::Bool(resumable))
}

/// Server-requested reconnect (`op=7`).
#[must_use]
pub fn reconnect() -> Packet {
    Packet::new(opcode::RECONNECT, Value::Null)
}
