//! Shardline Gateway - per-shard session engine for a push-based gateway.
//!
//! This crate provides:
//! - The wire protocol: opcodes, close codes, packet builders
//! - A pure session state machine (identify, heartbeat, resume, readiness)
//! - A rate-limited outbound queue (120 packets per 60 s window)
//! - A dispatch table routing server events to handlers
//! - A shard actor per session and a [`GatewayClient`] facade over them
//! - A `WebSocket` [`Connector`] built on `tokio-tungstenite`
//!
//! # Architecture
//!
//! ```text
//! GatewayClient
//! ├── EventBus (shared)
//! ├── EntityCache (shared)
//! └── ShardHandle ──► ShardRunner task
//!                     ├── ShardSession (state machine)
//!                     │   ├── HeartbeatMonitor
//!                     │   ├── OutboundQueue + RateBudget
//!                     │   ├── ReadinessAggregator
//!                     │   └── Dispatcher
//!                     └── Transport (from a Connector)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shardline_gateway::{GatewayClient, MemoryCache, ShardConfig, WsConnector};
//!
//! # async fn example() -> Result<(), shardline_gateway::GatewayError> {
//! let client = GatewayClient::new(
//!     vec![ShardConfig::new("token", 0, 1)],
//!     Arc::new(WsConnector::new()),
//!     Arc::new(MemoryCache::new()),
//! );
//! let mut events = client.subscribe();
//! client.connect_all().await?;
//!
//! while let Some(event) = events.recv().await {
//!     tracing::info!(event = event.event_type(), "gateway event");
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::arithmetic_side_effects))]

pub mod prelude;

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod shard;

mod heartbeat;
mod queue;
mod readiness;
mod session;

pub use cache::{EntityCache, GuildSnapshot, MemoryCache};
pub use client::GatewayClient;
pub use config::{ConnectionProperties, ShardConfig};
pub use connection::{Connector, Transport, TransportEvent, WsConnector};
pub use dispatch::{Dispatcher, Effect, EventHandler, HandlerContext};
pub use error::{GatewayError, GatewayResult};
pub use protocol::{Activity, Packet, Presence};
pub use queue::{BUDGET_CAPACITY, BUDGET_WINDOW};
pub use readiness::READY_DEADLINE_PER_GUILD;
pub use session::{HELLO_TIMEOUT, RECONNECT_DELAY, RESUME_DELAY, Status};
pub use shard::{ShardHandle, ShardSnapshot, spawn_shard};
