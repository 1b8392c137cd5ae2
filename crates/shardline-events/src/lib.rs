//! Shardline Events - signals published by gateway shard sessions.
//!
//! This crate provides:
//! - [`ShardEvent`], the lifecycle, guild and dispatch signals a shard emits
//! - A broadcast-based [`EventBus`] shared by all shards of a client
//! - A [`SubscriberRegistry`] for synchronous callback subscribers
//!
//! # Example
//!
//! ```rust
//! use shardline_events::{EventBus, EventMetadata, ShardEvent};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let mut receiver = bus.subscribe_shard(0);
//!
//! bus.publish(ShardEvent::ShardReady {
//!     metadata: EventMetadata::new(0, "session"),
//!     unavailable_guilds: 0,
//! });
//!
//! let event = receiver.recv().await.unwrap();
//! assert_eq!(event.event_type(), "shard_ready");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod bus;
mod event;
mod subscriber;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::{EventMetadata, ShardEvent};
pub use subscriber::{
    EventFilter, EventSubscriber, FilterSubscriber, SubscriberId, SubscriberRegistry,
};
