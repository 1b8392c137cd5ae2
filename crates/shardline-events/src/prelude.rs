//! Prelude module - commonly used types for convenient import.
//!
//! Use `use shardline_events::prelude::*;` to import all essential types.

// Event bus
pub use crate::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};

// Events
pub use crate::{EventMetadata, ShardEvent};

// Subscriber system
pub use crate::{EventFilter, EventSubscriber, FilterSubscriber, SubscriberId, SubscriberRegistry};
