//! Prelude module - commonly used types for convenient import.
//!
//! Use `use shardline_gateway::prelude::*;` to import all essential types.

// Client and shards
pub use crate::{GatewayClient, ShardConfig, ShardHandle, ShardSnapshot, Status};

// Transport and cache
pub use crate::{Connector, EntityCache, MemoryCache, WsConnector};

// Protocol
pub use crate::{Packet, Presence};

// Errors
pub use crate::{GatewayError, GatewayResult};
