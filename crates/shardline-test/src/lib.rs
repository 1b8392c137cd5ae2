//! Shardline Test - shared test utilities for the gateway client.
//!
//! This crate provides a scripted transport and packet fixtures that can be
//! used across shardline crates as a dev-dependency.
//!
//! # Usage
//!
//! ```rust,ignore
//! use shardline_test::{MockConnector, fixtures};
//! use shardline_gateway::protocol::opcode;
//!
//! #[tokio::test(start_paused = true)]
//! async fn identifies_after_hello() {
//!     let (connector, mut servers) = MockConnector::new();
//!     // ... spawn a shard with `connector` and call `connect()`
//!     let mut server = servers.next().await.unwrap();
//!     server.send_packet(&fixtures::hello(41_250));
//!     let identify = server.expect_op(opcode::IDENTIFY).await;
//!     assert_eq!(identify.d.unwrap()["token"], "token");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod harness;
pub mod mocks;

pub use harness::*;
pub use mocks::*;
