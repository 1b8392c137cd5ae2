//! Prelude module - commonly used types for convenient import.
//!
//! Use `use shardline_test::prelude::*;` to import all essential types.

pub use crate::fixtures;
pub use crate::{ClientFrame, MockConnector, MockServer, MockServers, init_test_logging};
