//! Shardline Telemetry - logging setup for gateway clients.
//!
//! Shard sessions log through `tracing` with a `shard` span carrying the
//! shard index and count; this crate installs the subscriber that renders
//! them.
//!
//! # Example
//!
//! ```rust,no_run
//! use shardline_telemetry::{LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), shardline_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("shardline_gateway=debug");
//!
//! setup_logging(&config)?;
//! tracing::info!("Logging ready");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

mod error;
mod logging;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging, setup_logging,
};
