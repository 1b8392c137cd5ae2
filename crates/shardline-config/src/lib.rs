//! Shardline Config - layered configuration for the gateway client.
//!
//! Values are merged from, lowest precedence first: the embedded
//! `defaults.toml`, `~/.shardline/config.toml`, and a file passed
//! explicitly. Environment variables fill fields no file set, and
//! `${VAR}` references in strings resolve against the environment.
//!
//! # Example
//!
//! ```rust,no_run
//! # fn main() -> Result<(), shardline_config::ConfigError> {
//! let resolved = shardline_config::load(None)?;
//! println!("running {} shard(s)", resolved.config.shards.count);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod env;
mod error;
mod loader;
mod merge;
mod show;
mod types;
mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load, load_with_env};
pub use merge::{ConfigLayer, FieldSources};
pub use show::ResolvedConfig;
pub use types::{
    Config, DEFAULT_GATEWAY_URL, DEFAULT_INTENTS, GatewaySection, LoggingSection,
    PresenceSection, PropertiesSection, ShardsSection,
};
pub use validate::validate;
