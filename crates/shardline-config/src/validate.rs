//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Validate a fully merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_gateway(config)?;
    validate_shards(config)?;
    validate_presence(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_gateway(config: &Config) -> ConfigResult<()> {
    let g = &config.gateway;

    if !(g.url.starts_with("wss://") || g.url.starts_with("ws://")) {
        return Err(invalid(
            "gateway.url",
            format!("'{}' is not a ws:// or wss:// URL", g.url),
        ));
    }

    if !(50..=250).contains(&g.large_threshold) {
        return Err(invalid(
            "gateway.large_threshold",
            format!("{} is out of range; must be between 50 and 250", g.large_threshold),
        ));
    }

    if g.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(invalid("gateway.token", "token must not be blank"));
    }

    Ok(())
}

fn validate_shards(config: &Config) -> ConfigResult<()> {
    let s = &config.shards;

    if s.count == 0 {
        return Err(invalid("shards.count", "shard count must be at least 1"));
    }

    if let Some(id) = s.ids.iter().find(|id| **id >= s.count) {
        return Err(invalid(
            "shards.ids",
            format!("shard id {id} is not below shard count {}", s.count),
        ));
    }

    Ok(())
}

fn validate_presence(config: &Config) -> ConfigResult<()> {
    if !matches!(
        config.presence.status.as_str(),
        "online" | "idle" | "dnd" | "invisible"
    ) {
        return Err(invalid(
            "presence.status",
            format!(
                "unsupported status '{}'; expected one of: online, idle, dnd, invisible",
                config.presence.status
            ),
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;

    if !matches!(
        l.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid(
            "logging.level",
            format!("unsupported level '{}'", l.level),
        ));
    }

    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }

    Ok(())
}
