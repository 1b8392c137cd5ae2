//! Config file discovery and layered loading.
//!
//! 1. Parse the embedded `defaults.toml`
//! 2. Merge `~/.shardline/config.toml` (user)
//! 3. Merge the file passed with `--config` (explicit)
//! 4. Apply env var fallbacks for fields no file set
//! 5. Resolve `${VAR}` references
//! 6. Deserialize and validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars, resolve_env_references};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge_tracking, record_leaves};
use crate::show::ResolvedConfig;
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MiB).
const MAX_CONFIG_FILE_SIZE: usize = 1_048_576;

/// Load the layered configuration using the process environment and the
/// current user's home directory.
///
/// # Errors
///
/// Returns a [`ConfigError`] if a config file is unreadable or malformed,
/// if the explicit file does not exist, or if the merged configuration
/// fails validation.
pub fn load(explicit: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let home = home_directory()?;
    load_with_env(explicit, Some(&home), &collect_env_vars())
}

/// Load the layered configuration from explicit inputs.
///
/// `home_dir` is the directory containing `.shardline/`; `None` skips the
/// user layer.
///
/// # Errors
///
/// See [`load`].
pub fn load_with_env<S: ::std::hash::BuildHasher>(
    explicit: Option<&Path>,
    home_dir: Option<&Path>,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<ResolvedConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", ConfigLayer::Defaults, &mut field_sources);

    if let Some(home) = home_dir {
        let user_path = home.join(".shardline").join("config.toml");
        if let Some(overlay) = try_load_file(&user_path)? {
            deep_merge_tracking(
                &mut merged,
                &overlay,
                "",
                ConfigLayer::User,
                &mut field_sources,
            );
            loaded_files.push(user_path.display().to_string());
            info!(path = %user_path.display(), "loaded user config");
        }
    }

    if let Some(path) = explicit {
        let overlay = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        deep_merge_tracking(
            &mut merged,
            &overlay,
            "",
            ConfigLayer::Explicit,
            &mut field_sources,
        );
        loaded_files.push(path.display().to_string());
        info!(path = %path.display(), "loaded config file");
    }

    let env_count = apply_env_fallbacks(&mut merged, &mut field_sources, env_vars);
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    resolve_env_references(&mut merged, env_vars);
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Read and parse a TOML file, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    let value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(Some(value))
}

fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}
