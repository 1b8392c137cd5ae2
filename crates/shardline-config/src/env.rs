//! Environment variable fallbacks and `${VAR}` reference resolution.
//!
//! Env vars are fallbacks, not overrides: they only fill fields that no
//! config file set.

use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::debug;

use crate::merge::{ConfigLayer, FieldSources};

struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
}

/// Supported env vars, in priority order (first match wins per field).
const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "SHARDLINE_TOKEN",
        field_path: "gateway.token",
    },
    EnvMapping {
        var_name: "DISCORD_BOT_TOKEN",
        field_path: "gateway.token",
    },
    EnvMapping {
        var_name: "SHARDLINE_GATEWAY_URL",
        field_path: "gateway.url",
    },
    EnvMapping {
        var_name: "SHARDLINE_SHARD_COUNT",
        field_path: "shards.count",
    },
    EnvMapping {
        var_name: "SHARDLINE_LOG_LEVEL",
        field_path: "logging.level",
    },
];

/// Apply env var fallbacks to fields not set by any config file.
///
/// Fields that only carry a compiled-in default count as unset. Returns the
/// number of env vars applied.
pub(crate) fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> usize {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        let set_by_file = sources
            .get(mapping.field_path)
            .is_some_and(|layer| *layer != ConfigLayer::Defaults);
        if set_by_file {
            continue;
        }

        if let Some(val) = env_vars.get(mapping.var_name) {
            debug!(
                var = mapping.var_name,
                field = mapping.field_path,
                "applying env var fallback"
            );
            set_field_from_string(merged, mapping.field_path, val);
            sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
            count = count.saturating_add(1);
        }
    }

    count
}

/// Resolve `${VAR}` references within string values in the config tree.
///
/// Unresolved references are left as-is.
pub(crate) fn resolve_env_references<S: ::std::hash::BuildHasher>(
    val: &mut toml::Value,
    env_vars: &HashMap<String, String, S>,
) {
    match val {
        toml::Value::String(s) => {
            if s.contains("${") {
                *s = resolve_string_refs(s, env_vars);
            }
        },
        toml::Value::Table(table) => {
            for (_, child) in table.iter_mut() {
                resolve_env_references(child, env_vars);
            }
        },
        toml::Value::Array(arr) => {
            for child in arr.iter_mut() {
                resolve_env_references(child, env_vars);
            }
        },
        _ => {},
    }
}

fn resolve_string_refs<S: ::std::hash::BuildHasher>(
    input: &str,
    env_vars: &HashMap<String, String, S>,
) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start..];
        let Some(end) = after.find('}') else {
            result.push_str(after);
            return result;
        };
        let var_name = &after[2..end];
        match env_vars.get(var_name) {
            Some(val) if !var_name.is_empty() => result.push_str(val),
            _ => {
                debug!(var = var_name, "unresolved env var reference in config");
                let _ = write!(result, "${{{var_name}}}");
            },
        }
        rest = &after[end.saturating_add(1)..];
    }

    result.push_str(rest);
    result
}

/// Set a dotted field in the TOML tree, creating intermediate tables.
fn set_field_from_string(root: &mut toml::Value, path: &str, val: &str) {
    let toml_val = coerce_to_toml_value(path, val);
    let Some((parents, leaf)) = path.rsplit_once('.') else {
        if let Some(table) = root.as_table_mut() {
            table.insert(path.to_owned(), toml_val);
        }
        return;
    };

    let mut current = root;
    for segment in parents.split('.') {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        current = table
            .entry(segment.to_owned())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    if let Some(table) = current.as_table_mut() {
        table.insert(leaf.to_owned(), toml_val);
    }
}

fn coerce_to_toml_value(path: &str, val: &str) -> toml::Value {
    if matches!(path, "shards.count")
        && let Ok(i) = val.parse::<i64>()
    {
        return toml::Value::Integer(i);
    }
    toml::Value::String(val.to_owned())
}

/// Collect all current environment variables into a map.
#[must_use]
pub(crate) fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}
