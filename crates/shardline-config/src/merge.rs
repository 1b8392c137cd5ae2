//! Deep merge of TOML layers with per-field source tracking.
//!
//! Layers merge as raw [`toml::Value`] trees, so a key missing from an
//! overlay never clobbers the base layer.

use std::collections::HashMap;

/// Which configuration layer a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    /// Compiled-in defaults (`defaults.toml`).
    Defaults,
    /// User-level configuration (`~/.shardline/config.toml`).
    User,
    /// File passed explicitly on the command line.
    Explicit,
    /// Environment variable fallback.
    Environment,
}

impl std::fmt::Display for ConfigLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Defaults => write!(f, "defaults"),
            Self::User => write!(f, "user (~/.shardline/config.toml)"),
            Self::Explicit => write!(f, "explicit (--config)"),
            Self::Environment => write!(f, "environment variable"),
        }
    }
}

/// Tracks which layer set each leaf field (dotted path).
pub type FieldSources = HashMap<String, ConfigLayer>;

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_owned()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Deep-merge `overlay` into `base`, recording `layer` as the source of
/// every leaf the overlay sets.
///
/// Tables merge per key; scalars and arrays replace the base value.
pub(crate) fn deep_merge_tracking(
    base: &mut toml::Value,
    overlay: &toml::Value,
    prefix: &str,
    layer: ConfigLayer,
    sources: &mut FieldSources,
) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let path = join_path(prefix, key);
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge_tracking(base_val, overlay_val, &path, layer, sources);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                    record_leaves(overlay_val, &path, layer, sources);
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
            record_leaves(overlay, prefix, layer, sources);
        },
    }
}

/// Mark every leaf under `val` as set by `layer`.
pub(crate) fn record_leaves(
    val: &toml::Value,
    prefix: &str,
    layer: ConfigLayer,
    sources: &mut FieldSources,
) {
    if let toml::Value::Table(table) = val {
        for (key, child) in table {
            record_leaves(child, &join_path(prefix, key), layer, sources);
        }
    } else {
        sources.insert(prefix.to_owned(), layer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_replaces_scalars_and_keeps_absent_keys() {
        let mut base: toml::Value =
            toml::from_str("[gateway]\nurl = \"a\"\nintents = 1\n").unwrap();
        let overlay: toml::Value = toml::from_str("[gateway]\nintents = 2\n").unwrap();
        let mut sources = FieldSources::new();
        record_leaves(&base, "", ConfigLayer::Defaults, &mut sources);

        deep_merge_tracking(&mut base, &overlay, "", ConfigLayer::User, &mut sources);

        assert_eq!(base["gateway"]["url"].as_str(), Some("a"));
        assert_eq!(base["gateway"]["intents"].as_integer(), Some(2));
        assert_eq!(sources["gateway.url"], ConfigLayer::Defaults);
        assert_eq!(sources["gateway.intents"], ConfigLayer::User);
    }

    #[test]
    fn test_new_tables_are_tracked() {
        let mut base: toml::Value = toml::from_str("[shards]\ncount = 1\n").unwrap();
        let overlay: toml::Value = toml::from_str("[presence]\nstatus = \"idle\"\n").unwrap();
        let mut sources = FieldSources::new();

        deep_merge_tracking(&mut base, &overlay, "", ConfigLayer::Explicit, &mut sources);

        assert_eq!(base["presence"]["status"].as_str(), Some("idle"));
        assert_eq!(sources["presence.status"], ConfigLayer::Explicit);
    }
}
