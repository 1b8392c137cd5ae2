//! Source-annotated display for `config show`.

use std::fmt::{self, Write as _};

use crate::merge::FieldSources;
use crate::types::Config;

/// A resolved configuration together with source annotations.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final merged configuration.
    pub config: Config,
    /// Dotted field path to the layer that set it.
    pub field_sources: FieldSources,
    /// Config files that were loaded, lowest precedence first.
    pub loaded_files: Vec<String>,
}

impl ResolvedConfig {
    /// Render the configuration as TOML, annotating each value with the
    /// layer that set it. The token is never included.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn show(&self) -> Result<String, fmt::Error> {
        let toml_str = toml::to_string_pretty(&self.config).map_err(|_| fmt::Error)?;
        let mut output = String::from("# Resolved shardline configuration\n");

        if !self.loaded_files.is_empty() {
            output.push_str("#\n# Loaded files (lowest precedence first):\n");
            for path in &self.loaded_files {
                writeln!(output, "#   {path}")?;
            }
        }
        if self.config.gateway.token.is_some() {
            let source = self
                .field_sources
                .get("gateway.token")
                .map_or_else(String::new, |layer| format!(" [{layer}]"));
            writeln!(output, "#\n# gateway.token is set (redacted){source}")?;
        }
        output.push('\n');

        let mut section = String::new();
        for line in toml_str.lines() {
            let trimmed = line.trim();
            if let Some(header) = trimmed.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
                section = header.to_owned();
            } else if let Some((key, _)) = trimmed.split_once('=') {
                let path = format!("{section}.{}", key.trim());
                if let Some(layer) = self.field_sources.get(&path) {
                    writeln!(output, "{line}  # [{layer}]")?;
                    continue;
                }
            }
            output.push_str(line);
            output.push('\n');
        }

        Ok(output)
    }
}
