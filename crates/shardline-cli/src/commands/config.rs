//! Config commands.

use anyhow::Result;
use colored::Colorize;
use shardline_config::ResolvedConfig;

/// Print the resolved configuration with per-field sources.
pub(crate) fn show(resolved: &ResolvedConfig) -> Result<()> {
    shardline_config::validate(&resolved.config)?;
    let rendered = resolved
        .show()
        .map_err(|_| anyhow::anyhow!("failed to render configuration"))?;
    println!("{rendered}");
    if resolved.config.gateway.token.is_none() {
        println!(
            "{}",
            "# No token configured: set SHARDLINE_TOKEN or gateway.token".yellow()
        );
    }
    Ok(())
}
