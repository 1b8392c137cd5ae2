//! Shardline CLI - run gateway shards from a layered configuration.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config_bridge;

use commands::{config, run};

/// Shardline - gateway shard runner
#[derive(Parser)]
#[command(name = "shardline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured shards and run until Ctrl+C
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bot token (overrides config and environment)
        #[arg(long, env = "SHARDLINE_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Total shard count; runs every shard
        #[arg(long)]
        shards: Option<u32>,

        /// Fetch every guild's members before reporting ready
        #[arg(long)]
        fetch_members: bool,
    },

    /// View configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the resolved configuration with the source of each value
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Commands {
    fn config_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Run { config, .. }
            | Self::Config {
                command: ConfigCommands::Show { config },
            } => config.as_ref(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config once; logging falls back to defaults if it is broken so
    // the error itself can be reported.
    let resolved = shardline_config::load(cli.command.config_path().map(PathBuf::as_path));

    let log_config = match &resolved {
        Ok(resolved) => {
            let mut lc = config_bridge::to_log_config(&resolved.config);
            if cli.verbose {
                "debug".clone_into(&mut lc.level);
            }
            lc
        },
        Err(_) => {
            let level = if cli.verbose { "debug" } else { "info" };
            shardline_telemetry::LogConfig::new(level)
                .with_format(shardline_telemetry::LogFormat::Compact)
        },
    };
    if let Err(e) = shardline_telemetry::setup_logging(&log_config) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let resolved = resolved?;
    match cli.command {
        Commands::Run {
            config: _,
            token,
            shards,
            fetch_members,
        } => {
            let overrides = run::Overrides {
                token,
                shards,
                fetch_members,
            };
            run::run_shards(resolved.config, overrides).await?;
        },
        Commands::Config {
            command: ConfigCommands::Show { config: _ },
        } => {
            config::show(&resolved)?;
        },
    }

    Ok(())
}
