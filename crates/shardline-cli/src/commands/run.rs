//! Shard run command.

use std::sync::Arc;

use anyhow::{Result, bail};
use colored::Colorize;
use shardline_config::Config;
use shardline_events::ShardEvent;
use shardline_gateway::{GatewayClient, MemoryCache, WsConnector};
use tracing::{debug, error, info, warn};

/// Command-line overrides applied on top of the loaded configuration.
#[derive(Debug, Default)]
pub(crate) struct Overrides {
    pub(crate) token: Option<String>,
    pub(crate) shards: Option<u32>,
    pub(crate) fetch_members: bool,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(token) = self.token {
            config.gateway.token = Some(token);
        }
        if let Some(count) = self.shards {
            config.shards.count = count;
            config.shards.ids.clear();
        }
        if self.fetch_members {
            config.gateway.fetch_all_members = true;
        }
    }
}

/// Connect every configured shard and log their events until Ctrl+C or a
/// fatal close.
pub(crate) async fn run_shards(mut config: Config, overrides: Overrides) -> Result<()> {
    overrides.apply(&mut config);
    shardline_config::validate(&config)?;

    println!("{}", "Starting shardline...".cyan().bold());
    println!("  Gateway: {}", config.gateway.url.yellow());
    println!(
        "  Shards: {} of {}",
        format!("{:?}", config.shards.effective_ids()).yellow(),
        config.shards.count.to_string().yellow()
    );
    println!(
        "  Member prefetch: {}",
        if config.gateway.fetch_all_members {
            "enabled".green()
        } else {
            "disabled".red()
        }
    );

    let client = GatewayClient::from_config(
        &config,
        Arc::new(WsConnector::new()),
        Arc::new(MemoryCache::new()),
    )?;
    let mut events = client.subscribe();
    client.connect_all().await?;
    println!("\n{}", "Running (Ctrl+C to stop)...".cyan());

    let mut fatal = None;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                }
                info!("shutdown requested");
                break;
            },
            event = events.recv() => {
                let Some(event) = event else { break };
                if let ShardEvent::Fatal { metadata, code, message } = &*event {
                    error!(shard = metadata.shard_id, code, "{message}");
                    fatal = Some(format!("shard {} closed with {code}: {message}", metadata.shard_id));
                    break;
                }
                log_event(&event);
            },
        }
    }

    if let Err(e) = client.destroy_all().await {
        debug!(error = %e, "destroy during shutdown");
    }
    client.shutdown().await;
    println!("{}", "Shardline stopped.".yellow());

    if let Some(reason) = fatal {
        bail!(reason);
    }
    Ok(())
}

fn log_event(event: &ShardEvent) {
    let shard = event.metadata().shard_id;
    match event {
        ShardEvent::Ready {
            session_id,
            guild_count,
            ..
        } => info!(shard, session_id = %session_id, guild_count, "session ready"),
        ShardEvent::ShardReady {
            unavailable_guilds,
            ..
        } => info!(shard, unavailable_guilds, "shard ready"),
        ShardEvent::Resumed { replayed, .. } => info!(shard, replayed, "shard resumed"),
        ShardEvent::Closed { code, .. } => info!(shard, code, "shard connection closed"),
        ShardEvent::Reconnecting { .. } => info!(shard, "shard reconnecting"),
        ShardEvent::Warn { message, .. } | ShardEvent::Error { message, .. } => {
            warn!(shard, "{message}");
        },
        other => debug!(shard, event = other.event_type(), "shard event"),
    }
}
