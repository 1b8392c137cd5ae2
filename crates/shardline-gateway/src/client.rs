//! Client facade over a set of shards.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use shardline_config::Config;
use shardline_events::{EventBus, EventReceiver};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::EntityCache;
use crate::config::ShardConfig;
use crate::connection::Connector;
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::shard::{ShardHandle, spawn_shard};

/// Owns the shards of one process, sharing an event bus and entity cache
/// between them.
pub struct GatewayClient {
    shards: BTreeMap<u32, ShardHandle>,
    tasks: Vec<JoinHandle<()>>,
    bus: EventBus,
    cache: Arc<dyn EntityCache>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("shards", &self.shards.keys().collect::<Vec<_>>())
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    /// Spawn one idle shard per config with the built-in handlers.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        configs: Vec<ShardConfig>,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn EntityCache>,
    ) -> Self {
        Self::with_dispatcher(configs, &Dispatcher::new(), connector, cache)
    }

    /// Spawn one idle shard per config using `dispatcher`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn with_dispatcher(
        configs: Vec<ShardConfig>,
        dispatcher: &Dispatcher,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn EntityCache>,
    ) -> Self {
        let bus = EventBus::new();
        let mut shards = BTreeMap::new();
        let mut tasks = Vec::with_capacity(configs.len());

        for config in configs {
            let index = config.shard_index;
            let (handle, task) = spawn_shard(
                config,
                dispatcher.clone(),
                Arc::clone(&connector),
                Arc::clone(&cache),
                bus.clone(),
            );
            if shards.insert(index, handle).is_some() {
                warn!(shard = index, "duplicate shard index, replacing earlier shard");
            }
            tasks.push(task);
        }

        Self {
            shards,
            tasks,
            bus,
            cache,
        }
    }

    /// Build shards for every id in `config.shards`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if a shard config cannot be derived.
    pub fn from_config(
        config: &Config,
        connector: Arc<dyn Connector>,
        cache: Arc<dyn EntityCache>,
    ) -> Result<Self, GatewayError> {
        let configs = config
            .shards
            .effective_ids()
            .into_iter()
            .map(|index| ShardConfig::from_config(config, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(configs, connector, cache))
    }

    /// Ask every shard to connect.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if a shard task has stopped.
    pub async fn connect_all(&self) -> Result<(), GatewayError> {
        info!(shards = self.shards.len(), "connecting shards");
        for shard in self.shards.values() {
            shard.connect().await?;
        }
        Ok(())
    }

    /// Destroy every shard's session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if a shard task has stopped.
    pub async fn destroy_all(&self) -> Result<(), GatewayError> {
        for shard in self.shards.values() {
            shard.destroy().await?;
        }
        Ok(())
    }

    /// Handle to shard `index`.
    #[must_use]
    pub fn shard(&self, index: u32) -> Option<&ShardHandle> {
        self.shards.get(&index)
    }

    /// All shard handles, by index.
    pub fn shards(&self) -> impl Iterator<Item = &ShardHandle> {
        self.shards.values()
    }

    /// Mean heartbeat latency across shards.
    #[must_use]
    pub fn ping(&self) -> Duration {
        let total = self
            .shards
            .values()
            .fold(Duration::ZERO, |acc, shard| acc.saturating_add(shard.latency()));
        u32::try_from(self.shards.len())
            .ok()
            .and_then(|count| total.checked_div(count))
            .unwrap_or_default()
    }

    /// Receive events from every shard.
    #[must_use]
    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    /// The shared event bus.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// The shared entity cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn EntityCache> {
        &self.cache
    }

    /// Destroy every session and wait for the shard tasks to finish.
    pub async fn shutdown(self) {
        for shard in self.shards.values() {
            // A stopped shard has nothing left to shut down.
            let _ = shard.shutdown().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "shard task failed");
            }
        }
        info!("gateway client shut down");
    }
}
