//! Shard actor: one task per shard owning its session and transport.
//!
//! All session mutation happens on the runner task. Dials and member
//! prefetches run as spawned futures and report back through an internal
//! channel, tagged with the epoch that issued them.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use shardline_events::EventBus;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span};

use crate::cache::EntityCache;
use crate::config::ShardConfig;
use crate::connection::{Connector, Transport, TransportEvent};
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::protocol::{Packet, Presence, close_code};
use crate::session::{Command, ShardSession, Status};

/// Capacity of a shard's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Requests from a [`ShardHandle`].
#[derive(Debug)]
enum ShardCommand {
    Connect,
    Destroy,
    Send {
        packet: Packet,
        forced: bool,
    },
    UpdatePresence(Presence),
    UpdateVoiceState {
        guild_id: String,
        channel_id: Option<String>,
        self_mute: bool,
        self_deaf: bool,
    },
    RequestGuildMembers {
        guild_id: String,
        query: String,
        limit: u32,
    },
    Shutdown,
}

/// Results of work spawned by the runner.
enum Completion {
    Dialed {
        epoch: u64,
        result: Result<Box<dyn Transport>, GatewayError>,
    },
    PrefetchSettled {
        epoch: u64,
        failures: Vec<GatewayError>,
    },
}

/// Read-only view of a shard, refreshed after every step of its runner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardSnapshot {
    /// Connection status.
    pub status: Status,
    /// Mean heartbeat round trip.
    pub latency: Duration,
    /// Last sequence number seen.
    pub sequence: Option<u64>,
    /// Resumable session token.
    pub session_id: Option<String>,
    /// Packets waiting for rate budget.
    pub queued: usize,
}

// ── Runner ───────────────────────────────────────────────────

struct ShardRunner {
    session: ShardSession,
    connector: Arc<dyn Connector>,
    cache: Arc<dyn EntityCache>,
    transport: Option<Box<dyn Transport>>,
    commands: mpsc::Receiver<ShardCommand>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    snapshot: watch::Sender<ShardSnapshot>,
}

impl ShardRunner {
    async fn run(mut self) {
        debug!("shard task started");
        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    None | Some(ShardCommand::Shutdown) => {
                        self.session.destroy();
                        self.flush().await;
                        self.publish_snapshot();
                        break;
                    },
                    Some(command) => self.handle_command(command),
                },
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion).await;
                },
                event = next_transport_event(&mut self.transport) => {
                    self.handle_transport(event);
                },
                () = sleep_until(deadline) => self.session.on_timer(Instant::now()),
            }
            self.flush().await;
            self.publish_snapshot();
        }
        debug!("shard task stopped");
    }

    fn handle_command(&mut self, command: ShardCommand) {
        let now = Instant::now();
        match command {
            ShardCommand::Connect => self.session.connect(now),
            ShardCommand::Destroy => self.session.destroy(),
            ShardCommand::Send { packet, forced } => self.session.send(packet, forced, now),
            ShardCommand::UpdatePresence(presence) => self.session.update_presence(presence, now),
            ShardCommand::UpdateVoiceState {
                guild_id,
                channel_id,
                self_mute,
                self_deaf,
            } => self.session.update_voice_state(
                &guild_id,
                channel_id.as_deref(),
                self_mute,
                self_deaf,
                now,
            ),
            ShardCommand::RequestGuildMembers {
                guild_id,
                query,
                limit,
            } => self
                .session
                .request_guild_members(&guild_id, &query, limit, now),
            // Handled by the run loop.
            ShardCommand::Shutdown => {},
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        let now = Instant::now();
        match completion {
            Completion::Dialed { epoch, result } => match result {
                Ok(mut transport) => {
                    if self.session.on_dialed(epoch, now) {
                        self.transport = Some(transport);
                    } else if let Err(e) = transport.close(close_code::NORMAL).await {
                        debug!(error = %e, "failed to close stale transport");
                    }
                },
                Err(e) => self.session.on_dial_failed(epoch, &e, now),
            },
            Completion::PrefetchSettled { epoch, failures } => {
                self.session.on_prefetch_settled(epoch, failures, now);
            },
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        let now = Instant::now();
        match event {
            TransportEvent::Message(text) => self.session.on_message(&text, now),
            TransportEvent::Closed(code) => {
                self.transport = None;
                self.session.on_close(code, now);
            },
            TransportEvent::Error(e) => {
                self.transport = None;
                self.session.on_error(&e, now);
            },
        }
    }

    /// Execute session commands until none are left.
    async fn flush(&mut self) {
        loop {
            let commands = self.session.take_commands();
            if commands.is_empty() {
                return;
            }
            for command in commands {
                self.execute(command).await;
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Dial { url, epoch } => {
                let connector = Arc::clone(&self.connector);
                let tx = self.completions_tx.clone();
                tokio::spawn(
                    async move {
                        let result = connector.connect(&url).await;
                        let _ = tx.send(Completion::Dialed { epoch, result });
                    }
                    .in_current_span(),
                );
            },
            Command::Transmit(packet) => {
                let Some(transport) = self.transport.as_mut() else {
                    debug!(op = packet.op, "no transport, dropping packet");
                    return;
                };
                if let Err(e) = transport.send(&packet).await {
                    self.session.on_error(&e, Instant::now());
                }
            },
            Command::Close { code } => {
                if let Some(mut transport) = self.transport.take()
                    && let Err(e) = transport.close(code).await
                {
                    debug!(code, error = %e, "close frame not delivered");
                }
            },
            Command::FetchMembers { epoch, guild_ids } => {
                let cache = Arc::clone(&self.cache);
                let tx = self.completions_tx.clone();
                tokio::spawn(
                    async move {
                        let fetches = guild_ids.iter().map(|id| {
                            let cache = Arc::clone(&cache);
                            async move {
                                cache.fetch_members(id).await.map_err(|e| {
                                    GatewayError::Prefetch {
                                        guild_id: id.clone(),
                                        message: e.to_string(),
                                    }
                                })
                            }
                        });
                        let failures = join_all(fetches)
                            .await
                            .into_iter()
                            .filter_map(Result::err)
                            .collect();
                        let _ = tx.send(Completion::PrefetchSettled { epoch, failures });
                    }
                    .in_current_span(),
                );
            },
        }
    }

    fn publish_snapshot(&self) {
        let next = ShardSnapshot {
            status: self.session.status(),
            latency: self.session.latency(),
            sequence: self.session.sequence(),
            session_id: self.session.session_id().map(str::to_owned),
            queued: self.session.queued(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_transport_event(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Start a shard task. It stays idle until [`ShardHandle::connect`].
#[must_use]
pub fn spawn_shard(
    config: ShardConfig,
    dispatcher: Dispatcher,
    connector: Arc<dyn Connector>,
    cache: Arc<dyn EntityCache>,
    bus: EventBus,
) -> (ShardHandle, JoinHandle<()>) {
    let index = config.shard_index;
    let span = info_span!("shard", index, count = config.shard_count);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(ShardSnapshot::default());

    let runner = ShardRunner {
        session: ShardSession::new(config, dispatcher, Arc::clone(&cache), bus),
        connector,
        cache,
        transport: None,
        commands: command_rx,
        completions_tx,
        completions_rx,
        snapshot: snapshot_tx,
    };
    let task = tokio::spawn(runner.run().instrument(span));

    let handle = ShardHandle {
        index,
        commands: command_tx,
        snapshot: snapshot_rx,
    };
    (handle, task)
}

// ── Handle ───────────────────────────────────────────────────

/// Cloneable handle to a running shard.
#[derive(Debug, Clone)]
pub struct ShardHandle {
    index: u32,
    commands: mpsc::Sender<ShardCommand>,
    snapshot: watch::Receiver<ShardSnapshot>,
}

impl ShardHandle {
    /// Index of this shard.
    #[must_use]
    pub fn index(&self) -> u32 {
        self.index
    }

    async fn request(&self, command: ShardCommand) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::ShardGone)
    }

    /// Start connecting.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if the shard task has stopped.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.request(ShardCommand::Connect).await
    }

    /// Close the connection and reset the session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if the shard task has stopped.
    pub async fn destroy(&self) -> Result<(), GatewayError> {
        self.request(ShardCommand::Destroy).await
    }

    /// Send a packet. Forced packets skip the rate budget.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if the shard task has stopped.
    pub async fn send(&self, packet: Packet, forced: bool) -> Result<(), GatewayError> {
        self.request(ShardCommand::Send { packet, forced }).await
    }

    /// Replace the shard's presence.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if the shard task has stopped.
    pub async fn update_presence(&self, presence: Presence) -> Result<(), GatewayError> {
        self.request(ShardCommand::UpdatePresence(presence)).await
    }

    /// Join, move or (with `channel_id = None`) leave a voice channel.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if the shard task has stopped.
    pub async fn update_voice_state(
        &self,
        guild_id: impl Into<String>,
        channel_id: Option<String>,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), GatewayError> {
        self.request(ShardCommand::UpdateVoiceState {
            guild_id: guild_id.into(),
            channel_id,
            self_mute,
            self_deaf,
        })
        .await
    }

    /// Ask the gateway for guild members matching `query`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if the shard task has stopped.
    pub async fn request_guild_members(
        &self,
        guild_id: impl Into<String>,
        query: impl Into<String>,
        limit: u32,
    ) -> Result<(), GatewayError> {
        self.request(ShardCommand::RequestGuildMembers {
            guild_id: guild_id.into(),
            query: query.into(),
            limit,
        })
        .await
    }

    /// Stop the shard task after destroying the session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if the shard task has stopped.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.request(ShardCommand::Shutdown).await
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> Status {
        self.snapshot.borrow().status
    }

    /// Mean heartbeat round trip over the last three heartbeats.
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.snapshot.borrow().latency
    }

    /// Last sequence number seen.
    #[must_use]
    pub fn sequence(&self) -> Option<u64> {
        self.snapshot.borrow().sequence
    }

    /// Current resumable session token.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.snapshot.borrow().session_id.clone()
    }

    /// Full read-only view.
    #[must_use]
    pub fn snapshot(&self) -> ShardSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the shard reaches `status`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ShardGone`] if the shard task stops first.
    pub async fn wait_for_status(&self, status: Status) -> Result<(), GatewayError> {
        let mut rx = self.snapshot.clone();
        rx.wait_for(|snapshot| snapshot.status == status)
            .await
            .map(|_| ())
            .map_err(|_| GatewayError::ShardGone)
    }
}
