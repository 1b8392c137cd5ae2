//! Shard session state machine.
//!
//! A [`ShardSession`] is driven one input at a time: transport events,
//! timer expiries and owner requests. It never performs I/O itself. Every
//! transmission, close and dial it decides on is appended to a command list
//! that the shard runner executes after each step. Time is passed in
//! explicitly, so all timers are plain deadlines owned by the session.
//!
//! Connection-scoped state (queue budget, heartbeat timer, readiness timer)
//! is torn down on every close. Session-scoped state (`session_id`,
//! `sequence`, resume URL) survives until a fresh identify or `destroy`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use shardline_events::{EventBus, EventMetadata, ShardEvent};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::cache::EntityCache;
use crate::config::ShardConfig;
use crate::dispatch::{Dispatcher, Effect, HandlerContext, Route, route};
use crate::error::GatewayError;
use crate::heartbeat::{Beat, HeartbeatMonitor};
use crate::protocol::{self, Packet, Presence, close_code};
use crate::queue::OutboundQueue;
use crate::readiness::{Readiness, ReadinessAggregator, unavailable_count};

/// Grace period before any dial after the first.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5500);

/// Delay before resuming after a resumable invalid session.
pub const RESUME_DELAY: Duration = Duration::from_millis(2500);

/// How long a dial may take to produce a `HELLO` before the attempt is
/// abandoned as an abnormal close.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

// ── Status ───────────────────────────────────────────────────

/// Connection status of a shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    /// Not connected and not trying to be.
    #[default]
    Idle,
    /// Dialing the gateway.
    Connecting,
    /// Identify sent, waiting for `READY`.
    Identifying,
    /// Resume sent, waiting for `RESUMED`.
    Resuming,
    /// All guilds available, member prefetch in flight.
    Nearly,
    /// Fully operational.
    Ready,
    /// Waiting out the grace period before redialing.
    Reconnecting,
    /// Transport closed.
    Disconnected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Nearly => "nearly",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

// ── Commands ─────────────────────────────────────────────────

/// I/O the runner performs on behalf of the session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    /// Open a transport to `url`. The completion must carry `epoch`.
    Dial { url: String, epoch: u64 },
    /// Write a packet to the open transport.
    Transmit(Packet),
    /// Close the open transport and drop it.
    Close { code: u16 },
    /// Fetch members of each guild; report back with `epoch`.
    FetchMembers { epoch: u64, guild_ids: Vec<String> },
}

// ── Session ──────────────────────────────────────────────────

/// Protocol state for one shard.
pub(crate) struct ShardSession {
    config: ShardConfig,
    status: Status,
    sequence: Option<u64>,
    session_id: Option<String>,
    resume_url: Option<String>,
    resume_sequence: Option<u64>,
    /// Bumped on every dial and on destroy; stale completions carry an
    /// older value.
    epoch: u64,
    transport_open: bool,
    dialing: bool,
    ever_dialed: bool,
    dial_at: Option<Instant>,
    hello_at: Option<Instant>,
    resume_at: Option<Instant>,
    heartbeat: HeartbeatMonitor,
    queue: OutboundQueue,
    readiness: ReadinessAggregator,
    dispatcher: Dispatcher,
    cache: Arc<dyn EntityCache>,
    bus: EventBus,
    commands: Vec<Command>,
}

impl ShardSession {
    pub(crate) fn new(
        config: ShardConfig,
        dispatcher: Dispatcher,
        cache: Arc<dyn EntityCache>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            status: Status::Idle,
            sequence: None,
            session_id: None,
            resume_url: None,
            resume_sequence: None,
            epoch: 0,
            transport_open: false,
            dialing: false,
            ever_dialed: false,
            dial_at: None,
            hello_at: None,
            resume_at: None,
            heartbeat: HeartbeatMonitor::new(),
            queue: OutboundQueue::new(),
            readiness: ReadinessAggregator::new(),
            dispatcher,
            cache,
            bus,
            commands: Vec::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) fn latency(&self) -> Duration {
        self.heartbeat.latency()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Earliest pending timer.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        [
            self.dial_at,
            self.hello_at,
            self.resume_at,
            self.heartbeat.deadline(),
            self.queue.retry_at(),
            self.readiness.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Commands produced since the last call, in order.
    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    // ── Owner Requests ───────────────────────────────────────

    /// Start connecting. The first dial of the session's life happens now;
    /// later dials wait out [`RECONNECT_DELAY`].
    pub(crate) fn connect(&mut self, now: Instant) {
        if self.transport_open || self.dialing || self.dial_at.is_some() {
            trace!(status = %self.status, "connect ignored, attempt already in progress");
            return;
        }
        if self.status != Status::Reconnecting {
            self.status = Status::Connecting;
        }
        if self.ever_dialed {
            self.debug(format!(
                "dialing again in {}ms",
                RECONNECT_DELAY.as_millis()
            ));
            self.dial_at = Some(now.checked_add(RECONNECT_DELAY).unwrap_or(now));
        } else {
            self.start_dial(now);
        }
    }

    /// Close with the normal code, cancel every timer and forget the
    /// session. The session can be reused with [`Self::connect`].
    pub(crate) fn destroy(&mut self) {
        if self.transport_open {
            self.commands.push(Command::Close {
                code: close_code::NORMAL,
            });
        }
        self.teardown();
        self.dial_at = None;
        self.epoch = self.epoch.wrapping_add(1);
        self.status = Status::Idle;
        self.session_id = None;
        self.resume_url = None;
        self.sequence = None;
        self.resume_sequence = None;
        info!("shard destroyed");
        let metadata = self.metadata();
        self.publish(ShardEvent::Destroyed { metadata });
    }

    /// Send a packet. Forced packets skip the queue and budget and are
    /// dropped if the transport is not open.
    pub(crate) fn send(&mut self, packet: Packet, forced: bool, now: Instant) {
        if forced {
            if self.transport_open {
                self.commands.push(Command::Transmit(packet));
            } else {
                debug!(op = packet.op, "dropping forced packet, transport not open");
            }
            return;
        }
        self.queue.push(packet);
        self.drain(now);
    }

    pub(crate) fn update_presence(&mut self, presence: Presence, now: Instant) {
        let packet = protocol::build_presence_update(&presence);
        self.config.presence = Some(presence);
        self.send(packet, true, now);
    }

    pub(crate) fn update_voice_state(
        &mut self,
        guild_id: &str,
        channel_id: Option<&str>,
        self_mute: bool,
        self_deaf: bool,
        now: Instant,
    ) {
        let packet =
            protocol::build_voice_state_update(guild_id, channel_id, self_mute, self_deaf);
        self.send(packet, false, now);
    }

    pub(crate) fn request_guild_members(
        &mut self,
        guild_id: &str,
        query: &str,
        limit: u32,
        now: Instant,
    ) {
        let packet = protocol::build_request_guild_members(guild_id, query, limit);
        self.send(packet, false, now);
    }

    // ── Transport Events ─────────────────────────────────────

    /// A dial finished. Returns `false` if the dial is stale and its
    /// transport must be discarded.
    pub(crate) fn on_dialed(&mut self, epoch: u64, now: Instant) -> bool {
        if epoch != self.epoch || !self.dialing {
            debug!(epoch, current = self.epoch, "discarding stale dial");
            return false;
        }
        self.on_open(now);
        true
    }

    /// A dial failed. Handled like an abnormal close.
    pub(crate) fn on_dial_failed(&mut self, epoch: u64, err: &GatewayError, now: Instant) {
        if epoch != self.epoch || !self.dialing {
            return;
        }
        self.dialing = false;
        warn!(error = %err, "gateway dial failed");
        self.surface_error(err);
        self.handle_close(close_code::ABNORMAL, false, now);
    }

    fn on_open(&mut self, now: Instant) {
        self.dialing = false;
        self.transport_open = true;
        self.debug("connection to gateway opened".to_owned());
        let metadata = self.metadata();
        self.publish(ShardEvent::Opened { metadata });
        self.heartbeat.reset_ack();
        self.queue.open(now);
        if self.session_id.is_some() {
            self.send_resume(now);
        } else {
            self.send_identify(now);
        }
    }

    /// A text frame arrived.
    pub(crate) fn on_message(&mut self, text: &str, now: Instant) {
        match serde_json::from_str::<Packet>(text) {
            Ok(packet) => self.on_packet(packet, now),
            Err(e) => self.on_error(&GatewayError::MalformedPacket(e.to_string()), now),
        }
    }

    /// The transport closed with `code`.
    pub(crate) fn on_close(&mut self, code: u16, now: Instant) {
        if !self.transport_open {
            return;
        }
        self.handle_close(code, false, now);
    }

    /// The transport reported an error. Always reconnects.
    pub(crate) fn on_error(&mut self, err: &GatewayError, now: Instant) {
        warn!(error = %err, "gateway connection error");
        self.surface_error(err);
        self.try_reconnect(now);
    }

    // ── Timers ───────────────────────────────────────────────

    /// Fire every timer due at `now`.
    pub(crate) fn on_timer(&mut self, now: Instant) {
        if self.hello_at.is_some_and(|at| now >= at) {
            self.hello_at = None;
            warn!(timeout = ?HELLO_TIMEOUT, status = %self.status, "no hello from gateway");
            self.surface_error(&GatewayError::HelloTimeout);
            if self.transport_open {
                self.commands.push(Command::Close {
                    code: close_code::RECONNECT,
                });
            }
            self.handle_close(close_code::ABNORMAL, true, now);
        }

        if self.dial_at.is_some_and(|at| now >= at) {
            self.start_dial(now);
        }

        if self.resume_at.is_some_and(|at| now >= at) {
            self.resume_at = None;
            if self.transport_open {
                self.send_resume(now);
            }
        }

        if self.heartbeat.due(now) {
            self.beat(now, true);
        }

        if self.queue.retry_at().is_some_and(|at| now >= at) {
            self.drain(now);
        }

        if self.readiness.due(now) {
            self.readiness.disarm();
            if self.status != Status::Ready {
                let guilds = self.cache.guilds_for_shard(self.config.shard_index);
                let unavailable = unavailable_count(&guilds);
                warn!(unavailable, "readiness deadline passed, forcing ready");
                self.emit_ready(unavailable, now);
            }
        }
    }

    // ── Membership Prefetch ──────────────────────────────────

    /// Every member fetch for readiness settled.
    pub(crate) fn on_prefetch_settled(
        &mut self,
        epoch: u64,
        failures: Vec<GatewayError>,
        now: Instant,
    ) {
        if epoch != self.epoch || self.status != Status::Nearly {
            debug!(epoch, status = %self.status, "ignoring stale member prefetch");
            return;
        }
        for failure in failures {
            warn!(error = %failure, "member prefetch failed");
            let metadata = self.metadata();
            self.publish(ShardEvent::Warn {
                metadata,
                message: format!("error in pre-ready guild member fetching: {failure}"),
            });
        }
        self.emit_ready(0, now);
    }

    // ── Internals ────────────────────────────────────────────

    fn start_dial(&mut self, now: Instant) {
        self.dial_at = None;
        self.hello_at = Some(now.checked_add(HELLO_TIMEOUT).unwrap_or(now));
        self.status = Status::Connecting;
        self.epoch = self.epoch.wrapping_add(1);
        self.dialing = true;
        self.ever_dialed = true;

        let url = match (&self.session_id, &self.resume_url) {
            (Some(_), Some(resume)) => resume.clone(),
            _ => self.config.url.clone(),
        };
        self.debug(format!("connecting to gateway {url}"));
        self.commands.push(Command::Dial {
            url,
            epoch: self.epoch,
        });
    }

    fn send_identify(&mut self, now: Instant) {
        self.status = Status::Identifying;
        self.debug("identifying as new session".to_owned());
        let packet = protocol::build_identify(&self.config);
        self.send(packet, true, now);
        self.sequence = None;
    }

    fn send_resume(&mut self, now: Instant) {
        let Some(session_id) = self.session_id.clone() else {
            self.send_identify(now);
            return;
        };
        self.status = Status::Resuming;
        self.resume_sequence = self.sequence;
        self.debug(format!("resuming session {session_id}"));
        let packet = protocol::build_resume(&self.config.token, &session_id, self.sequence);
        self.send(packet, true, now);
    }

    fn on_packet(&mut self, packet: Packet, now: Instant) {
        if let Some(s) = packet.s
            && self.sequence.is_none_or(|current| s > current)
        {
            self.sequence = Some(s);
        }

        let routed = match route(packet) {
            Ok(routed) => routed,
            Err(e) => {
                self.on_error(&e, now);
                return;
            },
        };

        match routed {
            Route::Hello { heartbeat_interval } => {
                debug!(heartbeat_interval, "received hello");
                self.hello_at = None;
                self.heartbeat
                    .start(now, Duration::from_millis(heartbeat_interval));
            },
            Route::Dispatch { name, data } => self.on_dispatch(&name, data, now),
            Route::HeartbeatRequest => self.beat(now, false),
            Route::HeartbeatAck => self.heartbeat.ack(now),
            Route::Reconnect => {
                self.debug("server requested a reconnect".to_owned());
                self.try_reconnect(now);
            },
            Route::InvalidSession { resumable } => self.on_invalid_session(resumable, now),
            Route::Unknown(op) => trace!(op, "ignoring packet with unhandled opcode"),
        }
    }

    fn on_dispatch(&mut self, name: &str, data: serde_json::Value, now: Instant) {
        trace!(event = name, seq = ?self.sequence, "dispatch");
        let mut ctx = HandlerContext::new(
            self.config.shard_index,
            self.config.shard_count,
            self.status,
            name,
            self.cache.as_ref(),
        );
        match self.dispatcher.dispatch(&mut ctx, data) {
            Ok(()) => {
                for effect in ctx.into_effects() {
                    self.apply(effect, now);
                }
            },
            Err(e) => self.on_error(&e, now),
        }
    }

    fn apply(&mut self, effect: Effect, now: Instant) {
        match effect {
            Effect::Emit(event) => self.publish(event),
            Effect::SessionEstablished {
                session_id,
                resume_url,
            } => {
                info!(session_id = %session_id, "session established");
                self.session_id = Some(session_id);
                self.resume_url = resume_url.and_then(|raw| {
                    let url = protocol::resume_dial_url(&raw, &self.config.url);
                    if url.is_none() {
                        warn!(url = %raw, "ignoring untrusted resume url");
                    }
                    url
                });
            },
            Effect::Resumed => {
                self.status = Status::Ready;
                let replayed = self
                    .sequence
                    .unwrap_or(0)
                    .saturating_sub(self.resume_sequence.unwrap_or(0));
                info!(replayed, "session resumed");
                let metadata = self.metadata();
                self.publish(ShardEvent::Resumed { metadata, replayed });
                self.drain(now);
            },
            Effect::CheckReadiness => self.check_readiness(now),
            Effect::HeartbeatNow => self.beat(now, false),
            Effect::ArmReadyDeadline { guild_count } => self.readiness.arm(now, guild_count),
        }
    }

    fn on_invalid_session(&mut self, resumable: bool, now: Instant) {
        if resumable && self.session_id.is_some() {
            self.debug(format!(
                "session invalidated, resuming in {}ms",
                RESUME_DELAY.as_millis()
            ));
            self.resume_at = Some(now.checked_add(RESUME_DELAY).unwrap_or(now));
        } else {
            self.debug("session invalidated, identifying".to_owned());
            self.session_id = None;
            self.resume_url = None;
            self.sequence = None;
            self.send_identify(now);
        }
    }

    fn check_readiness(&mut self, now: Instant) {
        if matches!(self.status, Status::Ready | Status::Nearly) {
            return;
        }
        let guilds = self.cache.guilds_for_shard(self.config.shard_index);
        match ReadinessAggregator::evaluate(&guilds, self.config.fetch_all_members) {
            Readiness::Waiting { unavailable } => {
                debug!(unavailable, "waiting for guilds to become available");
            },
            Readiness::Nearly { prefetch } => {
                self.status = Status::Nearly;
                if prefetch.is_empty() {
                    self.emit_ready(0, now);
                } else {
                    debug!(guilds = prefetch.len(), "prefetching members before ready");
                    self.commands.push(Command::FetchMembers {
                        epoch: self.epoch,
                        guild_ids: prefetch,
                    });
                }
            },
        }
    }

    fn emit_ready(&mut self, unavailable_guilds: usize, now: Instant) {
        self.status = Status::Ready;
        self.readiness.disarm();
        self.drain(now);
        info!(unavailable_guilds, "shard ready");
        let metadata = self.metadata();
        self.publish(ShardEvent::ShardReady {
            metadata,
            unavailable_guilds,
        });
    }

    fn beat(&mut self, now: Instant, routine: bool) {
        match self.heartbeat.tick(now, routine) {
            Beat::DeadLink => {
                let code = if self.config.constrained_close_codes {
                    close_code::NORMAL
                } else {
                    close_code::DEAD_LINK
                };
                warn!(code, "heartbeat ACK missed, closing dead link");
                self.close_locally(code, now);
            },
            Beat::Send => {
                trace!(seq = ?self.sequence, routine, "sending heartbeat");
                let packet = protocol::build_heartbeat(self.sequence);
                self.send(packet, true, now);
            },
        }
    }

    fn drain(&mut self, now: Instant) {
        self.queue.roll(now);
        for packet in self.queue.drain(self.transport_open) {
            self.commands.push(Command::Transmit(packet));
        }
    }

    /// Idempotent while already reconnecting or connecting.
    fn try_reconnect(&mut self, now: Instant) {
        if matches!(self.status, Status::Reconnecting | Status::Connecting) {
            return;
        }
        if self.transport_open {
            self.commands.push(Command::Close {
                code: close_code::RECONNECT,
            });
            self.teardown();
            let metadata = self.metadata();
            self.publish(ShardEvent::Closed {
                metadata,
                code: close_code::RECONNECT,
            });
        }
        self.status = Status::Reconnecting;
        info!("reconnecting");
        let metadata = self.metadata();
        self.publish(ShardEvent::Reconnecting { metadata });
        self.connect(now);
    }

    fn close_locally(&mut self, code: u16, now: Instant) {
        if self.transport_open {
            self.commands.push(Command::Close { code });
        }
        self.handle_close(code, true, now);
    }

    fn handle_close(&mut self, code: u16, local: bool, now: Instant) {
        let previous = self.status;
        self.teardown();
        self.status = Status::Disconnected;
        info!(code, local, "gateway connection closed");
        let metadata = self.metadata();
        self.publish(ShardEvent::Closed { metadata, code });

        if let Some(fatal) = GatewayError::from_close_code(code) {
            error!(code, error = %fatal, "unrecoverable close, not reconnecting");
            let metadata = self.metadata();
            self.publish(ShardEvent::Fatal {
                metadata,
                code,
                message: fatal.to_string(),
            });
            return;
        }

        if previous != Status::Reconnecting && (code != close_code::NORMAL || local) {
            self.try_reconnect(now);
        }
    }

    /// Reset connection-scoped state. Session identity is kept.
    fn teardown(&mut self) {
        self.transport_open = false;
        self.dialing = false;
        self.hello_at = None;
        self.heartbeat.stop();
        self.queue.clear();
        self.readiness.disarm();
        self.resume_at = None;
    }

    fn surface_error(&self, err: &GatewayError) {
        if self.bus.has_subscribers() {
            self.publish(ShardEvent::Error {
                metadata: self.metadata(),
                message: err.to_string(),
            });
        }
    }

    fn metadata(&self) -> EventMetadata {
        EventMetadata::new(self.config.shard_index, "session")
    }

    fn publish(&self, event: ShardEvent) {
        self.bus.publish(event);
    }

    fn debug(&self, message: String) {
        debug!("{message}");
        self.publish(ShardEvent::Debug {
            metadata: self.metadata(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::protocol::opcode;
    use serde_json::{Value, json};

    struct Harness {
        session: ShardSession,
        cache: Arc<MemoryCache>,
        bus: EventBus,
        now: Instant,
    }

    impl Harness {
        fn new(config: ShardConfig) -> Self {
            let cache = Arc::new(MemoryCache::new());
            let bus = EventBus::new();
            let session = ShardSession::new(
                config,
                Dispatcher::new(),
                Arc::clone(&cache) as Arc<dyn EntityCache>,
                bus.clone(),
            );
            Self {
                session,
                cache,
                bus,
                now: Instant::now(),
            }
        }

        fn standard() -> Self {
            Self::new(ShardConfig::new("tok", 0, 1))
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.session.on_timer(self.now);
        }

        fn dial_epoch(&mut self) -> u64 {
            let commands = self.session.take_commands();
            commands
                .iter()
                .find_map(|c| match c {
                    Command::Dial { epoch, .. } => Some(*epoch),
                    _ => None,
                })
                .expect("expected a dial command")
        }

        fn dial_url(&mut self) -> String {
            let commands = self.session.take_commands();
            commands
                .into_iter()
                .find_map(|c| match c {
                    Command::Dial { url, .. } => Some(url),
                    _ => None,
                })
                .expect("expected a dial command")
        }

        /// Drop the session after READY advertised `resume_url` and return
        /// the URL of the next dial.
        fn redial_after_ready_with(&mut self, resume_url: &str) -> String {
            self.open();
            self.recv(json!({ "op": 10, "d": { "heartbeat_interval": 41250 } }));
            self.recv(json!({
                "op": 0, "t": "READY", "s": 1,
                "d": { "session_id": "abc", "resume_gateway_url": resume_url, "guilds": [] },
            }));
            let _ = self.session.take_commands();
            self.session.on_close(close_code::ABNORMAL, self.now);
            self.advance(RECONNECT_DELAY);
            self.dial_url()
        }

        /// Connect, open the transport and clear the identify/resume commands.
        fn open(&mut self) -> Vec<Command> {
            self.session.connect(self.now);
            let epoch = self.dial_epoch();
            assert!(self.session.on_dialed(epoch, self.now));
            self.session.take_commands()
        }

        fn recv(&mut self, value: Value) {
            self.session.on_message(&value.to_string(), self.now);
        }

        fn ready(&mut self, guilds: Value) {
            self.recv(json!({ "op": 10, "d": { "heartbeat_interval": 41250 } }));
            self.recv(json!({
                "op": 0, "t": "READY", "s": 1,
                "d": { "session_id": "abc", "guilds": guilds },
            }));
        }
    }

    fn ops(commands: &[Command]) -> Vec<u8> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Transmit(p) => Some(p.op),
                _ => None,
            })
            .collect()
    }

    fn closes(commands: &[Command]) -> Vec<u16> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Close { code } => Some(*code),
                _ => None,
            })
            .collect()
    }

    fn queued_packet() -> Packet {
        protocol::build_request_guild_members("1", "", 0)
    }

    #[test]
    fn first_connect_dials_immediately() {
        let mut h = Harness::standard();
        h.session.connect(h.now);
        assert_eq!(h.session.status(), Status::Connecting);
        let commands = h.session.take_commands();
        assert!(matches!(
            &commands[0],
            Command::Dial { url, epoch: 1 } if url == shardline_config::DEFAULT_GATEWAY_URL
        ));
        // Second connect while dialing is a no-op.
        h.session.connect(h.now);
        assert!(h.session.take_commands().is_empty());
    }

    #[test]
    fn open_without_session_identifies() {
        let mut h = Harness::standard();
        let commands = h.open();
        assert_eq!(ops(&commands), vec![opcode::IDENTIFY]);
        assert_eq!(h.session.status(), Status::Identifying);
        assert_eq!(h.session.sequence(), None);
    }

    #[test]
    fn sequence_is_monotonic() {
        let mut h = Harness::standard();
        h.open();
        for s in [3, 7, 5] {
            h.recv(json!({ "op": 0, "t": "TYPING_START", "s": s, "d": {} }));
        }
        h.recv(json!({ "op": 11 }));
        assert_eq!(h.session.sequence(), Some(7));
    }

    #[test]
    fn ready_scenario_reaches_ready_after_guild_arrives() {
        let mut h = Harness::standard();
        let mut rx = h.bus.subscribe();
        h.open();
        h.ready(json!([{ "id": "1", "unavailable": true }]));

        assert_eq!(h.session.session_id(), Some("abc"));
        assert_ne!(h.session.status(), Status::Ready);
        // READY triggers an immediate heartbeat.
        assert_eq!(ops(&h.session.take_commands()), vec![opcode::HEARTBEAT]);

        h.recv(json!({ "op": 0, "t": "GUILD_CREATE", "s": 2, "d": { "id": "1" } }));
        assert_eq!(h.session.status(), Status::Ready);
        assert_eq!(h.session.session_id(), Some("abc"));

        let mut saw_ready = false;
        while let Some(event) = rx.try_recv() {
            if let ShardEvent::ShardReady {
                unavailable_guilds, ..
            } = event.as_ref()
            {
                assert_eq!(*unavailable_guilds, 0);
                saw_ready = true;
            }
        }
        assert!(saw_ready);
    }

    #[test]
    fn resume_after_abnormal_close() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([]));
        h.recv(json!({ "op": 0, "t": "TYPING_START", "s": 42, "d": {} }));
        let _ = h.session.take_commands();

        h.session.on_close(1006, h.now);
        assert_eq!(h.session.status(), Status::Reconnecting);
        assert!(h.session.take_commands().iter().all(|c| !matches!(c, Command::Dial { .. })));

        h.advance(Duration::from_millis(5499));
        assert!(h.session.take_commands().is_empty());
        h.advance(Duration::from_millis(1));
        let epoch = h.dial_epoch();
        assert!(h.session.on_dialed(epoch, h.now));

        let commands = h.session.take_commands();
        let Command::Transmit(resume) = &commands[0] else {
            panic!("expected resume, got {commands:?}");
        };
        assert_eq!(resume.op, opcode::RESUME);
        let d = resume.d.as_ref().unwrap();
        assert_eq!(d["seq"], 42);
        assert_eq!(d["session_id"], "abc");
        assert_eq!(h.session.status(), Status::Resuming);
    }

    #[test]
    fn resumed_reports_replayed_events() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([]));
        h.recv(json!({ "op": 0, "t": "TYPING_START", "s": 10, "d": {} }));
        h.session.on_close(1001, h.now);
        h.advance(RECONNECT_DELAY);
        let epoch = h.dial_epoch();
        h.session.on_dialed(epoch, h.now);

        let mut rx = h.bus.subscribe();
        h.recv(json!({ "op": 0, "t": "TYPING_START", "s": 11, "d": {} }));
        h.recv(json!({ "op": 0, "t": "TYPING_START", "s": 12, "d": {} }));
        h.recv(json!({ "op": 0, "t": "RESUMED", "s": 13, "d": {} }));
        assert_eq!(h.session.status(), Status::Ready);

        let mut replayed = None;
        while let Some(event) = rx.try_recv() {
            if let ShardEvent::Resumed { replayed: n, .. } = event.as_ref() {
                replayed = Some(*n);
            }
        }
        assert_eq!(replayed, Some(3));
    }

    #[test]
    fn fatal_close_never_redials() {
        let mut h = Harness::standard();
        let mut rx = h.bus.subscribe();
        h.open();
        h.session.on_close(4004, h.now);
        assert_eq!(h.session.status(), Status::Disconnected);
        assert_eq!(h.session.next_deadline(), None);

        h.advance(Duration::from_secs(60));
        assert!(h.session.take_commands().is_empty());

        let mut fatal = false;
        while let Some(event) = rx.try_recv() {
            fatal |= matches!(event.as_ref(), ShardEvent::Fatal { code: 4004, .. });
        }
        assert!(fatal);
    }

    #[test]
    fn normal_close_from_server_does_not_reconnect() {
        let mut h = Harness::standard();
        h.open();
        h.session.on_close(1000, h.now);
        assert_eq!(h.session.status(), Status::Disconnected);
        assert_eq!(h.session.next_deadline(), None);
    }

    #[test]
    fn forced_packets_bypass_exhausted_budget() {
        let mut h = Harness::standard();
        h.open();
        h.recv(json!({ "op": 10, "d": { "heartbeat_interval": 120_000 } }));
        for _ in 0..125 {
            h.session.send(queued_packet(), false, h.now);
        }
        assert_eq!(h.session.take_commands().len(), 120);
        assert_eq!(h.session.queued(), 5);

        h.session.send(protocol::build_heartbeat(None), true, h.now);
        assert_eq!(ops(&h.session.take_commands()), vec![opcode::HEARTBEAT]);
        assert_eq!(h.session.queued(), 5);

        // Retry scheduled at the window boundary, not before.
        h.advance(Duration::from_secs(59));
        assert!(h.session.take_commands().is_empty());
        h.advance(Duration::from_secs(1));
        assert_eq!(h.session.take_commands().len(), 5);
    }

    #[test]
    fn forced_packets_dropped_while_closed() {
        let mut h = Harness::standard();
        h.session.send(protocol::build_heartbeat(None), true, h.now);
        assert!(h.session.take_commands().is_empty());
        h.session.send(queued_packet(), false, h.now);
        assert!(h.session.take_commands().is_empty());
        assert_eq!(h.session.queued(), 1);
    }

    #[test]
    fn dead_link_closes_once_and_reconnects() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([]));
        let _ = h.session.take_commands();

        // Immediate heartbeat after READY was never acknowledged.
        h.advance(Duration::from_millis(41_250));
        let commands = h.session.take_commands();
        assert_eq!(closes(&commands), vec![close_code::DEAD_LINK]);
        assert_eq!(h.session.status(), Status::Reconnecting);

        h.advance(Duration::from_millis(41_250));
        let commands = h.session.take_commands();
        assert!(closes(&commands).is_empty());
        assert!(commands.iter().any(|c| matches!(c, Command::Dial { .. })));
    }

    #[test]
    fn constrained_dead_link_uses_normal_code_and_still_reconnects() {
        let mut h = Harness::new(ShardConfig::new("tok", 0, 1).with_constrained_close_codes(true));
        h.open();
        h.ready(json!([]));
        let _ = h.session.take_commands();

        h.advance(Duration::from_millis(41_250));
        assert_eq!(closes(&h.session.take_commands()), vec![close_code::NORMAL]);
        assert_eq!(h.session.status(), Status::Reconnecting);
    }

    #[test]
    fn acked_heartbeats_keep_the_link() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([]));
        h.advance(Duration::from_millis(40));
        h.recv(json!({ "op": 11 }));
        let _ = h.session.take_commands();

        h.advance(Duration::from_millis(41_210));
        assert_eq!(ops(&h.session.take_commands()), vec![opcode::HEARTBEAT]);
        assert_eq!(h.session.latency(), Duration::from_millis(40));
    }

    #[test]
    fn server_reconnect_request_closes_with_resumable_code() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([]));
        let _ = h.session.take_commands();

        h.recv(json!({ "op": 7, "d": null }));
        assert_eq!(closes(&h.session.take_commands()), vec![close_code::RECONNECT]);
        assert_eq!(h.session.status(), Status::Reconnecting);
        assert_eq!(h.session.session_id(), Some("abc"));

        // Idempotent while reconnecting.
        h.session.on_error(&GatewayError::Transport("boom".into()), h.now);
        assert!(h.session.take_commands().is_empty());
    }

    #[test]
    fn invalid_session_not_resumable_identifies_fresh() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([]));
        let _ = h.session.take_commands();

        h.recv(json!({ "op": 9, "d": false }));
        assert_eq!(ops(&h.session.take_commands()), vec![opcode::IDENTIFY]);
        assert_eq!(h.session.session_id(), None);
        assert_eq!(h.session.sequence(), None);
    }

    #[test]
    fn invalid_session_resumable_resumes_later() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([]));
        let _ = h.session.take_commands();

        h.recv(json!({ "op": 9, "d": true }));
        assert!(h.session.take_commands().is_empty());
        h.advance(RESUME_DELAY);
        assert_eq!(ops(&h.session.take_commands()), vec![opcode::RESUME]);
    }

    #[test]
    fn readiness_deadline_forces_ready() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([{ "id": "1", "unavailable": true }, { "id": "2", "unavailable": true }]));
        h.recv(json!({ "op": 11 }));
        let mut rx = h.bus.subscribe();

        h.advance(Duration::from_millis(2400));
        assert_eq!(h.session.status(), Status::Ready);
        let mut forced = None;
        while let Some(event) = rx.try_recv() {
            if let ShardEvent::ShardReady {
                unavailable_guilds, ..
            } = event.as_ref()
            {
                forced = Some(*unavailable_guilds);
            }
        }
        assert_eq!(forced, Some(2));
    }

    #[test]
    fn prefetch_settles_to_ready_despite_failures() {
        let mut h = Harness::new(ShardConfig::new("tok", 0, 1).with_fetch_all_members(true));
        let mut rx = h.bus.subscribe();
        h.open();
        h.ready(json!([{ "id": "1" }, { "id": "2" }]));

        assert_eq!(h.session.status(), Status::Nearly);
        let commands = h.session.take_commands();
        let (epoch, guild_ids) = commands
            .iter()
            .find_map(|c| match c {
                Command::FetchMembers { epoch, guild_ids } => Some((*epoch, guild_ids.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(guild_ids, vec!["1", "2"]);

        // Stale epoch ignored.
        h.session
            .on_prefetch_settled(epoch.wrapping_sub(1), Vec::new(), h.now);
        assert_eq!(h.session.status(), Status::Nearly);

        let failure = GatewayError::Prefetch {
            guild_id: "2".into(),
            message: "timeout".into(),
        };
        h.session.on_prefetch_settled(epoch, vec![failure], h.now);
        assert_eq!(h.session.status(), Status::Ready);

        let mut warned = false;
        while let Some(event) = rx.try_recv() {
            warned |= matches!(event.as_ref(), ShardEvent::Warn { .. });
        }
        assert!(warned);
    }

    #[test]
    fn malformed_message_reconnects() {
        let mut h = Harness::standard();
        let mut rx = h.bus.subscribe();
        h.open();
        h.session.on_message("{not json", h.now);
        assert_eq!(closes(&h.session.take_commands()), vec![close_code::RECONNECT]);
        assert_eq!(h.session.status(), Status::Reconnecting);

        let mut errored = false;
        while let Some(event) = rx.try_recv() {
            errored |= event.is_error();
        }
        assert!(errored);
    }

    #[test]
    fn failed_dial_retries_after_delay() {
        let mut h = Harness::standard();
        h.session.connect(h.now);
        let epoch = h.dial_epoch();
        h.session
            .on_dial_failed(epoch, &GatewayError::Transport("refused".into()), h.now);
        assert_eq!(h.session.status(), Status::Reconnecting);
        h.advance(RECONNECT_DELAY);
        assert!(matches!(
            h.session.take_commands().as_slice(),
            [Command::Dial { epoch: 2, .. }]
        ));
    }

    #[test]
    fn destroy_resets_everything() {
        let mut h = Harness::standard();
        h.open();
        h.ready(json!([]));
        h.session.send(queued_packet(), false, h.now);
        let _ = h.session.take_commands();

        h.session.destroy();
        assert_eq!(closes(&h.session.take_commands()), vec![close_code::NORMAL]);
        assert_eq!(h.session.status(), Status::Idle);
        assert_eq!(h.session.session_id(), None);
        assert_eq!(h.session.sequence(), None);
        assert_eq!(h.session.queued(), 0);
        assert_eq!(h.session.next_deadline(), None);

        // Reusable, but the next dial waits out the grace period.
        h.session.connect(h.now);
        assert!(h.session.take_commands().is_empty());
        h.advance(RECONNECT_DELAY);
        let epoch = h.dial_epoch();
        assert!(h.session.on_dialed(epoch, h.now));
        assert_eq!(ops(&h.session.take_commands()), vec![opcode::IDENTIFY]);
    }

    #[test]
    fn stale_dial_is_rejected() {
        let mut h = Harness::standard();
        h.session.connect(h.now);
        let epoch = h.dial_epoch();
        h.session.destroy();
        assert!(!h.session.on_dialed(epoch, h.now));
        assert_eq!(h.cache.guild_count(), 0);
    }

    #[test]
    fn resume_dial_keeps_configured_query() {
        let mut h = Harness::standard();
        let url = h.redial_after_ready_with("wss://gateway-us-east1-b.discord.gg");
        assert_eq!(url, "wss://gateway-us-east1-b.discord.gg/?v=10&encoding=json");
    }

    #[test]
    fn plaintext_resume_url_is_ignored() {
        let mut h = Harness::standard();
        let url = h.redial_after_ready_with("ws://gateway-us-east1-b.discord.gg");
        assert_eq!(url, shardline_config::DEFAULT_GATEWAY_URL);
        // The session itself is still resumed, just on the configured URL.
        let epoch = h.session.epoch;
        assert!(h.session.on_dialed(epoch, h.now));
        assert_eq!(ops(&h.session.take_commands()), vec![opcode::RESUME]);
    }

    #[test]
    fn foreign_resume_host_is_ignored() {
        let mut h = Harness::standard();
        let url = h.redial_after_ready_with("wss://attacker.example");
        assert_eq!(url, shardline_config::DEFAULT_GATEWAY_URL);
    }

    #[test]
    fn hung_dial_is_abandoned_after_hello_timeout() {
        let mut h = Harness::standard();
        let mut rx = h.bus.subscribe();
        h.session.connect(h.now);
        let stale = h.dial_epoch();
        assert_eq!(h.session.next_deadline(), Some(h.now + HELLO_TIMEOUT));

        // Errors while the dial hangs cannot recover it on their own.
        h.session
            .on_error(&GatewayError::Transport("reset".into()), h.now);
        assert_eq!(h.session.status(), Status::Connecting);

        h.advance(HELLO_TIMEOUT);
        assert_eq!(h.session.status(), Status::Reconnecting);
        assert!(h.session.take_commands().is_empty());
        assert!(!h.session.on_dialed(stale, h.now));

        h.advance(RECONNECT_DELAY);
        assert!(matches!(
            h.session.take_commands().as_slice(),
            [Command::Dial { epoch: 2, .. }]
        ));

        let mut timed_out = false;
        while let Some(event) = rx.try_recv() {
            if let ShardEvent::Error { message, .. } = event.as_ref() {
                timed_out |= message.contains("Hello");
            }
        }
        assert!(timed_out);
    }

    #[test]
    fn silent_gateway_is_closed_after_hello_timeout() {
        let mut h = Harness::standard();
        let commands = h.open();
        assert_eq!(ops(&commands), vec![opcode::IDENTIFY]);

        h.advance(HELLO_TIMEOUT - Duration::from_millis(1));
        assert!(h.session.take_commands().is_empty());
        h.advance(Duration::from_millis(1));
        assert_eq!(closes(&h.session.take_commands()), vec![close_code::RECONNECT]);
        assert_eq!(h.session.status(), Status::Reconnecting);

        h.advance(RECONNECT_DELAY);
        let epoch = h.dial_epoch();
        assert!(h.session.on_dialed(epoch, h.now));
    }

    #[test]
    fn hello_cancels_the_deadline() {
        let mut h = Harness::standard();
        h.open();
        h.recv(json!({ "op": 10, "d": { "heartbeat_interval": 41250 } }));
        h.advance(HELLO_TIMEOUT);
        assert!(h.session.take_commands().is_empty());
        assert_eq!(h.session.status(), Status::Identifying);
    }

    #[test]
    fn transport_error_without_subscribers_still_reconnects() {
        let mut h = Harness::standard();
        assert!(!h.bus.has_subscribers());
        h.open();
        h.ready(json!([]));
        let _ = h.session.take_commands();

        h.session
            .on_error(&GatewayError::Transport("reset".into()), h.now);
        assert_eq!(closes(&h.session.take_commands()), vec![close_code::RECONNECT]);
        assert_eq!(h.session.status(), Status::Reconnecting);

        // A late subscriber sees nothing stale and the redial still happens.
        let mut rx = h.bus.subscribe();
        h.advance(RECONNECT_DELAY);
        assert!(h.session.take_commands().iter().any(|c| matches!(c, Command::Dial { .. })));
        while let Some(event) = rx.try_recv() {
            assert!(!event.is_error(), "unexpected {event:?}");
        }
    }
}
