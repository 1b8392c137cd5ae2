//! Scripted transport for driving shards in tests.
//!
//! Every dial through a [`MockConnector`] yields a [`MockServer`]: the
//! server end of an in-memory connection. Tests push packets and closes to
//! the shard through it and read back what the shard sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use shardline_gateway::protocol::{close_code, opcode};
use shardline_gateway::{Connector, GatewayError, Packet, Transport, TransportEvent};
use tokio::sync::mpsc;

/// Something the shard sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// A packet.
    Packet(Packet),
    /// A close frame with this code.
    Close(u16),
}

// ── Connector ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ConnectorState {
    dialed: Vec<String>,
    failures: VecDeque<String>,
    hangs: usize,
}

/// [`Connector`] that hands the server end of every dial to the test.
#[derive(Debug, Clone)]
pub struct MockConnector {
    servers: mpsc::UnboundedSender<MockServer>,
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    /// Create a connector and the stream of servers it will produce.
    #[must_use]
    pub fn new() -> (Self, MockServers) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            servers: tx,
            state: Arc::new(Mutex::new(ConnectorState::default())),
        };
        (connector, MockServers { rx })
    }

    /// Make the next dial fail with `message`. Calls queue up.
    pub fn fail_next(&self, message: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push_back(message.into());
        }
    }

    /// Make the next dial never complete. Calls queue up, and take
    /// priority over [`Self::fail_next`].
    pub fn hang_next(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.hangs = state.hangs.saturating_add(1);
        }
    }

    /// Every URL dialed so far, in order.
    #[must_use]
    pub fn dialed_urls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.dialed.clone())
            .unwrap_or_default()
    }

    /// Number of dials so far, including failed ones.
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.state.lock().map(|state| state.dialed.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError> {
        let (hang, failure) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| GatewayError::Transport("mock connector poisoned".to_owned()))?;
            state.dialed.push(url.to_owned());
            if state.hangs > 0 {
                state.hangs = state.hangs.saturating_sub(1);
                (true, None)
            } else {
                (false, state.failures.pop_front())
            }
        };
        if hang {
            return std::future::pending().await;
        }
        if let Some(message) = failure {
            return Err(GatewayError::Transport(message));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let server = MockServer {
            url: url.to_owned(),
            frames: from_client,
            events: to_client,
        };
        self.servers
            .send(server)
            .map_err(|_| GatewayError::Transport("no test is listening for dials".to_owned()))?;

        Ok(Box::new(MockTransport {
            frames: to_server,
            events: from_server,
        }))
    }
}

/// Servers produced by a [`MockConnector`], one per successful dial.
#[derive(Debug)]
pub struct MockServers {
    rx: mpsc::UnboundedReceiver<MockServer>,
}

impl MockServers {
    /// Wait for the next successful dial.
    pub async fn next(&mut self) -> Option<MockServer> {
        self.rx.recv().await
    }

    /// The next dial, if one already happened.
    pub fn try_next(&mut self) -> Option<MockServer> {
        self.rx.try_recv().ok()
    }
}

// ── Transport ────────────────────────────────────────────────

/// Client end of an in-memory connection.
struct MockTransport {
    frames: mpsc::UnboundedSender<ClientFrame>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, packet: &Packet) -> Result<(), GatewayError> {
        self.frames
            .send(ClientFrame::Packet(packet.clone()))
            .map_err(|_| GatewayError::Transport("mock server hung up".to_owned()))
    }

    async fn recv(&mut self) -> TransportEvent {
        // A dropped server looks like a connection lost without a close frame.
        self.events
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(close_code::ABNORMAL))
    }

    async fn close(&mut self, code: u16) -> Result<(), GatewayError> {
        let _ = self.frames.send(ClientFrame::Close(code));
        Ok(())
    }
}

// ── Server ───────────────────────────────────────────────────

/// Server end of one dial.
#[derive(Debug)]
pub struct MockServer {
    url: String,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockServer {
    /// URL the shard dialed.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a packet as a text frame.
    ///
    /// # Panics
    ///
    /// Panics if the packet cannot be serialized.
    pub fn send_packet(&self, packet: &Packet) {
        let text = serde_json::to_string(packet).expect("packet serializes");
        self.send_raw(text);
    }

    /// Send an arbitrary text frame.
    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(text.into()));
    }

    /// Close the connection from the server side with `code`.
    pub fn close(&self, code: u16) {
        let _ = self.events.send(TransportEvent::Closed(code));
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self
            .events
            .send(TransportEvent::Error(GatewayError::Transport(message.into())));
    }

    /// Next frame from the shard, or `None` once the shard dropped the
    /// connection.
    pub async fn next_frame(&mut self) -> Option<ClientFrame> {
        self.frames.recv().await
    }

    /// A frame the shard already sent, if any.
    pub fn try_next_frame(&mut self) -> Option<ClientFrame> {
        self.frames.try_recv().ok()
    }

    /// Wait for a packet with opcode `op`, skipping heartbeats when waiting
    /// for something else.
    ///
    /// # Panics
    ///
    /// Panics if the shard closes the connection or sends another opcode.
    pub async fn expect_op(&mut self, op: u8) -> Packet {
        loop {
            match self.next_frame().await {
                Some(ClientFrame::Packet(packet)) if packet.op == op => return packet,
                Some(ClientFrame::Packet(packet)) if packet.op == opcode::HEARTBEAT => {},
                Some(ClientFrame::Packet(packet)) => {
                    panic!("expected op {op}, got op {}: {:?}", packet.op, packet.d)
                },
                Some(ClientFrame::Close(code)) => panic!("expected op {op}, got close {code}"),
                None => panic!("expected op {op}, connection dropped"),
            }
        }
    }

    /// Payload of the next packet with opcode `op`.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`Self::expect_op`].
    pub async fn expect_payload(&mut self, op: u8) -> Value {
        self.expect_op(op).await.d.unwrap_or(Value::Null)
    }

    /// Wait for the shard's close frame, skipping packets.
    ///
    /// # Panics
    ///
    /// Panics if the connection drops without a close frame.
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            match self.next_frame().await {
                Some(ClientFrame::Close(code)) => return code,
                Some(ClientFrame::Packet(_)) => {},
                None => panic!("expected a close frame, connection dropped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_hands_out_a_server() {
        let (connector, mut servers) = MockConnector::new();
        let mut transport = connector.connect("wss://a/").await.unwrap();
        let mut server = servers.next().await.unwrap();
        assert_eq!(server.url(), "wss://a/");

        transport
            .send(&Packet::new(opcode::HEARTBEAT, Value::Null))
            .await
            .unwrap();
        assert_eq!(server.expect_op(opcode::HEARTBEAT).await.op, opcode::HEARTBEAT);

        server.send_raw("{}");
        assert!(matches!(transport.recv().await, TransportEvent::Message(t) if t == "{}"));
    }

    #[tokio::test]
    async fn dropped_server_reads_as_abnormal_close() {
        let (connector, mut servers) = MockConnector::new();
        let mut transport = connector.connect("wss://a/").await.unwrap();
        drop(servers.next().await.unwrap());
        assert!(matches!(
            transport.recv().await,
            TransportEvent::Closed(close_code::ABNORMAL)
        ));
    }

    #[tokio::test]
    async fn fail_next_refuses_one_dial() {
        let (connector, mut servers) = MockConnector::new();
        connector.fail_next("refused");

        assert!(connector.connect("wss://a/").await.is_err());
        assert!(servers.try_next().is_none());
        assert!(connector.connect("wss://a/").await.is_ok());
        assert_eq!(connector.dial_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hang_next_never_completes_one_dial() {
        let (connector, mut servers) = MockConnector::new();
        connector.hang_next();

        let hung = tokio::time::timeout(
            std::time::Duration::from_secs(3600),
            connector.connect("wss://a/"),
        )
        .await;
        assert!(hung.is_err());
        assert!(servers.try_next().is_none());
        assert!(connector.connect("wss://a/").await.is_ok());
        assert_eq!(connector.dial_count(), 2);
    }
}
