//! Framed transport to the gateway.
//!
//! The session only needs four primitives: open (a successful
//! [`Connector::connect`]), send, receive and close. [`WsConnector`]
//! provides them over `tokio-tungstenite`; tests substitute a scripted
//! implementation.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::trace;

use crate::error::GatewayError;
use crate::protocol::{Packet, close_code};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something that happened on an open transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A text frame.
    Message(String),
    /// The connection closed with this code.
    Closed(u16),
    /// The connection failed.
    Error(GatewayError),
}

/// An open framed connection.
#[async_trait]
pub trait Transport: Send {
    /// Send one packet as a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet cannot be encoded or written.
    async fn send(&mut self, packet: &Packet) -> Result<(), GatewayError>;

    /// Wait for the next event. After `Closed` or `Error` the transport is
    /// finished.
    async fn recv(&mut self) -> TransportEvent;

    /// Send a close frame with `code`.
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame cannot be written.
    async fn close(&mut self, code: u16) -> Result<(), GatewayError>;
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial `url`. Success means the connection is open.
    ///
    /// # Errors
    ///
    /// Returns an error on connection, TLS or handshake failure.
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError>;
}

// ── WebSocket ────────────────────────────────────────────────

/// [`Connector`] for real gateway endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a connector.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, GatewayError> {
        let (ws, _response) = connect_async(url).await?;
        let (writer, reader) = ws.split();
        Ok(Box::new(WsTransport { writer, reader }))
    }
}

/// A live `WebSocket` connection, split into read and write halves.
struct WsTransport {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, packet: &Packet) -> Result<(), GatewayError> {
        let json = serde_json::to_string(packet)?;
        trace!(op = packet.op, "sending packet");
        self.writer.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.reader.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(text.as_str().to_owned());
                },
                Some(Ok(Message::Binary(bytes))) => {
                    // Only JSON text encoding is negotiated; tolerate UTF-8 binary frames.
                    match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => return TransportEvent::Message(text),
                        Err(_) => trace!("skipping non-UTF-8 binary frame"),
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map_or(close_code::NORMAL, |f| f.code.into());
                    return TransportEvent::Closed(code);
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Ping/pong handled by tungstenite.
                },
                Some(Err(e)) => return TransportEvent::Error(e.into()),
                None => return TransportEvent::Closed(close_code::ABNORMAL),
            }
        }
    }

    async fn close(&mut self, code: u16) -> Result<(), GatewayError> {
        let frame = CloseFrame {
            code: code.into(),
            reason: "closing".into(),
        };
        self.writer.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_failure_is_an_error() {
        let result = WsConnector::new().connect("ws://127.0.0.1:1/").await;
        assert!(result.is_err());
    }

    #[test]
    fn transport_event_debug() {
        let event = TransportEvent::Closed(4004);
        assert_eq!(format!("{event:?}"), "Closed(4004)");
    }
}
