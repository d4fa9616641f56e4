//! WebSocket binding of the transport.
//!
//! Connects with `tokio-tungstenite`, requests the configured subprotocol
//! (`cockpit1` by default), and splits the stream into two tasks:
//!
//! ```text
//!   SocketCommand queue ──▶ writer task ──▶ ws sink
//!   ws stream ──▶ reader task ──▶ SocketEvent queue
//! ```
//!
//! WebSocket pings and pongs surface as [`SocketEvent::Activity`] so they keep
//! the transport's health check satisfied; tungstenite answers pings itself.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use bridgemux_core::WireMessage;

use crate::application::connector::{Connector, SocketCommand, SocketEvent, SocketHandle};
use crate::domain::errors::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Connects to a bridge over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    protocol: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocol: protocol.into(),
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<SocketHandle, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        if !self.protocol.is_empty() {
            let value = HeaderValue::from_str(&self.protocol).map_err(|e| TransportError::InvalidUrl {
                url: self.url.clone(),
                reason: format!("invalid subprotocol {:?}: {e}", self.protocol),
            })?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        info!(target: "bridgemux::transport", "connecting to {}", self.url);
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect {
                url: self.url.clone(),
                source: Box::new(e),
            })?;

        let (sink, stream) = stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(sink, out_rx));
        tokio::spawn(read_loop(stream, in_tx));

        Ok(SocketHandle {
            outbound: out_tx,
            inbound: in_rx,
            binary: true,
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

// ── Socket tasks ──────────────────────────────────────────────────────────────

async fn write_loop(mut sink: WsSink, mut commands: mpsc::UnboundedReceiver<SocketCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            SocketCommand::Send(WireMessage::Text(text)) => {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    warn!(target: "bridgemux::transport", "websocket send failed: {e}");
                    break;
                }
            }
            SocketCommand::Send(WireMessage::Binary(bytes)) => {
                if let Err(e) = sink.send(WsMessage::Binary(bytes)).await {
                    warn!(target: "bridgemux::transport", "websocket send failed: {e}");
                    break;
                }
            }
            SocketCommand::Close => break,
        }
    }
    // Either asked to close or the transport dropped its sender.
    let _ = sink.close().await;
    debug!(target: "bridgemux::transport", "websocket writer finished");
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::UnboundedSender<SocketEvent>) {
    while let Some(next) = stream.next().await {
        let event = match next {
            Ok(WsMessage::Text(text)) => SocketEvent::Message(WireMessage::Text(text)),
            Ok(WsMessage::Binary(bytes)) => SocketEvent::Message(WireMessage::Binary(bytes)),
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => SocketEvent::Activity,
            Ok(WsMessage::Close(frame)) => {
                debug!(target: "bridgemux::transport", "websocket close frame: {frame:?}");
                break;
            }
            Ok(WsMessage::Frame(_)) => continue,
            Err(e) => {
                warn!(target: "bridgemux::transport", "websocket receive failed: {e}");
                break;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
    let _ = events.send(SocketEvent::Closed);
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_is_rejected_before_connecting() {
        // Arrange
        let connector = WebSocketConnector::new("not a url", "cockpit1");

        // Act
        let result = connector.connect().await;

        // Assert
        assert!(matches!(result, Err(TransportError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connect_error() {
        // Port 1 on loopback refuses connections on any sane host.
        let connector = WebSocketConnector::new("ws://127.0.0.1:1/cockpit/socket", "cockpit1");
        let result = connector.connect().await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[test]
    fn test_describe_is_the_url() {
        let connector = WebSocketConnector::new("ws://host/cockpit/socket", "cockpit1");
        assert_eq!(connector.describe(), "ws://host/cockpit/socket");
    }
}
