//! The physical socket seam.
//!
//! [`Transport`](crate::application::transport::Transport) never talks to a
//! WebSocket directly.  It asks a [`Connector`] for a [`SocketHandle`]: a pair
//! of queues carrying whole wire messages out and socket events in.  The
//! infrastructure layer provides two implementations:
//!
//! - **`WebSocketConnector`** – a real `tokio-tungstenite` connection.
//! - **`ParentConnector`** – an in-process pair, used when a host process
//!   already owns the bridge connection and relays frames, and by the tests
//!   as a scriptable fake bridge.
//!
//! Both keep the framing and handshake identical; only the bytes' route
//! differs.

use async_trait::async_trait;
use tokio::sync::mpsc;

use bridgemux_core::WireMessage;

use crate::domain::errors::TransportError;

/// Something that happened on the physical socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A complete text or binary message.
    Message(WireMessage),
    /// Traffic that carries no frame (a WebSocket ping or pong).  Counts as
    /// liveness for the health check.
    Activity,
    /// The socket is gone.
    Closed,
}

/// Instructions for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Send(WireMessage),
    Close,
}

/// An open socket, as seen by the transport.
#[derive(Debug)]
pub struct SocketHandle {
    pub outbound: mpsc::UnboundedSender<SocketCommand>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
    /// Whether binary messages can travel on this socket.
    pub binary: bool,
}

/// Opens the physical connection to a bridge.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects and returns the socket queues.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if no connection can be made.
    async fn connect(&self) -> Result<SocketHandle, TransportError>;

    /// Human readable endpoint for log messages.
    fn describe(&self) -> String;
}
