//! In-process socket pair.
//!
//! [`ParentConnector::pair`] returns a connector for the transport and the
//! [`ParentPeer`] holding the other end.  Whatever owns the peer (a host
//! process relaying frames, or a test playing the bridge) sees every wire
//! message the transport sends and can inject messages back.
//!
//! An empty text message from the peer means "the connection closed", the
//! same convention a parent frame uses when relaying through `postMessage`.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use bridgemux_core::WireMessage;

use crate::application::connector::{Connector, SocketCommand, SocketEvent, SocketHandle};
use crate::domain::errors::TransportError;

/// The transport's side of an in-process socket pair.
pub struct ParentConnector {
    binary: bool,
    ends: Mutex<Option<SocketHandle>>,
}

/// The relay's side of an in-process socket pair.
#[derive(Debug)]
pub struct ParentPeer {
    to_transport: mpsc::UnboundedSender<SocketEvent>,
    from_transport: mpsc::UnboundedReceiver<SocketCommand>,
}

impl ParentConnector {
    /// A pair whose socket carries binary messages.
    pub fn pair() -> (Self, ParentPeer) {
        Self::pair_with_binary(true)
    }

    /// A pair whose socket advertises `binary` support.  With `false` the
    /// transport falls back to base64 for binary channels.
    pub fn pair_with_binary(binary: bool) -> (Self, ParentPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let connector = Self {
            binary,
            ends: Mutex::new(Some(SocketHandle {
                outbound: out_tx,
                inbound: in_rx,
                binary,
            })),
        };
        let peer = ParentPeer {
            to_transport: in_tx,
            from_transport: out_rx,
        };
        (connector, peer)
    }
}

#[async_trait]
impl Connector for ParentConnector {
    /// Hands out the socket once.  A second connect finds the pair used up.
    async fn connect(&self) -> Result<SocketHandle, TransportError> {
        let handle = self.ends.lock().unwrap_or_else(PoisonError::into_inner).take();
        handle.ok_or_else(|| TransportError::Connect {
            url: self.describe(),
            source: "parent socket pair already used".into(),
        })
    }

    fn describe(&self) -> String {
        format!("parent socket (binary: {})", self.binary)
    }
}

impl ParentPeer {
    /// Delivers a wire message to the transport.  An empty text message
    /// closes the connection.  Returns `false` once the transport is gone.
    pub fn send(&self, message: WireMessage) -> bool {
        let event = match &message {
            WireMessage::Text(text) if text.is_empty() => SocketEvent::Closed,
            _ => SocketEvent::Message(message),
        };
        self.to_transport.send(event).is_ok()
    }

    /// Shortcut for a text message.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(WireMessage::Text(text.into()))
    }

    /// Signals liveness without a frame.
    pub fn activity(&self) -> bool {
        self.to_transport.send(SocketEvent::Activity).is_ok()
    }

    /// Closes the connection from the relay side.
    pub fn close(&self) {
        let _ = self.to_transport.send(SocketEvent::Closed);
    }

    /// Waits for the next message the transport sends.  Returns `None` once
    /// the transport closed the socket or dropped it.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        match self.from_transport.recv().await {
            Some(SocketCommand::Send(message)) => Some(message),
            Some(SocketCommand::Close) | None => {
                debug!(target: "bridgemux::transport", "parent socket closed by transport");
                None
            }
        }
    }

    /// Like [`ParentPeer::recv`] but returns the raw command, so a relay can
    /// tell an explicit close from a dropped transport.
    pub async fn recv_command(&mut self) -> Option<SocketCommand> {
        self.from_transport.recv().await
    }

    /// Non-blocking variant of [`ParentPeer::recv_command`].
    pub fn try_recv_command(&mut self) -> Option<SocketCommand> {
        self.from_transport.try_recv().ok()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
