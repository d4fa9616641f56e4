//! A scriptable bridge for the unit tests.

use std::sync::Arc;

use serde_json::Value;

use bridgemux_core::protocol::Frame;
use bridgemux_core::{decode_frame, Control, Payload, WireMessage};

use crate::application::transport::Transport;
use crate::domain::config::TransportConfig;
use crate::infrastructure::parent::{ParentConnector, ParentPeer};

/// The bridge's end of a transport under test.
pub(crate) struct FakeBridge {
    pub peer: ParentPeer,
}

impl FakeBridge {
    pub async fn recv_frame(&mut self) -> Frame {
        let message = self.peer.recv().await.expect("transport sent a frame");
        decode_frame(message).expect("well formed frame")
    }

    pub async fn recv_control(&mut self) -> Control {
        let frame = self.recv_frame().await;
        assert!(frame.is_control(), "expected a control frame, got {frame:?}");
        Control::parse(&frame.payload).expect("valid control JSON")
    }

    /// Receives an `open` and returns it; panics on anything else.
    pub async fn expect_open(&mut self, payload: &str) -> Control {
        let open = self.recv_control().await;
        assert_eq!(open.command.as_str(), "open");
        assert_eq!(open.get_str("payload"), Some(payload));
        open
    }

    pub fn send_control(&self, control: Value) {
        self.peer.send_text(format!("\n{control}"));
    }

    pub fn send(&self, channel: &str, payload: impl Into<Payload>) {
        let message = match payload.into() {
            Payload::Text(text) => WireMessage::Text(format!("{channel}\n{text}")),
            Payload::Binary(bytes) => {
                let mut out = format!("{channel}\n").into_bytes();
                out.extend_from_slice(&bytes);
                WireMessage::Binary(out)
            }
        };
        self.peer.send(message);
    }
}

/// A transport that has finished the `init` exchange: seed `t:`, binary
/// capable, health check off.
pub(crate) async fn ready_transport() -> (Arc<Transport>, FakeBridge) {
    ready_transport_with(TransportConfig {
        health_check_interval_secs: 0,
        ..TransportConfig::default()
    })
    .await
}

pub(crate) async fn ready_transport_with(config: TransportConfig) -> (Arc<Transport>, FakeBridge) {
    let (connector, peer) = ParentConnector::pair();
    handshake(config, connector, peer).await
}

/// Like [`ready_transport`] but over a text-only socket, so binary
/// channels fall back to base64.
pub(crate) async fn ready_text_socket_transport() -> (Arc<Transport>, FakeBridge) {
    let (connector, peer) = ParentConnector::pair_with_binary(false);
    let config = TransportConfig {
        health_check_interval_secs: 0,
        ..TransportConfig::default()
    };
    handshake(config, connector, peer).await
}

async fn handshake(
    config: TransportConfig,
    connector: ParentConnector,
    peer: ParentPeer,
) -> (Arc<Transport>, FakeBridge) {
    let transport = Transport::new(config, connector);
    let mut bridge = FakeBridge { peer };
    transport.start();
    let init = bridge.recv_control().await;
    assert_eq!(init.command.as_str(), "init");
    bridge.send_control(serde_json::json!({
        "command": "init",
        "version": 1,
        "channel-seed": "t:",
        "host": "localhost",
        "capabilities": ["binary"],
    }));
    transport.ready().await.expect("transport ready");
    (transport, bridge)
}

/// Lets spawned tasks run until they block.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
