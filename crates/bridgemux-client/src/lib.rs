//! bridgemux-client library entry point.
//!
//! # What does bridgemux-client do? (for beginners)
//!
//! A bridge process on a server exposes many services (processes, D-Bus,
//! files, HTTP, metrics) over a single WebSocket.  This crate is the client
//! side of that connection:
//!
//! 1. A [`Transport`] connects, exchanges `init` messages with the bridge, and
//!    from then on multiplexes frames by channel id.
//! 2. A [`Channel`] is opened with a payload type (`stream`, `dbus-json3`,
//!    `fsread1`…) and carries messages both ways until one side closes it.
//! 3. Typed clients wrap channels into ordinary async APIs:
//!    [`spawn`](application::spawn::spawn) runs a process and collects its
//!    output, [`DBusClient`] makes method calls and tracks properties,
//!    [`FileClient`] reads, replaces and watches files, [`HttpClient`] sends
//!    requests, and [`MetricsChannel`] feeds samples into the series cache.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use bridgemux_client::{spawn, websocket_transport, SpawnOptions, TransportConfig};
//!
//! let transport = websocket_transport(TransportConfig::default());
//! let output = spawn(&transport, &["uptime"], SpawnOptions::default()).output().await?;
//! println!("{}", output.data.into_text_lossy());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

/// Application layer: transport, channels and protocol clients.
pub mod application;

/// Domain layer: configuration and errors.
pub mod domain;

/// Infrastructure layer: WebSocket and parent-relay bindings.
pub mod infrastructure;

#[cfg(test)]
mod test_support;

pub use application::buffer::ChannelBuffer;
pub use application::channel::{Channel, ChannelEvent, ChannelEvents, ChannelOptions};
pub use application::dbus::{DBusClient, DBusOptions, DBusProxies, DBusProxy};
pub use application::file::{FileClient, FileContent, FileOptions, Json, Raw, Text};
pub use application::grid_walker::GridWalker;
pub use application::http::{Endpoint, HttpClient, HttpOptions, HttpResponse};
pub use application::metrics::{MetricsChannel, MetricsEvent, MetricsSource};
pub use application::spawn::{script, spawn, Process, ProcessOutput, SpawnOptions};
pub use application::transport::{ReadyState, Transport};
pub use domain::config::TransportConfig;
pub use domain::errors::{ChannelError, DBusError, FileError, HttpError, ProcessError, TransportError};
pub use infrastructure::parent::{ParentConnector, ParentPeer};
pub use infrastructure::websocket::WebSocketConnector;

/// A transport that connects over WebSocket to `config.url`.  The connection
/// starts with the first channel opened on it.
pub fn websocket_transport(config: TransportConfig) -> Arc<Transport> {
    let connector = WebSocketConnector::new(config.url.clone(), config.protocol.clone());
    Transport::new(config, connector)
}
