//! Infrastructure layer: physical bindings of the transport.
//!
//! **Dependency rule**: this layer implements `application::connector` and
//! may depend on `application` and `bridgemux_core`, but is never imported by
//! the application layer.
//!
//! - **`websocket`** – `tokio-tungstenite` client that requests the bridge
//!   subprotocol.
//!
//! - **`parent`** – An in-process pair of queues standing in for a parent
//!   frame that relays messages.  Tests use it as a scriptable bridge.

pub mod parent;
pub mod websocket;
