//! Application layer: the transport and everything that talks through it.
//!
//! # What lives here? (for beginners)
//!
//! - **`transport`** – The one physical connection.  Performs the `init`
//!   handshake, routes incoming frames to channels by id, runs the health
//!   check, and queues sends made before the bridge is ready.
//!
//! - **`channel`** – One logical stream: `open`, messages, `done`, `close`.
//!   Events arrive on an unbounded queue owned by the caller.
//!
//! - **`buffer`** – Collects channel payloads for consumers that take data in
//!   pieces (lines of output, for example).
//!
//! - **`spawn`**, **`dbus`**, **`file`**, **`http`**, **`metrics`** – Typed
//!   clients built on channels, one per payload type.
//!
//! - **`grid_walker`** – A tokio interval that keeps a series grid following
//!   the clock.
//!
//! - **`connector`** – The trait that the physical bindings in
//!   `infrastructure` implement.

pub mod buffer;
pub mod channel;
pub mod connector;
pub mod dbus;
pub mod file;
pub mod grid_walker;
pub mod http;
pub mod metrics;
pub mod spawn;
pub mod transport;
