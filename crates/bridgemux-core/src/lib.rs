//! # bridgemux-core
//!
//! Pure building blocks for a client of a channel-multiplexing bridge: one
//! physical connection (usually a WebSocket) carries many independent logical
//! *channels*, each speaking its own payload type (process spawning, D-Bus,
//! files, HTTP, metrics).
//!
//! This crate performs no I/O.  The async transport and the typed protocol
//! clients live in `bridgemux-client`.
//!
//! # Architecture overview (for beginners)
//!
//! - **`protocol`** – How bytes travel.  Every frame is `<channel-id>\n<payload>`;
//!   an empty channel id marks a JSON control command.  Also the channel id
//!   generator, the base64 fallback for binary payloads, and the D-Bus JSON
//!   message model.
//!
//! - **`domain`** – Problem codes (`disconnected`, `not-found`…) and their
//!   human-readable messages.
//!
//! - **`metrics`** – Decoding the metrics stream: the meta message that names
//!   the columns, and the delta decompression of data rows.
//!
//! - **`series`** – The time-series cache: a sorted, capacity-bounded block
//!   store, sinks that feed it, and grids that present windows of it.

pub mod domain;
pub mod metrics;
pub mod protocol;
pub mod series;

pub use domain::problem::{problem_message, Problem};
pub use protocol::control::{Command, Control};
pub use protocol::frame::{decode_frame, encode_frame, FrameError, Payload, WireMessage};
pub use series::{SeriesGrid, SeriesSink, SeriesStorage};
