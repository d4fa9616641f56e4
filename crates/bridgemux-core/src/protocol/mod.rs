//! Wire protocol: frame codec, control commands, channel ids, payload
//! encoding, and the D-Bus JSON message model.

pub mod channel_id;
pub mod control;
pub mod dbus;
pub mod encoding;
pub mod frame;

pub use channel_id::ChannelIdGenerator;
pub use control::{Command, Control, ControlError, InitOptions, PROTOCOL_VERSION};
pub use encoding::PayloadEncoding;
pub use frame::{decode_frame, encode_frame, Frame, FrameError, Payload, WireMessage};
