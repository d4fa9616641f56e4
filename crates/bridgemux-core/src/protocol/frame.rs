//! Frame codec for the multiplexed bridge protocol.
//!
//! Wire format:
//! ```text
//! <channel-id> "\n" <payload>
//! ```
//! An empty channel id marks a *control frame*; its payload is a JSON command
//! object (see [`crate::protocol::control`]).
//!
//! # Text vs binary frames (for beginners)
//!
//! The physical connection (a WebSocket, or an in-process pipe) carries two
//! kinds of messages: UTF-8 text and raw bytes.  Both use the same layout.  For
//! a binary frame the channel id occupies the leading bytes up to the first
//! `0x0A` byte and every byte after it is payload, untouched.  This is what
//! lets arbitrary binary data (including embedded newlines) survive the trip
//! byte-for-byte.
//!
//! Control frames are always text.  A binary frame whose newline sits at
//! position 0 would be a binary control frame, which the protocol forbids, so
//! the decoder rejects it.

use thiserror::Error;

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame carries no `\n` separator, so no channel id can be found.
    #[error("received invalid message without channel prefix")]
    MissingChannel,

    /// A binary frame with an empty channel id (control frames must be text).
    #[error("binary control frame is not allowed")]
    BinaryControl,

    /// The channel id bytes of a binary frame are not valid UTF-8.
    #[error("channel id is not valid UTF-8")]
    InvalidChannelEncoding,

    /// A channel id that would corrupt the frame layout when encoded.
    #[error("invalid channel id: {0:?}")]
    InvalidChannelId(String),

    /// Base64 text that could not be turned back into bytes.
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// The body of a frame: UTF-8 text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Length in bytes (text is measured in UTF-8 bytes as well).
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    /// Borrows the payload as bytes regardless of variant.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    /// Returns the text, if this is a text payload.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(_) => None,
        }
    }

    /// Converts to a `String`, replacing invalid UTF-8 sequences.
    pub fn into_text_lossy(self) -> String {
        match self {
            Payload::Text(text) => text,
            Payload::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.into_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Binary(bytes.to_vec())
    }
}

/// A message exactly as carried by the physical socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded frame: channel id plus payload.
///
/// `channel` is empty for control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: String,
    pub payload: Payload,
}

impl Frame {
    pub fn is_control(&self) -> bool {
        self.channel.is_empty()
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes `payload` for `channel` into a single wire message.
///
/// Binary payloads produce a binary wire message; text payloads produce text.
/// Pass an empty `channel` to build a control frame (text only).
///
/// # Errors
///
/// Returns [`FrameError::InvalidChannelId`] if the id contains a newline, and
/// [`FrameError::BinaryControl`] for a binary payload on the control channel.
///
/// # Examples
///
/// ```rust
/// use bridgemux_core::protocol::{decode_frame, encode_frame, Payload};
///
/// let wire = encode_frame("4", &Payload::Binary(b"a\nb".to_vec())).unwrap();
/// let frame = decode_frame(wire).unwrap();
/// assert_eq!(frame.channel, "4");
/// assert_eq!(frame.payload, Payload::Binary(b"a\nb".to_vec()));
/// ```
pub fn encode_frame(channel: &str, payload: &Payload) -> Result<WireMessage, FrameError> {
    if channel.contains('\n') {
        return Err(FrameError::InvalidChannelId(channel.to_owned()));
    }

    match payload {
        Payload::Text(text) => {
            let mut out = String::with_capacity(channel.len() + 1 + text.len());
            out.push_str(channel);
            out.push('\n');
            out.push_str(text);
            Ok(WireMessage::Text(out))
        }
        Payload::Binary(bytes) => {
            if channel.is_empty() {
                return Err(FrameError::BinaryControl);
            }
            let mut out = Vec::with_capacity(channel.len() + 1 + bytes.len());
            out.extend_from_slice(channel.as_bytes());
            out.push(b'\n');
            out.extend_from_slice(bytes);
            Ok(WireMessage::Binary(out))
        }
    }
}

/// Decodes a wire message into a [`Frame`].
///
/// # Errors
///
/// - [`FrameError::MissingChannel`] when the message has no `\n`.
/// - [`FrameError::BinaryControl`] for a binary message with an empty id.
/// - [`FrameError::InvalidChannelEncoding`] for a non-UTF-8 binary id.
pub fn decode_frame(message: WireMessage) -> Result<Frame, FrameError> {
    match message {
        WireMessage::Text(mut text) => {
            let pos = text.find('\n').ok_or(FrameError::MissingChannel)?;
            let payload = text.split_off(pos + 1);
            text.truncate(pos);
            Ok(Frame {
                channel: text,
                payload: Payload::Text(payload),
            })
        }
        WireMessage::Binary(mut bytes) => {
            let pos = bytes
                .iter()
                .position(|&b| b == b'\n')
                .ok_or(FrameError::MissingChannel)?;
            if pos == 0 {
                return Err(FrameError::BinaryControl);
            }
            let payload = bytes.split_off(pos + 1);
            bytes.truncate(pos);
            let channel = String::from_utf8(bytes).map_err(|_| FrameError::InvalidChannelEncoding)?;
            Ok(Frame {
                channel,
                payload: Payload::Binary(payload),
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
