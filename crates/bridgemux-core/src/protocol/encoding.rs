//! Payload encoding strategy, chosen once per channel.
//!
//! A channel declared `binary` wants raw bytes.  When the transport supports
//! binary frames they travel untouched ([`PayloadEncoding::Raw`]).  When it
//! does not, bytes are base64 encoded into text frames on the way out and
//! decoded on the way in ([`PayloadEncoding::Base64`]).  Text channels use
//! [`PayloadEncoding::Text`].

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::protocol::frame::{FrameError, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Text,
    Raw,
    Base64,
}

impl PayloadEncoding {
    /// Picks the strategy from the channel's wish and the transport's
    /// negotiated capability.
    pub fn negotiate(channel_binary: bool, transport_binary: bool) -> Self {
        match (channel_binary, transport_binary) {
            (false, _) => PayloadEncoding::Text,
            (true, true) => PayloadEncoding::Raw,
            (true, false) => PayloadEncoding::Base64,
        }
    }

    /// Value of the `binary` option in the `open` command, if any.
    pub fn open_option(self) -> Option<&'static str> {
        match self {
            PayloadEncoding::Text => None,
            PayloadEncoding::Raw => Some("raw"),
            PayloadEncoding::Base64 => Some("base64"),
        }
    }

    /// Prepares a payload for sending.
    pub fn encode(self, payload: Payload) -> Payload {
        match self {
            PayloadEncoding::Text => Payload::Text(payload.into_text_lossy()),
            PayloadEncoding::Raw => Payload::Binary(payload.into_bytes()),
            PayloadEncoding::Base64 => Payload::Text(STANDARD.encode(payload.as_bytes())),
        }
    }

    /// Turns a received payload into what the channel consumer expects.
    pub fn decode(self, payload: Payload) -> Result<Payload, FrameError> {
        match self {
            PayloadEncoding::Text => Ok(Payload::Text(payload.into_text_lossy())),
            PayloadEncoding::Raw => Ok(Payload::Binary(payload.into_bytes())),
            PayloadEncoding::Base64 => match payload {
                Payload::Text(text) => STANDARD
                    .decode(text.as_bytes())
                    .map(Payload::Binary)
                    .map_err(|e| FrameError::InvalidBase64(e.to_string())),
                Payload::Binary(bytes) => Ok(Payload::Binary(bytes)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_matrix() {
        assert_eq!(PayloadEncoding::negotiate(false, true), PayloadEncoding::Text);
        assert_eq!(PayloadEncoding::negotiate(true, true), PayloadEncoding::Raw);
        assert_eq!(PayloadEncoding::negotiate(true, false), PayloadEncoding::Base64);
    }

    #[test]
    fn test_base64_preserves_arbitrary_bytes() {
        // Arrange
        let bytes: Vec<u8> = (0..=255).collect();
        let encoding = PayloadEncoding::Base64;

        // Act
        let on_wire = encoding.encode(Payload::Binary(bytes.clone()));
        let received = encoding.decode(on_wire.clone()).unwrap();

        // Assert
        assert!(on_wire.as_text().is_some());
        assert_eq!(received, Payload::Binary(bytes));
    }

    #[test]
    fn test_base64_rejects_garbage() {
        let result = PayloadEncoding::Base64.decode(Payload::from("not base64!"));
        assert!(matches!(result, Err(FrameError::InvalidBase64(_))));
    }

    #[test]
    fn test_open_option_values() {
        assert_eq!(PayloadEncoding::Text.open_option(), None);
        assert_eq!(PayloadEncoding::Raw.open_option(), Some("raw"));
        assert_eq!(PayloadEncoding::Base64.open_option(), Some("base64"));
    }
}
