//! Control commands carried on the control channel (empty channel id).
//!
//! Every control frame is a JSON object with a `command` string, an optional
//! `channel` the command applies to, and any number of command-specific
//! options:
//!
//! ```text
//! {"command":"open","channel":"x:4","payload":"stream","spawn":["ls"]}
//! {"command":"close","channel":"x:4","problem":"not-found"}
//! ```
//!
//! [`Control`] keeps the options as an open JSON map because the vocabulary is
//! extensible: each payload type defines its own open options, and the server
//! adds fields like `exit-status` to `close`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::frame::{Payload, WireMessage};

/// The only protocol version this client speaks.
pub const PROTOCOL_VERSION: u64 = 1;

/// Errors raised while parsing a control frame.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control payload is not text")]
    NotText,

    #[error("invalid control JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Name of a control command.
///
/// Commands outside the core vocabulary are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    Init,
    Open,
    Ready,
    Done,
    Close,
    Ping,
    Options,
    Kill,
    Hint,
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::Init => "init",
            Command::Open => "open",
            Command::Ready => "ready",
            Command::Done => "done",
            Command::Close => "close",
            Command::Ping => "ping",
            Command::Options => "options",
            Command::Kill => "kill",
            Command::Hint => "hint",
            Command::Other(name) => name,
        }
    }
}

impl From<String> for Command {
    fn from(name: String) -> Self {
        match name.as_str() {
            "init" => Command::Init,
            "open" => Command::Open,
            "ready" => Command::Ready,
            "done" => Command::Done,
            "close" => Command::Close,
            "ping" => Command::Ping,
            "options" => Command::Options,
            "kill" => Command::Kill,
            "hint" => Command::Hint,
            _ => Command::Other(name),
        }
    }
}

impl From<&str> for Command {
    fn from(name: &str) -> Self {
        Command::from(name.to_owned())
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        command.as_str().to_owned()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control command object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub command: Command,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Command-specific options, flattened into the top-level object.
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl Control {
    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: command.into(),
            channel: None,
            options: Map::new(),
        }
    }

    /// `{"command":"init","version":1}` as sent by the client on connect.
    pub fn init() -> Self {
        Self::new(Command::Init).with("version", PROTOCOL_VERSION)
    }

    /// A `close` command, optionally carrying a problem code.
    pub fn close(problem: Option<&str>) -> Self {
        let mut control = Self::new(Command::Close);
        if let Some(problem) = problem {
            control.set("problem", problem);
        }
        control
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.options.insert(key.to_owned(), value.into());
    }

    /// Copies every entry of `options` into this command, overwriting.
    ///
    /// `command` and `channel` keys in `options` are ignored; use the fields.
    pub fn merge(&mut self, options: &Map<String, Value>) {
        for (key, value) in options {
            if key == "command" || key == "channel" {
                continue;
            }
            self.options.insert(key.clone(), value.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(Value::as_i64)
    }

    /// The `problem` option; `None` means a clean close.
    pub fn problem(&self) -> Option<&str> {
        self.get_str("problem")
    }

    pub fn message(&self) -> Option<&str> {
        self.get_str("message")
    }

    pub fn is(&self, command: &Command) -> bool {
        &self.command == command
    }

    /// Parses a control frame payload.
    pub fn parse(payload: &Payload) -> Result<Self, ControlError> {
        let text = payload.as_text().ok_or(ControlError::NotText)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Serialises into a control frame (empty channel prefix + JSON).
    pub fn to_wire(&self) -> WireMessage {
        // Serialising a struct of strings and JSON values cannot fail.
        let json = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        WireMessage::Text(format!("\n{json}"))
    }

    /// Serialises to a JSON object value.
    pub fn to_value(&self) -> Value {
        let mut object = self.options.clone();
        object.insert("command".to_owned(), Value::from(self.command.as_str()));
        if let Some(channel) = &self.channel {
            object.insert("channel".to_owned(), Value::from(channel.as_str()));
        }
        Value::Object(object)
    }
}

// ── Init handshake ────────────────────────────────────────────────────────────

/// Typed view of the server's `init` reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitOptions {
    pub version: Option<u64>,
    pub problem: Option<String>,
    pub channel_seed: Option<String>,
    pub host: Option<String>,
    pub capabilities: Vec<String>,
    pub csrf_token: Option<String>,
}

impl InitOptions {
    pub fn from_control(control: &Control) -> Self {
        let capabilities = control
            .get("capabilities")
            .and_then(Value::as_array)
            .map(|caps| {
                caps.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            version: control.get("version").and_then(Value::as_u64),
            problem: control.problem().map(str::to_owned),
            channel_seed: control.get_str("channel-seed").map(str::to_owned),
            host: control.get_str("host").map(str::to_owned),
            capabilities,
            csrf_token: control.get_str("csrf-token").map(str::to_owned),
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|cap| cap == name)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
