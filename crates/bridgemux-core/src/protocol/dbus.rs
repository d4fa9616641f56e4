//! JSON message model for the `dbus-json3` payload.
//!
//! Each channel message is one JSON object whose first recognised key decides
//! its meaning:
//!
//! | Key | Direction | Meaning |
//! |---|---|---|
//! | `call` | both | `[path, iface, method, args]` with an `id` |
//! | `reply` | in | `[[results…]]` for call `id` |
//! | `error` | in | `[name, [message]]` for call `id` |
//! | `signal` | both | `[path, iface, member, args]` |
//! | `notify` | in | `{path: {iface: props or null}}` |
//! | `meta` | both | interface descriptions |
//! | `owner` | in | unique name of the bus name owner, or null |
//! | `add-match` / `remove-match` | out | server-side signal filters |
//! | `watch` / `unwatch` | out | property-change subscriptions |

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Properties of one interface on one object.
pub type Props = Map<String, Value>;

/// A signal as it travels: `[path, interface, member, args]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub path: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

impl Signal {
    fn from_value(value: &Value) -> Option<Self> {
        let parts = value.as_array()?;
        Some(Self {
            path: parts.first()?.as_str()?.to_owned(),
            interface: parts.get(1)?.as_str()?.to_owned(),
            member: parts.get(2)?.as_str()?.to_owned(),
            args: parts
                .get(3)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
    }

    pub fn to_value(&self) -> Value {
        json!([self.path, self.interface, self.member, self.args])
    }
}

/// An incoming method call (the server asking us to handle a published object).
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub path: String,
    pub interface: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Decoded incoming D-Bus JSON message.
#[derive(Debug, Clone, PartialEq)]
pub enum DBusMessage {
    Reply {
        id: String,
        values: Vec<Value>,
        type_signature: Option<String>,
        flags: Option<String>,
    },
    Error {
        id: String,
        name: String,
        message: String,
    },
    Signal(Signal),
    Call {
        id: Option<String>,
        call: MethodCall,
    },
    /// `{path: {iface: props-or-null}}`
    Notify(Map<String, Value>),
    Meta(Map<String, Value>),
    Owner(Option<String>),
    Unknown(Value),
}

impl DBusMessage {
    /// Parses one message.  Anything that is valid JSON but not understood
    /// comes back as [`DBusMessage::Unknown`].
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return DBusMessage::Unknown(value);
        };
        let id = object.get("id").and_then(id_string);

        if let Some(reply) = object.get("reply").filter(|v| truthy(v)) {
            if let Some(id) = id {
                let values = reply
                    .as_array()
                    .and_then(|outer| outer.first())
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                return DBusMessage::Reply {
                    id,
                    values,
                    type_signature: object.get("type").and_then(Value::as_str).map(str::to_owned),
                    flags: object.get("flags").and_then(Value::as_str).map(str::to_owned),
                };
            }
        } else if let Some(error) = object.get("error").filter(|v| truthy(v)) {
            if let Some(id) = id {
                let name = error
                    .get(0)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let message = error
                    .get(1)
                    .and_then(|m| m.get(0))
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .map(str::to_owned)
                    .unwrap_or_else(|| name.clone());
                return DBusMessage::Error { id, name, message };
            }
        } else if let Some(signal) = object.get("signal").and_then(Signal::from_value) {
            return DBusMessage::Signal(signal);
        } else if let Some(call) = object.get("call").and_then(Signal::from_value) {
            return DBusMessage::Call {
                id,
                call: MethodCall {
                    path: call.path,
                    interface: call.interface,
                    method: call.member,
                    args: call.args,
                },
            };
        } else if let Some(notify) = object.get("notify").and_then(Value::as_object) {
            return DBusMessage::Notify(notify.clone());
        } else if let Some(meta) = object.get("meta").and_then(Value::as_object) {
            return DBusMessage::Meta(meta.clone());
        } else if let Some(owner) = object.get("owner") {
            return DBusMessage::Owner(owner.as_str().map(str::to_owned));
        }

        DBusMessage::Unknown(value)
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

// ── Match rules ───────────────────────────────────────────────────────────────

/// Signal / watch filter.  Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_namespace: Option<String>,
    #[serde(rename = "interface", skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arg0: Option<String>,
}

impl MatchRule {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn with_path_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.path_namespace = Some(namespace.into());
        self
    }

    pub fn with_arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    /// Local re-check of a signal against this rule.
    pub fn matches(&self, signal: &Signal) -> bool {
        fn set(field: &Option<String>) -> Option<&str> {
            field.as_deref().filter(|s| !s.is_empty())
        }

        if set(&self.path).is_some_and(|p| signal.path != p) {
            return false;
        }
        if set(&self.path_namespace).is_some_and(|ns| !signal.path.starts_with(ns)) {
            return false;
        }
        if set(&self.interface).is_some_and(|i| signal.interface != i) {
            return false;
        }
        if set(&self.member).is_some_and(|m| signal.member != m) {
            return false;
        }
        if let Some(arg0) = set(&self.arg0) {
            if signal.args.first().and_then(Value::as_str) != Some(arg0) {
                return false;
            }
        }
        true
    }

    fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

// ── Outgoing messages ─────────────────────────────────────────────────────────

/// `{…options, "call": [path, iface, method, args], "id": id}`
pub fn call_message(
    path: &str,
    interface: &str,
    method: &str,
    args: &[Value],
    id: &str,
    options: &Map<String, Value>,
) -> String {
    let mut message = options.clone();
    message.insert("call".to_owned(), json!([path, interface, method, args]));
    message.insert("id".to_owned(), Value::from(id));
    Value::Object(message).to_string()
}

pub fn signal_message(signal: &Signal, options: &Map<String, Value>) -> String {
    let mut message = options.clone();
    message.insert("signal".to_owned(), signal.to_value());
    Value::Object(message).to_string()
}

pub fn meta_message(data: &Map<String, Value>, options: &Map<String, Value>) -> String {
    let mut message = options.clone();
    message.insert("meta".to_owned(), Value::Object(data.clone()));
    Value::Object(message).to_string()
}

pub fn add_match_message(rule: &MatchRule) -> String {
    json!({ "add-match": rule.to_value() }).to_string()
}

pub fn remove_match_message(rule: &MatchRule) -> String {
    json!({ "remove-match": rule.to_value() }).to_string()
}

pub fn watch_message(rule: &MatchRule, id: &str) -> String {
    json!({ "watch": rule.to_value(), "id": id }).to_string()
}

pub fn unwatch_message(rule: &MatchRule) -> String {
    json!({ "unwatch": rule.to_value() }).to_string()
}

// ── Value helpers ─────────────────────────────────────────────────────────────

/// A D-Bus variant as the bridge expects it: `{"v": value, "t": type}`.
pub fn variant(type_signature: &str, value: impl Into<Value>) -> Value {
    json!({ "v": value.into(), "t": type_signature })
}

/// Byte arrays (`ay`) are carried as base64 text.
pub fn byte_array(bytes: &[u8]) -> Value {
    Value::String(STANDARD.encode(bytes))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(path: &str, iface: &str, member: &str, args: Vec<Value>) -> Signal {
        Signal {
            path: path.to_owned(),
            interface: iface.to_owned(),
            member: member.to_owned(),
            args,
        }
    }

    #[test]
    fn test_reply_takes_first_element() {
        let msg = DBusMessage::parse(r#"{"reply":[["a",1]],"id":"2","type":"si"}"#).unwrap();
        assert_eq!(
            msg,
            DBusMessage::Reply {
                id: "2".to_owned(),
                values: vec![json!("a"), json!(1)],
                type_signature: Some("si".to_owned()),
                flags: None,
            }
        );
    }

    #[test]
    fn test_error_message_falls_back_to_name() {
        let msg = DBusMessage::parse(r#"{"error":["org.x.Failed",[]],"id":"5"}"#).unwrap();
        assert_eq!(
            msg,
            DBusMessage::Error {
                id: "5".to_owned(),
                name: "org.x.Failed".to_owned(),
                message: "org.x.Failed".to_owned(),
            }
        );
    }

    #[test]
    fn test_notify_and_owner_are_recognised() {
        let notify = DBusMessage::parse(r#"{"notify":{"/org/x":{"com.y":{"Foo":1}}}}"#).unwrap();
        assert!(matches!(notify, DBusMessage::Notify(_)));

        let owner = DBusMessage::parse(r#"{"owner":null}"#).unwrap();
        assert_eq!(owner, DBusMessage::Owner(None));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(DBusMessage::parse("{not json").is_err());
    }

    #[test]
    fn test_empty_rule_matches_everything() {
        assert!(MatchRule::default().matches(&signal("/a", "b.c", "D", vec![])));
    }

    #[test]
    fn test_rule_fields_filter_signals() {
        // Arrange
        let rule = MatchRule::default()
            .with_path_namespace("/org/x")
            .with_interface("com.y")
            .with_member("Changed")
            .with_arg0("eth0");

        // Act / Assert
        assert!(rule.matches(&signal("/org/x/1", "com.y", "Changed", vec![json!("eth0")])));
        assert!(!rule.matches(&signal("/org/z", "com.y", "Changed", vec![json!("eth0")])));
        assert!(!rule.matches(&signal("/org/x/1", "com.z", "Changed", vec![json!("eth0")])));
        assert!(!rule.matches(&signal("/org/x/1", "com.y", "Other", vec![json!("eth0")])));
        assert!(!rule.matches(&signal("/org/x/1", "com.y", "Changed", vec![])));
    }

    #[test]
    fn test_match_rule_serialises_only_set_fields() {
        let rule = MatchRule::path("/p").with_interface("i.f");
        assert_eq!(
            add_match_message(&rule),
            json!({"add-match": {"path": "/p", "interface": "i.f"}}).to_string()
        );
    }

    #[test]
    fn test_call_message_shape() {
        let mut options = Map::new();
        options.insert("flags".to_owned(), json!("i"));

        let text = call_message("/p", "i.f", "Do", &[json!(1)], "3", &options);
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(
            value,
            json!({"call": ["/p", "i.f", "Do", [1]], "id": "3", "flags": "i"})
        );
    }

    #[test]
    fn test_variant_and_byte_array() {
        assert_eq!(variant("s", "x"), json!({"v": "x", "t": "s"}));
        assert_eq!(byte_array(b"hi"), json!("aGk="));
    }
}
