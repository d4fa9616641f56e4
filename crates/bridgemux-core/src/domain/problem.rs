//! Problem codes and their human-readable messages.
//!
//! A *problem* is the short machine-readable string that rides on a `close`
//! command (`"problem": "not-found"`).  Transport-wide problems such as
//! `disconnected` or `timeout` reach every channel; channel-scoped ones such as
//! `change-conflict` only reach the owner of that channel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Known problem codes.  Anything else is kept in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Problem {
    Terminated,
    NoSession,
    AccessDenied,
    AuthenticationFailed,
    AuthenticationNotSupported,
    UnknownHostkey,
    InvalidHostkey,
    InternalError,
    Timeout,
    NoCockpit,
    NoForwarding,
    Disconnected,
    NotSupported,
    NoHost,
    ProtocolError,
    NotFound,
    ChangeConflict,
    Cancelled,
    Other(String),
}

impl Problem {
    pub fn from_code(code: &str) -> Self {
        match code {
            "terminated" => Problem::Terminated,
            "no-session" => Problem::NoSession,
            "access-denied" => Problem::AccessDenied,
            "authentication-failed" => Problem::AuthenticationFailed,
            "authentication-not-supported" => Problem::AuthenticationNotSupported,
            "unknown-hostkey" => Problem::UnknownHostkey,
            "invalid-hostkey" => Problem::InvalidHostkey,
            "internal-error" => Problem::InternalError,
            "timeout" => Problem::Timeout,
            "no-cockpit" => Problem::NoCockpit,
            "no-forwarding" => Problem::NoForwarding,
            "disconnected" => Problem::Disconnected,
            "not-supported" => Problem::NotSupported,
            "no-host" => Problem::NoHost,
            "protocol-error" => Problem::ProtocolError,
            "not-found" => Problem::NotFound,
            "change-conflict" => Problem::ChangeConflict,
            "cancelled" => Problem::Cancelled,
            other => Problem::Other(other.to_owned()),
        }
    }

    /// The wire code.
    pub fn code(&self) -> &str {
        match self {
            Problem::Terminated => "terminated",
            Problem::NoSession => "no-session",
            Problem::AccessDenied => "access-denied",
            Problem::AuthenticationFailed => "authentication-failed",
            Problem::AuthenticationNotSupported => "authentication-not-supported",
            Problem::UnknownHostkey => "unknown-hostkey",
            Problem::InvalidHostkey => "invalid-hostkey",
            Problem::InternalError => "internal-error",
            Problem::Timeout => "timeout",
            Problem::NoCockpit => "no-cockpit",
            Problem::NoForwarding => "no-forwarding",
            Problem::Disconnected => "disconnected",
            Problem::NotSupported => "not-supported",
            Problem::NoHost => "no-host",
            Problem::ProtocolError => "protocol-error",
            Problem::NotFound => "not-found",
            Problem::ChangeConflict => "change-conflict",
            Problem::Cancelled => "cancelled",
            Problem::Other(code) => code,
        }
    }

    /// Human-readable text.  Codes without an entry fall back to the code.
    pub fn message(&self) -> &str {
        match self {
            Problem::Terminated => "Your session has been terminated.",
            Problem::NoSession => "Your session has expired. Please log in again.",
            Problem::AccessDenied => "Not permitted to perform this action.",
            Problem::AuthenticationFailed => "Login failed",
            Problem::AuthenticationNotSupported => {
                "The server refused to authenticate using any supported methods."
            }
            Problem::UnknownHostkey => "Untrusted host",
            Problem::InvalidHostkey => "Host key is incorrect",
            Problem::InternalError => "Internal error",
            Problem::Timeout => "Connection has timed out.",
            Problem::NoCockpit => "The bridge is not installed on the system.",
            Problem::NoForwarding => "Cannot forward login credentials",
            Problem::Disconnected => "Server has closed the connection.",
            Problem::NotSupported => "The bridge is not compatible with the software on the system.",
            Problem::NoHost => "The bridge could not contact the given host.",
            other => other.code(),
        }
    }

    /// Problems that end the whole transport rather than a single channel.
    pub fn is_transport_fatal(&self) -> bool {
        matches!(
            self,
            Problem::Disconnected
                | Problem::Timeout
                | Problem::NotSupported
                | Problem::NoCockpit
                | Problem::ProtocolError
        )
    }
}

/// Message for a raw problem code, see [`Problem::message`].
pub fn problem_message(code: &str) -> String {
    Problem::from_code(code).message().to_owned()
}

impl From<String> for Problem {
    fn from(code: String) -> Self {
        Problem::from_code(&code)
    }
}

impl From<&str> for Problem {
    fn from(code: &str) -> Self {
        Problem::from_code(code)
    }
}

impl From<Problem> for String {
    fn from(problem: Problem) -> Self {
        problem.code().to_owned()
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_entry_round_trips_its_code() {
        let codes = [
            "terminated",
            "no-session",
            "access-denied",
            "authentication-failed",
            "authentication-not-supported",
            "unknown-hostkey",
            "invalid-hostkey",
            "internal-error",
            "timeout",
            "no-cockpit",
            "no-forwarding",
            "disconnected",
            "not-supported",
            "no-host",
        ];
        for code in codes {
            let problem = Problem::from_code(code);
            assert_eq!(problem.code(), code);
            assert_ne!(problem.message(), code, "{code} should have a message");
        }
    }

    #[test]
    fn test_unknown_code_falls_back_to_raw_code() {
        assert_eq!(problem_message("weird-thing"), "weird-thing");
        assert_eq!(Problem::from_code("weird-thing"), Problem::Other("weird-thing".to_owned()));
    }

    #[test]
    fn test_display_uses_message() {
        assert_eq!(Problem::Timeout.to_string(), "Connection has timed out.");
    }

    #[test]
    fn test_transport_fatal_classification() {
        assert!(Problem::Disconnected.is_transport_fatal());
        assert!(!Problem::ChangeConflict.is_transport_fatal());
    }
}
