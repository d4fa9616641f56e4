//! Error types surfaced by the transport and the protocol clients.
//!
//! Every failure a bridge reports arrives the same way: a `close` control
//! carrying a `problem` code and maybe a `message`.  [`ChannelError`] is that
//! pair.  The protocol clients wrap it in their own error enums and add the
//! failures only they can have (a non-2xx HTTP status, a remote D-Bus fault,
//! an unparsable file).

use bridgemux_core::{Control, Payload, Problem};
use thiserror::Error;

/// Failures of the physical connection itself.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The bridge endpoint could not be reached or refused the handshake.
    #[error("failed to connect to bridge at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The endpoint string is not usable for a WebSocket request.
    #[error("invalid bridge URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The transport is closed and will not reconnect.
    #[error("transport closed: {0}")]
    Closed(ChannelError),
}

/// A problem code plus a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ChannelError {
    pub problem: Problem,
    pub message: String,
}

impl ChannelError {
    /// The standard message for `problem`.
    pub fn new(problem: Problem) -> Self {
        let message = problem.message().to_owned();
        Self { problem, message }
    }

    pub fn with_message(problem: Problem, message: impl Into<String>) -> Self {
        Self {
            problem,
            message: message.into(),
        }
    }

    /// The error described by a `close` control, or `None` for a clean close.
    pub fn from_close(control: &Control) -> Option<Self> {
        let problem = Problem::from_code(control.problem()?);
        Some(match control.message() {
            Some(message) => Self::with_message(problem, message),
            None => Self::new(problem),
        })
    }

    /// Like [`ChannelError::from_close`], but a close without a problem is
    /// reported as `disconnected`.
    pub fn from_close_or_disconnected(control: &Control) -> Self {
        Self::from_close(control).unwrap_or_else(|| Self::new(Problem::Disconnected))
    }
}

impl From<Problem> for ChannelError {
    fn from(problem: Problem) -> Self {
        Self::new(problem)
    }
}

// ── Process ───────────────────────────────────────────────────────────────────

/// A spawned process failed, was killed, or exited non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessError {
    pub problem: Option<Problem>,
    pub exit_status: Option<i64>,
    pub exit_signal: Option<String>,
    pub message: String,
}

impl ProcessError {
    /// Builds the error from the channel's `close` control.  `name` is the
    /// program name used in generated messages.
    pub fn from_close(control: &Control, name: &str) -> Self {
        let problem = control.problem().map(Problem::from_code);
        let exit_status = control.get_i64("exit-status");
        let exit_signal = control.get("exit-signal").and_then(|signal| match signal {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });

        let message = match control.message() {
            Some(message) => message.trim().to_owned(),
            None => match (&problem, &exit_signal, exit_status) {
                (Some(problem), _, _) => problem.message().to_owned(),
                (None, Some(signal), _) => format!("{name} killed with signal {signal}"),
                (None, None, Some(status)) => format!("{name} exited with code {status}"),
                (None, None, None) => format!("{name} failed"),
            },
        };

        Self {
            problem,
            exit_status,
            exit_signal,
            message,
        }
    }
}

// ── D-Bus ─────────────────────────────────────────────────────────────────────

/// Failure of one D-Bus request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DBusError {
    /// The channel closed (or was never usable) with this problem.
    #[error("{message}")]
    Problem { problem: Problem, message: String },

    /// The remote method raised a D-Bus error.
    #[error("{message}")]
    Remote { name: String, message: String },
}

impl DBusError {
    pub fn problem(problem: Problem) -> Self {
        let message = problem.message().to_owned();
        DBusError::Problem { problem, message }
    }

    /// The D-Bus error name for remote faults.
    pub fn name(&self) -> Option<&str> {
        match self {
            DBusError::Remote { name, .. } => Some(name),
            DBusError::Problem { .. } => None,
        }
    }

    pub fn problem_code(&self) -> Option<&Problem> {
        match self {
            DBusError::Problem { problem, .. } => Some(problem),
            DBusError::Remote { .. } => None,
        }
    }
}

impl From<ChannelError> for DBusError {
    fn from(error: ChannelError) -> Self {
        DBusError::Problem {
            problem: error.problem,
            message: error.message,
        }
    }
}

// ── Files ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    /// The bridge closed the file channel with a problem.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The file content could not be parsed with the file's syntax.
    #[error("failed to parse file content: {0}")]
    Parse(String),

    /// The new content could not be rendered with the file's syntax.
    #[error("failed to render file content: {0}")]
    Stringify(String),
}

impl FileError {
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            FileError::Channel(error) => Some(&error.problem),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.problem() == Some(&Problem::ChangeConflict)
    }
}

// ── HTTP ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HttpError {
    /// The request channel closed with a problem.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The server answered with a status outside 200..=299.
    #[error("{status} {message}")]
    Status {
        status: u16,
        reason: String,
        message: String,
        body: Payload,
    },

    /// The response head was not valid JSON.
    #[error("invalid HTTP response head: {0}")]
    InvalidResponse(String),

    /// The endpoint is neither an absolute unix socket path nor a port.
    #[error("the endpoint must be either a unix path or port number: {0}")]
    InvalidEndpoint(String),
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use bridgemux_core::Command;

    fn close_with(pairs: &[(&str, serde_json::Value)]) -> Control {
        let mut control = Control::new(Command::Close);
        for (key, value) in pairs {
            control.set(key, value.clone());
        }
        control
    }

    #[test]
    fn test_channel_error_from_clean_close_is_none() {
        assert!(ChannelError::from_close(&Control::new(Command::Close)).is_none());
    }

    #[test]
    fn test_channel_error_uses_problem_message_by_default() {
        // Arrange
        let control = close_with(&[("problem", "not-found".into())]);

        // Act
        let error = ChannelError::from_close(&control).unwrap();

        // Assert
        assert_eq!(error.problem, Problem::NotFound);
        assert_eq!(error.message, Problem::NotFound.message());
    }

    #[test]
    fn test_channel_error_keeps_server_message() {
        let control = close_with(&[("problem", "internal-error".into()), ("message", "boom".into())]);
        let error = ChannelError::from_close(&control).unwrap();
        assert_eq!(error.to_string(), "boom");
    }

    #[test]
    fn test_process_error_exit_status_message() {
        let control = close_with(&[("exit-status", 2.into())]);
        let error = ProcessError::from_close(&control, "ls");
        assert_eq!(error.exit_status, Some(2));
        assert_eq!(error.message, "ls exited with code 2");
    }

    #[test]
    fn test_process_error_signal_message() {
        let control = close_with(&[("exit-signal", "TERM".into())]);
        let error = ProcessError::from_close(&control, "sleep");
        assert_eq!(error.message, "sleep killed with signal TERM");
    }

    #[test]
    fn test_process_error_trims_server_message() {
        let control = close_with(&[("problem", "not-found".into()), ("message", "  no such file\n".into())]);
        let error = ProcessError::from_close(&control, "cat");
        assert_eq!(error.problem, Some(Problem::NotFound));
        assert_eq!(error.message, "no such file");
    }

    #[test]
    fn test_dbus_error_from_channel_error() {
        let error: DBusError = ChannelError::new(Problem::Disconnected).into();
        assert_eq!(error.problem_code(), Some(&Problem::Disconnected));
        assert_eq!(error.name(), None);
    }

    #[test]
    fn test_file_error_conflict_detection() {
        let error: FileError = ChannelError::new(Problem::ChangeConflict).into();
        assert!(error.is_conflict());
        assert!(!FileError::Parse("x".into()).is_conflict());
    }
}
