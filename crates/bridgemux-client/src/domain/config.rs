//! Transport configuration.
//!
//! [`TransportConfig`] holds every runtime setting of a client session.  It
//! can be built in code, taken from [`Default`], or read from a TOML file:
//!
//! ```toml
//! url = "wss://server.example.com/cockpit/socket"
//! protocol = "cockpit1"
//! health_check_interval_secs = 30
//! default_host = "localhost"
//!
//! [file]
//! batch_size = 16384
//! conflict_retries = 10
//!
//! [series]
//! private_limit = 1024
//! shared_limit = 65536
//! ```
//!
//! # Serde default values
//!
//! Every field carries `#[serde(default = "...")]`, so a file only needs the
//! keys it wants to change.  A missing file is not an error for
//! [`TransportConfig::load_or_default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use bridgemux_core::series::{PRIVATE_LIMIT, SHARED_LIMIT};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// All runtime configuration for one transport session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    /// WebSocket endpoint of the bridge.
    #[serde(default = "default_url")]
    pub url: String,

    /// WebSocket subprotocol requested during the handshake.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Seconds between liveness checks.  `0` disables the check.
    #[serde(default = "default_health_check_secs")]
    pub health_check_interval_secs: u64,

    /// Host put into `open` commands that do not name one.  The server's
    /// `init` reply overrides this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_host: Option<String>,

    #[serde(default)]
    pub file: FileConfig,

    #[serde(default)]
    pub series: SeriesConfig,
}

/// File client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    /// Size of each message when streaming content into `fsreplace1`.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How many times a read or a read-modify-write cycle is restarted after a
    /// `change-conflict` before the conflict is reported.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
}

/// Series store limits, in samples.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesConfig {
    #[serde(default = "default_private_limit")]
    pub private_limit: usize,

    #[serde(default = "default_shared_limit")]
    pub shared_limit: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_url() -> String {
    "ws://127.0.0.1:9090/cockpit/socket".to_string()
}
fn default_protocol() -> String {
    "cockpit1".to_string()
}
fn default_health_check_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    16 * 1024
}
fn default_conflict_retries() -> u32 {
    10
}
fn default_private_limit() -> usize {
    PRIVATE_LIMIT
}
fn default_shared_limit() -> usize {
    SHARED_LIMIT
}

impl Default for TransportConfig {
    /// | Field                       | Default                               |
    /// |-----------------------------|---------------------------------------|
    /// | url                         | `ws://127.0.0.1:9090/cockpit/socket`  |
    /// | protocol                    | `cockpit1`                            |
    /// | health_check_interval_secs  | 30                                    |
    /// | file.batch_size             | 16 KiB                                |
    /// | file.conflict_retries       | 10                                    |
    fn default() -> Self {
        Self {
            url: default_url(),
            protocol: default_protocol(),
            health_check_interval_secs: default_health_check_secs(),
            default_host: None,
            file: FileConfig::default(),
            series: SeriesConfig::default(),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            conflict_retries: default_conflict_retries(),
        }
    }
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            private_limit: default_private_limit(),
            shared_limit: default_shared_limit(),
        }
    }
}

impl TransportConfig {
    /// The liveness check period, or `None` when disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        match self.health_check_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the TOML is malformed.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Serialize`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Loads the configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] when the file cannot be read and
    /// [`ConfigError::Parse`] if the TOML is malformed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Like [`TransportConfig::load`], but a missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system errors other than "not
    /// found", and [`ConfigError::Parse`] if the TOML is malformed.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
