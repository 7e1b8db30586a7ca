#![deny(unsafe_code)]

//! Configuration loading and validation for eventgate.
//!
//! Loads TOML configuration files and validates them before any socket is
//! touched. [`AppConfig`] is the central configuration structure; every
//! ingestion endpoint is described by one [`EndpointConfig`] entry.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Longest socket path accepted, in bytes.
///
/// `sun_path` is 108 bytes on Linux and 104 on macOS, including the
/// trailing NUL.
pub const MAX_SOCKET_PATH_LEN: usize = 103;

/// Upper bound for `max_message_size` (16 MiB).
pub const MAX_MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Transports accepted in `endpoints[].transport`.
pub const TRANSPORTS: [&str; 2] = ["datagram", "stream"];

/// Framing strategies accepted in `endpoints[].framing`.
pub const FRAMINGS: [&str; 2] = ["whole", "delimited"];

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon runtime configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Control-plane socket configuration.
    #[serde(default)]
    pub control: ControlConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Ingestion endpoints, one per local transport.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            control: ControlConfig::default(),
            logging: LoggingConfig::default(),
            endpoints: default_endpoints(),
        }
    }
}

fn default_endpoints() -> Vec<EndpointConfig> {
    vec![EndpointConfig::datagram("queue", "/tmp/eventgate/queue.sock")]
}

/// Configuration for the daemon runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Capacity of the bounded event queue shared by all endpoints.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum number of handler dispatches per reactor turn.
    #[serde(default = "default_max_dispatch_per_turn")]
    pub max_dispatch_per_turn: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_dispatch_per_turn: default_max_dispatch_per_turn(),
        }
    }
}

fn default_queue_capacity() -> usize {
    4096
}

fn default_max_dispatch_per_turn() -> usize {
    64
}

/// Control-plane (status / shutdown) socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Whether the control socket is served.
    #[serde(default = "default_control_enabled")]
    pub enabled: bool,

    /// Path of the control socket.
    #[serde(default = "default_control_socket_path")]
    pub socket_path: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: default_control_enabled(),
            socket_path: default_control_socket_path(),
        }
    }
}

fn default_control_enabled() -> bool {
    true
}

fn default_control_socket_path() -> String {
    "/tmp/eventgate/control.sock".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One ingestion endpoint.
///
/// ## TOML Example
///
/// ```toml
/// [[endpoints]]
/// name = "queue"
/// transport = "datagram"
/// path = "/var/run/eventgate/queue.sock"
/// mode = "0660"
/// max_message_size = 65536
///
/// [[endpoints]]
/// name = "bulk"
/// transport = "stream"
/// path = "/var/run/eventgate/bulk.sock"
/// framing = "delimited"
/// delimiter = "\n"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique endpoint name, used in logs and provenance.
    pub name: String,

    /// Transport: "datagram" or "stream".
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Absolute path of the Unix socket.
    pub path: String,

    /// File mode of the socket, as an octal string.
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Optional numeric group to own the socket file.
    #[serde(default)]
    pub gid: Option<u32>,

    /// Largest accepted message in bytes. Longer messages are truncated
    /// and flagged.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Optional kernel receive buffer size (`SO_RCVBUF`) in bytes.
    #[serde(default)]
    pub kernel_recv_buffer: Option<usize>,

    /// Maximum reads per readiness notification.
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,

    /// Immediate retries when the event queue is full.
    #[serde(default = "default_push_retries")]
    pub push_retries: u32,

    /// Consecutive fatal socket errors before the endpoint fails.
    #[serde(default = "default_fatal_error_threshold")]
    pub fatal_error_threshold: u32,

    /// Framing: "whole" (one message per read unit) or "delimited".
    #[serde(default = "default_framing")]
    pub framing: String,

    /// Record delimiter for "delimited" framing; exactly one byte.
    #[serde(default)]
    pub delimiter: Option<String>,

    /// Maximum concurrent connections (stream transport only).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_transport() -> String {
    "datagram".to_string()
}

fn default_mode() -> String {
    "0660".to_string()
}

fn default_max_message_size() -> usize {
    65536
}

fn default_read_budget() -> usize {
    64
}

fn default_push_retries() -> u32 {
    3
}

fn default_fatal_error_threshold() -> u32 {
    3
}

fn default_framing() -> String {
    "whole".to_string()
}

fn default_max_connections() -> usize {
    64
}

impl EndpointConfig {
    /// A datagram endpoint with default settings.
    pub fn datagram(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: default_transport(),
            path: path.to_string(),
            mode: default_mode(),
            gid: None,
            max_message_size: default_max_message_size(),
            kernel_recv_buffer: None,
            read_budget: default_read_budget(),
            push_retries: default_push_retries(),
            fatal_error_threshold: default_fatal_error_threshold(),
            framing: default_framing(),
            delimiter: None,
            max_connections: default_max_connections(),
        }
    }

    /// A newline-delimited stream endpoint with default settings.
    pub fn stream(name: &str, path: &str) -> Self {
        Self {
            transport: "stream".to_string(),
            framing: "delimited".to_string(),
            delimiter: Some("\n".to_string()),
            ..Self::datagram(name, path)
        }
    }

    /// Parse [`mode`](Self::mode) as octal permission bits.
    pub fn mode_bits(&self) -> Result<u32, ConfigError> {
        let digits = self.mode.trim_start_matches("0o");
        let bits = u32::from_str_radix(digits, 8).map_err(|_| {
            ConfigError::Validation(format!(
                "endpoint {:?}: mode must be an octal string, got {:?}",
                self.name, self.mode
            ))
        })?;
        if bits > 0o777 {
            return Err(ConfigError::Validation(format!(
                "endpoint {:?}: mode {:?} exceeds 0777",
                self.name, self.mode
            )));
        }
        Ok(bits)
    }

    /// The delimiter byte, if one is configured.
    pub fn delimiter_byte(&self) -> Result<Option<u8>, ConfigError> {
        match self.delimiter.as_deref() {
            None => Ok(None),
            Some(d) if d.len() == 1 => Ok(Some(d.as_bytes()[0])),
            Some(d) => Err(ConfigError::Validation(format!(
                "endpoint {:?}: delimiter must be exactly one byte, got {d:?}",
                self.name
            ))),
        }
    }

    fn validate(&self, i: usize) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation(format!(
                "endpoints[{i}].name must not be empty"
            )));
        }
        if !TRANSPORTS.contains(&self.transport.as_str()) {
            return Err(ConfigError::Validation(format!(
                "endpoints[{i}].transport must be one of {:?}, got {:?}",
                TRANSPORTS, self.transport
            )));
        }
        validate_socket_path(&format!("endpoints[{i}].path"), &self.path)?;
        self.mode_bits()?;
        if self.max_message_size == 0 || self.max_message_size > MAX_MESSAGE_SIZE_LIMIT {
            return Err(ConfigError::Validation(format!(
                "endpoints[{i}].max_message_size must be in 1..={MAX_MESSAGE_SIZE_LIMIT}, got {}",
                self.max_message_size
            )));
        }
        if self.kernel_recv_buffer == Some(0) {
            return Err(ConfigError::Validation(format!(
                "endpoints[{i}].kernel_recv_buffer must be non-zero when set"
            )));
        }
        if self.read_budget == 0 {
            return Err(ConfigError::Validation(format!(
                "endpoints[{i}].read_budget must be at least 1"
            )));
        }
        if self.fatal_error_threshold == 0 {
            return Err(ConfigError::Validation(format!(
                "endpoints[{i}].fatal_error_threshold must be at least 1"
            )));
        }
        if !FRAMINGS.contains(&self.framing.as_str()) {
            return Err(ConfigError::Validation(format!(
                "endpoints[{i}].framing must be one of {:?}, got {:?}",
                FRAMINGS, self.framing
            )));
        }
        let delimiter = self.delimiter_byte()?;
        if self.framing == "delimited" && delimiter.is_none() {
            return Err(ConfigError::Validation(format!(
                "endpoints[{i}].delimiter is required when framing is \"delimited\""
            )));
        }
        if self.transport == "stream" {
            if self.framing != "delimited" {
                return Err(ConfigError::Validation(format!(
                    "endpoints[{i}]: stream transport requires \"delimited\" framing"
                )));
            }
            if self.max_connections == 0 {
                return Err(ConfigError::Validation(format!(
                    "endpoints[{i}].max_connections must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

fn validate_socket_path(field: &str, path: &str) -> Result<(), ConfigError> {
    if !Path::new(path).is_absolute() {
        return Err(ConfigError::Validation(format!(
            "{field} must be an absolute path, got {path:?}"
        )));
    }
    if path.len() > MAX_SOCKET_PATH_LEN {
        return Err(ConfigError::Validation(format!(
            "{field} is {} bytes, longer than the {MAX_SOCKET_PATH_LEN}-byte socket path limit",
            path.len()
        )));
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Loading configuration");
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "daemon.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.daemon.max_dispatch_per_turn == 0 {
            return Err(ConfigError::Validation(
                "daemon.max_dispatch_per_turn must be at least 1".to_string(),
            ));
        }
        if self.control.enabled {
            validate_socket_path("control.socket_path", &self.control.socket_path)?;
        }

        let mut names = HashSet::new();
        let mut paths = HashSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            endpoint.validate(i)?;
            if !names.insert(endpoint.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "endpoints[{i}].name {:?} is used more than once",
                    endpoint.name
                )));
            }
            if !paths.insert(endpoint.path.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "endpoints[{i}].path {:?} is used more than once",
                    endpoint.path
                )));
            }
            if self.control.enabled && endpoint.path == self.control.socket_path {
                return Err(ConfigError::Validation(format!(
                    "endpoints[{i}].path collides with control.socket_path"
                )));
            }
        }

        Ok(())
    }
}
