//! # Configuration Management
//!
//! Centralized configuration for connections, servers and logging.
//!
//! ## Configuration Sources
//! - TOML files via [`NetworkConfig::from_file`]
//! - Environment variables via [`NetworkConfig::from_env`]
//! - Direct instantiation with defaults
//!
//! Durations are written as integer milliseconds.

use crate::error::{ProtocolError, Result};
use crate::transport::DeliveryMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed stream frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload written into one datagram; leaves room for IP/UDP headers
pub const MAX_DATAGRAM_PAYLOAD: usize = 59_900;

/// Receive buffer for datagram transports (largest possible UDP datagram)
pub const DATAGRAM_BUFFER_SIZE: usize = 65_536;

/// Default time allowed for a graceful server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server, transport and logging settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `PEERLINK_*` environment variables.
    ///
    /// A variable that is set but does not parse is an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = env_value::<String>("PEERLINK_SERVER_ADDRESS")? {
            config.server.address = address;
        }
        if let Some(max) = env_value("PEERLINK_MAX_CONNECTIONS")? {
            config.server.max_connections = max;
        }
        if let Some(millis) = env_value("PEERLINK_NEGOTIATION_TIMEOUT_MS")? {
            config.server.negotiation_timeout = Some(Duration::from_millis(millis));
        }
        if let Some(size) = env_value("PEERLINK_MAX_FRAME_SIZE")? {
            config.transport.max_frame_size = size;
        }
        if let Some(mode) = env_value::<String>("PEERLINK_DELIVERY_MODE")? {
            config.transport.delivery_mode = match mode.to_ascii_lowercase().as_str() {
                "ordered" => DeliveryMode::Ordered,
                "unordered" => DeliveryMode::Unordered,
                _ => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid PEERLINK_DELIVERY_MODE '{mode}' (expected ordered or unordered)"
                    )))
                }
            };
        }

        Ok(config)
    }

    /// Defaults with `mutator` applied
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration rendered as TOML
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;
        let path = path.as_ref();
        std::fs::write(path, content).map_err(|e| {
            ProtocolError::ConfigError(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Every problem found in the configuration; empty when it is usable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.server.validate();
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// [`validate`](NetworkConfig::validate) folded into one `ConfigError`
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "Configuration validation failed:\n  - {}",
            errors.join("\n  - ")
        )))
    }
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ProtocolError::ConfigError(format!("Invalid {name} '{raw}': {e}"))),
        Err(_) => Ok(None),
    }
}

/// Listener and session limits
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address `listen_tcp` binds, e.g. `127.0.0.1:9000`
    pub address: String,

    /// Cap on validated plus negotiating connections
    pub max_connections: usize,

    /// Negotiations still running after this long are aborted with
    /// `Timeout`. Unset means no limit.
    #[serde(with = "millis::optional", skip_serializing_if = "Option::is_none")]
    pub negotiation_timeout: Option<Duration>,

    #[serde(with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".into(),
            max_connections: 1000,
            negotiation_timeout: None,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self.address.as_str() {
            "" => problems.push("Server address cannot be empty".to_owned()),
            addr if addr.parse::<std::net::SocketAddr>().is_err() => problems.push(format!(
                "Invalid server address '{addr}' (want host:port, e.g. 0.0.0.0:9000)"
            )),
            _ => {}
        }

        match self.max_connections {
            0 => problems.push("Max connections must be greater than 0".to_owned()),
            n if n > 100_000 => problems.push(format!(
                "Max connections very high ({n}); check file descriptor limits"
            )),
            _ => {}
        }

        if matches!(self.negotiation_timeout, Some(t) if t < Duration::from_millis(10)) {
            problems.push("Negotiation timeout too short (minimum 10ms)".to_owned());
        }

        let shutdown = self.shutdown_timeout;
        if shutdown < Duration::from_secs(1) {
            problems.push("Shutdown timeout too short (minimum 1s)".to_owned());
        } else if shutdown > Duration::from_secs(60) {
            problems.push("Shutdown timeout too long (maximum 60s)".to_owned());
        }

        problems
    }
}

/// Settings applied to every connection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest stream frame read or written. A peer announcing a longer
    /// frame is disconnected.
    pub max_frame_size: usize,

    /// Largest payload sent in one datagram
    pub max_datagram_payload: usize,

    pub datagram_buffer_size: usize,

    /// Delivery mode a connection starts with
    pub delivery_mode: DeliveryMode,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            max_datagram_payload: MAX_DATAGRAM_PAYLOAD,
            datagram_buffer_size: DATAGRAM_BUFFER_SIZE,
            delivery_mode: DeliveryMode::Ordered,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.max_frame_size == 0 {
            problems.push("Max frame size cannot be 0".to_owned());
        } else if u32::try_from(self.max_frame_size).is_err() {
            problems.push(format!(
                "Max frame size {} does not fit the 4-byte length prefix",
                self.max_frame_size
            ));
        }

        match self.max_datagram_payload {
            0 => problems.push("Max datagram payload cannot be 0".to_owned()),
            n if n > MAX_DATAGRAM_PAYLOAD => problems.push(format!(
                "Max datagram payload too large ({n} > {MAX_DATAGRAM_PAYLOAD})"
            )),
            _ => {}
        }

        if self.datagram_buffer_size < self.max_datagram_payload {
            problems.push(format!(
                "Datagram buffer size cannot be smaller than max_datagram_payload ({} < {})",
                self.datagram_buffer_size, self.max_datagram_payload
            ));
        }

        problems
    }
}

/// Where and how log output is written
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub app_name: String,

    #[serde(with = "level")]
    pub log_level: Level,

    pub log_to_console: bool,

    pub log_to_file: bool,

    /// Required when `log_to_file` is set
    pub log_file_path: Option<String>,

    /// Emit JSON lines instead of human-readable output
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: "peerlink".into(),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.app_name.is_empty() {
            problems.push("Application name cannot be empty".to_owned());
        } else if self.app_name.len() > 64 {
            problems.push(format!(
                "Application name is {} characters long (maximum 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            match self.log_file_path.as_deref().map(Path::new) {
                None => problems
                    .push("log_file_path must be specified when log_to_file is set".to_owned()),
                Some(path) => {
                    let missing_dir = path
                        .parent()
                        .filter(|dir| !dir.as_os_str().is_empty() && !dir.exists());
                    if let Some(dir) = missing_dir {
                        problems.push(format!("Log directory {} does not exist", dir.display()));
                    }
                }
            }
        }

        if !(self.log_to_console || self.log_to_file) {
            problems.push("At least one logging output must be enabled".to_owned());
        }

        problems
    }
}

/// Durations as integer milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    fn to_millis(duration: &Duration) -> u64 {
        u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(to_millis(duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod optional {
        use super::*;

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => serializer.serialize_some(&to_millis(duration)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// `tracing::Level` as a lowercase name
mod level {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.as_str().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| D::Error::custom(format!("unknown log level '{name}'")))
    }
}
