//! # Configuration Management
//!
//! Centralized configuration for the peer link.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Security Considerations
//! - The network key is the root of trust for every handshake; an empty key is refused
//! - The handshake timeout bounds how long an unauthenticated socket may stay open
//! - Ban patterns are regular expressions matched against the dotted remote address

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version, compared for exact equality
pub const PROTOCOL_VERSION: i64 = 1;

/// Version string advertised during the handshake
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listening port
pub const DEFAULT_PORT: u16 = 25555;

/// Max allowed frame payload (24-bit length)
pub const MAX_PAYLOAD_SIZE: usize = crate::core::codec::MAX_FRAME_LENGTH;

/// How long an inbound socket may take to present a handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Upper bound on a single reactor wait
pub const TICK_INTERVAL: Duration = Duration::from_millis(1000);

/// Pending requests older than this are swept as timed out
pub const REQUEST_TTL: Duration = Duration::from_secs(60);

/// Main configuration structure
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
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PEERLINK_LISTEN_ADDRESS") {
            config.server.listen_address = addr;
        }

        if let Ok(key) = std::env::var("PEERLINK_NETWORK_KEY") {
            config.server.network_key = key;
        }

        if let Ok(timeout) = std::env::var("PEERLINK_HANDSHAKE_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.handshake_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(tick) = std::env::var("PEERLINK_TICK_INTERVAL_MS") {
            if let Ok(val) = tick.parse::<u64>() {
                config.server.tick_interval = Duration::from_millis(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener and protocol timing configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:25555")
    pub listen_address: String,

    /// Pre-shared network key identifying this server to its peers
    pub network_key: String,

    /// Regular expressions matched against the remote IP of inbound connections
    #[serde(default)]
    pub ban_patterns: Vec<String>,

    /// Time a connection has to complete the handshake; zero disables the deadline
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Upper bound on a single reactor wait; keep-alive work runs once per tick
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,

    /// Age after which unanswered requests are swept as timed out
    #[serde(with = "duration_serde")]
    pub request_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            network_key: String::new(),
            ban_patterns: Vec::new(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            tick_interval: TICK_INTERVAL,
            request_ttl: REQUEST_TTL,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen_address.is_empty() {
            errors.push("Listen address cannot be empty".to_string());
        } else if self.listen_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid listen address format: '{}' (expected format: '0.0.0.0:25555')",
                self.listen_address
            ));
        }

        if self.network_key.is_empty() {
            errors.push("Network key cannot be empty".to_string());
        }

        for pattern in &self.ban_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("Invalid ban pattern '{pattern}': {e}"));
            }
        }

        // Zero disables the deadline
        if !self.handshake_timeout.is_zero() && self.handshake_timeout.as_millis() < 100 {
            errors.push("Handshake timeout too short (minimum: 100ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.tick_interval.as_millis() < 10 {
            errors.push("Tick interval too short (minimum: 10ms)".to_string());
        } else if self.tick_interval.as_secs() > 30 {
            errors.push("Tick interval too long (maximum: 30s)".to_string());
        }

        if self.request_ttl < self.tick_interval {
            errors.push("Request TTL must not be shorter than the tick interval".to_string());
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum accepted frame payload in bytes
    pub max_frame_size: usize,

    /// Size of the scratch buffer used for each socket read
    pub read_buffer_size: usize,

    /// Whether application sends default to encrypted frames
    pub encrypt_by_default: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_PAYLOAD_SIZE,
            read_buffer_size: 8192,
            encrypt_by_default: false,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_frame_size < 1024 {
            errors.push("Max frame size too small (minimum: 1 KB)".to_string());
        } else if self.max_frame_size > MAX_PAYLOAD_SIZE {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum: {MAX_PAYLOAD_SIZE})",
                self.max_frame_size
            ));
        }

        if self.read_buffer_size < 512 {
            errors.push("Read buffer too small (minimum: 512 bytes)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peerlink"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
