//! # Configuration Management
//!
//! Centralized configuration for the framed transport.
//!
//! The core never reads files or environment variables on its own: the
//! embedding application builds a [`NetworkConfig`] (directly, or from a
//! TOML document it owns) and hands the relevant section to the client or
//! server constructor.
//!
//! ## Configuration Sources
//! - Direct instantiation with defaults
//! - TOML strings via `from_toml()` or files via `from_file()`
//! - Programmatic overrides via `default_with_overrides()`

use crate::error::{Result, TransportError};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Initial capacity of a connection's receive buffer
pub const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Frames a server connection may have waiting for its writer task
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Framing configuration shared by both sides
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| {
            TransportError::ConfigError(format!("Failed to open config file: {e}"))
        })?;

        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(|e| {
            TransportError::ConfigError(format!("Failed to read config file: {e}"))
        })?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TransportError::ConfigError(format!("Failed to parse TOML: {e}")))
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

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
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
            Err(TransportError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// IP address the listener binds to; the port is passed to `start`
    pub bind_address: String,

    /// Maximum number of live connections kept in the registry
    pub max_connections: usize,

    /// Bound on disconnecting a single connection during `stop`
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Bound on a single frame write to one peer
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Frames queued per connection before a slow reader is dropped
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

fn default_outbound_queue_capacity() -> usize {
    OUTBOUND_QUEUE_CAPACITY
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("127.0.0.1"),
            max_connections: 1000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            write_timeout: timeout::WRITE_TIMEOUT,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("Server bind address cannot be empty".to_string());
        } else if self.bind_address.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "Invalid server bind address: '{}' (expected an IP such as '0.0.0.0')",
                self.bind_address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_millis() < 10 {
            errors.push("Shutdown timeout too short (minimum: 10ms)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.write_timeout.as_millis() < 10 {
            errors.push("Write timeout too short (minimum: 10ms)".to_string());
        }

        if self.outbound_queue_capacity == 0 {
            errors.push("Outbound queue capacity must be greater than 0".to_string());
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Timeout for connection attempts
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Disable Nagle's algorithm on the client socket
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: timeout::DEFAULT_TIMEOUT,
            nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        errors
    }
}

/// Framing configuration shared by client and server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Largest payload a peer may announce before the stream is treated as corrupt
    pub max_payload_size: usize,

    /// Initial capacity of each connection's receive buffer
    pub read_buffer_capacity: usize,

    /// Close the connection on an undefined kind ordinal instead of skipping the frame
    #[serde(default)]
    pub close_on_unknown_kind: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
            read_buffer_capacity: READ_BUFFER_CAPACITY,
            close_on_unknown_kind: false,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size > u32::MAX as usize {
            errors.push(format!(
                "Max payload size too large: {} bytes (the length field is 32 bits)",
                self.max_payload_size
            ));
        }

        if self.read_buffer_capacity < crate::core::frame::HEADER_LEN {
            errors.push(format!(
                "Read buffer capacity too small: {} (minimum: one header)",
                self.read_buffer_capacity
            ));
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
            app_name: String::from("netframe"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
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
