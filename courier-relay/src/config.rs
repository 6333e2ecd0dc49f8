//! Configuration loading for courier-relay.
//!
//! Configuration is loaded from a TOML file (default: `courier.toml`).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for courier-relay.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Per-connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Cleanup task configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Enable the metrics endpoint (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// TTL for queued messages in seconds (default: 7 days).
    #[serde(default = "default_message_ttl")]
    pub message_ttl_secs: u64,
    /// Maximum queued messages per recipient (default: 10000).
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: u64,
}

/// Per-connection configuration.
///
/// Defaults match the liveness parameters the protocol was designed around:
/// pings go out well inside the peer's 60s idle window.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Outbound buffer capacity in frames (default: 256).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Idle read deadline in seconds (default: 60).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Deadline for a single transport write in seconds (default: 10).
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Liveness ping interval in seconds (default: 54).
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Maximum inbound message size in bytes (default: 512KiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl ConnectionConfig {
    /// Idle read deadline as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Write deadline as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Ping interval as a [`Duration`].
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum connection attempts per identity per minute (default: 10).
    #[serde(default = "default_connections_per_minute")]
    pub connections_per_minute: u32,
    /// Maximum messages per identity per minute (default: 600).
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    /// Aggregate requests per second across all clients (default: 5000).
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
    /// Maximum concurrent connections (default: 10000).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 3600 = 1 hour).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    PathBuf::from("courier.db")
}

fn default_message_ttl() -> u64 {
    7 * 24 * 60 * 60 // 7 days in seconds
}

fn default_max_queue_depth() -> u64 {
    10_000
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_ping_interval_secs() -> u64 {
    54
}

fn default_max_frame_bytes() -> usize {
    512 * 1024
}

fn default_connections_per_minute() -> u32 {
    10
}

fn default_messages_per_minute() -> u32 {
    600
}

fn default_global_requests_per_second() -> u32 {
    5000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            message_ttl_secs: default_message_ttl(),
            max_queue_depth: default_max_queue_depth(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            idle_timeout_secs: default_idle_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            connections_per_minute: default_connections_per_minute(),
            messages_per_minute: default_messages_per_minute(),
            global_requests_per_second: default_global_requests_per_second(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
            enabled: default_cleanup_enabled(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            connection: ConnectionConfig::default(),
            limits: LimitsConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
