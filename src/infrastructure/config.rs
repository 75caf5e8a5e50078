//! Configuration management for the listener fleet
//!
//! Loads configuration from config.toml at startup.
//! Values are read once and are immutable after `Supervisor::start` begins.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::infrastructure::pool::{DEFAULT_BUFFER_SIZE, DEFAULT_MIN_RESERVED};

/// Fleet configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Listening socket and worker settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Buffer pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port shared by every endpoint
    #[serde(default = "default_port")]
    pub port: u16,

    /// Accept queue depth for each endpoint
    #[serde(default = "default_backlog")]
    pub backlog: u16,

    /// Worker count; zero or negative means `max(2, available processors)`
    #[serde(default)]
    pub workers: i32,
}

/// Buffer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Buffers kept allocated while the fleet runs
    #[serde(default = "default_min_reserved")]
    pub min_reserved: usize,

    /// Size of one processing buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for rolling log files; console only when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            backlog: default_backlog(),
            workers: 0,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_reserved: default_min_reserved(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

fn default_port() -> u16 {
    8081
}

fn default_backlog() -> u16 {
    512
}

fn default_min_reserved() -> usize {
    DEFAULT_MIN_RESERVED
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the file named by CONFIG_PATH (default config.toml)
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from(config_path)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File not found - use defaults
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.server.backlog, 512);
        assert_eq!(config.server.workers, 0);
        assert_eq!(config.pool.min_reserved, 4);
        assert_eq!(config.pool.buffer_size, 4096);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [server]
            port = 9090
            workers = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.workers, 3);
        assert_eq!(config.server.backlog, 512);
        assert_eq!(config.pool.min_reserved, 4);
    }

    #[test]
    fn test_negative_workers_accepted() {
        let config = Config::from_toml_str("[server]\nworkers = -1\n").unwrap();
        assert_eq!(config.server.workers, -1);
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::from_toml_str("[server]\nport = \"eighty\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_out_of_range_port_rejected() {
        let err = Config::from_toml_str("[server]\nport = 70000\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from("definitely/not/here/config.toml").unwrap();
        assert_eq!(config.server.port, 8081);
    }
}
