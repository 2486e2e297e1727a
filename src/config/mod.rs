//! Configuration management for ClipMirror
//!
//! This module handles loading, validating, and saving the TOML
//! configuration for the clipboard mirror.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::transport::{ReconnectPolicy, TransportConfig, DEFAULT_PORT, MAX_FRAME_LEN};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "CLIPMIRROR_CONFIG";

const APP_DIR_NAME: &str = "clipmirror";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),

    /// No platform config directory
    #[error("Could not determine the config directory")]
    NoConfigDir,
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Human-readable name of this device
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Directory for pairing data and the device identity
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Peer to connect to
    #[serde(default)]
    pub peer: PeerConfig,

    /// Connection tuning
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Clipboard configuration
    #[serde(default)]
    pub clipboard: ClipboardConfig,
}

/// Peer address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Last known address of the paired device's server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Connection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Largest accepted frame body in bytes
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

/// Clipboard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipboardConfig {
    /// How often the system clipboard is polled
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Number of clipboard items to keep in history
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

// Default value functions
fn default_device_name() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    format!("{}-clipmirror", hostname)
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.local/share/clipmirror")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_max_frame_len() -> usize {
    MAX_FRAME_LEN
}

fn default_reconnect_base_ms() -> u64 {
    2_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_history_size() -> usize {
    50
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            max_frame_len: default_max_frame_len(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl Default for ClipboardConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            history_size: default_history_size(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            peer: PeerConfig::default(),
            connection: ConnectionConfig::default(),
            clipboard: ClipboardConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Checks in order:
    /// 1. Path from CLIPMIRROR_CONFIG environment variable
    /// 2. <config dir>/clipmirror/config.toml
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_path() {
            Some(path) => Self::load_from_path(&path),
            None => {
                let mut config = Self::default();
                config.expand_paths();
                Ok(config)
            }
        }
    }

    /// Load from `config_path` when given, else from the default locations
    pub fn load_config(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(toml_str)?;
        config.expand_paths();
        config.validate_config()?;
        Ok(config)
    }

    /// Default config file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
            .ok_or(ConfigError::NoConfigDir)
    }

    fn find_config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        Self::default_path().ok().filter(|p| p.exists())
    }

    fn expand_paths(&mut self) {
        self.data_dir = expand_path(&self.data_dir);
    }

    /// Validate configuration values
    fn validate_config(&self) -> Result<(), ConfigError> {
        if self.peer.port == 0 {
            return Err(ConfigError::Validation("peer.port must not be 0".to_string()));
        }

        let connection = &self.connection;
        if connection.keepalive_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "keepalive_interval_secs must be at least 1".to_string(),
            ));
        }
        if connection.connect_timeout_secs < 1 || connection.write_timeout_secs < 1 {
            return Err(ConfigError::Validation(
                "connect_timeout_secs and write_timeout_secs must be at least 1".to_string(),
            ));
        }
        if connection.max_frame_len < 1 || connection.max_frame_len > MAX_FRAME_LEN {
            return Err(ConfigError::Validation(format!(
                "max_frame_len must be between 1 and {}",
                MAX_FRAME_LEN
            )));
        }
        if connection.reconnect_base_ms < 1 {
            return Err(ConfigError::Validation(
                "reconnect_base_ms must be at least 1".to_string(),
            ));
        }
        if connection.reconnect_base_ms > connection.reconnect_max_ms {
            return Err(ConfigError::Validation(
                "reconnect_base_ms must not exceed reconnect_max_ms".to_string(),
            ));
        }

        if self.clipboard.history_size < 1 || self.clipboard.history_size > 1000 {
            return Err(ConfigError::Validation(
                "history_size must be between 1 and 1000".to_string(),
            ));
        }
        if self.clipboard.poll_interval_ms < 50 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be at least 50".to_string(),
            ));
        }

        Ok(())
    }

    /// Connection engine settings derived from `[connection]`
    pub fn transport_config(&self) -> TransportConfig {
        let connection = &self.connection;
        TransportConfig {
            max_frame_len: connection.max_frame_len,
            connect_timeout: Duration::from_secs(connection.connect_timeout_secs),
            keepalive_interval: Duration::from_secs(connection.keepalive_interval_secs),
            write_timeout: Duration::from_secs(connection.write_timeout_secs),
            reconnect: ReconnectPolicy::new(
                Duration::from_millis(connection.reconnect_base_ms),
                Duration::from_millis(connection.reconnect_max_ms),
            ),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.clipboard.poll_interval_ms)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    /// Save configuration as pretty TOML at `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Write the commented example file to `path`
    pub fn write_example(path: &Path, force: bool) -> Result<(), ConfigError> {
        if !force && path.exists() {
            return Err(ConfigError::Validation(
                "Config file already exists. Use --force to overwrite.".to_string(),
            ));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::generate_example())?;
        Ok(())
    }

    /// Generate example configuration file
    pub fn generate_example() -> String {
        let config = Config::default();

        format!(
            r#"# ClipMirror Configuration File
# Location: ~/.config/clipmirror/config.toml

# Name shown for this device
device_name = "{}"
# Pairing data and device identity
data_dir = "{}"
# Logging level (trace, debug, info, warn, error)
log_level = "{}"

# Paired device to connect to
[peer]
# host = "192.168.1.20"
port = {}

# Connection tuning
[connection]
connect_timeout_secs = {}
# Ping interval while connected
keepalive_interval_secs = {}
write_timeout_secs = {}
# Largest frame accepted in bytes (at most 1000000)
max_frame_len = {}
# Reconnect backoff doubles from base up to max
reconnect_base_ms = {}
reconnect_max_ms = {}

# Clipboard settings
[clipboard]
poll_interval_ms = {}
# Number of clipboard items to keep in history
history_size = {}
"#,
            config.device_name,
            config.data_dir.display(),
            config.log_level,
            config.peer.port,
            config.connection.connect_timeout_secs,
            config.connection.keepalive_interval_secs,
            config.connection.write_timeout_secs,
            config.connection.max_frame_len,
            config.connection.reconnect_base_ms,
            config.connection.reconnect_max_ms,
            config.clipboard.poll_interval_ms,
            config.clipboard.history_size,
        )
    }
}

/// Expand tilde in path
fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(path_str.as_ref());
    PathBuf::from(expanded.into_owned())
}
