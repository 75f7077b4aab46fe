//! Configuration management for runledger
//!
//! Handles loading and validation of runledger.toml configuration files.
//! Every section and key is optional; missing values take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::{LogConfig, LogLevel};

/// Default config file name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "runledger.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Event processing settings
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Producer wait settings
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file, written in addition to stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Event processing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Let the sink buffer messages, checkpoints and statistics
    #[serde(default)]
    pub batch_mode: bool,

    #[serde(default = "default_true")]
    pub enable_checkpoints: bool,

    /// Persist messages at run and suite level
    #[serde(default)]
    pub log_before_after_messages: bool,

    /// How long the consumer waits for an event before flushing (batch mode)
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Machine name stored with messages; defaults to the host name
    #[serde(default)]
    pub machine_name: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_mode: false,
            enable_checkpoints: true,
            log_before_after_messages: false,
            poll_timeout_ms: default_poll_timeout_ms(),
            machine_name: None,
        }
    }
}

impl ProcessorConfig {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_timeout_ms() -> u64 {
    2_000
}

/// How long producers wait for synchronizing events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Wait for start_run, start_test_case and end_test_case
    #[serde(default = "default_short_timeout_secs")]
    pub short_timeout_secs: u64,

    /// Wait for end_run
    #[serde(default = "default_long_timeout_secs")]
    pub long_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            short_timeout_secs: default_short_timeout_secs(),
            long_timeout_secs: default_long_timeout_secs(),
        }
    }
}

fn default_short_timeout_secs() -> u64 {
    60
}

fn default_long_timeout_secs() -> u64 {
    15 * 60
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// Database file path
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Buffered writes that force a flush in batch mode
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            batch_capacity: default_batch_capacity(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("runledger.db")
}

fn default_batch_capacity() -> usize {
    500
}

impl Config {
    /// Load `runledger.toml` from the working directory, or defaults when absent
    pub fn load() -> Result<Self> {
        let path = Path::new(DEFAULT_CONFIG_FILE);
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&text)
    }

    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()).into())
    }

    pub fn validate(&self) -> Result<()> {
        self.general
            .log_level
            .parse::<LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        if self.processor.poll_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "processor.poll_timeout_ms must be greater than 0".to_string(),
            )
            .into());
        }
        if self.bridge.short_timeout_secs == 0 || self.bridge.long_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "bridge timeouts must be greater than 0".to_string(),
            )
            .into());
        }
        if self.storage.batch_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "storage.batch_capacity must be greater than 0".to_string(),
            )
            .into());
        }
        Ok(())
    }

    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.general.log_level.clone(),
            format: self.general.log_format,
            file: self.general.log_file.clone(),
        }
    }
}
