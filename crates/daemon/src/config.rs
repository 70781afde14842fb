//! Configuration management for the printhub daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/printhub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::NotificationSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default camera port range, inclusive.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (8181, 8191);

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 64, got {0}")]
    InvalidMaxSessions(usize),

    #[error("port range is empty or invalid: {0}..={1}")]
    InvalidPortRange(u16, u16),

    #[error("channel_capacity must be greater than 0")]
    InvalidChannelCapacity,

    #[error("backoff settings invalid: initial {initial_ms}ms, max {max_ms}ms, multiplier {multiplier}")]
    InvalidBackoff {
        initial_ms: u64,
        max_ms: u64,
        multiplier: f64,
    },

    #[error("cooldown poll_interval_secs must be greater than 0")]
    InvalidCooldownInterval,

    #[error("cooldown threshold must be a finite temperature, got {0}")]
    InvalidCooldownThreshold(f64),

    #[error("device poll_interval_ms must be at least 100, got {0}")]
    InvalidDevicePollInterval(u64),

    #[error("deduction_url must start with http:// or https://, got {0}")]
    InvalidDeductionUrl(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the printhub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session registry configuration.
    pub session: SessionConfig,

    /// Camera stream multiplexing configuration.
    pub stream: StreamConfig,

    /// Post-print cooldown watch configuration.
    pub cooldown: CooldownConfig,

    /// Device status polling configuration.
    pub device: DeviceConfig,

    /// Filament usage deduction configuration.
    pub usage: UsageConfig,

    /// Initial notification preferences.
    pub notifications: NotificationSettings,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Reconnect after the device link drops. When false the session is removed.
    pub auto_reconnect: bool,

    /// Initial reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay in milliseconds.
    pub reconnect_max_ms: u64,

    /// Hold a priority stream client on the active session.
    pub keepalive_active: bool,
}

/// Camera stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// First port handed out to stream sessions.
    pub port_range_start: u16,

    /// Last port handed out to stream sessions (inclusive).
    pub port_range_end: u16,

    /// Bind a TCP listener on each assigned port.
    pub serve_downstream: bool,

    /// Address the downstream listeners bind to.
    pub bind_address: String,

    /// Per-client buffered chunks before dropping.
    pub channel_capacity: usize,

    /// Content type announced to downstream clients.
    pub content_type: String,

    /// Initial upstream retry delay in milliseconds.
    pub initial_backoff_ms: u64,

    /// Maximum upstream retry delay in milliseconds.
    pub max_backoff_ms: u64,

    /// Multiplier applied to the retry delay after each failure.
    pub backoff_multiplier: f64,
}

/// Post-print cooldown configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CooldownConfig {
    /// Bed temperature, in Celsius, under which the print is cool.
    pub threshold_c: f64,

    /// Seconds between temperature checks.
    pub poll_interval_secs: u64,

    /// Give up after this many seconds (0 = never).
    pub max_wait_secs: u64,
}

/// Device status polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Milliseconds between status polls.
    pub poll_interval_ms: u64,

    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Consecutive failed polls before the link is considered down.
    pub failure_threshold: u32,
}

/// Usage deduction configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct UsageConfig {
    /// Endpoint receiving filament deductions. Deductions are only logged when unset.
    pub deduction_url: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            auto_reconnect: true,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            keepalive_active: true,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            port_range_start: DEFAULT_PORT_RANGE.0,
            port_range_end: DEFAULT_PORT_RANGE.1,
            serve_downstream: true,
            bind_address: "0.0.0.0".to_string(),
            channel_capacity: 64,
            content_type: "multipart/x-mixed-replace; boundary=frame".to_string(),
            initial_backoff_ms: 250,
            max_backoff_ms: 15_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            threshold_c: 35.0,
            poll_interval_secs: 2,
            max_wait_secs: 3600,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            request_timeout_secs: 5,
            failure_threshold: 3,
        }
    }
}

impl StreamConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl CooldownConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_secs > 0).then(|| Duration::from_secs(self.max_wait_secs))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("printhub")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("printhub")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PRINTHUB_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PRINTHUB_DEDUCTION_URL: Override the usage deduction endpoint
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PRINTHUB_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(url) = std::env::var("PRINTHUB_DEDUCTION_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding deduction_url from environment: {}", url);
                self.usage.deduction_url = Some(url);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 64 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        let (start, end) = (self.stream.port_range_start, self.stream.port_range_end);
        if start == 0 || start > end {
            return Err(ConfigError::InvalidPortRange(start, end));
        }

        if self.stream.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity);
        }

        let s = &self.stream;
        if s.initial_backoff_ms == 0
            || s.max_backoff_ms < s.initial_backoff_ms
            || !(s.backoff_multiplier >= 1.0)
        {
            return Err(ConfigError::InvalidBackoff {
                initial_ms: s.initial_backoff_ms,
                max_ms: s.max_backoff_ms,
                multiplier: s.backoff_multiplier,
            });
        }

        if self.cooldown.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidCooldownInterval);
        }

        if !self.cooldown.threshold_c.is_finite() {
            return Err(ConfigError::InvalidCooldownThreshold(
                self.cooldown.threshold_c,
            ));
        }

        if self.device.poll_interval_ms < 100 {
            return Err(ConfigError::InvalidDevicePollInterval(
                self.device.poll_interval_ms,
            ));
        }

        if let Some(url) = &self.usage.deduction_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::InvalidDeductionUrl(url.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
