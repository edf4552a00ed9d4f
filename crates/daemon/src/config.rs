//! Configuration management for the HostDeck daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/hostdeck/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("ssh.port must be between 1 and 65535, got {0}")]
    InvalidSshPort(u16),

    #[error("ssh.connect_timeout_ms must be between 1 and 120000, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("ssh.host must not be empty")]
    EmptySshHost,

    #[error("session.idle_timeout_secs must be greater than 0")]
    InvalidIdleTimeout,

    #[error("session.reap_interval_secs must be greater than 0")]
    InvalidReapInterval,

    #[error("session.max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("bridge.bind_addr is not a valid socket address: {0}")]
    InvalidBindAddr(String),

    #[error("bridge.identity_header must not be empty")]
    EmptyIdentityHeader,

    #[error("bridge.max_message_bytes must be greater than 0")]
    InvalidMaxMessageBytes,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the HostDeck daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Connection to the managed host.
    pub ssh: SshConfig,

    /// Terminal session limits.
    pub session: SessionConfig,

    /// WebSocket transport bridge.
    pub bridge: BridgeConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional file to write logs to instead of stderr.
    pub log_file: Option<PathBuf>,
}

/// SSH connection settings for the managed host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// Host running the SSH server.
    pub host: String,

    /// SSH server port.
    pub port: u16,

    /// Deadline for connect, authenticate and channel open, in milliseconds.
    pub connect_timeout_ms: u64,

    /// TERM value sent with the pty request.
    pub term: String,

    /// Expected SHA-256 host key fingerprint. Any key is accepted when unset.
    pub host_key_fingerprint: Option<String>,
}

/// Terminal session limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle for longer than this are closed by the reaper.
    pub idle_timeout_secs: u64,

    /// Absolute session age ceiling (0 = no ceiling).
    pub max_age_secs: u64,

    /// How often the reaper sweeps the registry.
    pub reap_interval_secs: u64,

    /// Maximum number of live sessions across all clients.
    pub max_sessions: usize,
}

/// WebSocket transport bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,

    /// Request header carrying the username verified by the fronting authenticator.
    pub identity_header: String,

    /// Maximum inbound message size in bytes.
    pub max_message_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            connect_timeout_ms: 10_000,
            term: "xterm-256color".to_string(),
            host_key_fingerprint: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            max_age_secs: 60 * 60,
            reap_interval_secs: 60,
            max_sessions: 32,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            identity_header: "x-authenticated-user".to_string(),
            max_message_bytes: protocol::MAX_MESSAGE_SIZE,
        }
    }
}

impl SshConfig {
    /// Connect deadline as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl SessionConfig {
    /// Idle threshold as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Age ceiling, or `None` when disabled.
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }

    /// Reaper sweep period as a [`Duration`].
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hostdeck")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SSH_HOST: Override the managed host
    /// - SSH_PORT: Override the SSH port
    /// - SSH_TIMEOUT: Override the connect deadline (milliseconds)
    /// - HOSTDECK_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - HOSTDECK_BIND_ADDR: Override the bridge listen address
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = non_empty_env("SSH_HOST") {
            tracing::info!("Overriding ssh.host from environment: {}", host);
            self.ssh.host = host;
        }

        if let Some(port) = non_empty_env("SSH_PORT") {
            match port.parse() {
                Ok(port) => self.ssh.port = port,
                Err(_) => tracing::warn!("Ignoring invalid SSH_PORT value: {}", port),
            }
        }

        if let Some(timeout) = non_empty_env("SSH_TIMEOUT") {
            match timeout.parse() {
                Ok(ms) => self.ssh.connect_timeout_ms = ms,
                Err(_) => tracing::warn!("Ignoring invalid SSH_TIMEOUT value: {}", timeout),
            }
        }

        if let Some(level) = non_empty_env("HOSTDECK_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(addr) = non_empty_env("HOSTDECK_BIND_ADDR") {
            tracing::info!("Overriding bridge.bind_addr from environment: {}", addr);
            self.bridge.bind_addr = addr;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssh.host.trim().is_empty() {
            return Err(ConfigError::EmptySshHost);
        }

        if self.ssh.port == 0 {
            return Err(ConfigError::InvalidSshPort(self.ssh.port));
        }

        if self.ssh.connect_timeout_ms == 0 || self.ssh.connect_timeout_ms > 120_000 {
            return Err(ConfigError::InvalidConnectTimeout(self.ssh.connect_timeout_ms));
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidIdleTimeout);
        }

        if self.session.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidReapInterval);
        }

        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.bridge.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.bridge.bind_addr.clone()));
        }

        if self.bridge.identity_header.trim().is_empty() {
            return Err(ConfigError::EmptyIdentityHeader);
        }

        if self.bridge.max_message_bytes == 0 {
            return Err(ConfigError::InvalidMaxMessageBytes);
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

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

/// Format a TOML parse error with line information when available.
fn format_toml_error(error: &toml::de::Error) -> String {
    let message = error.message().to_string();
    match error.span() {
        Some(span) => format!("{} (at byte offset {})", message, span.start),
        None => message,
    }
}
