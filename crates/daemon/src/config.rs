//! Configuration management for the Terminal Nexus daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/terminal-nexus/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidDimensions { cols: u16, rows: u16 },

    #[error("backlog_capacity must be between 1 and 100000, got {0}")]
    InvalidBacklogCapacity(usize),

    #[error("verify_attempts must be between 1 and 50, got {0}")]
    InvalidVerifyAttempts(u32),

    #[error("viewer_queue must be greater than 0, got {0}")]
    InvalidViewerQueue(usize),

    #[error("allowed_workdirs entries must be absolute paths, got {0}")]
    RelativeWorkdirRoot(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Directory name used under the platform config and data directories.
const APP_DIR: &str = "terminal-nexus";

/// Main configuration structure for the Terminal Nexus daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session orchestration configuration.
    pub session: SessionConfig,

    /// Local control socket configuration.
    pub ipc: IpcConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (session database).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Session database path. Defaults to `<data_dir>/sessions.db`.
    pub database: Option<PathBuf>,
}

/// Session orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell launched by `shell` sessions that do not name a command.
    pub default_shell: String,

    /// Directory holding one private tmux control socket per session.
    pub socket_dir: PathBuf,

    /// Explicit tmux binary. Looked up on PATH when unset.
    pub tmux_binary: Option<PathBuf>,

    /// Terminal width used when a create request does not give one.
    pub default_cols: u16,

    /// Terminal height used when a create request does not give one.
    pub default_rows: u16,

    /// Output chunks retained per live session for late joiners.
    pub backlog_capacity: usize,

    /// Backlog chunks replayed to a joining viewer and returned by default
    /// from recent-output queries.
    pub replay_chunks: usize,

    /// Attempts at reading back a freshly created tmux session.
    pub verify_attempts: u32,

    /// Delay between verification attempts, in milliseconds.
    pub verify_backoff_ms: u64,

    /// Pause between kill and create during a restart, in milliseconds.
    pub restart_delay_ms: u64,

    /// Roots that session working directories must live under. Empty allows
    /// any absolute directory.
    pub allowed_workdirs: Vec<PathBuf>,
}

/// Local control socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IpcConfig {
    /// Override for the control socket path.
    pub socket_path: Option<PathBuf>,

    /// Per-viewer outbound queue capacity.
    pub viewer_queue: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            database: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            socket_dir: PathBuf::from("/tmp").join(APP_DIR),
            tmux_binary: None,
            default_cols: 80,
            default_rows: 24,
            backlog_capacity: 1000,
            replay_chunks: 100,
            verify_attempts: 5,
            verify_backoff_ms: 50,
            restart_delay_ms: 100,
            allowed_workdirs: Vec::new(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            viewer_queue: 256,
        }
    }
}

impl DaemonConfig {
    /// Resolved path of the session database.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sessions.db"))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Returns the default shell: bash when present, else `$SHELL`, else `/bin/sh`.
fn default_shell() -> String {
    if Path::new("/bin/bash").exists() {
        "/bin/bash".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - NEXUS_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - NEXUS_TMUX_BIN: Override the tmux binary
    /// - NEXUS_SOCKET_DIR: Override the tmux socket directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("NEXUS_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(binary) = std::env::var("NEXUS_TMUX_BIN") {
            if !binary.is_empty() {
                tracing::info!("Overriding tmux_binary from environment: {}", binary);
                self.session.tmux_binary = Some(PathBuf::from(binary));
            }
        }

        if let Ok(dir) = std::env::var("NEXUS_SOCKET_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding socket_dir from environment: {}", dir);
                self.session.socket_dir = PathBuf::from(dir);
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.default_cols == 0 || session.default_rows == 0 {
            return Err(ConfigError::InvalidDimensions {
                cols: session.default_cols,
                rows: session.default_rows,
            });
        }

        if session.backlog_capacity == 0 || session.backlog_capacity > 100_000 {
            return Err(ConfigError::InvalidBacklogCapacity(session.backlog_capacity));
        }

        if session.verify_attempts == 0 || session.verify_attempts > 50 {
            return Err(ConfigError::InvalidVerifyAttempts(session.verify_attempts));
        }

        if self.ipc.viewer_queue == 0 {
            return Err(ConfigError::InvalidViewerQueue(self.ipc.viewer_queue));
        }

        if let Some(root) = session.allowed_workdirs.iter().find(|p| !p.is_absolute()) {
            return Err(ConfigError::RelativeWorkdirRoot(root.display().to_string()));
        }

        // Validate default_shell path exists
        let shell_path = Path::new(&session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
            }
        } else if which::which(&session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
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
