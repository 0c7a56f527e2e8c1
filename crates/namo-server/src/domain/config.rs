//! TOML-based configuration for the server.
//!
//! The config file names the TCP listen address, protocol timing, frame
//! size limits, and the set of serial channels:
//!
//! ```toml
//! listen_addr = "0.0.0.0:9000"
//!
//! [timing]
//! heartbeat_interval_ms = 2000
//! peer_timeout_ms = 9000
//!
//! [[channels]]
//! name = "/dev/ttyUSB0"
//! baud = 115200
//! line = "8N1"
//! ```
//!
//! Fields annotated with `#[serde(default = "…")]` fall back to the
//! documented defaults when absent, so a minimal file (or none at all)
//! still yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use namo_core::protocol::codec::{FrameLimits, MAX_KEY_LEN, MAX_VALUE_LEN};
use namo_core::{ChannelSettings, SettingsError};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// TCP address the hub listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Protocol timing constants.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Frame size limits enforced by this endpoint.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Serial channels to open at startup.
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

/// Protocol timing constants, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Period of the heartbeat sweep over TCP peers.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence threshold after which a TCP peer is evicted.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    /// Delay between serial reconnection attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Stall window for a partially received serial frame.
    #[serde(default = "default_read_stall_ms")]
    pub read_stall_ms: u64,
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn read_stall(&self) -> Duration {
        Duration::from_millis(self.read_stall_ms)
    }
}

/// Frame size limits enforced by this endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    #[serde(default = "default_max_key_len")]
    pub max_key_len: usize,
    #[serde(default = "default_max_value_len")]
    pub max_value_len: usize,
}

impl LimitsConfig {
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_key_len: self.max_key_len,
            max_value_len: self.max_value_len,
        }
    }
}

/// One configured serial channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelEntry {
    /// Device path, also used as the channel name peers address.
    pub name: String,
    /// Baud rate.
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Compact line descriptor: data bits, parity, stop bits (`"8N1"`).
    #[serde(default = "default_line")]
    pub line: String,
}

impl ChannelEntry {
    /// Validates the entry into domain [`ChannelSettings`].
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] when the line descriptor is invalid;
    /// fatal only to this channel; other channels proceed.
    pub fn settings(&self) -> Result<ChannelSettings, SettingsError> {
        ChannelSettings::from_descriptor(self.name.clone(), self.baud, &self.line)
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_listen_addr() -> String {
    "0.0.0.0:9000".to_string()
}
fn default_heartbeat_interval_ms() -> u64 {
    2000
}
fn default_peer_timeout_ms() -> u64 {
    9000
}
fn default_reconnect_delay_ms() -> u64 {
    300
}
fn default_read_stall_ms() -> u64 {
    1000
}
fn default_max_key_len() -> usize {
    MAX_KEY_LEN
}
fn default_max_value_len() -> usize {
    MAX_VALUE_LEN
}
fn default_baud() -> u32 {
    9600
}
fn default_line() -> String {
    "8N1".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timing: TimingConfig::default(),
            limits: LimitsConfig::default(),
            channels: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            read_stall_ms: default_read_stall_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_len: default_max_key_len(),
            max_value_len: default_max_value_len(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Loads a [`ServerConfig`] from `path`, returning `ServerConfig::default()`
/// if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than
/// "not found", and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: ServerConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
