//! Domain layer: server configuration schema.

pub mod config;

pub use config::{load_config, ChannelEntry, ConfigError, ServerConfig, TimingConfig};
