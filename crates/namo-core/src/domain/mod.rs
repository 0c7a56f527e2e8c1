//! Pure domain types with no OS dependencies.

pub mod channel;

pub use channel::{parse_line_settings, ChannelSettings, DataBits, Parity, SettingsError, StopBits};
