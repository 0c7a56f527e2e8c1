//! Serial channel line settings and their compact descriptor form.
//!
//! Channels are configured with a three-character descriptor in the
//! conventional `"8N1"` notation: data bits (`5`–`8`), parity (`N`, `E`,
//! `O`, `M`, `S`), stop bits (`1` or `2`).  Invalid settings are fatal
//! only to that channel's setup; other channels proceed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while validating channel line settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid data bits: {0} (must be 5-8)")]
    InvalidDataBits(char),

    #[error("invalid parity: {0} (must be one of N, E, O, M, S)")]
    InvalidParity(char),

    #[error("invalid stop bits: {0} (must be 1 or 2)")]
    InvalidStopBits(char),

    #[error("line descriptor {0:?} must be three characters, e.g. \"8N1\"")]
    InvalidDescriptor(String),
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl TryFrom<char> for DataBits {
    type Error = SettingsError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c {
            '5' => Ok(DataBits::Five),
            '6' => Ok(DataBits::Six),
            '7' => Ok(DataBits::Seven),
            '8' => Ok(DataBits::Eight),
            other => Err(SettingsError::InvalidDataBits(other)),
        }
    }
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
    Mark,
    Space,
}

impl TryFrom<char> for Parity {
    type Error = SettingsError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c.to_ascii_uppercase() {
            'N' => Ok(Parity::None),
            'E' => Ok(Parity::Even),
            'O' => Ok(Parity::Odd),
            'M' => Ok(Parity::Mark),
            'S' => Ok(Parity::Space),
            other => Err(SettingsError::InvalidParity(other)),
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<char> for StopBits {
    type Error = SettingsError;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c {
            '1' => Ok(StopBits::One),
            '2' => Ok(StopBits::Two),
            other => Err(SettingsError::InvalidStopBits(other)),
        }
    }
}

/// Complete configuration of one serial channel.
///
/// The name doubles as the device path (`COM4`, `/dev/ttyUSB0`) and as
/// the channel identifier peers address in `TEXT`/`BINARY`/`CSV`
/// commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub name: String,
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl ChannelSettings {
    /// Builds settings from a name, baud rate, and `"8N1"`-style
    /// descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`SettingsError`] when the descriptor is not three
    /// characters or any position is invalid.
    pub fn from_descriptor(
        name: impl Into<String>,
        baud: u32,
        descriptor: &str,
    ) -> Result<Self, SettingsError> {
        let (data_bits, parity, stop_bits) = parse_line_settings(descriptor)?;
        Ok(Self {
            name: name.into(),
            baud,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

/// Parses a `"8N1"`-style descriptor into its three components.
///
/// # Errors
///
/// Returns [`SettingsError::InvalidDescriptor`] when the string is not
/// exactly three characters, or the per-position error otherwise.
pub fn parse_line_settings(
    descriptor: &str,
) -> Result<(DataBits, Parity, StopBits), SettingsError> {
    let chars: Vec<char> = descriptor.trim().chars().collect();
    if chars.len() != 3 {
        return Err(SettingsError::InvalidDescriptor(descriptor.to_string()));
    }
    Ok((
        DataBits::try_from(chars[0])?,
        Parity::try_from(chars[1])?,
        StopBits::try_from(chars[2])?,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
