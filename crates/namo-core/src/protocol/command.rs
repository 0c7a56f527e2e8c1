//! Newline-delimited TCP text protocol spoken between the hub and its
//! peers.
//!
//! Client → server, one command per line:
//!
//! ```text
//! HEARTBEAT
//! QUIT
//! TEXT   <channel> <key> <value…>
//! BINARY <channel> <key> <hex>
//! CSV    <channel> <key> <count>,<delayMultiplier>
//! ```
//!
//! Server → client: the welcome banner, `HEARTBEAT` probes,
//! `RECEIVED {TEXT|BINARY} <channel> <key> <payload>` publish lines
//! (BINARY payload as uppercase hex, no separators), `ERROR: …` replies,
//! and `Goodbye!` on QUIT.
//!
//! Parsing and formatting live together here so the server's hub and the
//! remote client agree on the grammar by construction.

use std::fmt;

use thiserror::Error;

use crate::protocol::codec::{Frame, FrameType};

/// Banner sent to every peer immediately after accept.
pub const WELCOME_LINE: &str = "Welcome to NAMO Serial Server!";

/// Liveness probe/response line, identical in both directions.
pub const HEARTBEAT_LINE: &str = "HEARTBEAT";

/// Farewell line sent in response to QUIT.
pub const GOODBYE_LINE: &str = "Goodbye!";

/// Marker prefix of publish lines rebroadcast to every peer.
pub const RECEIVED_PREFIX: &str = "RECEIVED";

/// Fixed frame key used for CSV-converted payloads, regardless of the
/// key supplied by the caller.
pub const CSV_FORWARD_KEY: &str = "LED_TOGGLE";

/// Errors produced while parsing a peer command line.
///
/// All of these are reported back to the offending peer as an
/// `ERROR: …` line; the session continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Invalid command format. Expected 4 tokens minimum.")]
    Format,

    #[error("Unrecognized command {0:?}. Use TEXT, BINARY, or CSV.")]
    UnknownVerb(String),

    #[error("Hex string must have an even number of characters")]
    OddHexLength,

    #[error("Invalid hex digit {0:?}")]
    InvalidHex(char),

    #[error("CSV format invalid. Expected format: toggleCount,delayMultiplier")]
    CsvFormat,

    #[error("CSV field {0} out of range (each field must fit in one byte, 0-255)")]
    CsvRange(i64),
}

/// One parsed peer command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Refreshes the peer's liveness timestamp; no other effect.
    Heartbeat,
    /// Ends the session after a farewell line.
    Quit,
    /// Forwards the raw value bytes as a TEXT frame.
    SendText {
        channel: String,
        key: String,
        value: String,
    },
    /// Forwards hex-decoded bytes as a BINARY frame.
    SendBinary {
        channel: String,
        key: String,
        payload: Vec<u8>,
    },
    /// Forwards a fixed 2-byte BINARY payload `{count, delay}` under
    /// [`CSV_FORWARD_KEY`].  The caller-supplied key is carried for
    /// round-trip formatting but is not used for the frame.
    SendCsv {
        channel: String,
        key: String,
        count: u8,
        delay_multiplier: u8,
    },
}

impl Command {
    /// Builds the frame a send command produces, or `None` for
    /// `Heartbeat`/`Quit`.
    pub fn to_frame(&self) -> Option<Frame> {
        match self {
            Command::Heartbeat | Command::Quit => None,
            Command::SendText { key, value, .. } => Some(Frame::text(key.clone(), value.clone())),
            Command::SendBinary { key, payload, .. } => {
                Some(Frame::binary(key.clone(), payload.clone()))
            }
            Command::SendCsv {
                count,
                delay_multiplier,
                ..
            } => Some(Frame::binary(CSV_FORWARD_KEY, vec![*count, *delay_multiplier])),
        }
    }

    /// Target channel of a send command, or `None` for `Heartbeat`/`Quit`.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Command::Heartbeat | Command::Quit => None,
            Command::SendText { channel, .. }
            | Command::SendBinary { channel, .. }
            | Command::SendCsv { channel, .. } => Some(channel),
        }
    }
}

impl fmt::Display for Command {
    /// Renders the client → server wire form of the command.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Heartbeat => f.write_str(HEARTBEAT_LINE),
            Command::Quit => f.write_str("QUIT"),
            Command::SendText {
                channel,
                key,
                value,
            } => write!(f, "TEXT {channel} {key} {value}"),
            Command::SendBinary {
                channel,
                key,
                payload,
            } => write!(f, "BINARY {channel} {key} {}", encode_hex(payload)),
            Command::SendCsv {
                channel,
                key,
                count,
                delay_multiplier,
            } => write!(f, "CSV {channel} {key} {count},{delay_multiplier}"),
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parses one peer line into a [`Command`].
///
/// `HEARTBEAT` matches exactly (after trimming); `QUIT` is
/// case-insensitive.  Everything else is split into at most four tokens
/// `{VERB, channel, key, value}`; the value keeps any embedded spaces.
///
/// # Errors
///
/// Returns a [`CommandError`] describing the first problem found; the
/// caller reports it to the peer and continues.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line == HEARTBEAT_LINE {
        return Ok(Command::Heartbeat);
    }
    if line.eq_ignore_ascii_case("QUIT") {
        return Ok(Command::Quit);
    }

    let mut tokens = line.splitn(4, ' ');
    let verb = tokens.next().unwrap_or_default();
    let channel = tokens.next().unwrap_or_default();
    let key = tokens.next().unwrap_or_default();
    let value = tokens.next().unwrap_or_default();
    if verb.is_empty() || channel.is_empty() || key.is_empty() || value.is_empty() {
        return Err(CommandError::Format);
    }

    match verb.to_ascii_uppercase().as_str() {
        "TEXT" => Ok(Command::SendText {
            channel: channel.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }),
        "BINARY" => Ok(Command::SendBinary {
            channel: channel.to_string(),
            key: key.to_string(),
            payload: decode_hex(value)?,
        }),
        "CSV" => {
            let (count, delay_multiplier) = parse_csv_pair(value)?;
            Ok(Command::SendCsv {
                channel: channel.to_string(),
                key: key.to_string(),
                count,
                delay_multiplier,
            })
        }
        _ => Err(CommandError::UnknownVerb(verb.to_string())),
    }
}

/// Parses the CSV value `"count,delayMultiplier"` into two bytes.
///
/// Values outside `0..=255` are rejected with [`CommandError::CsvRange`]
/// rather than silently truncated.
fn parse_csv_pair(value: &str) -> Result<(u8, u8), CommandError> {
    let mut parts = value.split(',');
    let count = parse_csv_byte(parts.next())?;
    let delay = parse_csv_byte(parts.next())?;
    Ok((count, delay))
}

fn parse_csv_byte(part: Option<&str>) -> Result<u8, CommandError> {
    let n: i64 = part
        .ok_or(CommandError::CsvFormat)?
        .trim()
        .parse()
        .map_err(|_| CommandError::CsvFormat)?;
    u8::try_from(n).map_err(|_| CommandError::CsvRange(n))
}

// ── Hex helpers ───────────────────────────────────────────────────────────────

/// Decodes a hex string into bytes.  Whitespace is ignored; an odd number
/// of digits or a non-hex character is an error.
pub fn decode_hex(hex: &str) -> Result<Vec<u8>, CommandError> {
    let compact: Vec<char> = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err(CommandError::OddHexLength);
    }
    let mut bytes = Vec::with_capacity(compact.len() / 2);
    for pair in compact.chunks(2) {
        let hi = pair[0]
            .to_digit(16)
            .ok_or(CommandError::InvalidHex(pair[0]))?;
        let lo = pair[1]
            .to_digit(16)
            .ok_or(CommandError::InvalidHex(pair[1]))?;
        bytes.push(((hi << 4) | lo) as u8);
    }
    Ok(bytes)
}

/// Encodes bytes as uppercase hex with no separators.
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

// ── Server line formatting ────────────────────────────────────────────────────

/// Formats the publish line rebroadcast to every peer for one inbound
/// frame.
pub fn format_received(channel: &str, frame: &Frame) -> String {
    match frame.frame_type {
        FrameType::Text => format!(
            "{RECEIVED_PREFIX} TEXT {channel} {} {}",
            frame.key,
            String::from_utf8_lossy(&frame.value)
        ),
        FrameType::Binary => format!(
            "{RECEIVED_PREFIX} BINARY {channel} {} {}",
            frame.key,
            encode_hex(&frame.value)
        ),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
