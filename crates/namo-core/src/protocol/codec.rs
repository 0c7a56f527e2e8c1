//! Binary codec for encoding and decoding serial wire frames.
//!
//! Wire format:
//! ```text
//! [key_len:4][value_len:4][key:key_len][value:value_len][type:1]
//! ```
//! Header size: 8 bytes.  Both length fields are big-endian `u32`.  The
//! trailing type tag is `0` for TEXT and `1` for BINARY.
//!
//! The decoder operates on a byte slice and reports how many bytes one
//! complete frame consumed, so a streaming caller can accumulate reads in a
//! buffer, decode frames off the front, and treat
//! [`CodecError::InsufficientData`] as "wait for more bytes".

use thiserror::Error;

/// Size of the fixed frame header: two big-endian `u32` length fields.
pub const HEADER_SIZE: usize = 8;

/// Largest key this (host) endpoint will encode or accept.
pub const MAX_KEY_LEN: usize = 1024;

/// Largest value this (host) endpoint will encode or accept.
pub const MAX_VALUE_LEN: usize = 4096;

/// Key limit enforced by the embedded endpoint on the far side of a link.
///
/// The effective cross-link limit is the smaller of the two endpoints;
/// a frame within the host limits but above these is silently dropped by
/// the firmware, not rejected here.
pub const EMBEDDED_MAX_KEY_LEN: usize = 256;

/// Value limit enforced by the embedded endpoint.  See
/// [`EMBEDDED_MAX_KEY_LEN`].
pub const EMBEDDED_MAX_VALUE_LEN: usize = 2048;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A key or value exceeds the configured limit.  Raised by the encoder
    /// before any bytes are produced.
    #[error("{what} length {len} exceeds limit {limit}")]
    SizeExceeded {
        what: &'static str,
        len: usize,
        limit: usize,
    },

    /// The byte slice does not yet hold one complete frame.  Not a fault:
    /// the caller should read more bytes and retry.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The frame is structurally invalid (zero or over-limit length field,
    /// unknown type tag, non-UTF-8 key).  The caller should discard its
    /// buffered bytes and wait for the next frame boundary.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Payload interpretation carried in the trailing type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Text = 0,
    Binary = 1,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Text),
            1 => Ok(FrameType::Binary),
            other => Err(other),
        }
    }
}

/// One length-prefixed, type-tagged message unit on the serial wire.
///
/// Frames are ephemeral: created by a sender, encoded, decoded on the far
/// side, and consumed.  The key names the message; the value carries the
/// payload bytes (UTF-8 text for [`FrameType::Text`], raw bytes for
/// [`FrameType::Binary`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub key: String,
    pub value: Vec<u8>,
    pub frame_type: FrameType,
}

impl Frame {
    /// Builds a TEXT frame from a string value.
    pub fn text(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into().into_bytes(),
            frame_type: FrameType::Text,
        }
    }

    /// Builds a BINARY frame from raw payload bytes.
    pub fn binary(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            frame_type: FrameType::Binary,
        }
    }
}

/// Per-endpoint size limits applied on both encode and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_key_len: usize,
    pub max_value_len: usize,
}

impl FrameLimits {
    /// Limits of the embedded endpoint (the stricter side of a link).
    pub fn embedded() -> Self {
        Self {
            max_key_len: EMBEDDED_MAX_KEY_LEN,
            max_value_len: EMBEDDED_MAX_VALUE_LEN,
        }
    }
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_key_len: MAX_KEY_LEN,
            max_value_len: MAX_VALUE_LEN,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into its wire representation.
///
/// Produces `8 + key.len() + value.len() + 1` bytes.  Keys and values must
/// be non-empty and within `limits`; violations are rejected before any
/// bytes are produced.
///
/// # Errors
///
/// Returns [`CodecError::SizeExceeded`] for an over-limit key or value and
/// [`CodecError::Malformed`] for an empty key or value.
///
/// # Examples
///
/// ```rust
/// use namo_core::{decode_frame, encode_frame, Frame, FrameLimits};
///
/// let frame = Frame::text("greeting", "hello");
/// let bytes = encode_frame(&frame, &FrameLimits::default()).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes, &FrameLimits::default()).unwrap();
/// assert_eq!(decoded, frame);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(frame: &Frame, limits: &FrameLimits) -> Result<Vec<u8>, CodecError> {
    let key = frame.key.as_bytes();
    if key.is_empty() {
        return Err(CodecError::Malformed("key must not be empty".to_string()));
    }
    if frame.value.is_empty() {
        return Err(CodecError::Malformed("value must not be empty".to_string()));
    }
    if key.len() > limits.max_key_len {
        return Err(CodecError::SizeExceeded {
            what: "key",
            len: key.len(),
            limit: limits.max_key_len,
        });
    }
    if frame.value.len() > limits.max_value_len {
        return Err(CodecError::SizeExceeded {
            what: "value",
            len: frame.value.len(),
            limit: limits.max_value_len,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + frame.value.len() + 1);
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(frame.value.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&frame.value);
    buf.push(frame.frame_type as u8);
    Ok(buf)
}

/// Decodes one [`Frame`] from the beginning of `bytes`.
///
/// Returns the decoded frame and the total number of bytes consumed
/// (header + key + value + type tag), so the caller can advance its read
/// cursor.
///
/// # Errors
///
/// Returns [`CodecError::InsufficientData`] when the slice does not yet
/// hold a complete frame, and [`CodecError::Malformed`] when a length
/// field is zero or over-limit, the type tag is unknown, or the key is not
/// valid UTF-8.
pub fn decode_frame(bytes: &[u8], limits: &FrameLimits) -> Result<(Frame, usize), CodecError> {
    if bytes.len() < HEADER_SIZE {
        return Err(CodecError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let key_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let value_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;

    if key_len == 0 || key_len > limits.max_key_len {
        return Err(CodecError::Malformed(format!(
            "invalid header: key_len={key_len} (limit {})",
            limits.max_key_len
        )));
    }
    if value_len == 0 || value_len > limits.max_value_len {
        return Err(CodecError::Malformed(format!(
            "invalid header: value_len={value_len} (limit {})",
            limits.max_value_len
        )));
    }

    let total = HEADER_SIZE + key_len + value_len + 1;
    if bytes.len() < total {
        return Err(CodecError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }

    let key = std::str::from_utf8(&bytes[HEADER_SIZE..HEADER_SIZE + key_len])
        .map_err(|e| CodecError::Malformed(format!("key is not valid UTF-8: {e}")))?
        .to_string();
    let value = bytes[HEADER_SIZE + key_len..HEADER_SIZE + key_len + value_len].to_vec();
    let tag = bytes[total - 1];
    let frame_type = FrameType::try_from(tag)
        .map_err(|b| CodecError::Malformed(format!("unknown frame type tag: {b}")))?;

    Ok((
        Frame {
            key,
            value,
            frame_type,
        },
        total,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
