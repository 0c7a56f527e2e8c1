//! # namo-core
//!
//! Shared library for the NAMO serial bridge containing the wire frame
//! codec, the TCP text-command grammar, and serial channel domain types.
//!
//! This crate is used by both the server and client applications.  It has
//! zero dependencies on OS APIs, serial ports, or network sockets.
//!
//! # Architecture overview
//!
//! The bridge multiplexes one or more physical serial links into a
//! length-prefixed binary message protocol and exposes the resulting
//! message stream to many simultaneous TCP clients.  This crate defines
//! the two wire contracts both sides must agree on:
//!
//! - **`protocol::codec`** – How bytes travel over the serial links.
//!   Messages are encoded into a compact binary frame (8-byte header +
//!   key + value + type tag) and decoded back into typed Rust structs on
//!   the other end.
//!
//! - **`protocol::command`** – How TCP peers talk to the server.  A
//!   newline-delimited text protocol: `TEXT`/`BINARY`/`CSV` send commands,
//!   `HEARTBEAT` liveness probes, and `RECEIVED …` publish lines.
//!
//! - **`domain`** – Pure domain types with no OS dependencies: serial
//!   line settings (data bits, parity, stop bits) and their compact
//!   `"8N1"`-style descriptor parser.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `namo_core::Frame` instead of `namo_core::protocol::codec::Frame`.
pub use domain::channel::{
    parse_line_settings, ChannelSettings, DataBits, Parity, SettingsError, StopBits,
};
pub use protocol::codec::{decode_frame, encode_frame, CodecError, Frame, FrameLimits, FrameType};
pub use protocol::command::{parse_command, Command, CommandError};
