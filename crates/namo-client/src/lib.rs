//! # namo-client
//!
//! Reconnecting TCP client for the NAMO serial bridge.
//!
//! The client mirrors the server's liveness protocol from the other end
//! of the socket: it drains an outbound command queue, answers and sends
//! `HEARTBEAT` probes, delivers `RECEIVED …` publish lines to the caller,
//! and reconnects with exponential backoff when the connection or the
//! heartbeat exchange fails.

pub mod connection;

pub use connection::{ClientConfig, ClientEvent, RemoteClient};
