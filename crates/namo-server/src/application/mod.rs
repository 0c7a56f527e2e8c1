//! Application layer: the bridge between serial links and TCP peers.

pub mod bridge;

pub use bridge::{Bridge, BridgeError};
