//! Bridge: the channel registry and message fan-out.
//!
//! The bridge owns the map of serial channels by name.  The map is built
//! from static configuration at startup and passed through constructors;
//! there is no ambient global registry.  Outbound sends look up the named
//! channel (or fan out to all of them); inbound frames from every link
//! fan out to subscribers through a broadcast channel.
//!
//! # Fan-out semantics
//!
//! `subscribe()` hands out an independent receiver per subscriber.
//! Delivery is at-most-once with no cross-subscriber ordering guarantee:
//! a subscriber that falls behind loses the oldest messages rather than
//! stalling the producing read pump.  Within a single channel, frames are
//! published in the order they came off the wire.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use namo_core::Frame;

use crate::infrastructure::link::{
    spawn_link, InboundMessage, LinkConfig, LinkHandle, LinkState, LinkTransport,
};

/// Messages buffered per subscriber before the oldest are dropped.
const FANOUT_CAPACITY: usize = 256;

/// Error type for bridge send operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The named channel is not configured.  Reported to the caller,
    /// never fatal.
    #[error("Port {0} not found.")]
    ChannelNotFound(String),
}

/// The bridge between serial links and everything else.
pub struct Bridge {
    links: HashMap<String, LinkHandle>,
    link_config: LinkConfig,
    inbound_tx: broadcast::Sender<InboundMessage>,
}

impl Bridge {
    /// Creates an empty bridge; channels are added during startup.
    pub fn new(link_config: LinkConfig) -> Self {
        let (inbound_tx, _) = broadcast::channel(FANOUT_CAPACITY);
        Self {
            links: HashMap::new(),
            link_config,
            inbound_tx,
        }
    }

    /// Registers a channel and spawns its link session.
    ///
    /// Idempotent per name: re-adding an existing name is a no-op and the
    /// existing session is not replaced.
    pub fn add_channel(&mut self, name: impl Into<String>, transport: Arc<dyn LinkTransport>) {
        let name = name.into();
        if self.links.contains_key(&name) {
            debug!("channel {name} already registered; ignoring");
            return;
        }
        info!("adding channel {name}");
        let handle = spawn_link(
            name.clone(),
            transport,
            self.link_config.clone(),
            self.inbound_tx.clone(),
        );
        self.links.insert(name, handle);
    }

    /// Returns a fresh subscription to the inbound message stream.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound_tx.subscribe()
    }

    /// Enqueues a frame on the named channel.
    ///
    /// Queueing never blocks and succeeds regardless of the channel's
    /// connection state.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ChannelNotFound`] when no such channel is
    /// configured.
    pub fn send(&self, channel: &str, frame: Frame) -> Result<(), BridgeError> {
        match self.links.get(channel) {
            Some(link) => {
                link.enqueue(frame);
                Ok(())
            }
            None => Err(BridgeError::ChannelNotFound(channel.to_string())),
        }
    }

    /// Enqueues a copy of the frame on every configured channel.
    pub fn broadcast(&self, frame: Frame) {
        for link in self.links.values() {
            link.enqueue(frame.clone());
        }
    }

    /// Read-only connection state of a channel, if configured.
    pub fn channel_state(&self, channel: &str) -> Option<LinkState> {
        self.links.get(channel).map(|link| link.state())
    }

    /// Names of all configured channels.
    pub fn channel_names(&self) -> Vec<&str> {
        self.links.keys().map(String::as_str).collect()
    }

    /// Stops every link session, force-closing open transports.
    pub fn shutdown(&self) {
        for link in self.links.values() {
            link.shutdown();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
