//! Infrastructure layer: serial link sessions, the serial transport, and
//! the TCP hub.

pub mod link;
pub mod serial;
pub mod tcp_hub;

pub use link::{spawn_link, InboundMessage, LinkConfig, LinkHandle, LinkState, LinkTransport};
pub use serial::SerialLinkTransport;
pub use tcp_hub::{HubConfig, TcpHub};
