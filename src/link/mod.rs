//! Link endpoints.

pub mod channel;

pub use channel::{ChannelEndpoint, OutboundPacket};
