//! Protocol plug-ins: IPv4 and UDP, plus the checksum helpers they share.

pub mod checksum;
pub mod ipv4;
pub mod udp;
pub mod udp_endpoint;

pub use ipv4::Ipv4Protocol;
pub use udp::UdpProtocol;
pub use udp_endpoint::UdpEndpoint;
