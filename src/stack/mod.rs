//! The network stack core: packet buffers, NICs, routing, the transport
//! demuxer, connection tracking and the packet filter.

pub mod conntrack;
pub mod icmp_rate_limit;
pub mod iptables;
pub mod iptables_matchers;
pub mod iptables_targets;
pub mod iptables_types;
pub mod neighbor;
pub mod netstack;
pub mod nic;
pub mod packet_buffer;
pub mod registration;
pub mod route;
pub mod transport_demuxer;

pub use conntrack::{ConnInfo, ConnTrack, ConnTrackConfig, ConnTrackTimeouts, TupleId};
pub use icmp_rate_limit::IcmpRateLimiter;
pub use iptables::IpTables;
pub use iptables_types::{Hook, Rule, Table, TableBuilder, TableId};
pub use neighbor::{NeighborEntry, NeighborState, NudConfig};
pub use netstack::{Stack, StackOptions, TransportHandler};
pub use nic::{NicInfo, NicOptions};
pub use packet_buffer::{HeaderType, PacketBuffer, PacketBufferList, PacketBufferOptions};
pub use registration::{
    Endpoint, IcmpError, IcmpErrorSink, LinkAddressResolver, LinkCapabilities, LinkEndpoint,
    NetworkDispatcher, NetworkProtocol, ProtocolOption, ProtocolOptionName, Protocols,
    TransportEndpoint, TransportEndpointId, TransportProtocol,
};
pub use route::{Route, RouteEntry};
