//! Interfaces between the stack and the protocols, endpoints and links
//! plugged into it.
//!
//! The stack never looks at protocol header fields itself. Everything it
//! needs from a header (addresses, ports, next protocol) goes through the
//! [`NetworkProtocol`] and [`TransportProtocol`] registered for that
//! protocol number.

use super::conntrack::TupleId;
use super::packet_buffer::{HeaderType, PacketBuffer};
use super::route::Route;
use super::Stack;
use crate::tcpip::{
    FullAddress, LinkAddress, NetworkProtocolNumber, NicId, ReadOptions, ReadResult,
    SocketOptions, TransportProtocolNumber, WriteOptions,
};
use crate::waiter::{EventMask, Queue};
use crate::{Error, Result};
use bitflags::bitflags;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

/// Identity of a transport endpoint as seen from the local side.
///
/// `None` addresses and zero ports are wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransportEndpointId {
    pub local_port: u16,
    pub local_address: Option<IpAddr>,
    pub remote_port: u16,
    pub remote_address: Option<IpAddr>,
}

/// What a network protocol found while parsing an incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedNetwork {
    pub transport: TransportProtocolNumber,
    /// False for fragments that do not start at offset zero.
    pub has_transport_header: bool,
}

/// Fields a network protocol needs to build its header.
#[derive(Debug, Clone, Copy)]
pub struct NetworkHeaderParams {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: TransportProtocolNumber,
    pub ttl: u8,
    pub tos: u8,
}

/// Protocol-level tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOption {
    DefaultTtl(u8),
    /// Whether outgoing datagrams carry a checksum.
    SendChecksum(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolOptionName {
    DefaultTtl,
    SendChecksum,
}

/// A network-layer protocol.
pub trait NetworkProtocol: Send + Sync {
    fn number(&self) -> NetworkProtocolNumber;

    fn minimum_packet_size(&self) -> usize;

    /// Length of the header this protocol writes.
    fn max_header_length(&self) -> usize;

    fn default_prefix_len(&self) -> u8;

    /// Source and destination addresses of a network header.
    fn parse_addresses(&self, hdr: &[u8]) -> Option<(IpAddr, IpAddr)>;

    /// Consume the network header of an incoming packet and trim link
    /// padding. Returns `None` for malformed packets.
    fn parse(&self, pkt: &mut PacketBuffer) -> Option<ParsedNetwork>;

    /// Push a network header in front of the transport header.
    fn write_header(&self, pkt: &mut PacketBuffer, params: &NetworkHeaderParams) -> Result<()>;

    /// Replace the source and/or destination address, fixing up the
    /// header checksum.
    fn rewrite_addresses(
        &self,
        pkt: &mut PacketBuffer,
        src: Option<IpAddr>,
        dst: Option<IpAddr>,
    ) -> Result<()>;

    /// Update a packet about to be forwarded (TTL, hop limit). Returns
    /// false when it must be dropped instead.
    fn prepare_forward(&self, _pkt: &mut PacketBuffer) -> bool {
        true
    }

    fn set_option(&self, _opt: ProtocolOption) -> Result<()> {
        Err(Error::UnknownProtocolOption)
    }

    fn option(&self, _name: ProtocolOptionName) -> Result<ProtocolOption> {
        Err(Error::UnknownProtocolOption)
    }
}

/// What a transport protocol did with a packet nobody was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownDestinationDisposition {
    /// The packet was malformed.
    Malformed,
    /// Not handled; the stack answers with an ICMP port unreachable.
    Unhandled,
    /// Handled by the protocol (for example with a reset).
    Handled,
}

/// A transport-layer protocol.
pub trait TransportProtocol: Send + Sync {
    fn number(&self) -> TransportProtocolNumber;

    fn minimum_packet_size(&self) -> usize;

    /// Source and destination ports of a transport header.
    fn parse_ports(&self, hdr: &[u8]) -> Option<(u16, u16)>;

    /// Consume the transport header. Returns false when malformed.
    fn parse(&self, pkt: &mut PacketBuffer) -> bool;

    /// Create a socket-level endpoint.
    fn new_endpoint(
        &self,
        stack: &Arc<Stack>,
        network: NetworkProtocolNumber,
    ) -> Result<Arc<dyn Endpoint>>;

    fn handle_unknown_destination_packet(
        &self,
        id: &TransportEndpointId,
        pkt: &PacketBuffer,
    ) -> UnknownDestinationDisposition;

    /// Replace ports and recompute the checksum over the addresses now in
    /// the network header.
    fn rewrite_ports(
        &self,
        pkt: &mut PacketBuffer,
        addrs: (IpAddr, IpAddr),
        src_port: Option<u16>,
        dst_port: Option<u16>,
    ) -> Result<()>;

    fn set_option(&self, _opt: ProtocolOption) -> Result<()> {
        Err(Error::UnknownProtocolOption)
    }

    fn option(&self, _name: ProtocolOptionName) -> Result<ProtocolOption> {
        Err(Error::UnknownProtocolOption)
    }
}

/// Receiving side of an endpoint registered with the demuxer.
pub trait TransportEndpoint: Send + Sync {
    fn unique_id(&self) -> u64;

    fn handle_packet(&self, id: &TransportEndpointId, pkt: PacketBuffer);
}

/// An endpoint receiving every packet of one transport protocol.
pub trait RawTransportEndpoint: Send + Sync {
    fn unique_id(&self) -> u64;

    fn handle_packet(&self, pkt: PacketBuffer);
}

/// Socket-level endpoint API.
pub trait Endpoint: Send + Sync {
    fn bind(&self, addr: FullAddress) -> Result<()>;

    fn connect(&self, addr: FullAddress) -> Result<()>;

    /// Copy the next message into `dst`. Fails with `WouldBlock` when
    /// nothing is queued.
    fn read(&self, dst: &mut [u8], opts: ReadOptions) -> Result<ReadResult>;

    fn write(&self, data: &[u8], opts: WriteOptions) -> Result<usize>;

    fn close(&self);

    fn local_address(&self) -> Result<FullAddress>;

    fn remote_address(&self) -> Result<FullAddress>;

    /// The subset of `mask` that is ready now.
    fn readiness(&self, mask: EventMask) -> EventMask;

    fn waiter_queue(&self) -> &Queue;

    fn socket_options(&self) -> &SocketOptions;
}

bitflags! {
    /// What a link endpoint can do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LinkCapabilities: u32 {
        const LOOPBACK = 1 << 0;
        /// Outgoing packets need a resolved neighbor link address.
        const RESOLUTION_REQUIRED = 1 << 1;
    }
}

/// Receives inbound frames from a link endpoint.
pub trait NetworkDispatcher: Send + Sync {
    fn deliver_network_packet(
        &self,
        nic: NicId,
        remote: LinkAddress,
        protocol: NetworkProtocolNumber,
        pkt: PacketBuffer,
    );
}

/// A link-layer device.
pub trait LinkEndpoint: Send + Sync {
    fn mtu(&self) -> u32;

    /// Header space the link needs in front of a network header.
    fn max_header_length(&self) -> usize;

    fn link_address(&self) -> LinkAddress;

    fn capabilities(&self) -> LinkCapabilities;

    /// Hook the link up to the stack. Inbound frames go to `dispatcher`.
    fn attach(&self, nic: NicId, dispatcher: Weak<dyn NetworkDispatcher>);

    fn write_packet(
        &self,
        route: &Route,
        protocol: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) -> Result<()>;
}

/// Sends neighbor probes (ARP requests, neighbor solicitations).
pub trait LinkAddressResolver: Send + Sync {
    fn link_address_protocol(&self) -> NetworkProtocolNumber;

    fn link_address_request(
        &self,
        target: IpAddr,
        local: IpAddr,
        nic: NicId,
        link: &dyn LinkEndpoint,
    ) -> Result<()>;

    /// Addresses that map to a link address without asking (broadcast,
    /// multicast).
    fn resolve_static(&self, addr: IpAddr) -> Option<LinkAddress>;
}

/// ICMP errors the stack may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    NetUnreachable,
    HostUnreachable,
    ProtocolUnreachable,
    PortUnreachable,
    AdminProhibited,
}

/// Builds and sends ICMP errors on the stack's behalf.
pub trait IcmpErrorSink: Send + Sync {
    fn send_icmp_error(&self, nic: NicId, err: IcmpError, pkt: &PacketBuffer) -> Result<()>;
}

/// Protocol number to plug-in lookup.
#[derive(Clone, Default)]
pub struct Protocols {
    network: HashMap<NetworkProtocolNumber, Arc<dyn NetworkProtocol>>,
    transport: HashMap<TransportProtocolNumber, Arc<dyn TransportProtocol>>,
}

impl Protocols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(mut self, proto: Arc<dyn NetworkProtocol>) -> Self {
        self.network.insert(proto.number(), proto);
        self
    }

    pub fn with_transport(mut self, proto: Arc<dyn TransportProtocol>) -> Self {
        self.transport.insert(proto.number(), proto);
        self
    }

    pub fn network(&self, number: NetworkProtocolNumber) -> Option<&Arc<dyn NetworkProtocol>> {
        self.network.get(&number)
    }

    pub fn transport(
        &self,
        number: TransportProtocolNumber,
    ) -> Option<&Arc<dyn TransportProtocol>> {
        self.transport.get(&number)
    }

    pub fn network_numbers(&self) -> impl Iterator<Item = NetworkProtocolNumber> + '_ {
        self.network.keys().copied()
    }

    pub fn transport_numbers(&self) -> impl Iterator<Item = TransportProtocolNumber> + '_ {
        self.transport.keys().copied()
    }

    /// Source and destination addresses of a packet whose network header
    /// has been parsed or pushed.
    pub fn addresses(&self, pkt: &PacketBuffer) -> Option<(IpAddr, IpAddr)> {
        let proto = self.network(pkt.network_protocol_number)?;
        let hdr = pkt.header(HeaderType::Network)?;
        proto.parse_addresses(&hdr)
    }

    /// Source and destination ports, if the transport protocol has them.
    pub fn ports(&self, pkt: &PacketBuffer) -> Option<(u16, u16)> {
        let proto = self.transport(pkt.transport_protocol_number?)?;
        let hdr = pkt.header(HeaderType::Transport)?;
        proto.parse_ports(&hdr)
    }

    /// Endpoint id of an incoming packet: the destination is local.
    pub fn endpoint_id(&self, pkt: &PacketBuffer) -> Option<TransportEndpointId> {
        let (src, dst) = self.addresses(pkt)?;
        let (src_port, dst_port) = self.ports(pkt)?;
        Some(TransportEndpointId {
            local_port: dst_port,
            local_address: Some(dst),
            remote_port: src_port,
            remote_address: Some(src),
        })
    }

    /// Conntrack tuple of a packet as it currently reads.
    pub fn packet_tuple(&self, pkt: &PacketBuffer) -> Option<TupleId> {
        let (src_addr, dst_addr) = self.addresses(pkt)?;
        let (src_port, dst_port) = self.ports(pkt)?;
        Some(TupleId {
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            network: pkt.network_protocol_number,
            transport: pkt.transport_protocol_number?,
        })
    }
}

impl fmt::Debug for Protocols {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocols")
            .field("network", &self.network.keys().collect::<Vec<_>>())
            .field("transport", &self.transport.keys().collect::<Vec<_>>())
            .finish()
    }
}
