//! Identifiers and value types shared by every layer of the stack.
//!
//! Nothing in here owns state; these are the nouns the rest of the crate
//! passes around (NIC ids, protocol numbers, addresses, read results).

mod clock;
mod socketops;
mod subnet;

pub use clock::{Clock, ManualClock, StdClock};
pub use socketops::{SocketFlags, SocketOptions};
pub use subnet::Subnet;

use crate::{Error, Result};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// NIC identifier. Zero means "any NIC" wherever a binding is accepted.
pub type NicId = u32;

/// Wildcard NIC id.
pub const ANY_NIC: NicId = 0;

/// Network-layer protocol number (an EtherType).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkProtocolNumber(pub u16);

impl NetworkProtocolNumber {
    pub const IPV4: Self = Self(0x0800);
    pub const ARP: Self = Self(0x0806);
    pub const IPV6: Self = Self(0x86dd);
}

impl fmt::Display for NetworkProtocolNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::IPV4 => write!(f, "ipv4"),
            Self::ARP => write!(f, "arp"),
            Self::IPV6 => write!(f, "ipv6"),
            Self(n) => write!(f, "0x{:04x}", n),
        }
    }
}

/// Transport-layer protocol number (IP protocol field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportProtocolNumber(pub u8);

impl TransportProtocolNumber {
    pub const ICMP: Self = Self(1);
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
    pub const ICMPV6: Self = Self(58);

    /// Parses a protocol name or a decimal protocol number.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Some(Self::ICMP),
            "tcp" => Some(Self::TCP),
            "udp" => Some(Self::UDP),
            "icmpv6" => Some(Self::ICMPV6),
            other => other.parse().ok().map(Self),
        }
    }
}

impl fmt::Display for TransportProtocolNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ICMP => write!(f, "icmp"),
            Self::TCP => write!(f, "tcp"),
            Self::UDP => write!(f, "udp"),
            Self::ICMPV6 => write!(f, "icmpv6"),
            Self(n) => write!(f, "{}", n),
        }
    }
}

/// How a received frame was addressed at the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketType {
    #[default]
    Host,
    OtherHost,
    Outgoing,
    Broadcast,
    Multicast,
}

/// Link-layer (MAC) address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LinkAddress(pub [u8; 6]);

impl LinkAddress {
    pub const BROADCAST: LinkAddress = LinkAddress([0xff; 6]);
    pub const ZERO: LinkAddress = LinkAddress([0; 6]);
}

impl fmt::Debug for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Display for LinkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for LinkAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(Error::Parse(format!("invalid link address: {}", s)));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Parse(format!("invalid link address: {}", s)))?;
        }
        Ok(LinkAddress(bytes))
    }
}

/// A transport address: NIC, IP address and port.
///
/// `addr == None` is the unspecified (wildcard) address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FullAddress {
    pub nic: NicId,
    pub addr: Option<IpAddr>,
    pub port: u16,
}

impl FullAddress {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            nic: ANY_NIC,
            addr: Some(addr),
            port,
        }
    }
}

/// An address assigned to a NIC together with its on-link prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressWithPrefix {
    pub address: IpAddr,
    pub prefix_len: u8,
}

impl AddressWithPrefix {
    pub fn new(address: IpAddr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// The on-link subnet this address belongs to.
    pub fn subnet(&self) -> Subnet {
        Subnet::new(self.address, self.prefix_len)
    }
}

impl FromStr for AddressWithPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| Error::Parse(format!("missing prefix length: {}", s)))?;
        let address: IpAddr = addr
            .parse()
            .map_err(|_| Error::Parse(format!("invalid IP: {}", addr)))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| Error::Parse(format!("invalid prefix: {}", prefix)))?;
        let max = if address.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(Error::Parse(format!("prefix too long: {}", s)));
        }
        Ok(Self::new(address, prefix_len))
    }
}

/// Reports whether `addr` must be fanned out to every matching endpoint.
pub fn is_multicast_or_broadcast(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(a) => a.is_multicast() || a.is_broadcast(),
        IpAddr::V6(a) => a.is_multicast(),
    }
}

/// Options accepted by `Endpoint::read`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Leave the datagram queued after copying it out.
    pub peek: bool,
    /// Fill in `ReadResult::remote_addr`.
    pub need_remote_addr: bool,
}

/// Outcome of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadResult {
    /// Bytes copied to the destination.
    pub count: usize,
    /// Bytes available in the message, possibly more than `count`.
    pub total: usize,
    pub remote_addr: Option<FullAddress>,
}

/// Options accepted by `Endpoint::write`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Destination for unconnected endpoints.
    pub to: Option<FullAddress>,
}
