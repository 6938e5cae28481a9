//! Test harness: a stack with IPv4 and UDP on channel-backed NICs.

use netstack::config;
use netstack::link::{ChannelEndpoint, OutboundPacket};
use netstack::protocol::ipv4::{Ipv4Builder, Ipv4Header};
use netstack::protocol::udp::{UdpBuilder, UdpHeader};
use netstack::protocol::{Ipv4Protocol, UdpProtocol};
use netstack::stack::{
    Endpoint, IcmpError, IcmpErrorSink, LinkCapabilities, NicOptions, PacketBuffer, Protocols,
    RouteEntry, Stack, StackOptions,
};
use netstack::tcpip::{
    LinkAddress, ManualClock, NetworkProtocolNumber, NicId, Subnet, TransportProtocolNumber,
};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 254);
pub const REMOTE: Ipv4Addr = Ipv4Addr::new(9, 9, 9, 9);

pub struct Nic {
    pub link: Arc<ChannelEndpoint>,
    pub outbound: mpsc::Receiver<OutboundPacket>,
}

impl Nic {
    /// Next frame the stack wrote to this link, if any.
    pub fn next_outbound(&mut self) -> Option<OutboundPacket> {
        self.outbound.try_recv().ok()
    }
}

pub struct Harness {
    pub stack: Arc<Stack>,
    pub clock: Arc<ManualClock>,
    /// NIC 1, `eth0`, 10.0.0.1/24 with a default route via 10.0.0.254.
    pub eth0: Nic,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    pub fn with_options(f: impl FnOnce(&mut StackOptions)) -> Self {
        let clock = Arc::new(ManualClock::new());
        let mut opts = StackOptions {
            protocols: Protocols::new()
                .with_network(Arc::new(Ipv4Protocol::new()))
                .with_transport(Arc::new(UdpProtocol::new())),
            clock: clock.clone(),
            seed: 1,
            ..Default::default()
        };
        f(&mut opts);
        let stack = Stack::new(opts).expect("stack");
        let eth0 = add_nic(&stack, 1, "eth0", "10.0.0.1/24");
        stack.add_route(RouteEntry {
            destination: Subnet::parse("0.0.0.0/0").unwrap(),
            gateway: Some(IpAddr::V4(GATEWAY)),
            nic: 1,
        });
        Self { stack, clock, eth0 }
    }

    /// Install tables compiled from an `[iptables]` TOML snippet.
    pub fn install_tables(&self, toml: &str) {
        let cfg = config::parse(toml).expect("config");
        for (id, table) in config::build_tables(&cfg.iptables).expect("tables") {
            self.stack.replace_table(id, table, false).expect("replace");
        }
    }

    pub fn udp_endpoint(&self) -> Arc<dyn Endpoint> {
        self.stack
            .new_endpoint(TransportProtocolNumber::UDP, NetworkProtocolNumber::IPV4)
            .expect("endpoint")
    }
}

pub fn add_nic(stack: &Arc<Stack>, id: NicId, name: &str, addr: &str) -> Nic {
    let mac = LinkAddress([0x02, 0, 0, 0, 0, id as u8]);
    let (link, outbound) = ChannelEndpoint::new(16, 1500, mac, LinkCapabilities::empty());
    let link = Arc::new(link.with_pool(Arc::clone(stack.pool())));
    stack
        .create_nic(
            id,
            link.clone(),
            NicOptions {
                name: Some(name.to_string()),
                disabled: false,
            },
        )
        .expect("create nic");
    stack.add_address(id, addr.parse().unwrap()).expect("address");
    Nic { link, outbound }
}

/// An IPv4 datagram carrying UDP with valid checksums.
pub fn udp_packet(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
    let dgram = UdpBuilder::new()
        .src_port(src.1)
        .dst_port(dst.1)
        .payload(payload)
        .build(IpAddr::V4(src.0), IpAddr::V4(dst.0));
    Ipv4Builder::new()
        .src_addr(src.0)
        .dst_addr(dst.0)
        .protocol(TransportProtocolNumber::UDP)
        .payload(&dgram)
        .build()
}

/// Decoded view of an outbound frame.
#[derive(Debug, PartialEq, Eq)]
pub struct Sent {
    pub src: (Ipv4Addr, u16),
    pub dst: (Ipv4Addr, u16),
    pub ttl: u8,
    pub payload: Vec<u8>,
}

pub fn decode(pkt: &OutboundPacket) -> Sent {
    let ip = Ipv4Header::parse(&pkt.data).expect("ipv4 header");
    assert!(ip.validate_checksum());
    let udp = UdpHeader::parse(&pkt.data[ip.header_len()..]).expect("udp header");
    Sent {
        src: (ip.src_addr(), udp.src_port()),
        dst: (ip.dst_addr(), udp.dst_port()),
        ttl: ip.ttl(),
        payload: udp.payload().to_vec(),
    }
}

/// Collects the ICMP errors the stack asks for.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<(NicId, IcmpError)>>,
}

impl IcmpErrorSink for RecordingSink {
    fn send_icmp_error(&self, nic: NicId, err: IcmpError, _: &PacketBuffer) -> netstack::Result<()> {
        self.sent.lock().push((nic, err));
        Ok(())
    }
}
