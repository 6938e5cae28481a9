//! Forwarding between two NICs, with and without source NAT.

use super::harness::{Harness, REMOTE, RecordingSink, add_nic, decode, udp_packet};
use netstack::stack::{IcmpError, IcmpErrorSink, RouteEntry};
use netstack::tcpip::{NetworkProtocolNumber, Subnet};
use std::net::Ipv4Addr;
use std::sync::Arc;

const LAN_HOST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const LAN_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

fn make_router() -> (Harness, super::harness::Nic) {
    let h = Harness::with_options(|opts| opts.forwarding = true);
    let eth1 = add_nic(&h.stack, 2, "eth1", "192.168.1.1/24");
    h.stack.add_route(RouteEntry {
        destination: Subnet::parse("192.168.1.0/24").unwrap(),
        gateway: None,
        nic: 2,
    });
    (h, eth1)
}

#[test]
fn test_forward_decrements_ttl() {
    let (h, mut eth1) = make_router();
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LAN_HOST, 53), b"fwd"));

    let out = eth1.next_outbound().expect("forwarded frame");
    assert_eq!(out.route.nic, 2);
    assert_eq!(out.route.next_hop, None);
    let sent = decode(&out);
    assert_eq!(sent.src, (REMOTE, 4000));
    assert_eq!(sent.dst, (LAN_HOST, 53));
    assert_eq!(sent.ttl, 63);
    assert_eq!(sent.payload, b"fwd");
    assert_eq!(h.stack.stats().packets_forwarded.get(), 1);
}

#[test]
fn test_not_forwarded_when_disabled() {
    let (h, mut eth1) = make_router();
    h.stack.set_forwarding(false);
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LAN_HOST, 53), b"x"));
    assert!(eth1.next_outbound().is_none());
    assert_eq!(h.stack.stats().packets_forwarded.get(), 0);
}

#[test]
fn test_forward_drop_rule() {
    let (h, mut eth1) = make_router();
    h.install_tables(
        r#"
        [[iptables.rules]]
        table = "filter"
        hook = "forward"
        out_interface = "eth1"
        protocol = "udp"
        dport = "1-1023"
        target = "drop"
        "#,
    );
    let link = &h.eth0.link;
    link.inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LAN_HOST, 53), b"x"));
    link.inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LAN_HOST, 8053), b"y"));

    let sent = decode(&eth1.next_outbound().expect("high port passes"));
    assert_eq!(sent.dst, (LAN_HOST, 8053));
    assert!(eth1.next_outbound().is_none());
}

#[test]
fn test_masquerade_rewrites_source() {
    let (h, mut eth1) = make_router();
    h.install_tables(
        r#"
        [[iptables.rules]]
        table = "nat"
        hook = "postrouting"
        out_interface = "eth1"
        target = "masquerade"
        "#,
    );
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LAN_HOST, 53), b"m"));

    let sent = decode(&eth1.next_outbound().expect("frame"));
    assert_eq!(sent.src.0, LAN_ADDR);
    assert_eq!(sent.dst, (LAN_HOST, 53));
    assert_eq!(h.stack.connections().len(), 1);
}

#[test]
fn test_expired_ttl_not_forwarded() {
    let (h, mut eth1) = make_router();
    let mut pkt = udp_packet((REMOTE, 4000), (LAN_HOST, 53), b"x");
    // TTL 1, with the header checksum patched by hand.
    pkt[8] = 1;
    pkt[10..12].fill(0);
    let sum = netstack::protocol::checksum::checksum(&pkt[..20]);
    pkt[10..12].copy_from_slice(&sum.to_be_bytes());

    h.eth0.link.inject(NetworkProtocolNumber::IPV4, &pkt);
    assert!(eth1.next_outbound().is_none());
}

#[test]
fn test_unroutable_gets_net_unreachable() {
    let (h, _eth1) = make_router();
    h.stack.remove_routes(|r| r.gateway.is_some());
    let sink = Arc::new(RecordingSink::default());
    h.stack.set_icmp_error_sink(Some(sink.clone() as Arc<dyn IcmpErrorSink>));

    let elsewhere = Ipv4Addr::new(203, 0, 113, 9);
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (elsewhere, 53), b"x"));
    assert_eq!(*sink.sent.lock(), vec![(1, IcmpError::NetUnreachable)]);
}
