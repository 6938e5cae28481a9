//! UDP delivery, sockets and ICMP errors.

use super::harness::{GATEWAY, Harness, LOCAL, REMOTE, RecordingSink, decode, udp_packet};
use netstack::Error;
use netstack::stack::{IcmpError, IcmpErrorSink};
use netstack::tcpip::{FullAddress, NetworkProtocolNumber, ReadOptions, WriteOptions};
use netstack::waiter::{Entry, EventMask};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

fn any_port(port: u16) -> FullAddress {
    FullAddress {
        nic: 0,
        addr: None,
        port,
    }
}

fn to(addr: Ipv4Addr, port: u16) -> WriteOptions {
    WriteOptions {
        to: Some(FullAddress::new(IpAddr::V4(addr), port)),
    }
}

fn with_sender() -> ReadOptions {
    ReadOptions {
        peek: false,
        need_remote_addr: true,
    }
}

#[test]
fn test_datagram_delivered_to_bound_endpoint() {
    let h = Harness::new();
    let ep = h.udp_endpoint();
    ep.bind(any_port(5000)).unwrap();

    let pkt = udp_packet((REMOTE, 4000), (LOCAL, 5000), b"hello");
    assert!(h.eth0.link.inject(NetworkProtocolNumber::IPV4, &pkt));

    let mut buf = [0u8; 64];
    let res = ep.read(&mut buf, with_sender()).unwrap();
    assert_eq!(res.count, 5);
    assert_eq!(&buf[..res.count], b"hello");
    assert_eq!(res.remote_addr, Some(FullAddress {
        nic: 1,
        addr: Some(IpAddr::V4(REMOTE)),
        port: 4000,
    }));
    assert_eq!(h.stack.stats().packets_delivered.get(), 1);
    assert!(matches!(ep.read(&mut buf, ReadOptions::default()), Err(Error::WouldBlock)));
}

#[test]
fn test_peek_and_truncated_read() {
    let h = Harness::new();
    let ep = h.udp_endpoint();
    ep.bind(any_port(5000)).unwrap();
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5000), b"abcdef"));

    let mut small = [0u8; 3];
    let peeked = ep
        .read(&mut small, ReadOptions {
            peek: true,
            need_remote_addr: false,
        })
        .unwrap();
    assert_eq!((peeked.count, peeked.total), (3, 6));
    assert_eq!(&small, b"abc");

    let mut buf = [0u8; 16];
    let res = ep.read(&mut buf, ReadOptions::default()).unwrap();
    assert_eq!(&buf[..res.count], b"abcdef");
    assert!(ep.read(&mut buf, ReadOptions::default()).is_err());
}

#[test]
fn test_corrupt_checksum_dropped() {
    let h = Harness::new();
    let ep = h.udp_endpoint();
    ep.bind(any_port(5000)).unwrap();

    let mut pkt = udp_packet((REMOTE, 4000), (LOCAL, 5000), b"hello");
    // Flip a payload byte; the IPv4 header checksum stays valid.
    let last = pkt.len() - 1;
    pkt[last] ^= 0xff;
    h.eth0.link.inject(NetworkProtocolNumber::IPV4, &pkt);

    let mut buf = [0u8; 16];
    assert!(matches!(ep.read(&mut buf, ReadOptions::default()), Err(Error::WouldBlock)));
}

#[test]
fn test_unknown_port_sends_icmp_error() {
    let h = Harness::new();
    let sink = Arc::new(RecordingSink::default());
    h.stack.set_icmp_error_sink(Some(sink.clone() as Arc<dyn IcmpErrorSink>));

    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 7777), b"x"));

    assert_eq!(*sink.sent.lock(), vec![(1, IcmpError::PortUnreachable)]);
    assert_eq!(h.stack.stats().unknown_port_received.get(), 1);
    assert_eq!(h.stack.stats().icmp_errors_sent.get(), 1);
}

#[test]
fn test_icmp_errors_rate_limited() {
    let h = Harness::new();
    let sink = Arc::new(RecordingSink::default());
    h.stack.set_icmp_error_sink(Some(sink.clone() as Arc<dyn IcmpErrorSink>));
    h.stack.set_icmp_rate_limit(1.0, 2);
    assert_eq!(h.stack.icmp_rate_limit(), (1.0, 2));

    for _ in 0..3 {
        h.eth0
            .link
            .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 7777), b"x"));
    }
    assert_eq!(sink.sent.lock().len(), 2);
    assert_eq!(h.stack.stats().icmp_rate_limited.get(), 1);
}

#[test]
fn test_broadcast_destination_gets_no_icmp_error() {
    let h = Harness::new();
    let sink = Arc::new(RecordingSink::default());
    h.stack.set_icmp_error_sink(Some(sink.clone() as Arc<dyn IcmpErrorSink>));

    let bcast = Ipv4Addr::new(255, 255, 255, 255);
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (bcast, 7777), b"x"));
    assert!(sink.sent.lock().is_empty());
}

#[test]
fn test_reuse_address_delivers_to_most_recent() {
    let h = Harness::new();
    let first = h.udp_endpoint();
    let second = h.udp_endpoint();
    for ep in [&first, &second] {
        ep.socket_options().set_reuse_address(true);
        ep.bind(any_port(5000)).unwrap();
    }

    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5000), b"hi"));

    let mut buf = [0u8; 8];
    assert!(first.read(&mut buf, ReadOptions::default()).is_err());
    assert_eq!(second.read(&mut buf, ReadOptions::default()).unwrap().count, 2);
}

#[test]
fn test_port_in_use_without_reuse() {
    let h = Harness::new();
    let first = h.udp_endpoint();
    first.bind(any_port(5000)).unwrap();
    let second = h.udp_endpoint();
    assert!(matches!(second.bind(any_port(5000)), Err(Error::AddressInUse)));

    // Closing releases the port.
    first.close();
    let third = h.udp_endpoint();
    third.bind(any_port(5000)).unwrap();
}

#[test]
fn test_bind_rejects_foreign_address() {
    let h = Harness::new();
    let ep = h.udp_endpoint();
    let foreign = FullAddress::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 5000);
    assert!(matches!(ep.bind(foreign), Err(Error::BadLocalAddress)));
    ep.bind(any_port(5000)).unwrap();
    assert!(matches!(ep.bind(any_port(5001)), Err(Error::InvalidEndpointState)));
}

#[test]
fn test_write_goes_out_via_gateway() {
    let mut h = Harness::new();
    let ep = h.udp_endpoint();
    ep.bind(any_port(5000)).unwrap();
    assert_eq!(ep.write(b"query", to(Ipv4Addr::new(8, 8, 8, 8), 53)).unwrap(), 5);

    let out = h.eth0.next_outbound().expect("frame");
    assert_eq!(out.route.next_hop, Some(IpAddr::V4(GATEWAY)));
    assert_eq!(out.protocol, NetworkProtocolNumber::IPV4);
    let sent = decode(&out);
    assert_eq!(sent.src, (LOCAL, 5000));
    assert_eq!(sent.dst, (Ipv4Addr::new(8, 8, 8, 8), 53));
    assert_eq!(sent.ttl, 64);
    assert_eq!(sent.payload, b"query");
    assert_eq!(h.stack.stats().packets_sent.get(), 1);
}

#[test]
fn test_unconnected_write_needs_destination() {
    let h = Harness::new();
    let ep = h.udp_endpoint();
    assert!(matches!(ep.write(b"x", WriteOptions::default()), Err(Error::DestinationRequired)));
}

#[test]
fn test_connect_binds_implicitly() {
    let mut h = Harness::new();
    let ep = h.udp_endpoint();
    ep.connect(FullAddress::new(IpAddr::V4(REMOTE), 4000)).unwrap();

    let local = ep.local_address().unwrap();
    assert_eq!(local.addr, Some(IpAddr::V4(LOCAL)));
    assert_ne!(local.port, 0);
    assert_eq!(ep.remote_address().unwrap().port, 4000);

    ep.write(b"ping", WriteOptions::default()).unwrap();
    let sent = decode(&h.eth0.next_outbound().expect("frame"));
    assert_eq!(sent.src, (LOCAL, local.port));
    assert_eq!(sent.dst, (REMOTE, 4000));

    // Only the connected peer gets through.
    h.eth0.link.inject(
        NetworkProtocolNumber::IPV4,
        &udp_packet((Ipv4Addr::new(9, 9, 9, 8), 4000), (LOCAL, local.port), b"other"),
    );
    h.eth0.link.inject(
        NetworkProtocolNumber::IPV4,
        &udp_packet((REMOTE, 4000), (LOCAL, local.port), b"pong"),
    );
    let mut buf = [0u8; 8];
    let res = ep.read(&mut buf, ReadOptions::default()).unwrap();
    assert_eq!(&buf[..res.count], b"pong");
    assert!(ep.read(&mut buf, ReadOptions::default()).is_err());
}

#[test]
fn test_no_route() {
    let h = Harness::new();
    h.stack.remove_routes(|_| true);
    let ep = h.udp_endpoint();
    let res = ep.write(b"x", to(Ipv4Addr::new(8, 8, 8, 8), 53));
    assert!(matches!(res, Err(Error::NoRoute)));
    assert_eq!(h.stack.stats().no_route.get(), 1);
}

#[test]
fn test_loopback_between_endpoints() {
    let mut h = Harness::new();
    let server = h.udp_endpoint();
    server.bind(any_port(5000)).unwrap();
    let client = h.udp_endpoint();
    client.write(b"local", to(LOCAL, 5000)).unwrap();

    assert!(h.eth0.next_outbound().is_none());
    assert_eq!(h.stack.stats().packets_looped.get(), 1);

    let mut buf = [0u8; 8];
    let res = server.read(&mut buf, with_sender()).unwrap();
    assert_eq!(&buf[..res.count], b"local");
    let sender = res.remote_addr.unwrap();
    assert_eq!(sender.addr, Some(IpAddr::V4(LOCAL)));
    assert_eq!(sender.port, client.local_address().unwrap().port);
}

#[test]
fn test_close_reports_hangup() {
    let h = Harness::new();
    let ep = h.udp_endpoint();
    ep.bind(any_port(5000)).unwrap();
    assert_eq!(ep.readiness(EventMask::READABLE | EventMask::WRITABLE), EventMask::WRITABLE);

    ep.close();
    let mut buf = [0u8; 8];
    assert!(matches!(ep.read(&mut buf, ReadOptions::default()), Err(Error::ClosedForReceive)));
    assert!(matches!(ep.write(b"x", to(REMOTE, 1)), Err(Error::ClosedForSend)));
    assert_eq!(ep.readiness(EventMask::READABLE | EventMask::WRITABLE), EventMask::READABLE);
}

#[tokio::test]
async fn test_arrival_wakes_waiter() {
    let h = Harness::new();
    let ep = h.udp_endpoint();
    ep.bind(any_port(5000)).unwrap();
    let (mut entry, notify) = Entry::with_notify();
    ep.waiter_queue().event_register(&mut entry, EventMask::READABLE);

    let link = h.eth0.link.clone();
    tokio::spawn(async move {
        link.inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5000), b"wake"));
    });

    let woke = tokio::time::timeout(Duration::from_secs(1), notify.notified()).await;
    assert!(woke.is_ok());
    assert_eq!(ep.readiness(EventMask::READABLE), EventMask::READABLE);
    ep.waiter_queue().event_unregister(&mut entry);
}
