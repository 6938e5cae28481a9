//! Packet filter and NAT through the full stack, with tables compiled
//! from config.

use super::harness::{Harness, LOCAL, REMOTE, RecordingSink, decode, udp_packet};
use netstack::stack::{ConnTrackTimeouts, IcmpError, IcmpErrorSink, TableId};
use netstack::tcpip::{FullAddress, NetworkProtocolNumber, ReadOptions, WriteOptions};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

fn bound(h: &Harness, port: u16) -> Arc<dyn netstack::stack::Endpoint> {
    let ep = h.udp_endpoint();
    ep.bind(FullAddress {
        nic: 0,
        addr: None,
        port,
    })
    .unwrap();
    ep
}

#[test]
fn test_input_drop_rule() {
    let h = Harness::new();
    h.install_tables(
        r#"
        [[iptables.rules]]
        table = "filter"
        hook = "input"
        protocol = "udp"
        dport = "5000"
        target = "drop"
        "#,
    );
    let blocked = bound(&h, 5000);
    let open = bound(&h, 5001);

    let link = &h.eth0.link;
    link.inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5000), b"a"));
    link.inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5001), b"b"));

    let mut buf = [0u8; 4];
    assert!(blocked.read(&mut buf, ReadOptions::default()).is_err());
    assert_eq!(open.read(&mut buf, ReadOptions::default()).unwrap().count, 1);
    assert_eq!(h.stack.stats().packets_delivered.get(), 1);
}

#[test]
fn test_policy_drop_with_interface_exception() {
    let h = Harness::new();
    h.install_tables(
        r#"
        [[iptables.policies]]
        table = "filter"
        hook = "input"
        verdict = "drop"

        [[iptables.rules]]
        table = "filter"
        hook = "input"
        in_interface = "!eth+"
        target = "accept"

        [[iptables.rules]]
        table = "filter"
        hook = "input"
        source = "9.9.9.0/24"
        target = "accept"
        "#,
    );
    let ep = bound(&h, 5000);
    let link = &h.eth0.link;
    let stranger = "198.51.100.7".parse().unwrap();
    link.inject(NetworkProtocolNumber::IPV4, &udp_packet((stranger, 4000), (LOCAL, 5000), b"no"));
    link.inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5000), b"yes"));

    let mut buf = [0u8; 4];
    let res = ep.read(&mut buf, ReadOptions::default()).unwrap();
    assert_eq!(&buf[..res.count], b"yes");
    assert!(ep.read(&mut buf, ReadOptions::default()).is_err());
}

#[test]
fn test_reject_rule_sends_icmp() {
    let h = Harness::new();
    let sink = Arc::new(RecordingSink::default());
    h.stack.set_icmp_error_sink(Some(sink.clone() as Arc<dyn IcmpErrorSink>));
    h.install_tables(
        r#"
        [[iptables.rules]]
        table = "filter"
        hook = "input"
        protocol = "udp"
        dport = "5000"
        target = "reject"
        reject_with = "admin-prohibited"
        "#,
    );
    let _ep = bound(&h, 5000);
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5000), b"a"));
    assert_eq!(*sink.sent.lock(), vec![(1, IcmpError::AdminProhibited)]);
}

#[test]
fn test_output_drop_is_silent() {
    let mut h = Harness::new();
    h.install_tables(
        r#"
        [[iptables.rules]]
        table = "filter"
        hook = "output"
        destination = "8.8.8.8"
        target = "drop"
        "#,
    );
    let ep = h.udp_endpoint();
    let dst = FullAddress::new("8.8.8.8".parse().unwrap(), 53);
    assert_eq!(ep.write(b"q", WriteOptions { to: Some(dst) }).unwrap(), 1);
    assert!(h.eth0.next_outbound().is_none());
}

#[test]
fn test_dnat_to_local_port_and_back() {
    let mut h = Harness::new();
    h.install_tables(
        r#"
        [[iptables.rules]]
        table = "nat"
        hook = "prerouting"
        protocol = "udp"
        dport = "6000"
        target = "dnat"
        to_address = "10.0.0.1"
        to_port = 5000
        "#,
    );
    let ep = bound(&h, 5000);
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 6000), b"nat"));

    let mut buf = [0u8; 8];
    let res = ep
        .read(&mut buf, ReadOptions {
            peek: false,
            need_remote_addr: true,
        })
        .unwrap();
    assert_eq!(&buf[..res.count], b"nat");
    let sender = res.remote_addr.unwrap();
    assert_eq!((sender.addr, sender.port), (Some(IpAddr::V4(REMOTE)), 4000));
    assert_eq!(h.stack.connections().len(), 1);

    // The answer leaves from the port the client addressed.
    ep.write(b"ack", WriteOptions { to: Some(sender) }).unwrap();
    let sent = decode(&h.eth0.next_outbound().expect("reply"));
    assert_eq!(sent.src, (LOCAL, 6000));
    assert_eq!(sent.dst, (REMOTE, 4000));
    assert_eq!(h.stack.connections().len(), 1);
}

#[test]
fn test_clear_connections_and_stats() {
    let h = Harness::new();
    h.install_tables(
        r#"
        [[iptables.rules]]
        table = "filter"
        hook = "input"
        state = "new,established"
        target = "accept"
        "#,
    );
    let _ep = bound(&h, 5000);
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5000), b"a"));
    assert_eq!(h.stack.connections().len(), 1);

    let stats = h.stack.export_stats();
    let created = stats.iter().find(|(k, _)| k == "conntrack_created").map(|(_, v)| *v);
    assert_eq!(created, Some(1));

    h.stack.clear_connections();
    assert!(h.stack.connections().is_empty());
}

#[test]
fn test_invalid_table_keeps_previous() {
    let h = Harness::new();
    let before = h.stack.table(TableId::Filter, false).rules.len();
    let mut table = h.stack.table(TableId::Filter, false);
    table.rules.clear();
    assert!(h.stack.replace_table(TableId::Filter, table, false).is_err());
    assert_eq!(h.stack.table(TableId::Filter, false).rules.len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_reaps_idle_connections() {
    let h = Harness::new();
    h.install_tables(
        r#"
        [[iptables.rules]]
        table = "filter"
        hook = "input"
        target = "accept"
        "#,
    );
    let _ep = bound(&h, 5000);
    h.eth0
        .link
        .inject(NetworkProtocolNumber::IPV4, &udp_packet((REMOTE, 4000), (LOCAL, 5000), b"a"));
    assert_eq!(h.stack.conntrack().len(), 1);

    h.clock.advance(ConnTrackTimeouts::default().udp + Duration::from_secs(1));
    let task = h.stack.spawn_maintenance(Duration::from_secs(1), usize::MAX);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.stack.conntrack().len(), 0);
    assert_eq!(h.stack.conntrack().stats().reaped.get(), 1);
    task.abort();
}
