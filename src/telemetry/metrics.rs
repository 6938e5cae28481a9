//! Packet processing counters.
//!
//! Global counters live on [`StackStats`]; per-NIC counters are registered
//! by name when the NIC is created.

use crate::stack::iptables_types::{Hook, NUM_HOOKS};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-NIC statistics.
#[derive(Debug, Default)]
pub struct InterfaceStats {
    /// Number of packets received.
    pub rx_packets: Counter,
    /// Number of bytes received.
    pub rx_bytes: Counter,
    /// Number of packets transmitted.
    pub tx_packets: Counter,
    /// Number of bytes transmitted.
    pub tx_bytes: Counter,
    /// Number of receive drops.
    pub rx_drops: Counter,
    /// Number of transmit errors.
    pub tx_errors: Counter,
}

impl InterfaceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a received packet.
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.inc();
        self.rx_bytes.add(bytes as u64);
    }

    /// Records a transmitted packet.
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.inc();
        self.tx_bytes.add(bytes as u64);
    }

    pub fn record_rx_drop(&self) {
        self.rx_drops.inc();
    }

    pub fn record_tx_error(&self) {
        self.tx_errors.inc();
    }
}

/// Stack-wide counters.
#[derive(Debug, Default)]
pub struct StackStats {
    interfaces: RwLock<HashMap<String, Arc<InterfaceStats>>>,

    // Ingress
    /// Packets handed to the stack by a link.
    pub packets_received: Counter,
    /// Packets whose network or transport header failed to parse.
    pub malformed_received: Counter,
    /// Packets for a network or transport protocol nobody registered.
    pub unknown_protocol_received: Counter,
    /// Packets handed to a transport endpoint.
    pub packets_delivered: Counter,
    /// Packets for a port with no endpoint.
    pub unknown_port_received: Counter,

    // Egress
    /// Packets written to a link.
    pub packets_sent: Counter,
    /// Packets the link refused.
    pub send_errors: Counter,
    /// Packets looped back to the stack.
    pub packets_looped: Counter,
    /// Packets with no route.
    pub no_route: Counter,
    /// Packets forwarded between NICs.
    pub packets_forwarded: Counter,

    // Filtering
    /// Packets accepted by the tables, per hook.
    pub filter_accepted: [Counter; NUM_HOOKS],
    /// Packets dropped by the tables, per hook.
    pub filter_dropped: [Counter; NUM_HOOKS],

    // ICMP
    /// ICMP errors sent.
    pub icmp_errors_sent: Counter,
    /// ICMP errors suppressed by the rate limiter.
    pub icmp_rate_limited: Counter,

    // Neighbors
    /// Packets parked waiting for link address resolution.
    pub neighbor_queued: Counter,
    /// Packets dropped because resolution queues were full or timed out.
    pub neighbor_dropped: Counter,
}

impl StackStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a NIC for statistics tracking and returns its counters.
    pub fn register_interface(&self, name: &str) -> Arc<InterfaceStats> {
        self.interfaces
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn unregister_interface(&self, name: &str) {
        self.interfaces.write().remove(name);
    }

    pub fn interface(&self, name: &str) -> Option<Arc<InterfaceStats>> {
        self.interfaces.read().get(name).cloned()
    }

    /// Counts a filter verdict for `hook`.
    pub fn record_verdict(&self, hook: Hook, accepted: bool) {
        if accepted {
            self.filter_accepted[hook as usize].inc();
        } else {
            self.filter_dropped[hook as usize].inc();
        }
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("packets_received".into(), self.packets_received.get()),
            ("malformed_received".into(), self.malformed_received.get()),
            (
                "unknown_protocol_received".into(),
                self.unknown_protocol_received.get(),
            ),
            ("packets_delivered".into(), self.packets_delivered.get()),
            ("unknown_port_received".into(), self.unknown_port_received.get()),
            ("packets_sent".into(), self.packets_sent.get()),
            ("send_errors".into(), self.send_errors.get()),
            ("packets_looped".into(), self.packets_looped.get()),
            ("no_route".into(), self.no_route.get()),
            ("packets_forwarded".into(), self.packets_forwarded.get()),
            ("icmp_errors_sent".into(), self.icmp_errors_sent.get()),
            ("icmp_rate_limited".into(), self.icmp_rate_limited.get()),
            ("neighbor_queued".into(), self.neighbor_queued.get()),
            ("neighbor_dropped".into(), self.neighbor_dropped.get()),
        ];

        for hook in Hook::ALL {
            let i = hook as usize;
            result.push((format!("filter_{}_accepted", hook), self.filter_accepted[i].get()));
            result.push((format!("filter_{}_dropped", hook), self.filter_dropped[i].get()));
        }

        let interfaces = self.interfaces.read();
        let mut names: Vec<_> = interfaces.keys().collect();
        names.sort();
        for name in names {
            let stats = &interfaces[name];
            result.extend([
                (format!("{}_rx_packets", name), stats.rx_packets.get()),
                (format!("{}_rx_bytes", name), stats.rx_bytes.get()),
                (format!("{}_tx_packets", name), stats.tx_packets.get()),
                (format!("{}_tx_bytes", name), stats.tx_bytes.get()),
                (format!("{}_rx_drops", name), stats.rx_drops.get()),
                (format!("{}_tx_errors", name), stats.tx_errors.get()),
            ]);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.add(10);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_interface_stats() {
        let stats = InterfaceStats::new();

        stats.record_rx(100);
        stats.record_rx(200);
        stats.record_tx(150);

        assert_eq!(stats.rx_packets.get(), 2);
        assert_eq!(stats.rx_bytes.get(), 300);
        assert_eq!(stats.tx_packets.get(), 1);
        assert_eq!(stats.tx_bytes.get(), 150);
    }

    #[test]
    fn test_stack_stats_export() {
        let stats = StackStats::new();

        let eth0 = stats.register_interface("eth0");
        eth0.record_rx(100);
        stats.register_interface("eth0").record_tx(200);

        stats.packets_forwarded.inc();
        stats.record_verdict(Hook::Input, false);
        stats.record_verdict(Hook::Input, true);
        stats.record_verdict(Hook::Input, true);

        let metrics = stats.export();
        assert!(metrics.contains(&("packets_forwarded".into(), 1)));
        assert!(metrics.contains(&("filter_input_dropped".into(), 1)));
        assert!(metrics.contains(&("filter_input_accepted".into(), 2)));
        assert!(metrics.contains(&("eth0_rx_bytes".into(), 100)));
        assert!(metrics.contains(&("eth0_tx_packets".into(), 1)));

        stats.unregister_interface("eth0");
        assert!(stats.interface("eth0").is_none());
    }
}
