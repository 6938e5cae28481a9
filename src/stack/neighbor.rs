//! Per-NIC neighbor cache (IP to link address) with a queue for packets
//! waiting on resolution.

use super::packet_buffer::PacketBuffer;
use super::route::Route;
use crate::tcpip::{Clock, LinkAddress, NetworkProtocolNumber};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Neighbor entry state (RFC 4861 Section 7.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    /// Address resolution in progress
    Incomplete,
    /// Recently confirmed reachability
    Reachable,
    /// Reachability is unknown, usable until confirmed again
    Stale,
    /// Configured by hand; never ages
    Static,
}

/// Neighbor cache entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub addr: IpAddr,
    pub link_addr: LinkAddress,
    pub state: NeighborState,
    pub updated_at: Instant,
}

/// Timers and limits of the cache.
#[derive(Debug, Clone)]
pub struct NudConfig {
    /// How long a confirmation keeps an entry reachable.
    pub reachable_time: Duration,
    /// Packets queued per unresolved address.
    pub max_pending_per_addr: usize,
    /// Queued packets older than this are dropped.
    pub max_pending_age: Duration,
}

impl Default for NudConfig {
    fn default() -> Self {
        Self {
            reachable_time: Duration::from_secs(30),
            max_pending_per_addr: 3,
            max_pending_age: Duration::from_secs(60),
        }
    }
}

/// A packet parked until its next hop resolves.
#[derive(Debug)]
pub struct PendingPacket {
    pub route: Route,
    pub protocol: NetworkProtocolNumber,
    pub pkt: PacketBuffer,
    queued_at: Instant,
}

/// Outcome of [`NeighborCache::resolve_or_queue`].
#[derive(Debug)]
pub enum Resolution {
    /// Send now.
    Resolved(LinkAddress, PacketBuffer),
    /// Parked. `probe` is set when a neighbor probe should go out.
    Queued { probe: bool },
    /// The per-address queue is full; the packet was dropped.
    QueueFull,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<IpAddr, NeighborEntry>,
    pending: HashMap<IpAddr, Vec<PendingPacket>>,
}

impl CacheInner {
    fn age(&mut self, addr: &IpAddr, now: Instant, reachable_time: Duration) {
        if let Some(e) = self.entries.get_mut(addr) {
            if e.state == NeighborState::Reachable
                && now.saturating_duration_since(e.updated_at) > reachable_time
            {
                e.state = NeighborState::Stale;
            }
        }
    }

    fn take_pending(&mut self, addr: &IpAddr, link: LinkAddress) -> Vec<PendingPacket> {
        let mut out = self.pending.remove(addr).unwrap_or_default();
        for p in &mut out {
            p.route.remote_link_address = Some(link);
        }
        out
    }
}

#[derive(Debug)]
pub struct NeighborCache {
    clock: Arc<dyn Clock>,
    config: NudConfig,
    inner: Mutex<CacheInner>,
}

impl NeighborCache {
    pub fn new(config: NudConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Current entry for `addr`, with reachability aged.
    pub fn entry(&self, addr: &IpAddr) -> Option<NeighborEntry> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.age(addr, now, self.config.reachable_time);
        inner.entries.get(addr).cloned()
    }

    pub fn entries(&self) -> Vec<NeighborEntry> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let addrs: Vec<IpAddr> = inner.entries.keys().copied().collect();
        for addr in &addrs {
            inner.age(addr, now, self.config.reachable_time);
        }
        inner.entries.values().cloned().collect()
    }

    pub fn add_static_entry(&self, addr: IpAddr, link_addr: LinkAddress) -> Vec<PendingPacket> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.entries.insert(
            addr,
            NeighborEntry {
                addr,
                link_addr,
                state: NeighborState::Static,
                updated_at: now,
            },
        );
        inner.take_pending(&addr, link_addr)
    }

    pub fn remove_entry(&self, addr: &IpAddr) -> bool {
        let mut inner = self.inner.lock();
        inner.pending.remove(addr);
        inner.entries.remove(addr).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.pending.clear();
    }

    /// Return the link address of `route`'s next hop, or park `pkt` until
    /// it is known.
    pub fn resolve_or_queue(
        &self,
        route: Route,
        protocol: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) -> Resolution {
        let addr = route.next_hop_address();
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.age(&addr, now, self.config.reachable_time);

        let probe = match inner.entries.get(&addr) {
            Some(e) if e.state != NeighborState::Incomplete => {
                return Resolution::Resolved(e.link_addr, pkt);
            }
            Some(_) => false,
            None => {
                inner.entries.insert(
                    addr,
                    NeighborEntry {
                        addr,
                        link_addr: LinkAddress::ZERO,
                        state: NeighborState::Incomplete,
                        updated_at: now,
                    },
                );
                true
            }
        };

        let max = self.config.max_pending_per_addr;
        let queue = inner.pending.entry(addr).or_default();
        if queue.len() >= max {
            debug!(%addr, "neighbor queue full, dropping packet");
            return Resolution::QueueFull;
        }
        queue.push(PendingPacket {
            route,
            protocol,
            pkt,
            queued_at: now,
        });
        trace!(%addr, queued = queue.len(), "packet waiting for neighbor");
        Resolution::Queued { probe }
    }

    /// A neighbor announced itself (ARP request, neighbor solicitation).
    /// The entry becomes stale unless the link address is unchanged and
    /// still reachable. Returns packets that can now be sent.
    pub fn handle_probe(&self, addr: IpAddr, link_addr: LinkAddress) -> Vec<PendingPacket> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let keep = inner.entries.get(&addr).is_some_and(|e| {
            e.link_addr == link_addr
                && matches!(e.state, NeighborState::Reachable | NeighborState::Static)
        });
        if !keep {
            inner.entries.insert(
                addr,
                NeighborEntry {
                    addr,
                    link_addr,
                    state: NeighborState::Stale,
                    updated_at: now,
                },
            );
        }
        inner.take_pending(&addr, link_addr)
    }

    /// A neighbor answered one of our probes. Unknown addresses are
    /// ignored. Returns packets that can now be sent.
    pub fn handle_confirmation(&self, addr: IpAddr, link_addr: LinkAddress) -> Vec<PendingPacket> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&addr) else {
            return Vec::new();
        };
        if entry.state != NeighborState::Static {
            entry.link_addr = link_addr;
            entry.state = NeighborState::Reachable;
            entry.updated_at = now;
        }
        inner.take_pending(&addr, link_addr)
    }

    /// Drop queued packets older than the configured age. Returns how many
    /// were dropped.
    pub fn expire_pending(&self) -> usize {
        let now = self.clock.now();
        let max_age = self.config.max_pending_age;
        let mut inner = self.inner.lock();
        let mut dropped = 0;
        for queue in inner.pending.values_mut() {
            let before = queue.len();
            queue.retain(|p| now.saturating_duration_since(p.queued_at) < max_age);
            dropped += before - queue.len();
        }
        inner.pending.retain(|_, v| !v.is_empty());
        dropped
    }

    /// Number of packets waiting on `addr`.
    pub fn pending_count(&self, addr: &IpAddr) -> usize {
        self.inner.lock().pending.get(addr).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcpip::ManualClock;

    fn make_cache() -> (NeighborCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (NeighborCache::new(NudConfig::default(), clock.clone()), clock)
    }

    fn make_route(remote: &str) -> Route {
        Route {
            nic: 1,
            net_proto: NetworkProtocolNumber::IPV4,
            local_address: "192.168.1.1".parse().unwrap(),
            remote_address: remote.parse().unwrap(),
            next_hop: None,
            local_link_address: LinkAddress([2, 0, 0, 0, 0, 1]),
            remote_link_address: None,
            loopback: false,
        }
    }

    fn mac(last: u8) -> LinkAddress {
        LinkAddress([0x00, 0x11, 0x22, 0x33, 0x44, last])
    }

    fn make_pkt() -> PacketBuffer {
        PacketBuffer::from_bytes(b"frame")
    }

    #[test]
    fn test_first_miss_probes_then_queues() {
        let (cache, _) = make_cache();
        let ip: IpAddr = "192.168.1.2".parse().unwrap();

        let r = cache.resolve_or_queue(make_route("192.168.1.2"), NetworkProtocolNumber::IPV4, make_pkt());
        assert!(matches!(r, Resolution::Queued { probe: true }));
        let r = cache.resolve_or_queue(make_route("192.168.1.2"), NetworkProtocolNumber::IPV4, make_pkt());
        assert!(matches!(r, Resolution::Queued { probe: false }));
        assert_eq!(cache.pending_count(&ip), 2);
        assert_eq!(cache.entry(&ip).unwrap().state, NeighborState::Incomplete);
    }

    #[test]
    fn test_queue_bounded() {
        let (cache, _) = make_cache();
        for _ in 0..3 {
            cache.resolve_or_queue(make_route("192.168.1.2"), NetworkProtocolNumber::IPV4, make_pkt());
        }
        let r = cache.resolve_or_queue(make_route("192.168.1.2"), NetworkProtocolNumber::IPV4, make_pkt());
        assert!(matches!(r, Resolution::QueueFull));
    }

    #[test]
    fn test_confirmation_flushes_queue() {
        let (cache, _) = make_cache();
        let ip: IpAddr = "192.168.1.2".parse().unwrap();
        cache.resolve_or_queue(make_route("192.168.1.2"), NetworkProtocolNumber::IPV4, make_pkt());

        let flushed = cache.handle_confirmation(ip, mac(0x55));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].route.remote_link_address, Some(mac(0x55)));
        assert_eq!(cache.pending_count(&ip), 0);

        let entry = cache.entry(&ip).unwrap();
        assert_eq!(entry.state, NeighborState::Reachable);
        match cache.resolve_or_queue(make_route("192.168.1.2"), NetworkProtocolNumber::IPV4, make_pkt()) {
            Resolution::Resolved(link, _) => assert_eq!(link, mac(0x55)),
            other => panic!("expected resolved, got {:?}", other),
        }
    }

    #[test]
    fn test_unsolicited_confirmation_ignored() {
        let (cache, _) = make_cache();
        let ip: IpAddr = "192.168.1.9".parse().unwrap();
        assert!(cache.handle_confirmation(ip, mac(1)).is_empty());
        assert!(cache.entry(&ip).is_none());
    }

    #[test]
    fn test_probe_learns_stale() {
        let (cache, _) = make_cache();
        let ip: IpAddr = "192.168.1.3".parse().unwrap();
        cache.handle_probe(ip, mac(3));
        assert_eq!(cache.entry(&ip).unwrap().state, NeighborState::Stale);

        cache.handle_confirmation(ip, mac(3));
        cache.handle_probe(ip, mac(3));
        assert_eq!(cache.entry(&ip).unwrap().state, NeighborState::Reachable);

        cache.handle_probe(ip, mac(4));
        let entry = cache.entry(&ip).unwrap();
        assert_eq!(entry.state, NeighborState::Stale);
        assert_eq!(entry.link_addr, mac(4));
    }

    #[test]
    fn test_reachable_ages_to_stale() {
        let (cache, clock) = make_cache();
        let ip: IpAddr = "192.168.1.2".parse().unwrap();
        cache.resolve_or_queue(make_route("192.168.1.2"), NetworkProtocolNumber::IPV4, make_pkt());
        cache.handle_confirmation(ip, mac(2));

        clock.advance(Duration::from_secs(31));
        assert_eq!(cache.entry(&ip).unwrap().state, NeighborState::Stale);
    }

    #[test]
    fn test_static_entry_never_ages() {
        let (cache, clock) = make_cache();
        let ip: IpAddr = "192.168.1.254".parse().unwrap();
        cache.add_static_entry(ip, mac(0xfe));
        clock.advance(Duration::from_secs(3600));
        assert_eq!(cache.entry(&ip).unwrap().state, NeighborState::Static);
        assert_eq!(cache.entries().len(), 1);
        assert!(cache.remove_entry(&ip));
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn test_expire_pending() {
        let (cache, clock) = make_cache();
        let ip: IpAddr = "192.168.1.2".parse().unwrap();
        cache.resolve_or_queue(make_route("192.168.1.2"), NetworkProtocolNumber::IPV4, make_pkt());
        clock.advance(Duration::from_secs(61));
        assert_eq!(cache.expire_pending(), 1);
        assert_eq!(cache.pending_count(&ip), 0);
    }
}
