//! Port reservations and ephemeral port allocation.
//!
//! Reservations are kept in a nested map:
//! `(network, transport, port) -> address -> NIC -> FlagCounter`.
//! An unspecified address (`None`) or NIC id 0 overlaps every concrete one.
//! Empty levels are removed as soon as their last reference goes away.

mod flags;

pub use flags::{BitFlags, FlagCounter, Flags};

use crate::tcpip::{ANY_NIC, NetworkProtocolNumber, NicId, TransportProtocolNumber};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// First port of the default ephemeral range.
pub const DEFAULT_FIRST_EPHEMERAL: u16 = 16000;

/// Last port of the default ephemeral range.
pub const DEFAULT_LAST_EPHEMERAL: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PortDescriptor {
    network: NetworkProtocolNumber,
    transport: TransportProtocolNumber,
    port: u16,
}

type DeviceToCounter = HashMap<NicId, FlagCounter>;
type AddrToDevice = HashMap<Option<IpAddr>, DeviceToCounter>;

/// A request to hold a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub network: NetworkProtocolNumber,
    pub transport: TransportProtocolNumber,
    /// `None` binds every local address.
    pub addr: Option<IpAddr>,
    /// Zero asks for an ephemeral port.
    pub port: u16,
    pub flags: Flags,
    /// `ANY_NIC` binds every NIC.
    pub nic: NicId,
}

#[derive(Debug)]
struct PortsInner {
    allocated: HashMap<PortDescriptor, AddrToDevice>,
    first_ephemeral: u16,
    num_ephemeral: u32,
}

impl PortsInner {
    fn is_available(&self, desc: &PortDescriptor, res: &Reservation) -> bool {
        let Some(addrs) = self.allocated.get(desc) else {
            return true;
        };
        let bits = res.flags.bits();
        addrs
            .iter()
            .filter(|(addr, _)| res.addr.is_none() || addr.is_none() || **addr == res.addr)
            .flat_map(|(_, devices)| devices.iter())
            .filter(|(nic, _)| res.nic == ANY_NIC || **nic == ANY_NIC || **nic == res.nic)
            .all(|(_, counter)| counter.accepts(bits))
    }

    fn add_ref(&mut self, desc: PortDescriptor, res: &Reservation) {
        self.allocated
            .entry(desc)
            .or_default()
            .entry(res.addr)
            .or_default()
            .entry(res.nic)
            .or_default()
            .add_ref(res.flags.bits());
    }
}

/// Tracks reserved ports for every protocol pair.
#[derive(Debug)]
pub struct PortManager {
    inner: RwLock<PortsInner>,
    hint: AtomicU32,
}

impl PortManager {
    /// A manager with the default ephemeral range and a starting hint.
    pub fn new(hint_seed: u32) -> Self {
        Self {
            inner: RwLock::new(PortsInner {
                allocated: HashMap::new(),
                first_ephemeral: DEFAULT_FIRST_EPHEMERAL,
                num_ephemeral: (DEFAULT_LAST_EPHEMERAL - DEFAULT_FIRST_EPHEMERAL) as u32 + 1,
            }),
            hint: AtomicU32::new(hint_seed),
        }
    }

    /// Current ephemeral range as `(first, last)`, inclusive.
    pub fn port_range(&self) -> (u16, u16) {
        let inner = self.inner.read();
        let last = inner.first_ephemeral as u32 + inner.num_ephemeral - 1;
        (inner.first_ephemeral, last as u16)
    }

    /// Replace the ephemeral range. Both ends are inclusive.
    pub fn set_port_range(&self, first: u16, last: u16) -> Result<()> {
        if first == 0 || first > last {
            return Err(Error::InvalidPortRange);
        }
        let mut inner = self.inner.write();
        inner.first_ephemeral = first;
        inner.num_ephemeral = (last - first) as u32 + 1;
        Ok(())
    }

    /// Scan the ephemeral range from the rotating hint, wrapping once, and
    /// return the first port `pred` accepts. Errors from `pred` stop the
    /// scan.
    pub fn pick_ephemeral_port(&self, pred: impl FnMut(u16) -> Result<bool>) -> Result<u16> {
        let (first, count) = {
            let inner = self.inner.read();
            (inner.first_ephemeral, inner.num_ephemeral)
        };
        self.scan(first, count, pred)
    }

    fn scan(&self, first: u16, count: u32, mut pred: impl FnMut(u16) -> Result<bool>) -> Result<u16> {
        let start = self.hint.load(Ordering::Relaxed) % count;
        for i in 0..count {
            let port = (first as u32 + (start + i) % count) as u16;
            if pred(port)? {
                self.hint.fetch_add(i + 1, Ordering::Relaxed);
                return Ok(port);
            }
        }
        Err(Error::RangeExhausted)
    }

    /// Whether `res` could be reserved right now.
    pub fn is_port_available(&self, res: &Reservation) -> bool {
        let desc = descriptor(res, res.port);
        self.inner.read().is_available(&desc, res)
    }

    /// Reserve `res`, picking an ephemeral port when `res.port` is zero.
    ///
    /// `test_port` is consulted for ephemeral candidates only; it lets the
    /// caller reject ports for reasons outside this manager.
    pub fn reserve(
        &self,
        res: &Reservation,
        mut test_port: impl FnMut(u16) -> bool,
    ) -> Result<u16> {
        let mut inner = self.inner.write();

        if res.port != 0 {
            let desc = descriptor(res, res.port);
            if !inner.is_available(&desc, res) {
                return Err(Error::AddressInUse);
            }
            inner.add_ref(desc, res);
            return Ok(res.port);
        }

        let (first, count) = (inner.first_ephemeral, inner.num_ephemeral);
        let port = self.scan(first, count, |port| {
            Ok(inner.is_available(&descriptor(res, port), res) && test_port(port))
        })?;
        inner.add_ref(descriptor(res, port), res);
        debug!(port, transport = %res.transport, "reserved ephemeral port");
        Ok(port)
    }

    /// Drop one reference taken by `reserve`, where `port` is the port it
    /// returned.
    pub fn release(&self, res: &Reservation, port: u16) {
        let desc = descriptor(res, port);
        let mut inner = self.inner.write();
        let Some(addrs) = inner.allocated.get_mut(&desc) else {
            return;
        };
        let Some(devices) = addrs.get_mut(&res.addr) else {
            return;
        };
        let Some(counter) = devices.get_mut(&res.nic) else {
            return;
        };
        counter.drop_ref(res.flags.bits());
        if counter.total_refs() == 0 {
            devices.remove(&res.nic);
        }
        if devices.is_empty() {
            addrs.remove(&res.addr);
        }
        if addrs.is_empty() {
            inner.allocated.remove(&desc);
        }
    }

    /// True when no port is reserved at all.
    pub fn is_empty(&self) -> bool {
        self.inner.read().allocated.is_empty()
    }
}

fn descriptor(res: &Reservation, port: u16) -> PortDescriptor {
    PortDescriptor {
        network: res.network,
        transport: res.transport,
        port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn make_res(addr: Option<IpAddr>, port: u16, flags: Flags, nic: NicId) -> Reservation {
        Reservation {
            network: NetworkProtocolNumber::IPV4,
            transport: TransportProtocolNumber::UDP,
            addr,
            port,
            flags,
            nic,
        }
    }

    fn addr(last: u8) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    fn reuse_port() -> Flags {
        Flags {
            load_balanced: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_reserve_conflict_same_key() {
        let pm = PortManager::new(0);
        let res = make_res(addr(1), 80, Flags::default(), ANY_NIC);
        assert_eq!(pm.reserve(&res, |_| true).unwrap(), 80);
        assert!(matches!(pm.reserve(&res, |_| true), Err(Error::AddressInUse)));
    }

    #[test]
    fn test_reserve_distinct_addresses() {
        let pm = PortManager::new(0);
        pm.reserve(&make_res(addr(1), 80, Flags::default(), ANY_NIC), |_| true)
            .unwrap();
        assert!(
            pm.reserve(&make_res(addr(2), 80, Flags::default(), ANY_NIC), |_| true)
                .is_ok()
        );
    }

    #[test]
    fn test_wildcard_address_overlaps() {
        let pm = PortManager::new(0);
        pm.reserve(&make_res(addr(1), 80, Flags::default(), ANY_NIC), |_| true)
            .unwrap();
        let any = make_res(None, 80, Flags::default(), ANY_NIC);
        assert!(!pm.is_port_available(&any));

        let pm = PortManager::new(0);
        pm.reserve(&any, |_| true).unwrap();
        assert!(!pm.is_port_available(&make_res(addr(9), 80, Flags::default(), ANY_NIC)));
    }

    #[test]
    fn test_nic_binding() {
        let pm = PortManager::new(0);
        pm.reserve(&make_res(addr(1), 80, Flags::default(), 1), |_| true)
            .unwrap();
        assert!(pm.is_port_available(&make_res(addr(1), 80, Flags::default(), 2)));
        assert!(!pm.is_port_available(&make_res(addr(1), 80, Flags::default(), ANY_NIC)));
    }

    #[test]
    fn test_multi_bind_flags() {
        let pm = PortManager::new(0);
        let res = make_res(addr(1), 80, reuse_port(), ANY_NIC);
        pm.reserve(&res, |_| true).unwrap();
        pm.reserve(&res, |_| true).unwrap();
        assert!(!pm.is_port_available(&make_res(addr(1), 80, Flags::default(), ANY_NIC)));
    }

    #[test]
    fn test_release_prunes_all_levels() {
        let pm = PortManager::new(0);
        let res = make_res(addr(1), 80, reuse_port(), 3);
        for _ in 0..3 {
            pm.reserve(&res, |_| true).unwrap();
        }
        for _ in 0..3 {
            pm.release(&res, 80);
        }
        assert!(pm.is_empty());
        assert!(pm.inner.read().allocated.get(&descriptor(&res, 80)).is_none());
    }

    #[test]
    fn test_release_keeps_other_addresses() {
        let pm = PortManager::new(0);
        let a = make_res(addr(1), 80, Flags::default(), ANY_NIC);
        let b = make_res(addr(2), 80, Flags::default(), ANY_NIC);
        pm.reserve(&a, |_| true).unwrap();
        pm.reserve(&b, |_| true).unwrap();
        pm.release(&a, 80);
        let inner = pm.inner.read();
        let addrs = inner.allocated.get(&descriptor(&a, 80)).unwrap();
        assert!(!addrs.contains_key(&a.addr));
        assert!(addrs.contains_key(&b.addr));
    }

    #[test]
    fn test_ephemeral_reserve_within_range() {
        let pm = PortManager::new(0);
        pm.set_port_range(5000, 5002).unwrap();
        let res = make_res(addr(1), 0, Flags::default(), ANY_NIC);
        let mut got: Vec<u16> = (0..3).map(|_| pm.reserve(&res, |_| true).unwrap()).collect();
        got.sort();
        assert_eq!(got, vec![5000, 5001, 5002]);
        assert!(matches!(pm.reserve(&res, |_| true), Err(Error::RangeExhausted)));
    }

    #[test]
    fn test_ephemeral_respects_test_port() {
        let pm = PortManager::new(0);
        pm.set_port_range(6000, 6003).unwrap();
        let res = make_res(addr(1), 0, Flags::default(), ANY_NIC);
        let port = pm.reserve(&res, |p| p == 6002).unwrap();
        assert_eq!(port, 6002);
    }

    #[test]
    fn test_pick_ephemeral_wraps_once() {
        let pm = PortManager::new(2);
        pm.set_port_range(100, 104).unwrap();
        let mut seen = Vec::new();
        let result = pm.pick_ephemeral_port(|p| {
            seen.push(p);
            Ok(false)
        });
        assert!(matches!(result, Err(Error::RangeExhausted)));
        assert_eq!(seen, vec![102, 103, 104, 100, 101]);
    }

    #[test]
    fn test_pick_ephemeral_visits_each_port_near_hint_wrap() {
        let pm = PortManager::new(u32::MAX - 1);
        pm.set_port_range(100, 102).unwrap();
        let mut seen = Vec::new();
        let result = pm.pick_ephemeral_port(|p| {
            seen.push(p);
            Ok(false)
        });
        assert!(matches!(result, Err(Error::RangeExhausted)));
        assert_eq!(seen, vec![102, 100, 101]);
    }

    #[test]
    fn test_pick_ephemeral_advances_hint() {
        let pm = PortManager::new(0);
        pm.set_port_range(100, 109).unwrap();
        let first = pm.pick_ephemeral_port(|_| Ok(true)).unwrap();
        let second = pm.pick_ephemeral_port(|_| Ok(true)).unwrap();
        assert_eq!(first, 100);
        assert_eq!(second, 101);
    }

    #[test]
    fn test_pick_ephemeral_propagates_error() {
        let pm = PortManager::new(0);
        let result = pm.pick_ephemeral_port(|_| Err(Error::NoRoute));
        assert!(matches!(result, Err(Error::NoRoute)));
    }

    #[test]
    fn test_set_port_range_validation() {
        let pm = PortManager::new(0);
        assert!(matches!(pm.set_port_range(0, 10), Err(Error::InvalidPortRange)));
        assert!(matches!(pm.set_port_range(20, 10), Err(Error::InvalidPortRange)));
        pm.set_port_range(20, 30).unwrap();
        assert_eq!(pm.port_range(), (20, 30));
        assert_eq!(PortManager::new(0).port_range(), (16000, 65535));
    }
}
