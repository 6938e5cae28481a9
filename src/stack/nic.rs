//! Network interfaces.

use super::neighbor::{NeighborCache, NudConfig};
use super::registration::{LinkCapabilities, LinkEndpoint};
use crate::tcpip::{AddressWithPrefix, Clock, LinkAddress, NetworkProtocolNumber, NicId};
use crate::telemetry::InterfaceStats;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Options for [`Stack::create_nic`](super::Stack::create_nic).
#[derive(Debug, Clone, Default)]
pub struct NicOptions {
    /// Name matched by interface filters. Defaults to `nic<id>`.
    pub name: Option<String>,
    /// Create the NIC disabled.
    pub disabled: bool,
}

/// Snapshot of a NIC for the admin interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicInfo {
    pub id: NicId,
    pub name: String,
    pub mtu: u32,
    pub link_address: LinkAddress,
    pub addresses: Vec<AddressWithPrefix>,
    pub enabled: bool,
    pub loopback: bool,
}

/// Network protocol an address belongs to.
pub fn network_for(addr: &IpAddr) -> NetworkProtocolNumber {
    match addr {
        IpAddr::V4(_) => NetworkProtocolNumber::IPV4,
        IpAddr::V6(_) => NetworkProtocolNumber::IPV6,
    }
}

pub struct Nic {
    id: NicId,
    name: String,
    link: Arc<dyn LinkEndpoint>,
    enabled: AtomicBool,
    addresses: RwLock<Vec<AddressWithPrefix>>,
    pub(crate) neighbors: NeighborCache,
    pub(crate) stats: Arc<InterfaceStats>,
}

impl Nic {
    pub(crate) fn new(
        id: NicId,
        name: String,
        link: Arc<dyn LinkEndpoint>,
        enabled: bool,
        nud: NudConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<InterfaceStats>,
    ) -> Self {
        Self {
            id,
            name,
            link,
            enabled: AtomicBool::new(enabled),
            addresses: RwLock::new(Vec::new()),
            neighbors: NeighborCache::new(nud, clock),
            stats,
        }
    }

    pub fn id(&self) -> NicId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn link(&self) -> &Arc<dyn LinkEndpoint> {
        &self.link
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_loopback(&self) -> bool {
        self.link.capabilities().contains(LinkCapabilities::LOOPBACK)
    }

    pub fn addresses(&self) -> Vec<AddressWithPrefix> {
        self.addresses.read().clone()
    }

    /// First address of the given protocol.
    pub fn primary_address(&self, proto: NetworkProtocolNumber) -> Option<IpAddr> {
        self.addresses
            .read()
            .iter()
            .map(|a| a.address)
            .find(|a| network_for(a) == proto)
    }

    pub fn has_address(&self, addr: &IpAddr) -> bool {
        self.addresses.read().iter().any(|a| a.address == *addr)
    }

    /// Whether `addr` is on one of this NIC's subnets.
    pub fn is_on_link(&self, addr: &IpAddr) -> bool {
        self.addresses
            .read()
            .iter()
            .any(|a| a.subnet().contains(addr))
    }

    pub(crate) fn add_address(&self, addr: AddressWithPrefix) -> Result<()> {
        let mut addrs = self.addresses.write();
        if addrs.iter().any(|a| a.address == addr.address) {
            return Err(Error::AddressInUse);
        }
        addrs.push(addr);
        Ok(())
    }

    pub(crate) fn remove_address(&self, addr: &IpAddr) -> Result<()> {
        let mut addrs = self.addresses.write();
        let before = addrs.len();
        addrs.retain(|a| a.address != *addr);
        if addrs.len() == before {
            return Err(Error::BadLocalAddress);
        }
        Ok(())
    }

    pub fn info(&self) -> NicInfo {
        NicInfo {
            id: self.id,
            name: self.name.clone(),
            mtu: self.link.mtu(),
            link_address: self.link.link_address(),
            addresses: self.addresses(),
            enabled: self.is_enabled(),
            loopback: self.is_loopback(),
        }
    }
}

impl fmt::Debug for Nic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nic")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("addresses", &*self.addresses.read())
            .finish()
    }
}
