//! Routing table and resolved routes.

use crate::tcpip::{LinkAddress, NetworkProtocolNumber, NicId, Subnet};
use std::net::IpAddr;

/// Route table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Destination network
    pub destination: Subnet,
    /// Next hop (None for directly connected)
    pub gateway: Option<IpAddr>,
    /// Outgoing NIC
    pub nic: NicId,
}

/// Routing table using longest prefix match
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Add a route, replacing one with the same destination and NIC.
    pub fn add(&mut self, route: RouteEntry) {
        self.routes
            .retain(|r| r.destination != route.destination || r.nic != route.nic);
        self.routes.push(route);
        // Longest prefix first; a stable sort keeps insertion order among
        // equal prefixes.
        self.routes
            .sort_by(|a, b| b.destination.prefix_len().cmp(&a.destination.prefix_len()));
    }

    /// Remove every route that `pred` selects. Returns how many went.
    pub fn remove_if(&mut self, mut pred: impl FnMut(&RouteEntry) -> bool) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| !pred(r));
        before - self.routes.len()
    }

    /// Longest prefix match for `addr`, optionally restricted to `nic`.
    pub fn lookup(&self, addr: &IpAddr, nic: Option<NicId>) -> Option<&RouteEntry> {
        self.routes
            .iter()
            .filter(|r| nic.is_none_or(|n| n == r.nic))
            .find(|r| r.destination.contains(addr))
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A route resolved for one destination: what to put in the network header
/// and where to send the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub nic: NicId,
    pub net_proto: NetworkProtocolNumber,
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    /// Gateway, when the destination is not on-link.
    pub next_hop: Option<IpAddr>,
    pub local_link_address: LinkAddress,
    /// Filled in once the neighbor is resolved.
    pub remote_link_address: Option<LinkAddress>,
    /// The destination is one of our own addresses.
    pub loopback: bool,
}

impl Route {
    /// Address whose link address the frame is sent to.
    pub fn next_hop_address(&self) -> IpAddr {
        self.next_hop.unwrap_or(self.remote_address)
    }
}
