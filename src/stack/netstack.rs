//! The stack: NICs, routes and the paths packets take through them.
//!
//! ```text
//! link -> parse -> PREROUTING -+-> INPUT -> raw, demuxer, unknown dest
//!                              |
//!                              +-> FORWARD -> POSTROUTING -> link
//!
//! endpoint -> header -> OUTPUT -> POSTROUTING -+-> loopback (back to top)
//!                                              +-> neighbor -> link
//! ```

use super::conntrack::{ConnInfo, ConnTrack, ConnTrackConfig};
use super::icmp_rate_limit::IcmpRateLimiter;
use super::iptables::IpTables;
use super::iptables_types::{Hook, HookContext, Table, TableId};
use super::neighbor::{NeighborEntry, NudConfig, PendingPacket, Resolution};
use super::nic::{Nic, NicInfo, NicOptions, network_for};
use super::packet_buffer::{HeaderType, PacketBuffer};
use super::registration::{
    Endpoint, IcmpError, IcmpErrorSink, LinkAddressResolver, LinkCapabilities, LinkEndpoint,
    NetworkDispatcher, NetworkHeaderParams, ProtocolOption, ProtocolOptionName, Protocols,
    RawTransportEndpoint, TransportEndpoint, TransportEndpointId, UnknownDestinationDisposition,
};
use super::route::{Route, RouteEntry, RouteTable};
use super::transport_demuxer::TransportDemuxer;
use crate::buffer::{DEFAULT_BUFFER_SIZE, Pool, View};
use crate::ports::{Flags, PortManager};
use crate::tcpip::{
    ANY_NIC, AddressWithPrefix, Clock, LinkAddress, NetworkProtocolNumber, NicId, PacketType, StdClock,
    TransportProtocolNumber, is_multicast_or_broadcast,
};
use crate::telemetry::StackStats;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Called for packets no endpoint claimed, before the transport protocol
/// gets a say. Returns true if it handled the packet.
pub type TransportHandler = Arc<dyn Fn(&TransportEndpointId, &PacketBuffer) -> bool + Send + Sync>;

/// Everything the stack is built from. Nothing is global; two stacks
/// built from equal options behave the same.
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub protocols: Protocols,
    pub clock: Arc<dyn Clock>,
    /// Seeds demuxer hashing, conntrack bucketing and ephemeral port
    /// hints.
    pub seed: u32,
    /// Deliver packets addressed to our own addresses without touching a
    /// link.
    pub handle_local: bool,
    pub forwarding: bool,
    pub conntrack: ConnTrackConfig,
    /// ICMP errors per second.
    pub icmp_limit: f64,
    pub icmp_burst: u32,
    pub nud: NudConfig,
    pub ephemeral_range: Option<(u16, u16)>,
    /// Chunk size for packet buffers built by endpoints.
    pub buffer_size: usize,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            protocols: Protocols::new(),
            clock: Arc::new(StdClock),
            seed: rand::random(),
            handle_local: true,
            forwarding: false,
            conntrack: ConnTrackConfig::default(),
            icmp_limit: super::icmp_rate_limit::DEFAULT_LIMIT,
            icmp_burst: super::icmp_rate_limit::DEFAULT_BURST,
            nud: NudConfig::default(),
            ephemeral_range: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

pub struct Stack {
    weak_self: Weak<Stack>,
    protocols: Protocols,
    clock: Arc<dyn Clock>,
    nics: RwLock<HashMap<NicId, Arc<Nic>>>,
    routes: RwLock<RouteTable>,
    demuxer: TransportDemuxer,
    ports: PortManager,
    iptables: IpTables,
    resolvers: RwLock<HashMap<NetworkProtocolNumber, Arc<dyn LinkAddressResolver>>>,
    handlers: RwLock<HashMap<TransportProtocolNumber, TransportHandler>>,
    stats: Arc<StackStats>,
    handle_local: bool,
    forwarding: AtomicBool,
    nud: NudConfig,
    pool: Arc<Pool>,
    next_id: AtomicU64,
}

impl Stack {
    pub fn new(opts: StackOptions) -> Result<Arc<Stack>> {
        let ports = PortManager::new(opts.seed.rotate_left(16));
        if let Some((first, last)) = opts.ephemeral_range {
            ports.set_port_range(first, last)?;
        }
        let stats = Arc::new(StackStats::new());
        let conntrack = Arc::new(ConnTrack::new(
            &opts.conntrack,
            opts.seed ^ 0x9e37_79b9,
            opts.clock.clone(),
        ));
        let limiter = Arc::new(IcmpRateLimiter::with_limit(
            opts.icmp_limit,
            opts.icmp_burst,
            opts.clock.clone(),
        ));
        let demuxer = TransportDemuxer::new(
            opts.protocols.network_numbers(),
            opts.protocols.transport_numbers().collect::<Vec<_>>(),
            opts.seed,
        );
        let iptables = IpTables::new(opts.protocols.clone(), conntrack, limiter, stats.clone());

        Ok(Arc::new_cyclic(|weak_self| Stack {
            weak_self: weak_self.clone(),
            protocols: opts.protocols,
            clock: opts.clock,
            nics: RwLock::new(HashMap::new()),
            routes: RwLock::new(RouteTable::new()),
            demuxer,
            ports,
            iptables,
            resolvers: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            stats,
            handle_local: opts.handle_local,
            forwarding: AtomicBool::new(opts.forwarding),
            nud: opts.nud,
            pool: Arc::new(Pool::with_buffer_size(opts.buffer_size)),
            next_id: AtomicU64::new(1),
        }))
    }

    pub fn protocols(&self) -> &Protocols {
        &self.protocols
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ports(&self) -> &PortManager {
        &self.ports
    }

    pub fn demuxer(&self) -> &TransportDemuxer {
        &self.demuxer
    }

    pub fn iptables(&self) -> &IpTables {
        &self.iptables
    }

    pub fn conntrack(&self) -> &Arc<ConnTrack> {
        self.iptables.conntrack()
    }

    pub fn stats(&self) -> &Arc<StackStats> {
        &self.stats
    }

    /// A fresh id for an endpoint.
    pub fn unique_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Chunk storage shared by every view the stack hands out. Link
    /// endpoints may draw from it too.
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// An empty view drawing chunks of the configured size.
    pub fn new_view(&self) -> View {
        View::with_pool(Arc::clone(&self.pool))
    }

    // NICs

    pub fn create_nic(&self, id: NicId, link: Arc<dyn LinkEndpoint>, opts: NicOptions) -> Result<()> {
        if id == ANY_NIC {
            return Err(Error::UnknownNicId);
        }
        let mut nics = self.nics.write();
        if nics.contains_key(&id) {
            return Err(Error::DuplicateNicId);
        }
        let name = opts.name.unwrap_or_else(|| format!("nic{}", id));
        let stats = self.stats.register_interface(&name);
        let nic = Arc::new(Nic::new(
            id,
            name,
            link.clone(),
            !opts.disabled,
            self.nud.clone(),
            self.clock.clone(),
            stats,
        ));
        nics.insert(id, nic.clone());
        drop(nics);

        let dispatcher: Weak<dyn NetworkDispatcher> = self.weak_self.clone();
        link.attach(id, dispatcher);
        info!(nic = id, name = nic.name(), "created NIC");
        Ok(())
    }

    /// Remove a NIC together with its routes.
    pub fn remove_nic(&self, id: NicId) -> Result<()> {
        let mut nics = self.nics.write();
        let nic = nics.remove(&id).ok_or(Error::UnknownNicId)?;
        self.routes.write().remove_if(|r| r.nic == id);
        drop(nics);
        self.stats.unregister_interface(nic.name());
        info!(nic = id, "removed NIC");
        Ok(())
    }

    pub fn nic(&self, id: NicId) -> Result<Arc<Nic>> {
        self.nics.read().get(&id).cloned().ok_or(Error::UnknownNicId)
    }

    pub fn nic_info(&self) -> Vec<NicInfo> {
        let mut out: Vec<_> = self.nics.read().values().map(|n| n.info()).collect();
        out.sort_by_key(|n| n.id);
        out
    }

    pub fn enable_nic(&self, id: NicId) -> Result<()> {
        self.nic(id)?.set_enabled(true);
        Ok(())
    }

    pub fn disable_nic(&self, id: NicId) -> Result<()> {
        self.nic(id)?.set_enabled(false);
        Ok(())
    }

    pub fn add_address(&self, id: NicId, addr: AddressWithPrefix) -> Result<()> {
        if self.protocols.network(network_for(&addr.address)).is_none() {
            return Err(Error::UnknownProtocol);
        }
        self.nic(id)?.add_address(addr)?;
        debug!(nic = id, address = %addr.address, prefix = addr.prefix_len, "address added");
        Ok(())
    }

    pub fn remove_address(&self, id: NicId, addr: &IpAddr) -> Result<()> {
        self.nic(id)?.remove_address(addr)
    }

    /// NIC owning `addr`, if it is one of ours. Loopback range addresses
    /// belong to the first loopback NIC.
    fn local_nic(nics: &HashMap<NicId, Arc<Nic>>, addr: &IpAddr) -> Option<Arc<Nic>> {
        let owner = nics
            .values()
            .find(|n| n.is_enabled() && n.has_address(addr));
        if owner.is_some() || !addr.is_loopback() {
            return owner.cloned();
        }
        nics.values()
            .filter(|n| n.is_enabled() && n.is_loopback())
            .min_by_key(|n| n.id())
            .cloned()
    }

    pub fn is_local_address(&self, addr: &IpAddr) -> bool {
        Self::local_nic(&self.nics.read(), addr).is_some()
    }

    // Routes

    pub fn add_route(&self, entry: RouteEntry) {
        self.routes.write().add(entry);
    }

    /// Replace the whole route table.
    pub fn set_route_table(&self, entries: Vec<RouteEntry>) {
        let mut table = RouteTable::new();
        for entry in entries {
            table.add(entry);
        }
        *self.routes.write() = table;
    }

    pub fn remove_routes(&self, pred: impl FnMut(&RouteEntry) -> bool) -> usize {
        self.routes.write().remove_if(pred)
    }

    pub fn route_table(&self) -> Vec<RouteEntry> {
        self.routes.read().routes().to_vec()
    }

    /// Resolve a route to `remote`. Our own addresses resolve to a
    /// loopback route when local handling is on.
    pub fn find_route(
        &self,
        nic: Option<NicId>,
        local: Option<IpAddr>,
        remote: IpAddr,
        net_proto: NetworkProtocolNumber,
    ) -> Result<Route> {
        let nics = self.nics.read();
        if self.handle_local {
            if let Some(owner) = Self::local_nic(&nics, &remote).filter(|o| nic.is_none_or(|n| n == o.id())) {
                let link_addr = owner.link().link_address();
                return Ok(Route {
                    nic: owner.id(),
                    net_proto,
                    local_address: local.unwrap_or(remote),
                    remote_address: remote,
                    next_hop: None,
                    local_link_address: link_addr,
                    remote_link_address: Some(link_addr),
                    loopback: true,
                });
            }
        }

        let lookup = self
            .routes
            .read()
            .lookup(&remote, nic)
            .map(|r| (r.nic, r.gateway));
        let out = match lookup {
            Some((id, gateway)) => nics.get(&id).map(|n| (n.clone(), gateway)),
            // Broadcast and multicast may go out of an explicitly chosen
            // NIC without a route.
            None if is_multicast_or_broadcast(&remote) => nic.and_then(|id| nics.get(&id)).map(|n| (n.clone(), None)),
            None => None,
        };
        let Some((out, next_hop)) = out.filter(|(n, _)| n.is_enabled()) else {
            self.stats.no_route.inc();
            trace!(%remote, "no route");
            return Err(Error::NoRoute);
        };

        let local_address = match local {
            Some(addr) if out.has_address(&addr) => addr,
            Some(_) => return Err(Error::BadLocalAddress),
            None => out.primary_address(net_proto).ok_or(Error::NoRoute)?,
        };
        Ok(Route {
            nic: out.id(),
            net_proto,
            local_address,
            remote_address: remote,
            next_hop,
            local_link_address: out.link().link_address(),
            remote_link_address: None,
            loopback: out.is_loopback(),
        })
    }

    // Protocols and endpoints

    pub fn new_endpoint(
        self: &Arc<Self>,
        trans: TransportProtocolNumber,
        net: NetworkProtocolNumber,
    ) -> Result<Arc<dyn Endpoint>> {
        if self.protocols.network(net).is_none() {
            return Err(Error::UnknownProtocol);
        }
        let proto = self.protocols.transport(trans).ok_or(Error::UnknownProtocol)?;
        proto.new_endpoint(self, net)
    }

    /// Install a handler for packets of `trans` that no endpoint claims.
    pub fn set_transport_protocol_handler(&self, trans: TransportProtocolNumber, handler: TransportHandler) {
        self.handlers.write().insert(trans, handler);
    }

    pub fn set_link_address_resolver(&self, resolver: Arc<dyn LinkAddressResolver>) {
        self.resolvers
            .write()
            .insert(resolver.link_address_protocol(), resolver);
    }

    pub fn set_network_protocol_option(&self, net: NetworkProtocolNumber, opt: ProtocolOption) -> Result<()> {
        self.protocols
            .network(net)
            .ok_or(Error::UnknownProtocol)?
            .set_option(opt)
    }

    pub fn network_protocol_option(
        &self,
        net: NetworkProtocolNumber,
        name: ProtocolOptionName,
    ) -> Result<ProtocolOption> {
        self.protocols.network(net).ok_or(Error::UnknownProtocol)?.option(name)
    }

    pub fn set_transport_protocol_option(&self, trans: TransportProtocolNumber, opt: ProtocolOption) -> Result<()> {
        self.protocols
            .transport(trans)
            .ok_or(Error::UnknownProtocol)?
            .set_option(opt)
    }

    pub fn transport_protocol_option(
        &self,
        trans: TransportProtocolNumber,
        name: ProtocolOptionName,
    ) -> Result<ProtocolOption> {
        self.protocols
            .transport(trans)
            .ok_or(Error::UnknownProtocol)?
            .option(name)
    }

    pub fn register_transport_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: Arc<dyn TransportEndpoint>,
        flags: Flags,
        nic: NicId,
    ) -> Result<()> {
        self.demuxer.register_endpoint(net, trans, id, ep, flags, nic)
    }

    pub fn unregister_transport_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: &TransportEndpointId,
        unique_id: u64,
        flags: Flags,
        nic: NicId,
    ) {
        self.demuxer
            .unregister_endpoint(net, trans, id, unique_id, flags, nic)
    }

    pub fn register_raw_transport_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        ep: Arc<dyn RawTransportEndpoint>,
    ) -> Result<()> {
        self.demuxer.register_raw_endpoint(net, trans, ep)
    }

    pub fn unregister_raw_transport_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        unique_id: u64,
    ) {
        self.demuxer.unregister_raw_endpoint(net, trans, unique_id)
    }

    // Egress

    /// Put a network header on `pkt` (which already carries its transport
    /// header) and send it along `route`.
    ///
    /// A packet dropped by the tables is not an error.
    pub fn write_packet(&self, route: &Route, trans: TransportProtocolNumber, mut pkt: PacketBuffer) -> Result<()> {
        let net = self
            .protocols
            .network(route.net_proto)
            .ok_or(Error::UnknownProtocol)?;
        let nic = self.nic(route.nic)?;
        pkt.network_protocol_number = route.net_proto;
        pkt.transport_protocol_number = Some(trans);
        pkt.pkt_type = PacketType::Outgoing;
        net.write_header(
            &mut pkt,
            &NetworkHeaderParams {
                src: route.local_address,
                dst: route.remote_address,
                protocol: trans,
                ttl: 0,
                tos: 0,
            },
        )?;

        let output = HookContext {
            hook: Hook::Output,
            in_nic: "",
            out_nic: nic.name(),
            address: None,
        };
        if !self.iptables.check_packet(&mut pkt, &output) {
            trace!(nic = nic.id(), "output dropped packet");
            return Ok(());
        }

        // Output DNAT may have turned this into a local packet.
        let loopback = route.loopback
            || self
                .protocols
                .addresses(&pkt)
                .is_some_and(|(_, dst)| dst != route.remote_address && self.is_local_address(&dst));

        let postrouting = HookContext {
            hook: Hook::Postrouting,
            in_nic: "",
            out_nic: nic.name(),
            address: Some(route.local_address),
        };
        if !self.iptables.check_packet(&mut pkt, &postrouting) {
            trace!(nic = nic.id(), "postrouting dropped packet");
            return Ok(());
        }

        if loopback {
            self.stats.packets_looped.inc();
            let inbound = pkt.clone_to_inbound();
            self.deliver_network_packet(route.nic, route.local_link_address, route.net_proto, inbound);
            return Ok(());
        }
        self.write_to_link(&nic, route.clone(), route.net_proto, pkt)
    }

    fn write_to_link(
        &self,
        nic: &Nic,
        mut route: Route,
        proto: NetworkProtocolNumber,
        pkt: PacketBuffer,
    ) -> Result<()> {
        let link = nic.link();
        if route.remote_link_address.is_some()
            || !link.capabilities().contains(LinkCapabilities::RESOLUTION_REQUIRED)
        {
            return self.link_write(nic, &route, proto, pkt);
        }

        let next_hop = route.next_hop_address();
        let resolver = self.resolvers.read().get(&proto).cloned();
        if let Some(addr) = resolver.as_ref().and_then(|r| r.resolve_static(next_hop)) {
            route.remote_link_address = Some(addr);
            return self.link_write(nic, &route, proto, pkt);
        }

        match nic.neighbors.resolve_or_queue(route.clone(), proto, pkt) {
            Resolution::Resolved(addr, pkt) => {
                route.remote_link_address = Some(addr);
                self.link_write(nic, &route, proto, pkt)
            }
            Resolution::Queued { probe } => {
                self.stats.neighbor_queued.inc();
                if probe {
                    match &resolver {
                        Some(r) => {
                            if let Err(e) = r.link_address_request(next_hop, route.local_address, nic.id(), link.as_ref()) {
                                debug!(%next_hop, error = %e, "neighbor probe failed");
                            }
                        }
                        None => warn!(%proto, "no link address resolver registered"),
                    }
                }
                Ok(())
            }
            Resolution::QueueFull => {
                self.stats.neighbor_dropped.inc();
                Err(Error::WouldBlock)
            }
        }
    }

    fn link_write(&self, nic: &Nic, route: &Route, proto: NetworkProtocolNumber, pkt: PacketBuffer) -> Result<()> {
        let size = pkt.size();
        match nic.link().write_packet(route, proto, pkt) {
            Ok(()) => {
                self.stats.packets_sent.inc();
                nic.stats.record_tx(size);
                Ok(())
            }
            Err(e) => {
                if !e.ignore_stats() {
                    self.stats.send_errors.inc();
                    nic.stats.record_tx_error();
                }
                Err(e)
            }
        }
    }

    fn flush_pending(&self, nic: &Nic, pending: Vec<PendingPacket>) {
        for p in pending {
            if let Err(e) = self.link_write(nic, &p.route, p.protocol, p.pkt) {
                debug!(nic = nic.id(), error = %e, "failed to send queued packet");
            }
        }
    }

    // Neighbors

    /// A neighbor announced its link address.
    pub fn handle_neighbor_probe(&self, nic: NicId, addr: IpAddr, link_addr: LinkAddress) -> Result<()> {
        let nic = self.nic(nic)?;
        let pending = nic.neighbors.handle_probe(addr, link_addr);
        self.flush_pending(&nic, pending);
        Ok(())
    }

    /// A neighbor answered one of our probes.
    pub fn handle_neighbor_confirmation(&self, nic: NicId, addr: IpAddr, link_addr: LinkAddress) -> Result<()> {
        let nic = self.nic(nic)?;
        let pending = nic.neighbors.handle_confirmation(addr, link_addr);
        self.flush_pending(&nic, pending);
        Ok(())
    }

    pub fn add_static_neighbor(&self, nic: NicId, addr: IpAddr, link_addr: LinkAddress) -> Result<()> {
        let nic = self.nic(nic)?;
        let pending = nic.neighbors.add_static_entry(addr, link_addr);
        self.flush_pending(&nic, pending);
        Ok(())
    }

    pub fn remove_neighbor(&self, nic: NicId, addr: &IpAddr) -> Result<bool> {
        Ok(self.nic(nic)?.neighbors.remove_entry(addr))
    }

    pub fn neighbors(&self, nic: NicId) -> Result<Vec<NeighborEntry>> {
        Ok(self.nic(nic)?.neighbors.entries())
    }

    /// Drop packets that waited too long for a neighbor.
    pub fn expire_neighbor_queues(&self) -> usize {
        let nics: Vec<_> = self.nics.read().values().cloned().collect();
        let dropped: usize = nics.iter().map(|n| n.neighbors.expire_pending()).sum();
        self.stats.neighbor_dropped.add(dropped as u64);
        dropped
    }

    // Ingress

    fn deliver_local(&self, nic: &Nic, mut pkt: PacketBuffer) {
        let input = HookContext {
            hook: Hook::Input,
            in_nic: nic.name(),
            out_nic: "",
            address: None,
        };
        if !self.iptables.check_packet(&mut pkt, &input) {
            nic.stats.record_rx_drop();
            return;
        }

        let Some(trans_num) = pkt.transport_protocol_number else {
            self.stats.malformed_received.inc();
            return;
        };
        let raw = self.demuxer.deliver_raw_packet(trans_num, &pkt);
        let Some(trans) = self.protocols.transport(trans_num) else {
            self.stats.unknown_protocol_received.inc();
            if !raw {
                self.send_icmp_error(nic.id(), IcmpError::ProtocolUnreachable, &pkt);
            }
            return;
        };
        // Fragments past the first carry no transport header.
        if pkt.header_len(HeaderType::Transport) == 0 {
            return;
        }
        let Some(id) = self.protocols.endpoint_id(&pkt) else {
            self.stats.malformed_received.inc();
            return;
        };

        if self.demuxer.deliver_packet(trans_num, pkt.clone(), &id) {
            self.stats.packets_delivered.inc();
            return;
        }
        let handler = self.handlers.read().get(&trans_num).cloned();
        if handler.is_some_and(|h| h(&id, &pkt)) {
            return;
        }
        match trans.handle_unknown_destination_packet(&id, &pkt) {
            UnknownDestinationDisposition::Handled => {}
            UnknownDestinationDisposition::Malformed => self.stats.malformed_received.inc(),
            UnknownDestinationDisposition::Unhandled => {
                self.stats.unknown_port_received.inc();
                debug!(nic = nic.id(), ?id, "no endpoint for packet");
                self.send_icmp_error(nic.id(), IcmpError::PortUnreachable, &pkt);
            }
        }
    }

    fn forward_packet(&self, in_nic: &Nic, pkt: &PacketBuffer, dst: IpAddr) {
        let proto = pkt.network_protocol_number;
        let route = match self.find_route(None, None, dst, proto) {
            Ok(route) => route,
            Err(_) => {
                self.send_icmp_error(in_nic.id(), IcmpError::NetUnreachable, pkt);
                return;
            }
        };
        let Ok(out) = self.nic(route.nic) else {
            return;
        };
        let Some(net) = self.protocols.network(proto) else {
            return;
        };
        let mut fwd = match pkt.clone_for_forwarding(out.link().max_header_length()) {
            Ok(fwd) => fwd,
            Err(e) => {
                warn!(%dst, error = %e, "cannot forward packet");
                return;
            }
        };
        fwd.nic_id = in_nic.id();
        if !net.prepare_forward(&mut fwd) {
            trace!(%dst, "forwarded packet expired");
            return;
        }

        let forward = HookContext {
            hook: Hook::Forward,
            in_nic: in_nic.name(),
            out_nic: out.name(),
            address: None,
        };
        if !self.iptables.check_packet(&mut fwd, &forward) {
            return;
        }
        let postrouting = HookContext {
            hook: Hook::Postrouting,
            in_nic: in_nic.name(),
            out_nic: out.name(),
            address: Some(route.local_address),
        };
        if !self.iptables.check_packet(&mut fwd, &postrouting) {
            return;
        }

        self.stats.packets_forwarded.inc();
        if let Err(e) = self.write_to_link(&out, route, proto, fwd) {
            debug!(%dst, error = %e, "forwarding failed");
        }
    }

    fn send_icmp_error(&self, nic: NicId, err: IcmpError, pkt: &PacketBuffer) {
        if self
            .protocols
            .addresses(pkt)
            .is_some_and(|(_, dst)| is_multicast_or_broadcast(&dst))
        {
            return;
        }
        let Some(sink) = self.iptables.icmp_error_sink() else {
            return;
        };
        if !self.iptables.icmp_limiter().allow() {
            self.stats.icmp_rate_limited.inc();
            return;
        }
        match sink.send_icmp_error(nic, err, pkt) {
            Ok(()) => self.stats.icmp_errors_sent.inc(),
            Err(e) => debug!(nic, ?err, error = %e, "failed to send ICMP error"),
        }
    }

    // Administration

    pub fn set_icmp_error_sink(&self, sink: Option<Arc<dyn IcmpErrorSink>>) {
        self.iptables.set_icmp_error_sink(sink);
    }

    pub fn replace_table(&self, id: TableId, table: Table, ipv6: bool) -> Result<()> {
        self.iptables.replace_table(id, table, ipv6)
    }

    pub fn table(&self, id: TableId, ipv6: bool) -> Table {
        self.iptables.get_table(id, ipv6)
    }

    pub fn connections(&self) -> Vec<ConnInfo> {
        self.conntrack().connections()
    }

    pub fn clear_connections(&self) {
        self.conntrack().clear();
        info!("cleared connection tracking table");
    }

    /// `(errors per second, burst)`.
    pub fn icmp_rate_limit(&self) -> (f64, u32) {
        let limiter = self.iptables.icmp_limiter();
        (limiter.limit(), limiter.burst())
    }

    pub fn set_icmp_rate_limit(&self, limit: f64, burst: u32) {
        let limiter = self.iptables.icmp_limiter();
        limiter.set_limit(limit);
        limiter.set_burst(burst);
    }

    pub fn forwarding(&self) -> bool {
        self.forwarding.load(Ordering::Relaxed)
    }

    pub fn set_forwarding(&self, enabled: bool) {
        self.forwarding.store(enabled, Ordering::Relaxed);
    }

    /// Stack counters plus connection tracking counters.
    pub fn export_stats(&self) -> Vec<(String, u64)> {
        let mut out = self.stats.export();
        let ct = self.conntrack();
        out.extend([
            ("conntrack_connections".into(), ct.len() as u64),
            ("conntrack_created".into(), ct.stats().created.get()),
            ("conntrack_reaped".into(), ct.stats().reaped.get()),
            ("conntrack_untracked".into(), ct.stats().untracked.get()),
        ]);
        out
    }

    /// Periodically sweep `buckets_per_tick` conntrack buckets and expire
    /// neighbor queues. The task ends once the stack is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, period: Duration, buckets_per_tick: usize) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut next = 0;
            loop {
                ticker.tick().await;
                let Some(stack) = weak.upgrade() else {
                    break;
                };
                next = stack.conntrack().reap_unused(next, buckets_per_tick);
                stack.expire_neighbor_queues();
            }
            debug!("maintenance task stopped");
        })
    }
}

impl NetworkDispatcher for Stack {
    fn deliver_network_packet(
        &self,
        nic_id: NicId,
        _remote: LinkAddress,
        protocol: NetworkProtocolNumber,
        mut pkt: PacketBuffer,
    ) {
        self.stats.packets_received.inc();
        let Ok(nic) = self.nic(nic_id) else {
            return;
        };
        if !nic.is_enabled() {
            nic.stats.record_rx_drop();
            return;
        }
        nic.stats.record_rx(pkt.size());
        pkt.nic_id = nic_id;
        pkt.network_protocol_number = protocol;

        let Some(net) = self.protocols.network(protocol) else {
            self.stats.unknown_protocol_received.inc();
            return;
        };
        let Some(parsed) = net.parse(&mut pkt) else {
            self.stats.malformed_received.inc();
            return;
        };
        pkt.transport_protocol_number = Some(parsed.transport);
        if parsed.has_transport_header {
            if let Some(trans) = self.protocols.transport(parsed.transport) {
                if !trans.parse(&mut pkt) {
                    self.stats.malformed_received.inc();
                    return;
                }
            }
        }

        let prerouting = HookContext {
            hook: Hook::Prerouting,
            in_nic: nic.name(),
            out_nic: "",
            address: nic.primary_address(protocol),
        };
        if !self.iptables.check_packet(&mut pkt, &prerouting) {
            nic.stats.record_rx_drop();
            return;
        }

        let Some((_, dst)) = self.protocols.addresses(&pkt) else {
            self.stats.malformed_received.inc();
            return;
        };
        if is_multicast_or_broadcast(&dst) || self.is_local_address(&dst) {
            self.deliver_local(&nic, pkt);
        } else if self.forwarding() {
            self.forward_packet(&nic, &pkt, dst);
        } else {
            trace!(nic = nic_id, %dst, "not for us, dropping");
            nic.stats.record_rx_drop();
        }
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("protocols", &self.protocols)
            .field("nics", &self.nics.read().len())
            .field("routes", &self.routes.read().len())
            .field("iptables", &self.iptables)
            .finish()
    }
}
