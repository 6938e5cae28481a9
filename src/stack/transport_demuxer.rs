//! Transport demultiplexer.
//!
//! Maps an incoming packet's endpoint id to the endpoint(s) registered for
//! it. Lookup tries progressively wider ids:
//!
//! 1. the exact id
//! 2. local address and port (unconnected, bound to an address)
//! 3. local port and remote address and port (connected, any local address)
//! 4. local port only
//! 5. the all-wildcard id
//!
//! At each level an endpoint bound to the receiving NIC wins over one bound
//! to any NIC. Locks are dropped before an endpoint's handler runs.

use super::packet_buffer::PacketBuffer;
use super::registration::{RawTransportEndpoint, TransportEndpoint, TransportEndpointId};
use crate::hash::hash_with_seed;
use crate::ports::{BitFlags, FlagCounter, Flags};
use crate::tcpip::{
    ANY_NIC, NetworkProtocolNumber, NicId, TransportProtocolNumber, is_multicast_or_broadcast,
};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Endpoints sharing one id on one NIC.
struct MultiPortEndpoint {
    /// In registration order.
    endpoints: Vec<Arc<dyn TransportEndpoint>>,
    flags: FlagCounter,
}

impl MultiPortEndpoint {
    fn select(&self, id: &TransportEndpointId, seed: u32) -> Option<Arc<dyn TransportEndpoint>> {
        match self.endpoints.len() {
            0 => None,
            1 => self.endpoints.first().cloned(),
            n => {
                if self.flags.shared_flags().contains(BitFlags::MOST_RECENT) {
                    return self.endpoints.last().cloned();
                }
                let h = hash_with_seed(
                    seed,
                    &(id.remote_address, id.remote_port, id.local_port),
                );
                self.endpoints.get(h as usize % n).cloned()
            }
        }
    }
}

/// Everything registered at one id, split by NIC.
struct EndpointsByNic {
    endpoints: HashMap<NicId, MultiPortEndpoint>,
}

impl EndpointsByNic {
    fn for_nic(&self, nic: NicId) -> Option<&MultiPortEndpoint> {
        self.endpoints
            .get(&nic)
            .or_else(|| self.endpoints.get(&ANY_NIC))
    }

    fn register(&mut self, ep: Arc<dyn TransportEndpoint>, flags: Flags, nic: NicId) -> Result<()> {
        let bits = flags.bits();
        let mp = self.endpoints.entry(nic).or_insert_with(|| MultiPortEndpoint {
            endpoints: Vec::new(),
            flags: FlagCounter::default(),
        });
        if mp.flags.total_refs() > 0 && (bits & mp.flags.shared_flags()).is_empty() {
            return Err(Error::AddressInUse);
        }
        mp.endpoints.push(ep);
        mp.flags.add_ref(bits);
        Ok(())
    }

    /// Returns true when nothing is left at this id.
    fn unregister(&mut self, unique_id: u64, flags: Flags, nic: NicId) -> bool {
        if let Some(mp) = self.endpoints.get_mut(&nic) {
            if let Some(pos) = mp.endpoints.iter().position(|e| e.unique_id() == unique_id) {
                mp.endpoints.remove(pos);
                mp.flags.drop_ref(flags.bits());
            }
            if mp.endpoints.is_empty() {
                self.endpoints.remove(&nic);
            }
        }
        self.endpoints.is_empty()
    }
}

#[derive(Default)]
struct EndpointTable {
    endpoints: HashMap<TransportEndpointId, EndpointsByNic>,
    raw: Vec<Arc<dyn RawTransportEndpoint>>,
}

impl EndpointTable {
    /// The ids a packet with `id` may match, most specific first.
    fn candidates(id: &TransportEndpointId) -> [TransportEndpointId; 5] {
        [
            *id,
            TransportEndpointId {
                local_port: id.local_port,
                local_address: id.local_address,
                ..Default::default()
            },
            TransportEndpointId {
                local_address: None,
                ..*id
            },
            TransportEndpointId {
                local_port: id.local_port,
                ..Default::default()
            },
            TransportEndpointId::default(),
        ]
    }

    fn find(
        &self,
        id: &TransportEndpointId,
        nic: NicId,
        seed: u32,
    ) -> Option<Arc<dyn TransportEndpoint>> {
        Self::candidates(id).iter().find_map(|cand| {
            self.endpoints
                .get(cand)
                .and_then(|by_nic| by_nic.for_nic(nic))
                .and_then(|mp| mp.select(id, seed))
        })
    }

    fn find_all(&self, id: &TransportEndpointId, nic: NicId) -> Vec<Arc<dyn TransportEndpoint>> {
        let mut out: Vec<Arc<dyn TransportEndpoint>> = Vec::new();
        let mut seen = Vec::new();
        for cand in Self::candidates(id) {
            if seen.contains(&cand) {
                continue;
            }
            seen.push(cand);
            if let Some(mp) = self.endpoints.get(&cand).and_then(|b| b.for_nic(nic)) {
                out.extend(mp.endpoints.iter().cloned());
            }
        }
        out
    }
}

/// Registered endpoints for one (network, transport) protocol pair.
#[derive(Default)]
struct TransportEndpoints {
    table: RwLock<EndpointTable>,
}

/// Routes incoming packets to transport endpoints.
pub struct TransportDemuxer {
    protocols: HashMap<(NetworkProtocolNumber, TransportProtocolNumber), TransportEndpoints>,
    seed: u32,
}

impl TransportDemuxer {
    /// A demuxer serving every combination of the given protocols.
    pub fn new(
        network: impl IntoIterator<Item = NetworkProtocolNumber>,
        transport: impl IntoIterator<Item = TransportProtocolNumber> + Clone,
        seed: u32,
    ) -> Self {
        let mut protocols = HashMap::new();
        for net in network {
            for trans in transport.clone() {
                protocols.insert((net, trans), TransportEndpoints::default());
            }
        }
        Self { protocols, seed }
    }

    fn endpoints(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
    ) -> Result<&TransportEndpoints> {
        self.protocols.get(&(net, trans)).ok_or(Error::UnknownProtocol)
    }

    /// Register `ep` at `id`. A second endpoint at the same id and NIC is
    /// accepted only when it shares a multi-bind flag with every endpoint
    /// already there.
    pub fn register_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: TransportEndpointId,
        ep: Arc<dyn TransportEndpoint>,
        flags: Flags,
        nic: NicId,
    ) -> Result<()> {
        let eps = self.endpoints(net, trans)?;
        let mut table = eps.table.write();
        let by_nic = table.endpoints.entry(id).or_insert_with(|| EndpointsByNic {
            endpoints: HashMap::new(),
        });
        let result = by_nic.register(ep, flags, nic);
        if by_nic.endpoints.is_empty() {
            table.endpoints.remove(&id);
        }
        if result.is_ok() {
            trace!(%net, %trans, ?id, nic, "endpoint registered");
        }
        result
    }

    /// Remove the endpoint with `unique_id` from `id`, dropping the id
    /// entirely once empty.
    pub fn unregister_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: &TransportEndpointId,
        unique_id: u64,
        flags: Flags,
        nic: NicId,
    ) {
        let Ok(eps) = self.endpoints(net, trans) else {
            return;
        };
        let mut table = eps.table.write();
        let now_empty = table
            .endpoints
            .get_mut(id)
            .is_some_and(|by_nic| by_nic.unregister(unique_id, flags, nic));
        if now_empty {
            table.endpoints.remove(id);
        }
    }

    /// Deliver `pkt` to the endpoint(s) matching `id`. Multicast and
    /// broadcast packets go to every match; anything else to exactly one.
    /// Returns false when nothing matched.
    pub fn deliver_packet(
        &self,
        trans: TransportProtocolNumber,
        pkt: PacketBuffer,
        id: &TransportEndpointId,
    ) -> bool {
        let Ok(eps) = self.endpoints(pkt.network_protocol_number, trans) else {
            return false;
        };

        if id.local_address.is_some_and(|a| is_multicast_or_broadcast(&a)) {
            let targets = eps.table.read().find_all(id, pkt.nic_id);
            let Some((last, rest)) = targets.split_last() else {
                return false;
            };
            for ep in rest {
                ep.handle_packet(id, pkt.clone());
            }
            last.handle_packet(id, pkt);
            return true;
        }

        let target = eps.table.read().find(id, pkt.nic_id, self.seed);
        match target {
            Some(ep) => {
                ep.handle_packet(id, pkt);
                true
            }
            None => false,
        }
    }

    pub fn register_raw_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        ep: Arc<dyn RawTransportEndpoint>,
    ) -> Result<()> {
        self.endpoints(net, trans)?.table.write().raw.push(ep);
        Ok(())
    }

    pub fn unregister_raw_endpoint(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        unique_id: u64,
    ) {
        if let Ok(eps) = self.endpoints(net, trans) {
            eps.table.write().raw.retain(|e| e.unique_id() != unique_id);
        }
    }

    /// Give every raw endpoint of the packet's protocols a copy. Returns
    /// whether any did.
    pub fn deliver_raw_packet(&self, trans: TransportProtocolNumber, pkt: &PacketBuffer) -> bool {
        let Ok(eps) = self.endpoints(pkt.network_protocol_number, trans) else {
            return false;
        };
        let raw = eps.table.read().raw.clone();
        for ep in &raw {
            ep.handle_packet(pkt.clone());
        }
        !raw.is_empty()
    }

    /// Whether anything is registered at exactly `id`.
    pub fn is_registered(
        &self,
        net: NetworkProtocolNumber,
        trans: TransportProtocolNumber,
        id: &TransportEndpointId,
    ) -> bool {
        self.endpoints(net, trans)
            .map(|eps| eps.table.read().endpoints.contains_key(id))
            .unwrap_or(false)
    }

    /// Number of distinct ids registered for a protocol pair.
    pub fn id_count(&self, net: NetworkProtocolNumber, trans: TransportProtocolNumber) -> usize {
        self.endpoints(net, trans)
            .map(|eps| eps.table.read().endpoints.len())
            .unwrap_or(0)
    }
}

impl fmt::Debug for TransportDemuxer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportDemuxer")
            .field("protocols", &self.protocols.keys().collect::<Vec<_>>())
            .finish()
    }
}
