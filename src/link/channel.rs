//! A link endpoint backed by a tokio channel.
//!
//! Outgoing packets land on an `mpsc` channel for whoever owns the
//! receiving half (a TAP pump, a test, another stack). Frames coming the
//! other way are handed in with [`ChannelEndpoint::inject`].

use crate::buffer::{Pool, VectorisedView, View};
use crate::stack::packet_buffer::{PacketBuffer, PacketBufferOptions};
use crate::stack::registration::{LinkCapabilities, LinkEndpoint, NetworkDispatcher};
use crate::stack::route::Route;
use crate::tcpip::{LinkAddress, NetworkProtocolNumber, NicId};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::trace;

/// A packet the stack sent out of a [`ChannelEndpoint`].
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    pub route: Route,
    pub protocol: NetworkProtocolNumber,
    /// Network header onwards.
    pub data: Vec<u8>,
}

pub struct ChannelEndpoint {
    mtu: u32,
    link_address: LinkAddress,
    capabilities: LinkCapabilities,
    tx: mpsc::Sender<OutboundPacket>,
    dispatcher: RwLock<Option<(NicId, Weak<dyn NetworkDispatcher>)>>,
    pool: Arc<Pool>,
}

impl ChannelEndpoint {
    /// An endpoint queueing up to `capacity` outbound packets.
    pub fn new(
        capacity: usize,
        mtu: u32,
        link_address: LinkAddress,
        capabilities: LinkCapabilities,
    ) -> (Self, mpsc::Receiver<OutboundPacket>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let ep = Self {
            mtu,
            link_address,
            capabilities,
            tx,
            dispatcher: RwLock::new(None),
            pool: Pool::shared(),
        };
        (ep, rx)
    }

    /// Copy injected frames into chunks from `pool`, usually the stack's.
    pub fn with_pool(mut self, pool: Arc<Pool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn is_attached(&self) -> bool {
        self.dispatcher.read().is_some()
    }

    /// Hand an inbound packet (network header onwards) to the stack.
    /// Returns false if the endpoint is not attached to a live stack.
    pub fn inject(&self, protocol: NetworkProtocolNumber, data: &[u8]) -> bool {
        self.inject_from(LinkAddress::ZERO, protocol, data)
    }

    pub fn inject_from(&self, remote: LinkAddress, protocol: NetworkProtocolNumber, data: &[u8]) -> bool {
        let attached = self.dispatcher.read().clone();
        let Some((nic, dispatcher)) = attached else {
            return false;
        };
        let Some(dispatcher) = dispatcher.upgrade() else {
            return false;
        };
        let mut view = View::with_pool(Arc::clone(&self.pool));
        view.append(data);
        let pkt = PacketBuffer::new(PacketBufferOptions {
            data: VectorisedView::from(view),
            ..Default::default()
        });
        dispatcher.deliver_network_packet(nic, remote, protocol, pkt);
        true
    }
}

impl LinkEndpoint for ChannelEndpoint {
    fn mtu(&self) -> u32 {
        self.mtu
    }

    fn max_header_length(&self) -> usize {
        0
    }

    fn link_address(&self) -> LinkAddress {
        self.link_address
    }

    fn capabilities(&self) -> LinkCapabilities {
        self.capabilities
    }

    fn attach(&self, nic: NicId, dispatcher: Weak<dyn NetworkDispatcher>) {
        *self.dispatcher.write() = Some((nic, dispatcher));
    }

    fn write_packet(&self, route: &Route, protocol: NetworkProtocolNumber, pkt: PacketBuffer) -> Result<()> {
        let out = OutboundPacket {
            route: route.clone(),
            protocol,
            data: pkt.to_vec(),
        };
        trace!(nic = route.nic, len = out.data.len(), "link write");
        self.tx.try_send(out).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::WouldBlock,
            mpsc::error::TrySendError::Closed(_) => Error::ClosedForSend,
        })
    }
}

impl std::fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("mtu", &self.mtu)
            .field("link_address", &self.link_address)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
