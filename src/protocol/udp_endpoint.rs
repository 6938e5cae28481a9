//! UDP sockets.

use super::udp::{HEADER_SIZE, outgoing_checksum, verify_checksum, write_header};
use crate::buffer::VectorisedView;
use crate::ports::{Flags, Reservation};
use crate::stack::packet_buffer::{HeaderType, PacketBuffer, PacketBufferOptions};
use crate::stack::registration::{Endpoint, TransportEndpoint, TransportEndpointId};
use crate::stack::route::Route;
use crate::stack::Stack;
use crate::tcpip::{
    ANY_NIC, FullAddress, NetworkProtocolNumber, NicId, ReadOptions, ReadResult, SocketOptions,
    TransportProtocolNumber, WriteOptions, is_multicast_or_broadcast,
};
use crate::waiter::{EventMask, Queue};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

const UDP: TransportProtocolNumber = TransportProtocolNumber::UDP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initial,
    Bound,
    Connected,
    Closed,
}

#[derive(Debug)]
struct EndpointState {
    phase: Phase,
    /// What the endpoint is registered under with the demuxer.
    id: TransportEndpointId,
    bind_nic: NicId,
    flags: Flags,
    /// Reservation backing `id.local_port`, with the port it returned.
    reservation: Option<(Reservation, u16)>,
    route: Option<Route>,
}

#[derive(Debug)]
struct Datagram {
    sender: FullAddress,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct ReceiveQueue {
    datagrams: VecDeque<Datagram>,
    bytes: usize,
    closed: bool,
}

/// A UDP endpoint. Registered with the demuxer once bound; packets land
/// in a receive queue bounded by the socket's receive buffer size.
pub struct UdpEndpoint {
    weak_self: Weak<UdpEndpoint>,
    stack: Weak<Stack>,
    unique_id: u64,
    net_proto: NetworkProtocolNumber,
    send_checksum: bool,
    state: Mutex<EndpointState>,
    rcv: Mutex<ReceiveQueue>,
    waiter: Queue,
    opts: SocketOptions,
}

impl UdpEndpoint {
    pub fn new(stack: &Arc<Stack>, net_proto: NetworkProtocolNumber, send_checksum: bool) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            stack: Arc::downgrade(stack),
            unique_id: stack.unique_id(),
            net_proto,
            send_checksum,
            state: Mutex::new(EndpointState {
                phase: Phase::Initial,
                id: TransportEndpointId::default(),
                bind_nic: ANY_NIC,
                flags: Flags::default(),
                reservation: None,
                route: None,
            }),
            rcv: Mutex::new(ReceiveQueue::default()),
            waiter: Queue::new(),
            opts: SocketOptions::new(),
        })
    }

    fn stack(&self) -> Result<Arc<Stack>> {
        self.stack.upgrade().ok_or(Error::InvalidEndpointState)
    }

    fn as_transport(&self) -> Result<Arc<dyn TransportEndpoint>> {
        let ep: Arc<dyn TransportEndpoint> = self.weak_self.upgrade().ok_or(Error::InvalidEndpointState)?;
        Ok(ep)
    }

    fn bind_locked(&self, stack: &Stack, st: &mut EndpointState, addr: FullAddress) -> Result<()> {
        let flags = self.opts.bind_flags();
        let res = Reservation {
            network: self.net_proto,
            transport: UDP,
            addr: addr.addr,
            port: addr.port,
            flags,
            nic: addr.nic,
        };
        let port = stack.ports().reserve(&res, |_| true)?;
        let id = TransportEndpointId {
            local_port: port,
            local_address: addr.addr,
            ..Default::default()
        };
        let registered = self
            .as_transport()
            .and_then(|ep| stack.register_transport_endpoint(self.net_proto, UDP, id, ep, flags, addr.nic));
        if let Err(e) = registered {
            stack.ports().release(&res, port);
            return Err(e);
        }

        st.phase = Phase::Bound;
        st.id = id;
        st.bind_nic = addr.nic;
        st.flags = flags;
        st.reservation = Some((res, port));
        debug!(port, address = ?addr.addr, nic = addr.nic, "udp endpoint bound");
        Ok(())
    }

    /// Move the demuxer registration from the current id to `id`.
    fn reregister_locked(&self, stack: &Stack, st: &mut EndpointState, id: TransportEndpointId) -> Result<()> {
        stack.unregister_transport_endpoint(self.net_proto, UDP, &st.id, self.unique_id, st.flags, st.bind_nic);
        let ep = self.as_transport()?;
        if let Err(e) = stack.register_transport_endpoint(self.net_proto, UDP, id, ep.clone(), st.flags, st.bind_nic) {
            if let Err(restore) = stack.register_transport_endpoint(self.net_proto, UDP, st.id, ep, st.flags, st.bind_nic) {
                warn!(id = ?st.id, error = %restore, "udp endpoint lost its registration");
            }
            return Err(e);
        }
        st.id = id;
        Ok(())
    }

    fn nic_for(st: &EndpointState, requested: NicId) -> Option<NicId> {
        match (requested, st.bind_nic) {
            (ANY_NIC, ANY_NIC) => None,
            (ANY_NIC, nic) | (nic, _) => Some(nic),
        }
    }
}

impl Endpoint for UdpEndpoint {
    fn bind(&self, addr: FullAddress) -> Result<()> {
        let stack = self.stack()?;
        let mut st = self.state.lock();
        if st.phase != Phase::Initial {
            return Err(Error::InvalidEndpointState);
        }
        if let Some(a) = addr.addr {
            if !is_multicast_or_broadcast(&a) && !stack.is_local_address(&a) {
                return Err(Error::BadLocalAddress);
            }
        }
        self.bind_locked(&stack, &mut st, addr)
    }

    fn connect(&self, addr: FullAddress) -> Result<()> {
        let remote = addr.addr.ok_or(Error::DestinationRequired)?;
        let stack = self.stack()?;
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            return Err(Error::InvalidEndpointState);
        }
        let route = stack.find_route(Self::nic_for(&st, addr.nic), st.id.local_address, remote, self.net_proto)?;
        if st.phase == Phase::Initial {
            let local = FullAddress {
                nic: ANY_NIC,
                addr: Some(route.local_address),
                port: 0,
            };
            self.bind_locked(&stack, &mut st, local)?;
        }

        let id = TransportEndpointId {
            local_port: st.id.local_port,
            local_address: Some(route.local_address),
            remote_port: addr.port,
            remote_address: Some(remote),
        };
        self.reregister_locked(&stack, &mut st, id)?;
        st.phase = Phase::Connected;
        st.route = Some(route);
        Ok(())
    }

    fn read(&self, dst: &mut [u8], opts: ReadOptions) -> Result<ReadResult> {
        let mut rcv = self.rcv.lock();
        let Some(front) = rcv.datagrams.front() else {
            return Err(if rcv.closed {
                Error::ClosedForReceive
            } else {
                Error::WouldBlock
            });
        };
        let count = dst.len().min(front.data.len());
        dst[..count].copy_from_slice(&front.data[..count]);
        let result = ReadResult {
            count,
            total: front.data.len(),
            remote_addr: opts.need_remote_addr.then_some(front.sender),
        };
        if !opts.peek {
            if let Some(d) = rcv.datagrams.pop_front() {
                rcv.bytes -= d.data.len();
            }
        }
        Ok(result)
    }

    fn write(&self, data: &[u8], opts: WriteOptions) -> Result<usize> {
        if data.len() > u16::MAX as usize - HEADER_SIZE {
            return Err(Error::MessageTooLong);
        }
        let stack = self.stack.upgrade().ok_or(Error::ClosedForSend)?;
        let (route, local_port, remote_port) = {
            let mut st = self.state.lock();
            if st.phase == Phase::Closed {
                return Err(Error::ClosedForSend);
            }
            match opts.to {
                Some(to) => {
                    let remote = to.addr.ok_or(Error::DestinationRequired)?;
                    if st.phase == Phase::Initial {
                        self.bind_locked(&stack, &mut st, FullAddress::default())?;
                    }
                    let route =
                        stack.find_route(Self::nic_for(&st, to.nic), st.id.local_address, remote, self.net_proto)?;
                    (route, st.id.local_port, to.port)
                }
                None => {
                    let route = st.route.clone().ok_or(Error::DestinationRequired)?;
                    (route, st.id.local_port, st.id.remote_port)
                }
            }
        };

        let net = stack
            .protocols()
            .network(self.net_proto)
            .ok_or(Error::UnknownProtocol)?;
        let reserve = HEADER_SIZE + net.max_header_length() + stack.nic(route.nic)?.link().max_header_length();
        let mut view = stack.new_view();
        view.append(data);
        let mut pkt = PacketBuffer::new(PacketBufferOptions {
            reserve_header_bytes: reserve,
            data: VectorisedView::from(view),
            ..Default::default()
        });
        let hdr = pkt.push_header(HeaderType::Transport, HEADER_SIZE)?;
        write_header(hdr, local_port, remote_port, HEADER_SIZE + data.len());
        let enabled = self.send_checksum && !self.opts.flags().no_checksum;
        let sum = outgoing_checksum(&pkt, route.local_address, route.remote_address, enabled);
        pkt.update_header(HeaderType::Transport, |h| h[6..8].copy_from_slice(&sum.to_be_bytes()))?;

        stack.write_packet(&route, UDP, pkt)?;
        Ok(data.len())
    }

    fn close(&self) {
        let mut st = self.state.lock();
        if st.phase == Phase::Closed {
            return;
        }
        if let Some(stack) = self.stack.upgrade() {
            if st.phase != Phase::Initial {
                stack.unregister_transport_endpoint(self.net_proto, UDP, &st.id, self.unique_id, st.flags, st.bind_nic);
            }
            if let Some((res, port)) = st.reservation.take() {
                stack.ports().release(&res, port);
            }
        }
        st.phase = Phase::Closed;
        st.route = None;
        drop(st);

        {
            let mut rcv = self.rcv.lock();
            rcv.closed = true;
            rcv.datagrams.clear();
            rcv.bytes = 0;
        }
        self.waiter.notify(EventMask::READABLE | EventMask::HUP);
    }

    fn local_address(&self) -> Result<FullAddress> {
        let st = self.state.lock();
        Ok(FullAddress {
            nic: st.bind_nic,
            addr: st.id.local_address,
            port: st.id.local_port,
        })
    }

    fn remote_address(&self) -> Result<FullAddress> {
        let st = self.state.lock();
        if st.phase != Phase::Connected {
            return Err(Error::InvalidEndpointState);
        }
        Ok(FullAddress {
            nic: st.bind_nic,
            addr: st.id.remote_address,
            port: st.id.remote_port,
        })
    }

    fn readiness(&self, mask: EventMask) -> EventMask {
        let mut ready = EventMask::empty();
        let rcv = self.rcv.lock();
        if !rcv.datagrams.is_empty() || rcv.closed {
            ready |= EventMask::READABLE;
        }
        if !rcv.closed {
            ready |= EventMask::WRITABLE;
        }
        ready & mask
    }

    fn waiter_queue(&self) -> &Queue {
        &self.waiter
    }

    fn socket_options(&self) -> &SocketOptions {
        &self.opts
    }
}

impl TransportEndpoint for UdpEndpoint {
    fn unique_id(&self) -> u64 {
        self.unique_id
    }

    fn handle_packet(&self, id: &TransportEndpointId, pkt: PacketBuffer) {
        let (Some(remote), Some(local)) = (id.remote_address, id.local_address) else {
            return;
        };
        if !verify_checksum(&pkt, remote, local) {
            trace!(%remote, "udp checksum mismatch");
            return;
        }
        let size = pkt.data_size();
        {
            let mut rcv = self.rcv.lock();
            if rcv.closed {
                return;
            }
            if rcv.bytes + size > self.opts.receive_buffer_size() {
                trace!(port = id.local_port, "receive buffer full, dropping");
                return;
            }
            rcv.bytes += size;
            rcv.datagrams.push_back(Datagram {
                sender: FullAddress {
                    nic: pkt.nic_id,
                    addr: Some(remote),
                    port: id.remote_port,
                },
                data: pkt.data_to_vec(),
            });
        }
        self.waiter.notify(EventMask::READABLE);
    }
}

impl fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("unique_id", &self.unique_id)
            .field("state", &*self.state.lock())
            .finish()
    }
}
