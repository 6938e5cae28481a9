//! Packets as they move through the stack.
//!
//! A [`PacketBuffer`] is a [`View`] laid out as
//!
//! ```text
//! | reserved header space         | data ...                        |
//! |<- available ->|<- pushed ->|  |<- consumed ->|<- data_size ->|
//! ```
//!
//! Outgoing packets push headers backwards into the reserved space.
//! Incoming packets consume headers forwards out of the data. Both leave
//! the payload bytes where they are.

use super::conntrack::TrackedConn;
use crate::buffer::{Pool, Spans, VectorisedView, View};
use crate::tcpip::{NetworkProtocolNumber, NicId, PacketType, TransportProtocolNumber};
use crate::{Error, Result};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;

/// Header slots a packet keeps track of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderType {
    Link = 0,
    Network = 1,
    Transport = 2,
}

const NUM_HEADER_TYPE: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
struct HeaderInfo {
    offset: usize,
    length: usize,
}

/// NAT rewrites already applied to this packet.
///
/// Loopback traffic crosses both the outgoing and incoming hooks; these
/// flags stop the second pass from translating it again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NatDone {
    pub source: bool,
    pub destination: bool,
}

/// How to build a packet.
#[derive(Debug, Clone, Default)]
pub struct PacketBufferOptions {
    /// Header space set aside in front of `data`.
    pub reserve_header_bytes: usize,
    pub data: VectorisedView,
    pub is_forwarded_packet: bool,
}

#[derive(Debug, Clone)]
pub struct PacketBuffer {
    buf: View,
    reserved: usize,
    pushed: usize,
    consumed: usize,
    headers: [HeaderInfo; NUM_HEADER_TYPE],

    pub network_protocol_number: NetworkProtocolNumber,
    pub transport_protocol_number: Option<TransportProtocolNumber>,
    pub nat_done: NatDone,
    pub pkt_type: PacketType,
    /// NIC the packet arrived on, or 0 for locally generated packets.
    pub nic_id: NicId,
    pub is_forwarded_packet: bool,
    /// Connection the packet was matched to, if it is tracked.
    pub conn: Option<TrackedConn>,
}

impl PacketBuffer {
    pub fn new(opts: PacketBufferOptions) -> Self {
        let pool = opts
            .data
            .views()
            .next()
            .map_or_else(Pool::shared, |v| Arc::clone(v.pool()));
        let mut buf = View::with_pool(pool);
        buf.prepend_zeroed(opts.reserve_header_bytes);
        for view in opts.data.into_views() {
            buf.append_view(view);
        }
        Self {
            buf,
            reserved: opts.reserve_header_bytes,
            pushed: 0,
            consumed: 0,
            headers: [HeaderInfo::default(); NUM_HEADER_TYPE],
            network_protocol_number: NetworkProtocolNumber(0),
            transport_protocol_number: None,
            nat_done: NatDone::default(),
            pkt_type: PacketType::Host,
            nic_id: 0,
            is_forwarded_packet: opts.is_forwarded_packet,
            conn: None,
        }
    }

    /// An inbound packet carrying `data` with no reserved space.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::new(PacketBufferOptions {
            data: VectorisedView::from(data),
            ..Default::default()
        })
    }

    pub fn reserved_header_bytes(&self) -> usize {
        self.reserved
    }

    /// Reserved bytes not yet used by pushed headers.
    pub fn available_header_bytes(&self) -> usize {
        self.reserved - self.pushed
    }

    /// Offset of the first byte of the packet as it would be put on the
    /// wire.
    pub fn header_offset(&self) -> usize {
        self.reserved - self.pushed
    }

    /// Claim `n` bytes directly in front of the headers pushed so far and
    /// return them for the caller to fill in.
    pub fn push_header(&mut self, typ: HeaderType, n: usize) -> Result<&mut [u8]> {
        debug_assert_eq!(
            self.headers[typ as usize].length,
            0,
            "{:?} header pushed twice",
            typ
        );
        if n > self.available_header_bytes() {
            return Err(Error::BufferTooSmall);
        }
        self.pushed += n;
        let offset = self.reserved - self.pushed;
        self.headers[typ as usize] = HeaderInfo { offset, length: n };
        self.buf
            .contiguous_mut(offset, n)
            .ok_or(Error::BufferTooSmall)
    }

    /// Mark the next `n` bytes of data as header `typ`.
    pub fn consume_header(&mut self, typ: HeaderType, n: usize) -> Result<()> {
        debug_assert_eq!(
            self.headers[typ as usize].length,
            0,
            "{:?} header consumed twice",
            typ
        );
        if n > self.data_size() {
            return Err(Error::BufferTooSmall);
        }
        self.headers[typ as usize] = HeaderInfo {
            offset: self.reserved + self.consumed,
            length: n,
        };
        self.consumed += n;
        Ok(())
    }

    /// Bytes of header `typ`, or `None` if it was never pushed or
    /// consumed.
    pub fn header(&self, typ: HeaderType) -> Option<Cow<'_, [u8]>> {
        let info = self.headers[typ as usize];
        if info.length == 0 {
            return None;
        }
        self.buf.contiguous(info.offset, info.length)
    }

    pub fn header_len(&self, typ: HeaderType) -> usize {
        self.headers[typ as usize].length
    }

    pub fn link_header(&self) -> Option<Cow<'_, [u8]>> {
        self.header(HeaderType::Link)
    }

    pub fn network_header(&self) -> Option<Cow<'_, [u8]>> {
        self.header(HeaderType::Network)
    }

    pub fn transport_header(&self) -> Option<Cow<'_, [u8]>> {
        self.header(HeaderType::Transport)
    }

    /// Modify header `typ` in place. Shared storage is copied first.
    pub fn update_header(&mut self, typ: HeaderType, f: impl FnOnce(&mut [u8])) -> Result<()> {
        let info = self.headers[typ as usize];
        if info.length == 0 {
            return Err(Error::MalformedHeader);
        }
        if let Some(bytes) = self.buf.contiguous_mut(info.offset, info.length) {
            f(bytes);
            return Ok(());
        }
        let mut bytes = self
            .buf
            .contiguous(info.offset, info.length)
            .ok_or(Error::BufferTooSmall)?
            .into_owned();
        f(&mut bytes);
        self.buf.write_at(info.offset, &bytes)
    }

    /// Payload bytes not claimed by any consumed header.
    pub fn data_size(&self) -> usize {
        self.buf.size() - self.reserved - self.consumed
    }

    /// The first `n` payload bytes, for peeking at a header before
    /// consuming it.
    pub fn data_head(&self, n: usize) -> Option<Cow<'_, [u8]>> {
        self.buf.contiguous(self.reserved + self.consumed, n)
    }

    /// Spans over the payload.
    pub fn data(&self) -> Spans<'_> {
        self.buf.spans(self.reserved + self.consumed, self.data_size())
    }

    pub fn data_to_vec(&self) -> Vec<u8> {
        self.data().flatten().copied().collect()
    }

    /// Drop payload past the first `len` bytes (link padding).
    pub fn cap_data(&mut self, len: usize) {
        if len < self.data_size() {
            self.buf.truncate(self.reserved + self.consumed + len);
        }
    }

    /// Total wire size: pushed headers, consumed headers and payload.
    pub fn size(&self) -> usize {
        self.buf.size() - self.header_offset()
    }

    /// Spans covering the whole packet in wire order.
    pub fn views(&self) -> Spans<'_> {
        self.buf.spans(self.header_offset(), self.size())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.views().flatten().copied().collect()
    }

    /// An inbound copy of an outgoing packet, sharing its bytes. Used for
    /// loopback; NAT flags and the tracked connection carry over.
    pub fn clone_to_inbound(&self) -> PacketBuffer {
        let mut pkt = PacketBuffer::new(PacketBufferOptions {
            data: VectorisedView::from(self.buf.sub_view(self.header_offset(), self.size())),
            ..Default::default()
        });
        pkt.nat_done = self.nat_done;
        pkt.conn = self.conn.clone();
        pkt
    }

    /// A packet for forwarding out of another NIC: fresh header space and
    /// the network and transport headers already accounted for.
    pub fn clone_for_forwarding(&self, reserve_header_bytes: usize) -> Result<PacketBuffer> {
        let net = self.headers[HeaderType::Network as usize];
        let start = if net.length > 0 {
            net.offset
        } else {
            self.reserved + self.consumed
        };
        let mut pkt = PacketBuffer::new(PacketBufferOptions {
            reserve_header_bytes,
            data: VectorisedView::from(self.buf.sub_view(start, self.buf.size() - start)),
            is_forwarded_packet: true,
        });
        pkt.network_protocol_number = self.network_protocol_number;
        pkt.transport_protocol_number = self.transport_protocol_number;
        pkt.nat_done = self.nat_done;
        pkt.conn = self.conn.clone();
        if net.length > 0 {
            pkt.consume_header(HeaderType::Network, net.length)?;
        }
        let trans_len = self.header_len(HeaderType::Transport);
        if trans_len > 0 {
            pkt.consume_header(HeaderType::Transport, trans_len)?;
        }
        Ok(pkt)
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new(PacketBufferOptions::default())
    }
}

/// FIFO of packets.
#[derive(Debug, Default)]
pub struct PacketBufferList {
    pkts: VecDeque<PacketBuffer>,
}

impl PacketBufferList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, pkt: PacketBuffer) {
        self.pkts.push_back(pkt);
    }

    pub fn pop_front(&mut self) -> Option<PacketBuffer> {
        self.pkts.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pkts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PacketBuffer> {
        self.pkts.iter()
    }
}

impl IntoIterator for PacketBufferList {
    type Item = PacketBuffer;
    type IntoIter = std::collections::vec_deque::IntoIter<PacketBuffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.pkts.into_iter()
    }
}

impl FromIterator<PacketBuffer> for PacketBufferList {
    fn from_iter<I: IntoIterator<Item = PacketBuffer>>(iter: I) -> Self {
        Self {
            pkts: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::EMBEDDED_COUNT;

    fn make_outgoing(reserve: usize, payload: &[u8]) -> PacketBuffer {
        PacketBuffer::new(PacketBufferOptions {
            reserve_header_bytes: reserve,
            data: VectorisedView::from(payload),
            ..Default::default()
        })
    }

    #[test]
    fn test_push_headers_in_wire_order() {
        let mut pkt = make_outgoing(10, b"");
        pkt.push_header(HeaderType::Transport, 2).unwrap().copy_from_slice(b"TT");
        pkt.push_header(HeaderType::Network, 3).unwrap().copy_from_slice(b"NNN");
        pkt.push_header(HeaderType::Link, 4).unwrap().copy_from_slice(b"LLLL");

        assert_eq!(pkt.header_offset(), 10 - 9);
        assert_eq!(pkt.size(), 9);
        assert_eq!(pkt.to_vec(), b"LLLLNNNTT");
        assert_eq!(pkt.network_header().unwrap().as_ref(), b"NNN");
    }

    #[test]
    fn test_push_beyond_reserve_fails_cleanly() {
        let mut pkt = make_outgoing(4, b"payload");
        pkt.push_header(HeaderType::Transport, 3).unwrap().copy_from_slice(b"abc");
        assert!(matches!(
            pkt.push_header(HeaderType::Network, 2),
            Err(Error::BufferTooSmall)
        ));
        assert_eq!(pkt.header_offset(), 1);
        assert_eq!(pkt.to_vec(), b"abcpayload");
    }

    #[test]
    fn test_consume_headers() {
        let mut pkt = PacketBuffer::from_bytes(b"NNNNTTpayload");
        pkt.consume_header(HeaderType::Network, 4).unwrap();
        pkt.consume_header(HeaderType::Transport, 2).unwrap();
        assert_eq!(pkt.network_header().unwrap().as_ref(), b"NNNN");
        assert_eq!(pkt.transport_header().unwrap().as_ref(), b"TT");
        assert_eq!(pkt.data_size(), 7);
        assert_eq!(pkt.data_to_vec(), b"payload");
        assert_eq!(pkt.size(), 13);
    }

    #[test]
    fn test_consume_beyond_data_fails() {
        let mut pkt = PacketBuffer::from_bytes(b"abc");
        assert!(matches!(
            pkt.consume_header(HeaderType::Network, 4),
            Err(Error::BufferTooSmall)
        ));
        assert!(pkt.network_header().is_none());
        assert_eq!(pkt.data_size(), 3);
    }

    #[test]
    fn test_views_restartable() {
        let pkt = make_outgoing(0, b"hello");
        let views = pkt.views();
        let first: Vec<u8> = views.clone().flatten().copied().collect();
        let second: Vec<u8> = views.flatten().copied().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_clone_is_copy_on_write() {
        let mut pkt = PacketBuffer::from_bytes(b"NNNNpayload");
        pkt.consume_header(HeaderType::Network, 4).unwrap();
        let snapshot = pkt.clone();

        pkt.update_header(HeaderType::Network, |h| h.copy_from_slice(b"XXXX"))
            .unwrap();
        assert_eq!(pkt.network_header().unwrap().as_ref(), b"XXXX");
        assert_eq!(snapshot.network_header().unwrap().as_ref(), b"NNNN");
    }

    #[test]
    fn test_update_missing_header() {
        let mut pkt = PacketBuffer::from_bytes(b"abc");
        assert!(pkt.update_header(HeaderType::Transport, |_| {}).is_err());
    }

    #[test]
    fn test_clone_to_inbound() {
        let mut pkt = make_outgoing(8, b"data");
        pkt.push_header(HeaderType::Network, 4).unwrap().copy_from_slice(b"HDR!");
        pkt.nat_done.destination = true;

        let mut inbound = pkt.clone_to_inbound();
        assert_eq!(inbound.reserved_header_bytes(), 0);
        assert_eq!(inbound.data_to_vec(), b"HDR!data");
        assert!(inbound.nat_done.destination);
        inbound.consume_header(HeaderType::Network, 4).unwrap();
        assert_eq!(inbound.data_to_vec(), b"data");
    }

    #[test]
    fn test_clone_for_forwarding() {
        let mut pkt = PacketBuffer::from_bytes(b"LLNNNNTTdata");
        pkt.consume_header(HeaderType::Link, 2).unwrap();
        pkt.consume_header(HeaderType::Network, 4).unwrap();
        pkt.consume_header(HeaderType::Transport, 2).unwrap();

        let mut fwd = pkt.clone_for_forwarding(14).unwrap();
        assert!(fwd.is_forwarded_packet);
        assert!(fwd.link_header().is_none());
        assert_eq!(fwd.network_header().unwrap().as_ref(), b"NNNN");
        assert_eq!(fwd.transport_header().unwrap().as_ref(), b"TT");
        assert_eq!(fwd.to_vec(), b"NNNNTTdata");
        fwd.push_header(HeaderType::Link, 14).unwrap();
        assert_eq!(fwd.size(), 24);
    }

    #[test]
    fn test_clone_for_forwarding_without_network_header() {
        let mut pkt = PacketBuffer::from_bytes(b"TTTTTTTT");
        pkt.consume_header(HeaderType::Transport, 8).unwrap();
        assert!(matches!(pkt.clone_for_forwarding(14), Err(Error::BufferTooSmall)));
    }

    #[test]
    fn test_header_space_drawn_from_payload_pool() {
        let pool = Arc::new(Pool::with_buffer_size(64));
        let mut payload = View::with_pool(Arc::clone(&pool));
        payload.append(b"data");
        let pkt = PacketBuffer::new(PacketBufferOptions {
            reserve_header_bytes: 20,
            data: VectorisedView::from(payload),
            ..Default::default()
        });
        assert_eq!(pool.cached(), EMBEDDED_COUNT - 2);
        drop(pkt);
        assert_eq!(pool.cached(), EMBEDDED_COUNT);
    }

    #[test]
    fn test_cap_data() {
        let mut pkt = PacketBuffer::from_bytes(b"abcdefgh");
        pkt.consume_header(HeaderType::Network, 2).unwrap();
        pkt.cap_data(3);
        assert_eq!(pkt.data_to_vec(), b"cde");
        assert_eq!(pkt.size(), 5);
    }

    #[test]
    fn test_list_fifo() {
        let mut list: PacketBufferList = [b"a", b"b"]
            .iter()
            .map(|d| PacketBuffer::from_bytes(&d[..]))
            .collect();
        list.push_back(PacketBuffer::from_bytes(b"c"));
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front().unwrap().to_vec(), b"a");
        let rest: Vec<Vec<u8>> = list.into_iter().map(|p| p.to_vec()).collect();
        assert_eq!(rest, vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
