//! UDP - RFC 768

use super::checksum::{Checksum, pseudo_header};
use super::udp_endpoint::UdpEndpoint;
use crate::stack::packet_buffer::{HeaderType, PacketBuffer};
use crate::stack::registration::{
    Endpoint, ProtocolOption, ProtocolOptionName, TransportEndpointId, TransportProtocol,
    UnknownDestinationDisposition,
};
use crate::stack::Stack;
use crate::tcpip::{NetworkProtocolNumber, TransportProtocolNumber, is_multicast_or_broadcast};
use crate::{Error, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// UDP header size (fixed)
pub const HEADER_SIZE: usize = 8;

/// Parsed UDP header (zero-copy reference)
#[derive(Debug)]
pub struct UdpHeader<'a> {
    buffer: &'a [u8],
}

impl<'a> UdpHeader<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("UDP header too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Header plus data.
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    /// 0 means no checksum (IPv4 only).
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

/// Checksum over the pseudo-header, `header` and `data`. `header` is
/// summed as given, so zero its checksum field to compute a fresh one.
pub fn udp_checksum<'a>(
    src: IpAddr,
    dst: IpAddr,
    header: &[u8],
    data: impl IntoIterator<Item = &'a [u8]>,
) -> u16 {
    let data: Vec<&[u8]> = data.into_iter().collect();
    let length = header.len() + data.iter().map(|d| d.len()).sum::<usize>();
    let mut sum: Checksum = pseudo_header(src, dst, TransportProtocolNumber::UDP.0, length);
    sum.add(header);
    for span in data {
        sum.add(span);
    }
    sum.finish()
}

/// A computed checksum of zero goes on the wire as all ones; zero means
/// "none".
fn wire_checksum(sum: u16) -> u16 {
    if sum == 0 { 0xFFFF } else { sum }
}

/// Builds UDP datagrams with a valid checksum.
#[derive(Debug, Clone, Default)]
pub struct UdpBuilder {
    src_port: u16,
    dst_port: u16,
    payload: Vec<u8>,
}

impl UdpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    pub fn build(self, src_ip: IpAddr, dst_ip: IpAddr) -> Vec<u8> {
        let length = HEADER_SIZE + self.payload.len();
        let mut buffer = vec![0u8; length];
        write_header(&mut buffer[..HEADER_SIZE], self.src_port, self.dst_port, length);
        buffer[HEADER_SIZE..].copy_from_slice(&self.payload);
        let sum = udp_checksum(src_ip, dst_ip, &buffer, std::iter::empty());
        buffer[6..8].copy_from_slice(&wire_checksum(sum).to_be_bytes());
        buffer
    }
}

/// Fill in ports and length, leaving the checksum zero.
pub(crate) fn write_header(hdr: &mut [u8], src_port: u16, dst_port: u16, length: usize) {
    hdr[0..2].copy_from_slice(&src_port.to_be_bytes());
    hdr[2..4].copy_from_slice(&dst_port.to_be_bytes());
    hdr[4..6].copy_from_slice(&(length as u16).to_be_bytes());
    hdr[6..8].fill(0);
}

/// Checksum to put in the header of an outgoing datagram, or 0 when
/// checksums are off. IPv6 always carries one.
pub(crate) fn outgoing_checksum(pkt: &PacketBuffer, src: IpAddr, dst: IpAddr, enabled: bool) -> u16 {
    if !enabled && src.is_ipv4() {
        return 0;
    }
    let Some(hdr) = pkt.transport_header() else {
        return 0;
    };
    wire_checksum(udp_checksum(src, dst, &hdr, pkt.data()))
}

/// Whether an incoming datagram's checksum is acceptable.
pub(crate) fn verify_checksum(pkt: &PacketBuffer, src: IpAddr, dst: IpAddr) -> bool {
    let Some(hdr) = pkt.transport_header() else {
        return false;
    };
    if hdr.len() < HEADER_SIZE {
        return false;
    }
    if hdr[6] == 0 && hdr[7] == 0 {
        return src.is_ipv4();
    }
    udp_checksum(src, dst, &hdr, pkt.data()) == 0
}

/// The UDP transport protocol plug-in.
#[derive(Debug)]
pub struct UdpProtocol {
    send_checksum: AtomicBool,
}

impl UdpProtocol {
    pub fn new() -> Self {
        Self {
            send_checksum: AtomicBool::new(true),
        }
    }

    pub fn send_checksum(&self) -> bool {
        self.send_checksum.load(Ordering::Relaxed)
    }
}

impl Default for UdpProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportProtocol for UdpProtocol {
    fn number(&self) -> TransportProtocolNumber {
        TransportProtocolNumber::UDP
    }

    fn minimum_packet_size(&self) -> usize {
        HEADER_SIZE
    }

    fn parse_ports(&self, hdr: &[u8]) -> Option<(u16, u16)> {
        if hdr.len() < 4 {
            return None;
        }
        Some((
            u16::from_be_bytes([hdr[0], hdr[1]]),
            u16::from_be_bytes([hdr[2], hdr[3]]),
        ))
    }

    fn parse(&self, pkt: &mut PacketBuffer) -> bool {
        let length = match pkt.data_head(HEADER_SIZE) {
            Some(head) => u16::from_be_bytes([head[4], head[5]]) as usize,
            None => return false,
        };
        if length < HEADER_SIZE || length > pkt.data_size() {
            return false;
        }
        if pkt.consume_header(HeaderType::Transport, HEADER_SIZE).is_err() {
            return false;
        }
        pkt.cap_data(length - HEADER_SIZE);
        true
    }

    fn new_endpoint(&self, stack: &Arc<Stack>, network: NetworkProtocolNumber) -> Result<Arc<dyn Endpoint>> {
        Ok(UdpEndpoint::new(stack, network, self.send_checksum()))
    }

    fn handle_unknown_destination_packet(
        &self,
        id: &TransportEndpointId,
        _pkt: &PacketBuffer,
    ) -> UnknownDestinationDisposition {
        // Nobody answers group traffic with an error.
        if id.local_address.is_some_and(|a| is_multicast_or_broadcast(&a)) {
            return UnknownDestinationDisposition::Handled;
        }
        UnknownDestinationDisposition::Unhandled
    }

    fn rewrite_ports(
        &self,
        pkt: &mut PacketBuffer,
        addrs: (IpAddr, IpAddr),
        src_port: Option<u16>,
        dst_port: Option<u16>,
    ) -> Result<()> {
        let mut hdr = pkt
            .transport_header()
            .ok_or(Error::MalformedHeader)?
            .into_owned();
        if hdr.len() < HEADER_SIZE {
            return Err(Error::MalformedHeader);
        }
        if let Some(port) = src_port {
            hdr[0..2].copy_from_slice(&port.to_be_bytes());
        }
        if let Some(port) = dst_port {
            hdr[2..4].copy_from_slice(&port.to_be_bytes());
        }
        // A datagram sent without a checksum stays without one.
        let had_checksum = hdr[6] != 0 || hdr[7] != 0;
        if had_checksum || addrs.0.is_ipv6() {
            hdr[6..8].fill(0);
            let sum = wire_checksum(udp_checksum(addrs.0, addrs.1, &hdr, pkt.data()));
            hdr[6..8].copy_from_slice(&sum.to_be_bytes());
        }
        pkt.update_header(HeaderType::Transport, |h| h.copy_from_slice(&hdr))
    }

    fn set_option(&self, opt: ProtocolOption) -> Result<()> {
        match opt {
            ProtocolOption::SendChecksum(on) => {
                self.send_checksum.store(on, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(Error::UnknownProtocolOption),
        }
    }

    fn option(&self, name: ProtocolOptionName) -> Result<ProtocolOption> {
        match name {
            ProtocolOptionName::SendChecksum => Ok(ProtocolOption::SendChecksum(self.send_checksum())),
            _ => Err(Error::UnknownProtocolOption),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn make_datagram() -> Vec<u8> {
        UdpBuilder::new()
            .src_port(12345)
            .dst_port(53)
            .payload(b"test")
            .build(addr("192.168.1.100"), addr("8.8.8.8"))
    }

    fn make_parsed(dgram: &[u8]) -> PacketBuffer {
        let mut pkt = PacketBuffer::from_bytes(dgram);
        pkt.transport_protocol_number = Some(TransportProtocolNumber::UDP);
        assert!(UdpProtocol::new().parse(&mut pkt));
        pkt
    }

    #[test]
    fn test_header_parse() {
        let dgram = make_datagram();
        let hdr = UdpHeader::parse(&dgram).unwrap();
        assert_eq!(hdr.src_port(), 12345);
        assert_eq!(hdr.dst_port(), 53);
        assert_eq!(hdr.length(), 12);
        assert_eq!(hdr.payload(), b"test");
        assert_ne!(hdr.checksum(), 0);
        assert!(UdpHeader::parse(&dgram[..7]).is_err());
    }

    #[test]
    fn test_checksum_split_payload_matches_contiguous() {
        let dgram = make_datagram();
        let (src, dst) = (addr("192.168.1.100"), addr("8.8.8.8"));
        assert_eq!(udp_checksum(src, dst, &dgram, std::iter::empty()), 0);
        assert_eq!(udp_checksum(src, dst, &dgram[..8], [&dgram[8..9], &dgram[9..]]), 0);
    }

    #[test]
    fn test_parse_caps_to_length() {
        let mut dgram = make_datagram();
        dgram.extend_from_slice(&[0xAA; 3]);
        let pkt = make_parsed(&dgram);
        assert_eq!(pkt.data_to_vec(), b"test");
        assert_eq!(UdpProtocol::new().parse_ports(&pkt.transport_header().unwrap()), Some((12345, 53)));
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        let proto = UdpProtocol::new();
        let mut dgram = make_datagram();
        dgram[4..6].copy_from_slice(&100u16.to_be_bytes());
        assert!(!proto.parse(&mut PacketBuffer::from_bytes(&dgram)));
        dgram[4..6].copy_from_slice(&4u16.to_be_bytes());
        assert!(!proto.parse(&mut PacketBuffer::from_bytes(&dgram)));
        assert!(!proto.parse(&mut PacketBuffer::from_bytes(&[0u8; 5])));
    }

    #[test]
    fn test_verify_checksum() {
        let (src, dst) = (addr("192.168.1.100"), addr("8.8.8.8"));
        let mut dgram = make_datagram();
        assert!(verify_checksum(&make_parsed(&dgram), src, dst));
        assert!(!verify_checksum(&make_parsed(&dgram), src, addr("8.8.4.4")));

        dgram[6..8].fill(0);
        assert!(verify_checksum(&make_parsed(&dgram), src, dst));
    }

    #[test]
    fn test_rewrite_ports_recomputes_checksum() {
        let proto = UdpProtocol::new();
        let mut pkt = make_parsed(&make_datagram());
        let new_addrs = (addr("203.0.113.1"), addr("8.8.8.8"));
        proto.rewrite_ports(&mut pkt, new_addrs, Some(40000), None).unwrap();

        assert_eq!(proto.parse_ports(&pkt.transport_header().unwrap()), Some((40000, 53)));
        assert!(verify_checksum(&pkt, new_addrs.0, new_addrs.1));
    }

    #[test]
    fn test_rewrite_ports_keeps_missing_checksum() {
        let proto = UdpProtocol::new();
        let mut dgram = make_datagram();
        dgram[6..8].fill(0);
        let mut pkt = make_parsed(&dgram);
        proto
            .rewrite_ports(&mut pkt, (addr("10.0.0.1"), addr("10.0.0.2")), None, Some(8080))
            .unwrap();
        let hdr = pkt.transport_header().unwrap();
        assert_eq!(&hdr[6..8], &[0, 0]);
        assert_eq!(&hdr[2..4], &8080u16.to_be_bytes());
    }

    #[test]
    fn test_unknown_destination() {
        let proto = UdpProtocol::new();
        let pkt = PacketBuffer::default();
        let unicast = TransportEndpointId {
            local_port: 9,
            local_address: Some(addr("10.0.0.1")),
            ..Default::default()
        };
        assert_eq!(
            proto.handle_unknown_destination_packet(&unicast, &pkt),
            UnknownDestinationDisposition::Unhandled
        );
        let broadcast = TransportEndpointId {
            local_address: Some(addr("255.255.255.255")),
            ..unicast
        };
        assert_eq!(
            proto.handle_unknown_destination_packet(&broadcast, &pkt),
            UnknownDestinationDisposition::Handled
        );
    }

    #[test]
    fn test_send_checksum_option() {
        let proto = UdpProtocol::new();
        assert!(proto.send_checksum());
        proto.set_option(ProtocolOption::SendChecksum(false)).unwrap();
        assert_eq!(
            proto.option(ProtocolOptionName::SendChecksum).unwrap(),
            ProtocolOption::SendChecksum(false)
        );
        assert!(proto.set_option(ProtocolOption::DefaultTtl(3)).is_err());
    }
}
