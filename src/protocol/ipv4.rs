//! IPv4 - RFC 791

use super::checksum::checksum;
use crate::stack::packet_buffer::{HeaderType, PacketBuffer};
use crate::stack::registration::{
    NetworkHeaderParams, NetworkProtocol, ParsedNetwork, ProtocolOption, ProtocolOptionName,
};
use crate::tcpip::{NetworkProtocolNumber, TransportProtocolNumber};
use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU8, AtomicU16, Ordering};
use tracing::trace;

/// Minimum IPv4 header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

pub const DEFAULT_TTL: u8 = 64;

/// Fragment flags
pub mod flags {
    /// Don't Fragment
    pub const DF: u8 = 0b010;
    /// More Fragments
    pub const MF: u8 = 0b001;
}

/// Parsed IPv4 header (zero-copy reference)
#[derive(Debug)]
pub struct Ipv4Header<'a> {
    buffer: &'a [u8],
    header_len: usize,
}

impl<'a> Ipv4Header<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("IPv4 header too short".into()));
        }
        if buffer[0] >> 4 != 4 {
            return Err(Error::Parse("not an IPv4 packet".into()));
        }
        let header_len = (buffer[0] & 0x0F) as usize * 4;
        if header_len < MIN_HEADER_SIZE || buffer.len() < header_len {
            return Err(Error::Parse("IPv4 header truncated".into()));
        }
        Ok(Self { buffer, header_len })
    }

    pub fn version(&self) -> u8 {
        self.buffer[0] >> 4
    }

    pub fn ihl(&self) -> u8 {
        self.buffer[0] & 0x0F
    }

    pub fn tos(&self) -> u8 {
        self.buffer[1]
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.buffer[4], self.buffer[5]])
    }

    pub fn flags(&self) -> u8 {
        self.buffer[6] >> 5
    }

    /// In 8-byte units.
    pub fn fragment_offset(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6] & 0x1F, self.buffer[7]])
    }

    pub fn ttl(&self) -> u8 {
        self.buffer[8]
    }

    pub fn protocol(&self) -> u8 {
        self.buffer[9]
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buffer[12], self.buffer[13], self.buffer[14], self.buffer[15])
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buffer[16], self.buffer[17], self.buffer[18], self.buffer[19])
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn dont_fragment(&self) -> bool {
        (self.flags() & flags::DF) != 0
    }

    pub fn more_fragments(&self) -> bool {
        (self.flags() & flags::MF) != 0
    }

    /// MF set or a non-zero offset.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.fragment_offset() > 0
    }

    pub fn validate_checksum(&self) -> bool {
        checksum(&self.buffer[..self.header_len]) == 0
    }
}

/// Recompute the header checksum in place.
fn update_checksum(hdr: &mut [u8]) {
    hdr[10] = 0;
    hdr[11] = 0;
    let sum = checksum(hdr);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());
}

/// Builds whole IPv4 packets. Mostly useful for injecting traffic.
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    tos: u8,
    identification: u16,
    dont_fragment: bool,
    more_fragments: bool,
    fragment_offset: u16,
    ttl: u8,
    protocol: TransportProtocolNumber,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    payload: Vec<u8>,
}

impl Ipv4Builder {
    pub fn new() -> Self {
        Self {
            tos: 0,
            identification: 0,
            dont_fragment: true,
            more_fragments: false,
            fragment_offset: 0,
            ttl: DEFAULT_TTL,
            protocol: TransportProtocolNumber(0),
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            payload: Vec::new(),
        }
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn identification(mut self, id: u16) -> Self {
        self.identification = id;
        self
    }

    pub fn dont_fragment(mut self, df: bool) -> Self {
        self.dont_fragment = df;
        self
    }

    pub fn more_fragments(mut self, mf: bool) -> Self {
        self.more_fragments = mf;
        self
    }

    pub fn fragment_offset(mut self, offset: u16) -> Self {
        self.fragment_offset = offset & 0x1FFF;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn protocol(mut self, protocol: TransportProtocolNumber) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn src_addr(mut self, addr: Ipv4Addr) -> Self {
        self.src_addr = addr;
        self
    }

    pub fn dst_addr(mut self, addr: Ipv4Addr) -> Self {
        self.dst_addr = addr;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total_length = (MIN_HEADER_SIZE + self.payload.len()) as u16;
        let mut buffer = vec![0u8; total_length as usize];
        let mut flags_frag = self.fragment_offset;
        if self.dont_fragment {
            flags_frag |= 0x4000;
        }
        if self.more_fragments {
            flags_frag |= 0x2000;
        }
        fill_header(
            &mut buffer[..MIN_HEADER_SIZE],
            &HeaderFields {
                tos: self.tos,
                total_length,
                identification: self.identification,
                flags_frag,
                ttl: self.ttl,
                protocol: self.protocol.0,
                src: self.src_addr,
                dst: self.dst_addr,
            },
        );
        buffer[MIN_HEADER_SIZE..].copy_from_slice(&self.payload);
        buffer
    }
}

impl Default for Ipv4Builder {
    fn default() -> Self {
        Self::new()
    }
}

struct HeaderFields {
    tos: u8,
    total_length: u16,
    identification: u16,
    flags_frag: u16,
    ttl: u8,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

fn fill_header(buf: &mut [u8], f: &HeaderFields) {
    // Version 4, IHL 5: no options.
    buf[0] = 0x45;
    buf[1] = f.tos;
    buf[2..4].copy_from_slice(&f.total_length.to_be_bytes());
    buf[4..6].copy_from_slice(&f.identification.to_be_bytes());
    buf[6..8].copy_from_slice(&f.flags_frag.to_be_bytes());
    buf[8] = f.ttl;
    buf[9] = f.protocol;
    buf[12..16].copy_from_slice(&f.src.octets());
    buf[16..20].copy_from_slice(&f.dst.octets());
    update_checksum(buf);
}

fn v4(addr: IpAddr) -> Result<Ipv4Addr> {
    match addr {
        IpAddr::V4(a) => Ok(a),
        IpAddr::V6(_) => Err(Error::NotSupported),
    }
}

/// The IPv4 network protocol plug-in.
#[derive(Debug)]
pub struct Ipv4Protocol {
    default_ttl: AtomicU8,
    next_id: AtomicU16,
}

impl Ipv4Protocol {
    pub fn new() -> Self {
        Self {
            default_ttl: AtomicU8::new(DEFAULT_TTL),
            next_id: AtomicU16::new(rand::random()),
        }
    }
}

impl Default for Ipv4Protocol {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProtocol for Ipv4Protocol {
    fn number(&self) -> NetworkProtocolNumber {
        NetworkProtocolNumber::IPV4
    }

    fn minimum_packet_size(&self) -> usize {
        MIN_HEADER_SIZE
    }

    fn max_header_length(&self) -> usize {
        MIN_HEADER_SIZE
    }

    fn default_prefix_len(&self) -> u8 {
        24
    }

    fn parse_addresses(&self, hdr: &[u8]) -> Option<(IpAddr, IpAddr)> {
        let hdr = Ipv4Header::parse(hdr).ok()?;
        Some((hdr.src_addr().into(), hdr.dst_addr().into()))
    }

    fn parse(&self, pkt: &mut PacketBuffer) -> Option<ParsedNetwork> {
        let (header_len, total_length, protocol, offset) = {
            let head = pkt.data_head(MIN_HEADER_SIZE)?;
            let ihl = (head[0] & 0x0F) as usize * 4;
            let full = pkt.data_head(ihl.max(MIN_HEADER_SIZE))?;
            let hdr = Ipv4Header::parse(&full).ok()?;
            if !hdr.validate_checksum() {
                trace!("IPv4 checksum mismatch");
                return None;
            }
            (
                hdr.header_len(),
                hdr.total_length() as usize,
                hdr.protocol(),
                hdr.fragment_offset(),
            )
        };
        if total_length < header_len || total_length > pkt.data_size() {
            return None;
        }
        pkt.consume_header(HeaderType::Network, header_len).ok()?;
        // Drop link padding.
        pkt.cap_data(total_length - header_len);
        Some(ParsedNetwork {
            transport: TransportProtocolNumber(protocol),
            has_transport_header: offset == 0,
        })
    }

    /// A zero TTL in `params` means the protocol default.
    fn write_header(&self, pkt: &mut PacketBuffer, params: &NetworkHeaderParams) -> Result<()> {
        let fields = HeaderFields {
            tos: params.tos,
            total_length: u16::try_from(pkt.size() + MIN_HEADER_SIZE).map_err(|_| Error::MessageTooLong)?,
            identification: self.next_id.fetch_add(1, Ordering::Relaxed),
            flags_frag: 0x4000,
            ttl: match params.ttl {
                0 => self.default_ttl.load(Ordering::Relaxed),
                ttl => ttl,
            },
            protocol: params.protocol.0,
            src: v4(params.src)?,
            dst: v4(params.dst)?,
        };
        let buf = pkt.push_header(HeaderType::Network, MIN_HEADER_SIZE)?;
        fill_header(buf, &fields);
        Ok(())
    }

    fn rewrite_addresses(&self, pkt: &mut PacketBuffer, src: Option<IpAddr>, dst: Option<IpAddr>) -> Result<()> {
        let src = src.map(v4).transpose()?;
        let dst = dst.map(v4).transpose()?;
        pkt.update_header(HeaderType::Network, |hdr| {
            if let Some(src) = src {
                hdr[12..16].copy_from_slice(&src.octets());
            }
            if let Some(dst) = dst {
                hdr[16..20].copy_from_slice(&dst.octets());
            }
            update_checksum(hdr);
        })
    }

    fn prepare_forward(&self, pkt: &mut PacketBuffer) -> bool {
        let ttl = match pkt.network_header() {
            Some(hdr) if hdr.len() >= MIN_HEADER_SIZE => hdr[8],
            _ => return false,
        };
        if ttl <= 1 {
            return false;
        }
        pkt.update_header(HeaderType::Network, |hdr| {
            hdr[8] = ttl - 1;
            update_checksum(hdr);
        })
        .is_ok()
    }

    fn set_option(&self, opt: ProtocolOption) -> Result<()> {
        match opt {
            ProtocolOption::DefaultTtl(ttl) if ttl > 0 => {
                self.default_ttl.store(ttl, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(Error::UnknownProtocolOption),
        }
    }

    fn option(&self, name: ProtocolOptionName) -> Result<ProtocolOption> {
        match name {
            ProtocolOptionName::DefaultTtl => Ok(ProtocolOption::DefaultTtl(self.default_ttl.load(Ordering::Relaxed))),
            _ => Err(Error::UnknownProtocolOption),
        }
    }
}
