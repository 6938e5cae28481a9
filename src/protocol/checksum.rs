//! Internet checksum (RFC 1071).
//!
//! Packets live in several spans, so the sum is accumulated span by span.
//! A span of odd length leaves its last byte pending until the next span
//! supplies its partner.

use std::net::IpAddr;

/// Running one's complement sum.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u32,
    odd: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a run of bytes.
    pub fn add(&mut self, mut data: &[u8]) {
        if let Some(hi) = self.odd.take() {
            let Some((&lo, rest)) = data.split_first() else {
                self.odd = Some(hi);
                return;
            };
            self.add_u16(u16::from_be_bytes([hi, lo]));
            data = rest;
        }
        let mut chunks = data.chunks_exact(2);
        for word in &mut chunks {
            self.add_u16(u16::from_be_bytes([word[0], word[1]]));
        }
        if let [last] = chunks.remainder() {
            self.odd = Some(*last);
        }
    }

    pub fn add_u16(&mut self, word: u16) {
        self.sum = self.sum.wrapping_add(word as u32);
        // Fold early so the accumulator never overflows.
        if self.sum > 0xFFFF_0000 {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }

    /// The complemented, folded sum, ready to be written into a header.
    pub fn finish(mut self) -> u16 {
        if let Some(hi) = self.odd.take() {
            self.add_u16(u16::from_be_bytes([hi, 0]));
        }
        let mut sum = self.sum;
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// Sum of the pseudo-header used by UDP and TCP.
///
/// ```text
/// IPv4: src(4) dst(4) zero(1) proto(1) len(2)
/// IPv6: src(16) dst(16) len(4) zero(3) next(1)
/// ```
pub fn pseudo_header(src: IpAddr, dst: IpAddr, protocol: u8, length: usize) -> Checksum {
    let mut sum = Checksum::new();
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            sum.add(&s.octets());
            sum.add(&d.octets());
        }
        (s, d) => {
            sum.add(&to_v6_octets(s));
            sum.add(&to_v6_octets(d));
        }
    }
    sum.add_u16(protocol as u16);
    sum.add_u16((length >> 16) as u16);
    sum.add_u16(length as u16);
    sum
}

fn to_v6_octets(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
        IpAddr::V6(a) => a.octets(),
    }
}

/// Checksum of a single contiguous run of bytes.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    sum.add(data);
    sum.finish()
}
