//! Matchers beyond the common header filter.

use super::conntrack::{ConnState, Direction};
use super::iptables_types::{HookContext, Matcher};
use super::packet_buffer::PacketBuffer;
use crate::tcpip::TransportProtocolNumber;
use bitflags::bitflags;

/// Port range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// `start..=end`. An inverted pair matches nothing.
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(port: u16) -> Self {
        Self::new(port, port)
    }

    /// Accepts the iptables `--dport` forms `N` and `N-M`. Returns `None`
    /// for names or inverted ranges.
    pub fn parse(s: &str) -> Option<Self> {
        let (lo, hi) = s.split_once('-').unwrap_or((s, s));
        let lo = lo.trim().parse::<u16>().ok()?;
        let hi = hi.trim().parse::<u16>().ok()?;
        (lo <= hi).then(|| Self::new(lo, hi))
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// Matches TCP or UDP ports. Both protocols start their header with the
/// source and destination ports.
#[derive(Debug, Clone)]
pub struct PortMatcher {
    pub protocol: TransportProtocolNumber,
    pub src: Option<PortRange>,
    pub dst: Option<PortRange>,
}

impl Matcher for PortMatcher {
    fn name(&self) -> &'static str {
        if self.protocol == TransportProtocolNumber::TCP {
            "tcp"
        } else {
            "udp"
        }
    }

    fn matches(&self, _: &HookContext<'_>, pkt: &PacketBuffer) -> (bool, bool) {
        if pkt.transport_protocol_number != Some(self.protocol) {
            return (false, false);
        }
        // Non-initial fragments carry no ports.
        let Some(hdr) = pkt.transport_header() else {
            return (false, false);
        };
        if hdr.len() < 4 {
            return (false, true);
        }
        let src = u16::from_be_bytes([hdr[0], hdr[1]]);
        let dst = u16::from_be_bytes([hdr[2], hdr[3]]);
        let hit = self.src.is_none_or(|r| r.contains(src)) && self.dst.is_none_or(|r| r.contains(dst));
        (hit, false)
    }
}

bitflags! {
    /// Connection states a [`ConnStateMatcher`] accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtStates: u8 {
        /// First direction only, no reply seen yet.
        const NEW = 1 << 0;
        /// Replies, and anything after the first reply.
        const ESTABLISHED = 1 << 1;
        /// Packets conntrack could not or would not track.
        const UNTRACKED = 1 << 2;
    }
}

impl CtStates {
    /// Parse a comma separated list such as "established,new".
    pub fn parse(s: &str) -> Option<Self> {
        let mut states = CtStates::empty();
        for part in s.split(',') {
            states |= match part.trim().to_ascii_lowercase().as_str() {
                "new" => CtStates::NEW,
                "established" => CtStates::ESTABLISHED,
                "untracked" => CtStates::UNTRACKED,
                _ => return None,
            };
        }
        Some(states)
    }
}

/// Matches on conntrack state.
#[derive(Debug, Clone, Copy)]
pub struct ConnStateMatcher {
    pub states: CtStates,
}

impl Matcher for ConnStateMatcher {
    fn name(&self) -> &'static str {
        "conntrack"
    }

    fn matches(&self, _: &HookContext<'_>, pkt: &PacketBuffer) -> (bool, bool) {
        let state = match &pkt.conn {
            None => CtStates::UNTRACKED,
            Some(t) if t.direction == Direction::Reply => CtStates::ESTABLISHED,
            Some(t) => match t.conn.state() {
                ConnState::New => CtStates::NEW,
                ConnState::Established => CtStates::ESTABLISHED,
            },
        };
        (self.states.contains(state), false)
    }
}
