//! Address prefixes for routes and filter rules.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// An IPv4 or IPv6 prefix, stored with host bits cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    addr: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    /// Create a subnet; host bits of `addr` are masked off.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(Self::max_prefix(&addr));
        Self {
            addr: Self::network_addr(addr, prefix_len),
            prefix_len,
        }
    }

    /// The subnet that matches every address of `addr`'s family.
    pub fn any_of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => Self::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }

    /// Parse from string like "192.168.1.0/24" or "2001:db8::/32".
    ///
    /// A bare address is accepted as a host prefix.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((addr, prefix)) => {
                let addr: IpAddr = addr.parse().ok()?;
                let prefix_len: u8 = prefix.parse().ok()?;
                if prefix_len > Self::max_prefix(&addr) {
                    return None;
                }
                Some(Self::new(addr, prefix_len))
            }
            None => {
                let addr: IpAddr = s.parse().ok()?;
                Some(Self::new(addr, Self::max_prefix(&addr)))
            }
        }
    }

    pub fn address(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this prefix. Families never mix.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(network), IpAddr::V4(target)) => {
                let mask = v4_mask(self.prefix_len);
                (u32::from(network) & mask) == (u32::from(*target) & mask)
            }
            (IpAddr::V6(network), IpAddr::V6(target)) => {
                let mask = v6_mask(self.prefix_len);
                (u128::from(network) & mask) == (u128::from(*target) & mask)
            }
            _ => false,
        }
    }

    fn max_prefix(addr: &IpAddr) -> u8 {
        if addr.is_ipv4() { 32 } else { 128 }
    }

    fn network_addr(addr: IpAddr, prefix_len: u8) -> IpAddr {
        match addr {
            IpAddr::V4(a) => IpAddr::V4(Ipv4Addr::from(u32::from(a) & v4_mask(prefix_len))),
            IpAddr::V6(a) => IpAddr::V6(Ipv6Addr::from(u128::from(a) & v6_mask(prefix_len))),
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        !0u32 << (32 - prefix_len)
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        !0u128 << (128 - prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_ipv4_subnet_parse() {
        let subnet = Subnet::parse("192.168.1.0/24").unwrap();
        assert!(subnet.contains(&v4(192, 168, 1, 1)));
        assert!(subnet.contains(&v4(192, 168, 1, 254)));
        assert!(!subnet.contains(&v4(192, 168, 2, 1)));
    }

    #[test]
    fn test_ipv4_subnet_edge_cases() {
        let host = Subnet::parse("10.0.0.1/32").unwrap();
        assert!(host.contains(&v4(10, 0, 0, 1)));
        assert!(!host.contains(&v4(10, 0, 0, 2)));

        let all = Subnet::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(&v4(1, 2, 3, 4)));
        assert!(all.contains(&v4(255, 255, 255, 255)));
    }

    #[test]
    fn test_bare_address_is_host_prefix() {
        let subnet = Subnet::parse("10.1.2.3").unwrap();
        assert_eq!(subnet.prefix_len(), 32);
        assert!(!subnet.contains(&v4(10, 1, 2, 4)));
    }

    #[test]
    fn test_ipv6_subnet_parse() {
        let subnet = Subnet::parse("2001:db8::/32").unwrap();
        assert!(subnet.contains(&"2001:db8::1".parse().unwrap()));
        assert!(subnet.contains(&"2001:db8:ffff::1".parse().unwrap()));
        assert!(!subnet.contains(&"2001:db9::1".parse().unwrap()));
        assert!(!subnet.contains(&v4(32, 1, 13, 184)));
    }

    #[test]
    fn test_host_bits_masked() {
        let subnet = Subnet::new(v4(10, 9, 8, 7), 8);
        assert_eq!(subnet.address(), v4(10, 0, 0, 0));
        assert_eq!(subnet.to_string(), "10.0.0.0/8");
        assert!(Subnet::parse("10.0.0.0/40").is_none());
    }
}
