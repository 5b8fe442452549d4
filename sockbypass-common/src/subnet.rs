use crate::error::{BypassError, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A CIDR range over IPv4 or IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpSubnet {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpSubnet {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return Err(BypassError::Config(format!(
                "prefix length {} out of range for {}",
                prefix_len, addr
            )));
        }
        // Normalize to the network address so equality behaves.
        let network = match addr {
            IpAddr::V4(v4) => {
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(prefix_len)))
            }
            IpAddr::V6(v6) => {
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(prefix_len)))
            }
        };
        Ok(IpSubnet {
            addr: network,
            prefix_len,
        })
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                (u32::from(*ip) & v4_mask(self.prefix_len)) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                (u128::from(*ip) & v6_mask(self.prefix_len)) == u128::from(net)
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len as u32)
    }
}

fn v6_mask(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len as u32)
    }
}

impl FromStr for IpSubnet {
    type Err = BypassError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| BypassError::Config(format!("{} is not CIDR format", s)))?;
        let addr: IpAddr = addr.parse()?;
        let prefix_len: u8 = len
            .parse()
            .map_err(|_| BypassError::Config(format!("{} is not CIDR format", s)))?;
        IpSubnet::new(addr, prefix_len)
    }
}

impl fmt::Display for IpSubnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// An ordered list of CIDR ranges; an address is a member when any range
/// contains it.
#[derive(Debug, Clone, Default)]
pub struct SubnetSet {
    subnets: Vec<IpSubnet>,
}

impl SubnetSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subnet: IpSubnet) {
        self.subnets.push(subnet);
    }

    pub fn extend(&mut self, subnets: impl IntoIterator<Item = IpSubnet>) {
        self.subnets.extend(subnets);
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.subnets.iter().any(|s| s.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.subnets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }
}

/// The RFC1918 ranges, used both by `--ignore auto` discovery and as the
/// candidate space for multinode peer lookups.
pub fn private_ranges() -> Vec<IpSubnet> {
    vec![
        IpSubnet::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8).unwrap(),
        IpSubnet::new(IpAddr::V4(Ipv4Addr::new(172, 16, 0, 0)), 12).unwrap(),
        IpSubnet::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 0)), 16).unwrap(),
    ]
}

/// RFC1918 for IPv4, unique-local (fc00::/7) for IPv6.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.octets()[0] & 0xfe) == 0xfc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cidr() {
        let subnet: IpSubnet = "127.0.0.0/8".parse().unwrap();
        assert_eq!(subnet.prefix_len(), 8);
        assert_eq!(subnet.to_string(), "127.0.0.0/8");
    }

    #[test]
    fn rejects_bad_cidr() {
        assert!("127.0.0.1".parse::<IpSubnet>().is_err());
        assert!("127.0.0.1/33".parse::<IpSubnet>().is_err());
        assert!("nonsense/8".parse::<IpSubnet>().is_err());
    }

    #[test]
    fn normalizes_to_network_address() {
        let subnet: IpSubnet = "10.1.2.3/8".parse().unwrap();
        assert_eq!(subnet.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn v4_membership() {
        let subnet: IpSubnet = "127.0.0.0/8".parse().unwrap();
        assert!(subnet.contains(&"127.0.0.1".parse().unwrap()));
        assert!(subnet.contains(&"127.255.255.254".parse().unwrap()));
        assert!(!subnet.contains(&"128.0.0.1".parse().unwrap()));
        assert!(!subnet.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn v6_membership() {
        let subnet: IpSubnet = "fd00::/8".parse().unwrap();
        assert!(subnet.contains(&"fd12:3456::1".parse().unwrap()));
        assert!(!subnet.contains(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn set_matches_any_range() {
        let mut set = SubnetSet::new();
        set.push("127.0.0.0/8".parse().unwrap());
        set.push("10.0.0.0/8".parse().unwrap());
        assert!(set.contains(&"10.4.0.2".parse().unwrap()));
        assert!(set.contains(&"127.0.0.1".parse().unwrap()));
        assert!(!set.contains(&"192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn private_range_detection() {
        assert!(is_private_ip(&"10.4.0.2".parse().unwrap()));
        assert!(is_private_ip(&"172.17.0.2".parse().unwrap()));
        assert!(is_private_ip(&"192.168.1.10".parse().unwrap()));
        assert!(is_private_ip(&"fd00::2".parse().unwrap()));
        assert!(!is_private_ip(&"8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip(&"2001:db8::1".parse().unwrap()));
    }
}
