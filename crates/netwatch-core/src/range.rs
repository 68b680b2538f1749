//! IPv4 CIDR ranges targeted by discovery sweeps

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("address range must be CIDR notation (a.b.c.d/len): {0}")]
    Malformed(String),
    #[error("invalid network address in {0}")]
    BadAddress(String),
    #[error("prefix length {0} is out of range (0-32)")]
    BadPrefix(u8),
}

/// An IPv4 network in CIDR form. Host bits are masked off on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Default for AddressRange {
    /// 192.168.1.0/24
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(192, 168, 1, 0),
            prefix_len: 24,
        }
    }
}

impl AddressRange {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, RangeError> {
        if prefix_len > 32 {
            return Err(RangeError::BadPrefix(prefix_len));
        }
        let network = Ipv4Addr::from(u32::from(addr) & mask(prefix_len));
        Ok(Self {
            network,
            prefix_len,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix_len))
    }

    /// Check if an address is in this range
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => u32::from(v4) & mask(self.prefix_len) == u32::from(self.network),
            IpAddr::V6(_) => false,
        }
    }

    /// Number of addresses [`hosts`](Self::hosts) yields
    pub fn host_count(&self) -> u64 {
        let size = 1u64 << (32 - u32::from(self.prefix_len));
        if self.prefix_len >= 31 {
            size
        } else {
            size - 2
        }
    }

    /// Usable host addresses. Network and broadcast addresses are skipped,
    /// except for /31 and /32 where every address is a host.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let network = u64::from(u32::from(self.network));
        let broadcast = u64::from(u32::from(self.broadcast()));
        let (first, last) = if self.prefix_len >= 31 {
            (network, broadcast)
        } else {
            (network + 1, broadcast - 1)
        };
        (first..=last).map(|h| Ipv4Addr::from(h as u32))
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        0xFFFF_FFFF
    } else {
        !((1u32 << (32 - prefix_len)) - 1)
    }
}

impl FromStr for AddressRange {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| RangeError::Malformed(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| RangeError::BadAddress(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| RangeError::Malformed(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl Serialize for AddressRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_masks_host_bits() {
        let range: AddressRange = "192.168.186.77/24".parse().unwrap();
        assert_eq!(range.network(), Ipv4Addr::new(192, 168, 186, 0));
        assert_eq!(range.broadcast(), Ipv4Addr::new(192, 168, 186, 255));
        assert_eq!(range.to_string(), "192.168.186.0/24");
    }

    #[test]
    fn test_malformed_ranges() {
        assert!(matches!(
            "192.168.1.0".parse::<AddressRange>(),
            Err(RangeError::Malformed(_))
        ));
        assert!(matches!(
            "192.168.1/24".parse::<AddressRange>(),
            Err(RangeError::BadAddress(_))
        ));
        assert_eq!(
            "10.0.0.0/33".parse::<AddressRange>(),
            Err(RangeError::BadPrefix(33))
        );
    }

    #[test]
    fn test_contains() {
        let range: AddressRange = "192.168.186.0/24".parse().unwrap();
        assert!(range.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 186, 1))));
        assert!(range.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 186, 255))));
        assert!(!range.contains(IpAddr::V4(Ipv4Addr::new(192, 168, 187, 1))));
        assert!(!range.contains(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!range.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_hosts_skip_network_and_broadcast() {
        let range: AddressRange = "10.1.2.0/29".parse().unwrap();
        let hosts: Vec<_> = range.hosts().collect();
        assert_eq!(hosts.len(), 6);
        assert_eq!(range.host_count(), 6);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 1, 2, 1));
        assert_eq!(hosts[5], Ipv4Addr::new(10, 1, 2, 6));
    }

    #[test]
    fn test_point_to_point_and_single_host() {
        let p2p: AddressRange = "10.0.0.0/31".parse().unwrap();
        assert_eq!(p2p.hosts().count(), 2);
        let single: AddressRange = "10.0.0.9/32".parse().unwrap();
        assert_eq!(
            single.hosts().collect::<Vec<_>>(),
            vec![Ipv4Addr::new(10, 0, 0, 9)]
        );
        assert_eq!(single.host_count(), 1);
    }

    #[test]
    fn test_whole_space_does_not_overflow() {
        let all: AddressRange = "0.0.0.0/0".parse().unwrap();
        assert_eq!(all.host_count(), (1u64 << 32) - 2);
        assert_eq!(all.hosts().next(), Some(Ipv4Addr::new(0, 0, 0, 1)));
    }
}
