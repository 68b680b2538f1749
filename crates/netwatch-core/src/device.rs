//! Device types for tracking discovered hosts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacParseError {
    #[error("invalid hardware address: {0}")]
    Invalid(String),
    #[error("hardware address {0} is not a unicast identity")]
    NotAnIdentity(String),
}

/// Link-layer (MAC) address, always rendered as lowercase `aa:bb:cc:dd:ee:ff`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// First three octets as uppercase hex, e.g. `AABBCC`
    pub fn oui(&self) -> String {
        format!("{:02X}{:02X}{:02X}", self.0[0], self.0[1], self.0[2])
    }

    /// Locally administered bit set (randomized or virtual interfaces)
    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `AA-BB-CC-DD-EE-FF`, `aabb.ccdd.eeff` and bare hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();

        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MacParseError::Invalid(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| MacParseError::Invalid(s.to_string()))?;
        }

        if octets == [0; 6] || octets == [0xff; 6] {
            return Err(MacParseError::NotAnIdentity(s.to_string()));
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity key of a device.
///
/// A hardware address is the primary identity. Hosts seen only at the network
/// layer (echo replies, mDNS announcements) are keyed by address until an
/// address-resolution sighting supplies their hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceId {
    Mac(MacAddr),
    Ip(IpAddr),
}

impl DeviceId {
    pub fn is_hardware(&self) -> bool {
        matches!(self, DeviceId::Mac(_))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Mac(mac) => write!(f, "mac:{}", mac),
            DeviceId::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

impl FromStr for DeviceId {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(mac) = s.strip_prefix("mac:") {
            return Ok(DeviceId::Mac(mac.parse()?));
        }
        if let Some(ip) = s.strip_prefix("ip:") {
            return ip
                .parse()
                .map(DeviceId::Ip)
                .map_err(|_| MacParseError::Invalid(s.to_string()));
        }
        Err(MacParseError::Invalid(s.to_string()))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reachability status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Last probe burst succeeded
    Up,
    /// Last probe burst failed
    Down,
    /// Not probed yet
    #[default]
    Unknown,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Up => "up",
            DeviceStatus::Down => "down",
            DeviceStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Tag keys written by discovery and identification
pub mod tags {
    pub const SOURCE: &str = "source";
    pub const SNMP: &str = "snmp";
    pub const SNMP_DESCRIPTION: &str = "snmp.description";
    pub const SNMP_LOCATION: &str = "snmp.location";
    pub const SNMP_CONTACT: &str = "snmp.contact";
    pub const SNMP_OBJECT_ID: &str = "snmp.object_id";
    pub const SNMP_UPTIME: &str = "snmp.uptime_secs";
    pub const MDNS_SERVICE: &str = "mdns.service";
}

/// A host on the monitored network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Identity key, fixed once assigned
    pub id: DeviceId,
    /// Last known network address
    pub ip: IpAddr,
    pub mac: Option<MacAddr>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    /// Free-form class (printer, media, ...)
    pub class: Option<String>,
    pub status: DeviceStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Device {
    /// Create a device first sighted at `now`. The identity is derived from
    /// the hardware address when one is known.
    pub fn new(ip: IpAddr, mac: Option<MacAddr>, now: DateTime<Utc>) -> Self {
        let id = match mac {
            Some(mac) => DeviceId::Mac(mac),
            None => DeviceId::Ip(ip),
        };
        Self {
            id,
            ip,
            mac,
            hostname: None,
            vendor: None,
            class: None,
            status: DeviceStatus::Unknown,
            first_seen: now,
            last_seen: now,
            tags: BTreeMap::new(),
        }
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Whether the management protocol has answered for this device
    pub fn snmp_capable(&self) -> bool {
        self.tags.get(tags::SNMP).map(String::as_str) == Some("true")
    }

    /// Record that `source` has seen this device; keeps the tag sorted and unique
    pub fn add_source(&mut self, source: &str) {
        let mut sources: Vec<String> = self
            .tags
            .get(tags::SOURCE)
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        if !sources.iter().any(|s| s == source) {
            sources.push(source.to_string());
            sources.sort();
        }
        self.tags.insert(tags::SOURCE.to_string(), sources.join(","));
    }

    /// Carry attributes of an older record into this one without touching
    /// identity. Used when an address-keyed record is unified onto a
    /// hardware-address key: history (first seen) and filled-in fields survive.
    pub fn absorb(&mut self, older: &Device) {
        if older.first_seen < self.first_seen {
            self.first_seen = older.first_seen;
        }
        if self.hostname.is_none() {
            self.hostname = older.hostname.clone();
        }
        if self.vendor.is_none() {
            self.vendor = older.vendor.clone();
        }
        if self.class.is_none() {
            self.class = older.class.clone();
        }
        if self.status == DeviceStatus::Unknown {
            self.status = older.status;
        }
        for (key, value) in &older.tags {
            if key == tags::SOURCE {
                for source in value.split(',').filter(|s| !s.is_empty()) {
                    self.add_source(source);
                }
            } else {
                self.tags.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    /// Take the attributes discovery owns from a newer sighting of the same
    /// device. Status belongs to the monitor and is left as is.
    pub fn refresh_from(&mut self, sighting: &Device) {
        self.ip = sighting.ip;
        if sighting.mac.is_some() {
            self.mac = sighting.mac;
        }
        if sighting.hostname.is_some() {
            self.hostname = sighting.hostname.clone();
        }
        if sighting.vendor.is_some() {
            self.vendor = sighting.vendor.clone();
        }
        if sighting.class.is_some() {
            self.class = sighting.class.clone();
        }
        if sighting.first_seen < self.first_seen {
            self.first_seen = sighting.first_seen;
        }
        self.touch(sighting.last_seen);
        for (key, value) in &sighting.tags {
            if key == tags::SOURCE {
                for source in value.split(',').filter(|s| !s.is_empty()) {
                    self.add_source(source);
                }
            } else {
                self.tags.insert(key.clone(), value.clone());
            }
        }
    }
}
