//! Merging probe results into one deduplicated device set
//!
//! Results are grouped by hardware address. A result without one joins the
//! group of the hardware address seen at the same network address (in this
//! batch or the inventory snapshot); otherwise it stands alone, keyed by its
//! network address. Within a group the first non-empty value of each field
//! wins, in source priority order.

use chrono::{DateTime, Utc};
use netwatch_core::device::tags;
use netwatch_core::{Device, DeviceId, MacAddr};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use tracing::debug;

use crate::probe::{ProbeResult, ProbeSource};

/// Whether a merged device was already in the inventory snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    New,
    Refreshed,
}

/// One device of a discovery batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedDevice {
    pub device: Device,
    pub freshness: Freshness,
    /// Address-keyed record this device replaces
    pub supersedes: Option<DeviceId>,
}

impl MergedDevice {
    pub fn is_new(&self) -> bool {
        self.freshness == Freshness::New
    }
}

/// Fields gathered for one group of results
#[derive(Debug, Default)]
struct Candidate {
    ip: Option<IpAddr>,
    mac: Option<MacAddr>,
    name: Option<String>,
    class: Option<String>,
    service: Option<String>,
    sources: BTreeSet<ProbeSource>,
}

impl Candidate {
    fn absorb(&mut self, result: &ProbeResult) {
        fill(&mut self.ip, Some(result.ip));
        fill(&mut self.mac, result.mac);
        fill(&mut self.name, non_empty(&result.name));
        fill(&mut self.class, non_empty(&result.class_hint));
        fill(&mut self.service, non_empty(&result.service));
        self.sources.insert(result.source);
    }

    /// Copy probe-derived attributes onto a device record
    fn apply(&self, device: &mut Device, now: DateTime<Utc>) {
        if let Some(ip) = self.ip {
            device.ip = ip;
        }
        self.fill_gaps(device, now);
    }

    /// Like `apply`, but the device keeps its network address
    fn fill_gaps(&self, device: &mut Device, now: DateTime<Utc>) {
        if device.mac.is_none() {
            device.mac = self.mac;
        }
        if device.hostname.is_none() {
            device.hostname = self.name.clone();
        }
        if device.class.is_none() {
            device.class = self.class.clone();
        }
        if let Some(service) = &self.service {
            device
                .tags
                .entry(tags::MDNS_SERVICE.to_string())
                .or_insert_with(|| service.clone());
        }
        for source in &self.sources {
            device.add_source(source.as_str());
        }
        device.touch(now);
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Merge one batch of probe results against an inventory snapshot.
///
/// Pure: the snapshot is only read. Output is ordered by device id.
pub fn merge(results: &[ProbeResult], snapshot: &[Device], now: DateTime<Utc>) -> Vec<MergedDevice> {
    let mut ordered: Vec<&ProbeResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.source);

    // hardware address per network address, highest priority sighting first
    let mut mac_at: HashMap<IpAddr, MacAddr> = HashMap::new();
    // and the reverse: where this batch puts each hardware address
    let mut address_of: HashMap<MacAddr, IpAddr> = HashMap::new();
    for result in &ordered {
        if let Some(mac) = result.mac {
            mac_at.entry(result.ip).or_insert(mac);
            address_of.entry(mac).or_insert(result.ip);
        }
    }

    let mut groups: BTreeMap<DeviceId, Candidate> = BTreeMap::new();
    for result in &ordered {
        let key = match result.mac.or_else(|| mac_at.get(&result.ip).copied()) {
            Some(mac) => DeviceId::Mac(mac),
            None => DeviceId::Ip(result.ip),
        };
        groups.entry(key).or_default().absorb(result);
    }

    let known: HashMap<DeviceId, &Device> = snapshot.iter().map(|d| (d.id, d)).collect();
    // most recently seen hardware-keyed record per network address
    let mut hardware_at: HashMap<IpAddr, &Device> = HashMap::new();
    for device in snapshot.iter().filter(|d| d.id.is_hardware()) {
        hardware_at
            .entry(device.ip)
            .and_modify(|d| {
                if device.last_seen > d.last_seen {
                    *d = device;
                }
            })
            .or_insert(device);
    }

    let mut merged: BTreeMap<DeviceId, MergedDevice> = BTreeMap::new();
    for (key, candidate) in groups {
        let item = match key {
            DeviceId::Mac(mac) => classify_hardware(key, mac, &candidate, &known, now),
            DeviceId::Ip(ip) => {
                // a stored address is stale once this batch has seen the hardware elsewhere
                let resident = hardware_at.get(&ip).copied().filter(|device| {
                    device
                        .mac
                        .and_then(|mac| address_of.get(&mac))
                        .map_or(true, |seen| *seen == ip)
                });
                classify_address(key, ip, &candidate, &known, resident, now)
            }
        };

        match merged.get_mut(&item.device.id) {
            // two groups resolved to the same stored device; the one already
            // merged came first in key order and keeps its address
            Some(existing) => {
                candidate.fill_gaps(&mut existing.device, now);
                fill(&mut existing.supersedes, item.supersedes);
            }
            None => {
                merged.insert(item.device.id, item);
            }
        }
    }

    let merged: Vec<MergedDevice> = merged.into_values().collect();
    debug!(
        results = results.len(),
        devices = merged.len(),
        new = merged.iter().filter(|m| m.is_new()).count(),
        "Merged probe results"
    );
    merged
}

fn classify_hardware(
    key: DeviceId,
    mac: MacAddr,
    candidate: &Candidate,
    known: &HashMap<DeviceId, &Device>,
    now: DateTime<Utc>,
) -> MergedDevice {
    if let Some(existing) = known.get(&key) {
        let mut device = (*existing).clone();
        candidate.apply(&mut device, now);
        return MergedDevice {
            device,
            freshness: Freshness::Refreshed,
            supersedes: None,
        };
    }

    let ip = candidate.ip.unwrap_or(IpAddr::from([0, 0, 0, 0]));
    let mut device = Device::new(ip, Some(mac), now);
    candidate.apply(&mut device, now);

    // address-keyed record for the same host gets unified onto this key
    let address_key = DeviceId::Ip(ip);
    if let Some(older) = known.get(&address_key) {
        device.absorb(older);
        return MergedDevice {
            device,
            freshness: Freshness::Refreshed,
            supersedes: Some(address_key),
        };
    }

    MergedDevice {
        device,
        freshness: Freshness::New,
        supersedes: None,
    }
}

fn classify_address<'a>(
    key: DeviceId,
    ip: IpAddr,
    candidate: &Candidate,
    known: &HashMap<DeviceId, &'a Device>,
    resident: Option<&'a Device>,
    now: DateTime<Utc>,
) -> MergedDevice {
    let stored = resident.or_else(|| known.get(&key).copied());
    match stored {
        Some(existing) => {
            let mut device = existing.clone();
            candidate.apply(&mut device, now);
            MergedDevice {
                device,
                freshness: Freshness::Refreshed,
                supersedes: None,
            }
        }
        None => {
            let mut device = Device::new(ip, None, now);
            candidate.apply(&mut device, now);
            MergedDevice {
                device,
                freshness: Freshness::New,
                supersedes: None,
            }
        }
    }
}
