//! ARP-based network scanning for device discovery
//!
//! A raw who-has sweep over the datalink layer is tried first. Without raw
//! socket privileges the sweep falls back to `arp-scan`, and finally to the
//! kernel neighbour table.

use anyhow::{anyhow, bail, Result};
use netwatch_core::{AddressRange, MacAddr};
use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::Packet;
use pnet::util::MacAddr as PnetMac;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::probe::{ProbeResult, ProbeSource};

/// Default cap on hosts swept in one range
pub const DEFAULT_MAX_HOSTS: usize = 4096;

/// Who-has rounds; the second round only targets hosts that stayed silent
const SWEEP_ROUNDS: u32 = 2;

const ETHERNET_ARP_FRAME_LEN: usize = 42;

/// ARP table entry
#[derive(Debug, Clone)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddr>,
    pub interface: String,
    pub state: ArpState,
}

/// ARP entry state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Incomplete,
    Permanent,
    Unknown,
}

impl ArpState {
    /// Entry that names a live hardware address
    pub fn is_resolved(self) -> bool {
        !matches!(self, ArpState::Failed | ArpState::Incomplete)
    }
}

/// Address-resolution sweep
#[derive(Debug, Clone)]
pub struct ArpProbe {
    pub max_hosts: usize,
}

impl Default for ArpProbe {
    fn default() -> Self {
        Self {
            max_hosts: DEFAULT_MAX_HOSTS,
        }
    }
}

impl ArpProbe {
    pub async fn probe(
        &self,
        range: &AddressRange,
        interface: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<ProbeResult>> {
        let targets = capped_hosts(range, self.max_hosts);

        match self.raw_sweep(range, interface, targets, timeout).await {
            Ok(found) => return Ok(into_results(found)),
            Err(e) => debug!(error = %e, "Raw ARP sweep unavailable, trying arp-scan"),
        }

        match arp_scan(interface, timeout).await {
            Ok(found) => return Ok(into_results(found)),
            Err(e) => debug!(error = %e, "arp-scan unavailable, reading neighbour table"),
        }

        let entries = get_arp_table().await?;
        let found = entries
            .into_iter()
            .filter(|e| e.state.is_resolved())
            .filter(|e| interface.map_or(true, |name| e.interface == name))
            .filter_map(|e| e.mac.map(|mac| (e.ip, mac)))
            .collect();
        Ok(into_results(found))
    }

    async fn raw_sweep(
        &self,
        range: &AddressRange,
        interface: Option<&str>,
        targets: Vec<Ipv4Addr>,
        window: Duration,
    ) -> Result<Vec<(Ipv4Addr, MacAddr)>> {
        let (iface, source_ip) = select_interface(range, interface)?;
        debug!(
            interface = %iface.name,
            source = %source_ip,
            targets = targets.len(),
            "Starting raw ARP sweep"
        );
        tokio::task::spawn_blocking(move || sweep_blocking(&iface, source_ip, &targets, window))
            .await?
    }
}

/// Hosts of the range, capped at `max_hosts`
pub fn capped_hosts(range: &AddressRange, max_hosts: usize) -> Vec<Ipv4Addr> {
    if range.host_count() > max_hosts as u64 {
        warn!(
            range = %range,
            hosts = range.host_count(),
            max_hosts,
            "Range larger than sweep limit, truncating"
        );
    }
    range.hosts().take(max_hosts).collect()
}

fn into_results(found: Vec<(Ipv4Addr, MacAddr)>) -> Vec<ProbeResult> {
    found
        .into_iter()
        .map(|(ip, mac)| ProbeResult::new(IpAddr::V4(ip), ProbeSource::Arp).with_mac(mac))
        .collect()
}

/// Interface to sweep from and its address inside the range
fn select_interface(
    range: &AddressRange,
    wanted: Option<&str>,
) -> Result<(NetworkInterface, Ipv4Addr)> {
    for iface in datalink::interfaces() {
        if let Some(name) = wanted {
            if iface.name != name {
                continue;
            }
        } else if iface.is_loopback() || !iface.is_up() || iface.mac.is_none() {
            continue;
        }

        let source = iface.ips.iter().find_map(|net| match net.ip() {
            IpAddr::V4(v4) if range.contains(IpAddr::V4(v4)) => Some(v4),
            _ => None,
        });
        if let Some(source) = source {
            return Ok((iface, source));
        }
    }

    match wanted {
        Some(name) => bail!("interface {} has no address in {}", name, range),
        None => bail!("no interface with an address in {}", range),
    }
}

fn sweep_blocking(
    iface: &NetworkInterface,
    source_ip: Ipv4Addr,
    targets: &[Ipv4Addr],
    window: Duration,
) -> Result<Vec<(Ipv4Addr, MacAddr)>> {
    let source_mac = iface
        .mac
        .ok_or_else(|| anyhow!("interface {} has no hardware address", iface.name))?;

    let config = datalink::Config {
        read_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let (mut tx, mut rx) = match datalink::channel(iface, config) {
        Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
        Ok(_) => bail!("unsupported channel type on {}", iface.name),
        Err(e) => bail!("failed to open datalink channel on {}: {}", iface.name, e),
    };

    let start = Instant::now();
    let round_window = window / SWEEP_ROUNDS;
    let mut found: HashMap<Ipv4Addr, MacAddr> = HashMap::new();

    for round in 1..=SWEEP_ROUNDS {
        let pending: Vec<Ipv4Addr> = targets
            .iter()
            .filter(|ip| !found.contains_key(ip) && **ip != source_ip)
            .copied()
            .collect();
        if pending.is_empty() {
            break;
        }

        for target in &pending {
            let frame = arp_request(source_mac, source_ip, *target)?;
            if let Some(Err(e)) = tx.send_to(&frame, None) {
                trace!(target = %target, error = %e, "ARP request not sent");
            }
        }

        let round_deadline = start + round_window * round;
        while Instant::now() < round_deadline {
            match rx.next() {
                Ok(frame) => {
                    if let Some((ip, mac)) = parse_arp_reply(frame) {
                        if targets.contains(&ip) && !found.contains_key(&ip) {
                            trace!(ip = %ip, mac = %mac, "ARP reply");
                            found.insert(ip, mac);
                        }
                    }
                }
                // read timeouts keep the loop checking the deadline
                Err(_) => continue,
            }
        }
        debug!(round, found = found.len(), "ARP sweep round complete");
    }

    Ok(found.into_iter().collect())
}

/// Broadcast who-has frame for `target_ip`
fn arp_request(source_mac: PnetMac, source_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; ETHERNET_ARP_FRAME_LEN];
    {
        let mut ethernet = MutableEthernetPacket::new(&mut buffer[..14])
            .ok_or_else(|| anyhow!("ethernet buffer too small"))?;
        ethernet.set_destination(PnetMac::broadcast());
        ethernet.set_source(source_mac);
        ethernet.set_ethertype(EtherTypes::Arp);
    }
    {
        let mut arp = MutableArpPacket::new(&mut buffer[14..])
            .ok_or_else(|| anyhow!("ARP buffer too small"))?;
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(ArpOperations::Request);
        arp.set_sender_hw_addr(source_mac);
        arp.set_sender_proto_addr(source_ip);
        arp.set_target_hw_addr(PnetMac::zero());
        arp.set_target_proto_addr(target_ip);
    }
    Ok(buffer)
}

/// Sender of an ARP reply frame, if `frame` is one
fn parse_arp_reply(frame: &[u8]) -> Option<(Ipv4Addr, MacAddr)> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(ethernet.payload())?;
    if arp.get_operation() != ArpOperations::Reply {
        return None;
    }
    let mac = from_pnet(arp.get_sender_hw_addr())?;
    Some((arp.get_sender_proto_addr(), mac))
}

fn from_pnet(mac: PnetMac) -> Option<MacAddr> {
    mac.to_string().parse().ok()
}

/// Run `arp-scan` against the local network
async fn arp_scan(interface: Option<&str>, timeout: Duration) -> Result<Vec<(Ipv4Addr, MacAddr)>> {
    let mut command = Command::new("arp-scan");
    command
        .args(["--localnet", "--quiet", "--plain"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(name) = interface {
        command.args(["--interface", name]);
    }

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| anyhow!("arp-scan timed out"))??;
    if !output.status.success() {
        bail!(
            "arp-scan failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let found: Vec<_> = stdout.lines().filter_map(parse_arp_scan_line).collect();
    debug!("arp-scan found {} hosts", found.len());
    Ok(found)
}

/// Parse a line of `arp-scan` output: `192.168.1.1<TAB>aa:bb:cc:dd:ee:ff<TAB>Vendor`
fn parse_arp_scan_line(line: &str) -> Option<(Ipv4Addr, MacAddr)> {
    let mut parts = line.split_whitespace();
    let ip = Ipv4Addr::from_str(parts.next()?).ok()?;
    let mac = parts.next()?.parse().ok()?;
    Some((ip, mac))
}

/// Get current ARP table entries
pub async fn get_arp_table() -> Result<Vec<ArpEntry>> {
    // Use `ip neigh` command on Linux
    let output = Command::new("ip")
        .args(["-4", "neigh", "show"])
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        bail!(
            "Failed to get ARP table: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let entries: Vec<ArpEntry> = stdout.lines().filter_map(parse_ip_neigh_line).collect();

    debug!("Found {} ARP entries", entries.len());
    Ok(entries)
}

/// Parse a line from `ip neigh show` output
fn parse_ip_neigh_line(line: &str) -> Option<ArpEntry> {
    // Format: "192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE"
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() < 4 {
        return None;
    }

    let ip = Ipv4Addr::from_str(parts[0]).ok()?;

    let dev_idx = parts.iter().position(|&p| p == "dev")?;
    let interface = parts.get(dev_idx + 1)?.to_string();

    // MAC is absent for INCOMPLETE and FAILED entries
    let mac = parts
        .iter()
        .position(|&p| p == "lladdr")
        .and_then(|idx| parts.get(idx + 1))
        .and_then(|s| s.parse().ok());

    let state = parts
        .last()
        .map(|s| parse_arp_state(s))
        .unwrap_or(ArpState::Unknown);

    Some(ArpEntry {
        ip,
        mac,
        interface,
        state,
    })
}

/// Parse ARP state string
fn parse_arp_state(s: &str) -> ArpState {
    match s.to_uppercase().as_str() {
        "REACHABLE" => ArpState::Reachable,
        "STALE" => ArpState::Stale,
        "DELAY" => ArpState::Delay,
        "PROBE" => ArpState::Probe,
        "FAILED" => ArpState::Failed,
        "INCOMPLETE" => ArpState::Incomplete,
        "PERMANENT" => ArpState::Permanent,
        _ => ArpState::Unknown,
    }
}
