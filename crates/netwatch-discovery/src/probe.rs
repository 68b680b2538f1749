//! Probe adapters and their results

use anyhow::Result;
use netwatch_core::{AddressRange, MacAddr};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::debug;

use crate::arp::ArpProbe;
use crate::echo::EchoProbe;
use crate::mdns::MdnsProbe;

/// Probing technique that produced a result.
///
/// Declaration order is merge priority: earlier sources win field conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSource {
    Arp,
    Mdns,
    Echo,
    Static,
}

impl ProbeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeSource::Arp => "arp",
            ProbeSource::Mdns => "mdns",
            ProbeSource::Echo => "echo",
            ProbeSource::Static => "static",
        }
    }
}

impl fmt::Display for ProbeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sighting of a host by one adapter
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub ip: IpAddr,
    pub mac: Option<MacAddr>,
    pub name: Option<String>,
    pub source: ProbeSource,
    pub class_hint: Option<String>,
    /// Service type the host was announced under (mDNS only)
    pub service: Option<String>,
}

impl ProbeResult {
    pub fn new(ip: IpAddr, source: ProbeSource) -> Self {
        Self {
            ip,
            mac: None,
            name: None,
            source,
            class_hint: None,
            service: None,
        }
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Operator-configured host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticHost {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub mac: Option<MacAddr>,
    #[serde(default)]
    pub name: Option<String>,
}

/// The set of probing techniques. Every variant answers the same question:
/// which hosts in this range can be seen within this time budget.
#[derive(Debug, Clone)]
pub enum ProbeAdapter {
    Arp(ArpProbe),
    Echo(EchoProbe),
    Mdns(MdnsProbe),
    Static(Vec<StaticHost>),
    #[cfg(test)]
    Scripted(tests::Script),
}

impl ProbeAdapter {
    pub fn source(&self) -> ProbeSource {
        match self {
            ProbeAdapter::Arp(_) => ProbeSource::Arp,
            ProbeAdapter::Echo(_) => ProbeSource::Echo,
            ProbeAdapter::Mdns(_) => ProbeSource::Mdns,
            ProbeAdapter::Static(_) => ProbeSource::Static,
            #[cfg(test)]
            ProbeAdapter::Scripted(script) => script.source,
        }
    }

    /// Probe `range`, collecting for at most `timeout`. Results outside the
    /// range are dropped.
    pub async fn probe(
        &self,
        range: &AddressRange,
        interface: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<ProbeResult>> {
        let results = match self {
            ProbeAdapter::Arp(arp) => arp.probe(range, interface, timeout).await?,
            ProbeAdapter::Echo(echo) => echo.probe(range, timeout).await?,
            ProbeAdapter::Mdns(mdns) => mdns.probe(range, timeout).await?,
            ProbeAdapter::Static(hosts) => static_results(hosts, range),
            #[cfg(test)]
            ProbeAdapter::Scripted(script) => script.run().await?,
        };

        let before = results.len();
        let results: Vec<ProbeResult> = results
            .into_iter()
            .filter(|r| range.contains(r.ip))
            .collect();
        debug!(
            source = %self.source(),
            found = results.len(),
            out_of_range = before - results.len(),
            "Probe finished"
        );
        Ok(results)
    }
}

fn static_results(hosts: &[StaticHost], range: &AddressRange) -> Vec<ProbeResult> {
    hosts
        .iter()
        .filter(|h| range.contains(IpAddr::V4(h.ip)))
        .map(|h| ProbeResult {
            ip: IpAddr::V4(h.ip),
            mac: h.mac,
            name: h.name.clone(),
            source: ProbeSource::Static,
            class_hint: None,
            service: None,
        })
        .collect()
}
