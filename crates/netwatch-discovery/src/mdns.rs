//! mDNS/DNS-SD browse
//!
//! Enumerates the service types announced on the link, browses a bounded
//! number of them and reports resolved instances until the deadline.

use anyhow::{anyhow, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use netwatch_core::AddressRange;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::probe::{ProbeResult, ProbeSource};

/// DNS-SD meta query listing every announced service type
const META_QUERY: &str = "_services._dns-sd._udp.local.";

/// Browsed when the meta query finds nothing
const FALLBACK_TYPES: &[&str] = &["_http._tcp.local.", "_workstation._tcp.local.", "_ssh._tcp.local."];

/// Default cap on service types browsed per sweep
pub const DEFAULT_MAX_TYPES: usize = 10;

/// Service-discovery browse settings
#[derive(Debug, Clone)]
pub struct MdnsProbe {
    pub max_types: usize,
}

impl Default for MdnsProbe {
    fn default() -> Self {
        Self {
            max_types: DEFAULT_MAX_TYPES,
        }
    }
}

impl MdnsProbe {
    pub async fn probe(&self, range: &AddressRange, timeout: Duration) -> Result<Vec<ProbeResult>> {
        let daemon = ServiceDaemon::new().map_err(|e| anyhow!("failed to start mDNS daemon: {}", e))?;
        let result = self.browse(&daemon, range, timeout).await;
        if let Err(e) = daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown failed");
        }
        result
    }

    async fn browse(
        &self,
        daemon: &ServiceDaemon,
        range: &AddressRange,
        timeout: Duration,
    ) -> Result<Vec<ProbeResult>> {
        let deadline = Instant::now() + timeout;

        // a third of the budget goes to learning which types exist
        let types = enumerate_types(daemon, Instant::now() + timeout / 3).await?;
        let types: Vec<String> = if types.is_empty() {
            debug!("No service types announced, browsing fallback set");
            FALLBACK_TYPES.iter().map(|t| t.to_string()).collect()
        } else {
            types.into_iter().take(self.max_types).collect()
        };

        let (tx, mut rx) = mpsc::channel::<ProbeResult>(256);
        let mut browsers = JoinSet::new();
        for service_type in &types {
            let receiver = match daemon.browse(service_type) {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!(service = %service_type, error = %e, "mDNS browse failed");
                    continue;
                }
            };
            let tx = tx.clone();
            browsers.spawn(async move {
                while let Ok(event) = receiver.recv_async().await {
                    if let ServiceEvent::ServiceResolved(info) = event {
                        for result in resolved_results(&info) {
                            if tx.send(result).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        drop(tx);

        let mut by_ip: HashMap<IpAddr, ProbeResult> = HashMap::new();
        while let Ok(Some(result)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if range.contains(result.ip) {
                by_ip.entry(result.ip).or_insert(result);
            }
        }
        browsers.abort_all();

        let mut results: Vec<ProbeResult> = by_ip.into_values().collect();
        results.sort_by_key(|r| r.ip);
        debug!(types = types.len(), hosts = results.len(), "mDNS browse complete");
        Ok(results)
    }
}

/// Service types answered to the meta query before `until`
async fn enumerate_types(daemon: &ServiceDaemon, until: Instant) -> Result<BTreeSet<String>> {
    let receiver = daemon
        .browse(META_QUERY)
        .map_err(|e| anyhow!("mDNS meta query failed: {}", e))?;

    let mut types = BTreeSet::new();
    while let Ok(Ok(event)) = tokio::time::timeout_at(until, receiver.recv_async()).await {
        if let ServiceEvent::ServiceFound(_, fullname) = event {
            trace!(service = %fullname, "Service type announced");
            types.insert(normalize_type(&fullname));
        }
    }
    if let Err(e) = daemon.stop_browse(META_QUERY) {
        trace!(error = %e, "Stopping meta query failed");
    }
    Ok(types)
}

fn normalize_type(fullname: &str) -> String {
    if fullname.ends_with('.') {
        fullname.to_string()
    } else {
        format!("{}.", fullname)
    }
}

fn resolved_results(info: &ServiceInfo) -> Vec<ProbeResult> {
    let hostname = info.get_hostname().trim_end_matches('.').to_string();
    let service_type = info.get_type().to_string();
    let class_hint = class_hint(&service_type).map(str::to_string);

    info.get_addresses()
        .iter()
        .map(|addr| ProbeResult {
            ip: IpAddr::from(*addr),
            mac: None,
            name: (!hostname.is_empty()).then(|| hostname.clone()),
            source: ProbeSource::Mdns,
            class_hint: class_hint.clone(),
            service: Some(service_type.clone()),
        })
        .collect()
}

/// Device class suggested by an announced service type
pub fn class_hint(service_type: &str) -> Option<&'static str> {
    let t = service_type.to_ascii_lowercase();
    let hint = if t.contains("_ipp") || t.contains("_printer") || t.contains("_pdl-datastream") {
        "printer"
    } else if t.contains("_airplay")
        || t.contains("_raop")
        || t.contains("_googlecast")
        || t.contains("_spotify")
    {
        "media"
    } else if t.contains("_ssh") || t.contains("_sftp") {
        "ssh-host"
    } else if t.contains("_smb") || t.contains("_afpovertcp") || t.contains("_nfs") {
        "file-server"
    } else if t.contains("_hap") || t.contains("_homekit") {
        "smart-home"
    } else if t.contains("_http") {
        "web"
    } else {
        return None;
    };
    Some(hint)
}
