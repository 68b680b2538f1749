//! Configuration loading and validation

use anyhow::{bail, Context, Result};
use netwatch_core::hub::DEFAULT_SUBSCRIBER_CAPACITY;
use netwatch_core::AddressRange;
use netwatch_discovery::{IdentifyFlags, ScannerConfig, StaticHost};
use netwatch_monitor::MonitorConfig;
use netwatch_snmp::SnmpConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub snmp: SnmpSection,
    #[serde(default)]
    pub vendor: VendorConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default, rename = "static_host")]
    pub static_hosts: Vec<StaticHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for web server
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Range to sweep; detected from the first non-loopback interface when unset
    #[serde(default)]
    pub range: Option<AddressRange>,
    /// Interface for raw ARP
    #[serde(default)]
    pub interface: Option<String>,
    /// Pause between discovery cycles in seconds
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,
    /// Collection window per probe method
    #[serde(default = "default_method_timeout")]
    pub method_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub use_arp: bool,
    #[serde(default = "default_true")]
    pub use_echo: bool,
    #[serde(default = "default_true")]
    pub use_mdns: bool,
    #[serde(default = "default_echo_concurrency")]
    pub echo_concurrency: usize,
    #[serde(default = "default_max_hosts")]
    pub max_hosts: usize,
    #[serde(default)]
    pub identify: IdentifyFlags,
    /// Bound on each identification lookup
    #[serde(default = "default_identify_timeout")]
    pub identify_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            range: None,
            interface: None,
            interval_secs: default_discovery_interval(),
            method_timeout_ms: default_method_timeout(),
            use_arp: true,
            use_echo: true,
            use_mdns: true,
            echo_concurrency: default_echo_concurrency(),
            max_hosts: default_max_hosts(),
            identify: IdentifyFlags::default(),
            identify_timeout_ms: default_identify_timeout(),
        }
    }
}

impl DiscoveryConfig {
    pub fn identify_timeout(&self) -> Duration {
        Duration::from_millis(self.identify_timeout_ms)
    }
}

fn default_discovery_interval() -> u64 {
    300
}

fn default_method_timeout() -> u64 {
    5000
}

fn default_echo_concurrency() -> usize {
    netwatch_discovery::echo::DEFAULT_CONCURRENCY
}

fn default_max_hosts() -> usize {
    netwatch_discovery::arp::DEFAULT_MAX_HOSTS
}

fn default_identify_timeout() -> u64 {
    netwatch_discovery::identify::DEFAULT_LOOKUP_TIMEOUT.as_millis() as u64
}

fn default_true() -> bool {
    true
}

/// SNMPv2c session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpSection {
    #[serde(default = "default_community")]
    pub community: String,
    #[serde(default = "default_snmp_port")]
    pub port: u16,
    #[serde(default = "default_snmp_timeout")]
    pub timeout_ms: u64,
}

impl Default for SnmpSection {
    fn default() -> Self {
        Self {
            community: default_community(),
            port: default_snmp_port(),
            timeout_ms: default_snmp_timeout(),
        }
    }
}

fn default_community() -> String {
    "public".to_string()
}

fn default_snmp_port() -> u16 {
    netwatch_snmp::oid::SNMP_PORT
}

fn default_snmp_timeout() -> u64 {
    netwatch_snmp::client::DEFAULT_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    /// Pre-downloaded OUI table (CSV cache or Wireshark `manuf`)
    #[serde(default = "default_oui_path")]
    pub oui_path: String,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            oui_path: default_oui_path(),
        }
    }
}

fn default_oui_path() -> String {
    "./data/oui.csv".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Events queued per subscriber before the oldest are dropped
    #[serde(default = "default_hub_capacity")]
    pub capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: default_hub_capacity(),
        }
    }
}

fn default_hub_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}

impl Config {
    /// Reject values that would make a cycle fail on every run
    pub fn validate(&self) -> Result<()> {
        self.monitor
            .validate()
            .context("invalid [monitor] section")?;
        if self.hub.capacity == 0 {
            bail!("[hub] capacity must be at least 1");
        }
        Ok(())
    }

    /// Convert to ScannerConfig for the given range
    pub fn to_scanner_config(&self, range: AddressRange) -> ScannerConfig {
        ScannerConfig {
            range,
            interface: self.discovery.interface.clone(),
            interval_secs: self.discovery.interval_secs,
            method_timeout_ms: self.discovery.method_timeout_ms,
            use_arp: self.discovery.use_arp,
            use_echo: self.discovery.use_echo,
            use_mdns: self.discovery.use_mdns,
            echo_concurrency: self.discovery.echo_concurrency,
            max_hosts: self.discovery.max_hosts,
            identify: self.discovery.identify,
            static_hosts: self.static_hosts.clone(),
            ..ScannerConfig::default()
        }
    }

    pub fn to_snmp_config(&self) -> SnmpConfig {
        SnmpConfig {
            community: self.snmp.community.clone(),
            port: self.snmp.port,
            timeout: Duration::from_millis(self.snmp.timeout_ms),
        }
    }

    /// The configured range, or the one of the first usable interface
    pub fn resolve_range(&self) -> Result<AddressRange> {
        if let Some(range) = self.discovery.range {
            return Ok(range);
        }
        let Some(iface) = ipv4_interfaces().into_iter().next() else {
            bail!("no [discovery] range configured and no IPv4 interface to derive one from");
        };
        info!(interface = %iface.name, range = %iface.range, "Detected scan range");
        Ok(iface.range)
    }
}

/// IPv4 address of a local interface
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub ip: Ipv4Addr,
    pub range: AddressRange,
}

/// Non-loopback, non-virtual interfaces with an IPv4 address
pub fn ipv4_interfaces() -> Vec<InterfaceInfo> {
    use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};

    let interfaces = match NetworkInterface::show() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            debug!(error = %e, "Listing interfaces failed");
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .filter(|iface| is_physical(&iface.name))
        .filter_map(|iface| {
            iface.addr.iter().find_map(|addr| match addr {
                Addr::V4(v4) if !v4.ip.is_loopback() && !v4.ip.is_link_local() => {
                    range_for(v4.ip, v4.netmask).map(|range| InterfaceInfo {
                        name: iface.name.clone(),
                        ip: v4.ip,
                        range,
                    })
                }
                _ => None,
            })
        })
        .collect()
}

fn is_physical(name: &str) -> bool {
    !["lo", "docker", "br-", "veth", "virbr", "tun", "tap"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Network containing `ip` under `netmask` (/24 when the mask is unknown)
pub fn range_for(ip: Ipv4Addr, netmask: Option<Ipv4Addr>) -> Option<AddressRange> {
    let prefix = netmask.map_or(24, |m| u32::from(m).count_ones() as u8);
    AddressRange::new(ip, prefix).ok()
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration");
        config
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let mut config = Config::default();
    config.discovery.range = Some(AddressRange::default());
    config.static_hosts.push(StaticHost {
        ip: Ipv4Addr::new(192, 168, 1, 1),
        mac: None,
        name: Some("gateway".to_string()),
    });

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.daemon.bind, "0.0.0.0:8080");
        assert_eq!(config.monitor.interval_secs, 5);
        assert_eq!(config.monitor.burst_count, 4);
        assert_eq!(config.monitor.loss_ceiling, 1.0);
        assert_eq!(config.hub.capacity, 256);
        assert!(config.discovery.range.is_none());
        assert_eq!(config.discovery.identify_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[discovery]
range = "10.1.2.0/24"
use_mdns = false

identify_timeout_ms = 750

[discovery.identify]
use_reverse_dns = false

[monitor]
burst_count = 6

[[static_host]]
ip = "10.1.2.50"
name = "nas"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.discovery.range.unwrap().to_string(), "10.1.2.0/24");
        assert!(!config.discovery.use_mdns);
        assert!(config.discovery.use_arp);
        assert!(!config.discovery.identify.use_reverse_dns);
        assert!(config.discovery.identify.use_vendor);
        assert_eq!(config.discovery.identify_timeout(), Duration::from_millis(750));
        assert_eq!(config.monitor.burst_count, 6);
        assert_eq!(config.monitor.probe_timeout_ms, 2000);
        assert_eq!(config.static_hosts.len(), 1);
        assert_eq!(config.static_hosts[0].name.as_deref(), Some("nas"));

        let scanner = config.to_scanner_config(config.resolve_range().unwrap());
        assert_eq!(scanner.adapters().len(), 3);
    }

    #[test]
    fn test_invalid_ceiling_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\nloss_ceiling = 1.5").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_malformed_range_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[discovery]\nrange = \"10.1.2.0\"").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netwatch.toml");
        save_default_config(&path).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.discovery.range, Some(AddressRange::default()));
        assert_eq!(config.static_hosts.len(), 1);
    }

    #[test]
    fn test_range_for_interface() {
        let range = range_for(
            Ipv4Addr::new(192, 168, 7, 23),
            Some(Ipv4Addr::new(255, 255, 255, 0)),
        )
        .unwrap();
        assert_eq!(range.to_string(), "192.168.7.0/24");
        let range = range_for(Ipv4Addr::new(10, 0, 5, 9), None).unwrap();
        assert_eq!(range.to_string(), "10.0.5.0/24");
        assert!(!is_physical("docker0"));
        assert!(is_physical("eth0"));
    }
}
