//! Recurring discovery cycle: probe, identify, store and announce

use futures_util::stream::{self, StreamExt};
use netwatch_core::{AddressRange, Event, EventHub, InventorySink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::arp::{ArpProbe, DEFAULT_MAX_HOSTS};
use crate::echo::{EchoProbe, DEFAULT_CONCURRENCY};
use crate::identify::{IdentifyFlags, Identifier};
use crate::mdns::MdnsProbe;
use crate::orchestrator::{DegradedMethod, DiscoveryError, Orchestrator};
use crate::probe::{ProbeAdapter, StaticHost};

/// Scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Range to probe (e.g. "192.168.1.0/24")
    pub range: AddressRange,
    /// Interface for raw ARP; first usable one when unset
    pub interface: Option<String>,
    /// Pause between the end of one cycle and the start of the next
    pub interval_secs: u64,
    /// Collection window for each probe method
    pub method_timeout_ms: u64,
    pub use_arp: bool,
    pub use_echo: bool,
    pub use_mdns: bool,
    /// Pings in flight during an echo sweep
    pub echo_concurrency: usize,
    /// Hosts swept per range at most
    pub max_hosts: usize,
    pub identify: IdentifyFlags,
    /// Devices identified in parallel
    pub identify_concurrency: usize,
    pub static_hosts: Vec<StaticHost>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            range: AddressRange::default(),
            interface: None,
            interval_secs: 300,
            method_timeout_ms: 5000,
            use_arp: true,
            use_echo: true,
            use_mdns: true,
            echo_concurrency: DEFAULT_CONCURRENCY,
            max_hosts: DEFAULT_MAX_HOSTS,
            identify: IdentifyFlags::default(),
            identify_concurrency: 16,
            static_hosts: Vec::new(),
        }
    }
}

impl ScannerConfig {
    /// Probe adapters enabled by this configuration
    pub fn adapters(&self) -> Vec<ProbeAdapter> {
        let mut adapters = Vec::new();
        if self.use_arp {
            adapters.push(ProbeAdapter::Arp(ArpProbe {
                max_hosts: self.max_hosts,
            }));
        }
        if self.use_echo {
            adapters.push(ProbeAdapter::Echo(EchoProbe {
                concurrency: self.echo_concurrency,
                max_hosts: self.max_hosts,
                ..EchoProbe::default()
            }));
        }
        if self.use_mdns {
            adapters.push(ProbeAdapter::Mdns(MdnsProbe::default()));
        }
        if !self.static_hosts.is_empty() {
            adapters.push(ProbeAdapter::Static(self.static_hosts.clone()));
        }
        adapters
    }

    pub fn method_timeout(&self) -> Duration {
        Duration::from_millis(self.method_timeout_ms)
    }
}

/// What one cycle did
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub range: AddressRange,
    pub found: usize,
    pub new: usize,
    pub refreshed: usize,
    pub identified: usize,
    pub degraded: Vec<DegradedMethod>,
    pub duration_ms: u64,
}

/// Discovery scanner service
pub struct DiscoveryScanner {
    config: Arc<RwLock<ScannerConfig>>,
    orchestrator: Orchestrator,
    identifier: Identifier,
    inventory: Arc<dyn InventorySink>,
    hub: Arc<EventHub>,
}

impl DiscoveryScanner {
    pub fn new(
        config: ScannerConfig,
        orchestrator: Orchestrator,
        identifier: Identifier,
        inventory: Arc<dyn InventorySink>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            orchestrator,
            identifier,
            inventory,
            hub,
        }
    }

    /// Scanner whose adapters come from `config`
    pub fn from_config(
        config: ScannerConfig,
        identifier: Identifier,
        inventory: Arc<dyn InventorySink>,
        hub: Arc<EventHub>,
    ) -> Self {
        let orchestrator = Orchestrator::new(config.adapters());
        Self::new(config, orchestrator, identifier, inventory, hub)
    }

    /// Get current config
    pub async fn get_config(&self) -> ScannerConfig {
        self.config.read().await.clone()
    }

    /// Change the probed range at runtime; takes effect on the next cycle
    pub async fn update_range(&self, range: AddressRange) {
        self.config.write().await.range = range;
        info!(range = %range, "Scan range updated");
    }

    /// Whether a cycle for the configured range is running
    pub async fn is_scanning(&self) -> bool {
        let range = self.config.read().await.range;
        self.orchestrator.is_running(&range)
    }

    /// Run a single discovery cycle
    pub async fn scan_once(&self) -> Result<ScanSummary, DiscoveryError> {
        let config = self.config.read().await.clone();
        let started = Instant::now();

        let snapshot = self.inventory.list().await?;
        let batch = self
            .orchestrator
            .discover(
                config.range,
                config.interface.as_deref(),
                config.method_timeout(),
                &snapshot,
            )
            .await?;

        let flags = config.identify;
        let concurrency = config.identify_concurrency.max(1);
        let identifier = &self.identifier;
        let enriched: Vec<_> = stream::iter(batch.devices.iter().cloned())
            .map(|merged| async move {
                let mut merged = merged;
                let device = &merged.device;
                let wanted = merged.is_new() || device.vendor.is_none() || device.hostname.is_none();
                let mut identified = false;
                if wanted {
                    let record = identifier.identify(device.ip, device.mac, flags).await;
                    identified = !record.is_empty();
                    record.apply_to(&mut merged.device);
                }
                (merged, identified)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut summary = ScanSummary {
            range: config.range,
            found: enriched.len(),
            new: 0,
            refreshed: 0,
            identified: 0,
            degraded: batch.degraded.clone(),
            duration_ms: 0,
        };

        for (merged, identified) in enriched {
            if identified {
                summary.identified += 1;
            }
            if let Some(old) = merged.supersedes {
                debug!(old = %old, new = %merged.device.id, "Address record superseded");
            }
            self.inventory.record_sighting(merged.device.clone()).await?;
            if merged.is_new() {
                summary.new += 1;
                info!(
                    device = %merged.device.id,
                    ip = %merged.device.ip,
                    vendor = ?merged.device.vendor,
                    "New device discovered"
                );
                self.hub.publish(Event::DeviceDiscovered {
                    device: merged.device,
                });
            } else {
                summary.refreshed += 1;
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            range = %summary.range,
            found = summary.found,
            new = summary.new,
            identified = summary.identified,
            duration_ms = summary.duration_ms,
            "Scan complete"
        );
        Ok(summary)
    }

    /// Run discovery cycles until the task is dropped. Each cycle finishes
    /// before the next one is scheduled.
    pub async fn run(&self) {
        loop {
            match self.scan_once().await {
                Ok(_) => {}
                Err(DiscoveryError::CycleInProgress(range)) => {
                    debug!(range = %range, "Cycle skipped, one is already running");
                }
                Err(e) => warn!(error = %e, "Discovery cycle failed"),
            }
            let pause = self.config.read().await.interval_secs.max(1);
            tokio::time::sleep(Duration::from_secs(pause)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::ReverseResolver;
    use crate::probe::tests::Script;
    use crate::probe::{ProbeResult, ProbeSource};
    use async_trait::async_trait;
    use netwatch_core::{DeviceId, DeviceStatus, MacAddr, MemoryInventory, OuiTable};
    use std::net::{IpAddr, Ipv4Addr};

    struct FakeDns;

    #[async_trait]
    impl ReverseResolver for FakeDns {
        async fn reverse(&self, ip: IpAddr) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("host-{}.lan", ip.to_string().replace('.', "-"))))
        }
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::new([0xb8, 0x27, 0xeb, 0, 0, last])
    }

    fn identifier() -> Identifier {
        Identifier::new(Arc::new(OuiTable::parse("B827EB,Raspberry Pi Foundation\n")))
            .with_resolver(Arc::new(FakeDns))
    }

    fn config() -> ScannerConfig {
        ScannerConfig {
            range: "192.168.1.0/24".parse().unwrap(),
            method_timeout_ms: 1000,
            ..ScannerConfig::default()
        }
    }

    fn scanner(
        adapters: Vec<ProbeAdapter>,
        inventory: Arc<MemoryInventory>,
        hub: Arc<EventHub>,
    ) -> DiscoveryScanner {
        DiscoveryScanner::new(config(), Orchestrator::new(adapters), identifier(), inventory, hub)
    }

    fn arp(entries: &[u8]) -> ProbeAdapter {
        ProbeAdapter::Scripted(Script::ok(
            ProbeSource::Arp,
            entries
                .iter()
                .map(|&n| ProbeResult::new(ip(n), ProbeSource::Arp).with_mac(mac(n)))
                .collect(),
        ))
    }

    fn echo(entries: &[u8]) -> ProbeAdapter {
        ProbeAdapter::Scripted(Script::ok(
            ProbeSource::Echo,
            entries
                .iter()
                .map(|&n| ProbeResult::new(ip(n), ProbeSource::Echo))
                .collect(),
        ))
    }

    #[tokio::test]
    async fn test_scan_stores_identifies_and_announces() {
        let inventory = Arc::new(MemoryInventory::new());
        let hub = Arc::new(EventHub::default());
        let mut events = hub.subscribe();
        let scanner = scanner(vec![arp(&[1, 2]), echo(&[2, 3])], inventory.clone(), hub.clone());

        let summary = scanner.scan_once().await.unwrap();
        assert_eq!(summary.found, 3);
        assert_eq!(summary.new, 3);
        assert_eq!(summary.identified, 3);
        assert_eq!(inventory.len().await, 3);

        let pi = inventory
            .get(&DeviceId::Mac(mac(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pi.vendor.as_deref(), Some("Raspberry Pi Foundation"));
        assert_eq!(pi.hostname.as_deref(), Some("host-192-168-1-1.lan"));

        let mut announced = 0;
        while let Some(event) = events.try_recv() {
            assert_eq!(event.kind(), "device_discovered");
            announced += 1;
        }
        assert_eq!(announced, 3);
    }

    #[tokio::test]
    async fn test_rescan_is_stable_and_quiet() {
        let inventory = Arc::new(MemoryInventory::new());
        let hub = Arc::new(EventHub::default());
        let scanner = scanner(vec![arp(&[1, 2]), echo(&[3])], inventory.clone(), hub.clone());

        scanner.scan_once().await.unwrap();
        let mut events = hub.subscribe();
        let summary = scanner.scan_once().await.unwrap();

        assert_eq!(summary.new, 0);
        assert_eq!(summary.refreshed, 3);
        assert_eq!(inventory.len().await, 3);
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_address_record_unified_on_later_scan() {
        let inventory = Arc::new(MemoryInventory::new());
        let hub = Arc::new(EventHub::default());

        scanner(vec![echo(&[7])], inventory.clone(), hub.clone())
            .scan_once()
            .await
            .unwrap();
        assert!(inventory.get(&DeviceId::Ip(ip(7))).await.unwrap().is_some());

        let summary = scanner(vec![arp(&[7])], inventory.clone(), hub.clone())
            .scan_once()
            .await
            .unwrap();
        assert_eq!(summary.new, 0);
        assert_eq!(inventory.len().await, 1);
        assert!(inventory.get(&DeviceId::Mac(mac(7))).await.unwrap().is_some());
        assert!(inventory.get(&DeviceId::Ip(ip(7))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_degraded_method_reported() {
        let inventory = Arc::new(MemoryInventory::new());
        let hub = Arc::new(EventHub::default());
        let scanner = scanner(
            vec![
                arp(&[1]),
                ProbeAdapter::Scripted(Script::failing(ProbeSource::Mdns, "socket error")),
            ],
            inventory,
            hub,
        );

        let summary = scanner.scan_once().await.unwrap();
        assert_eq!(summary.found, 1);
        assert_eq!(summary.degraded.len(), 1);
        assert_eq!(summary.degraded[0].source, ProbeSource::Mdns);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_written_during_scan_survives() {
        let inventory = Arc::new(MemoryInventory::new());
        let mut stored = netwatch_core::Device::new(ip(1), Some(mac(1)), chrono::Utc::now());
        stored.status = DeviceStatus::Up;
        inventory.upsert(stored.clone()).await.unwrap();

        let mut slow = Script::ok(
            ProbeSource::Arp,
            vec![ProbeResult::new(ip(1), ProbeSource::Arp).with_mac(mac(1))],
        );
        slow.delay = Duration::from_millis(500);
        let scanner = scanner(
            vec![ProbeAdapter::Scripted(slow)],
            inventory.clone(),
            Arc::new(EventHub::default()),
        );

        let mark_down = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            inventory
                .update_status(&stored.id, DeviceStatus::Down, None)
                .await
                .unwrap()
        };
        let (summary, marked) = tokio::join!(scanner.scan_once(), mark_down);
        assert!(marked);
        assert_eq!(summary.unwrap().refreshed, 1);

        let current = inventory.get(&stored.id).await.unwrap().unwrap();
        assert_eq!(current.status, DeviceStatus::Down);
        assert_eq!(current.vendor.as_deref(), Some("Raspberry Pi Foundation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_scanning_while_cycle_runs() {
        let mut slow = Script::ok(ProbeSource::Echo, vec![ProbeResult::new(ip(4), ProbeSource::Echo)]);
        slow.delay = Duration::from_millis(200);
        let scanner = scanner(
            vec![ProbeAdapter::Scripted(slow)],
            Arc::new(MemoryInventory::new()),
            Arc::new(EventHub::default()),
        );
        assert!(!scanner.is_scanning().await);

        let check = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            scanner.is_scanning().await
        };
        let (summary, during) = tokio::join!(scanner.scan_once(), check);
        assert!(summary.is_ok());
        assert!(during);
        assert!(!scanner.is_scanning().await);
    }

    #[test]
    fn test_adapters_follow_flags() {
        let mut config = ScannerConfig::default();
        assert_eq!(config.adapters().len(), 3);

        config.use_echo = false;
        config.static_hosts.push(StaticHost {
            ip: Ipv4Addr::new(192, 168, 1, 250),
            mac: None,
            name: Some("printer".into()),
        });
        let sources: Vec<ProbeSource> = config.adapters().iter().map(|a| a.source()).collect();
        assert_eq!(sources, vec![ProbeSource::Arp, ProbeSource::Mdns, ProbeSource::Static]);
    }
}
