//! Application state management

use anyhow::Result;
use netwatch_core::{
    AddressRange, Device, DeviceId, EventHub, InventorySink, MemoryInventory, OuiTable,
    TracingMetrics,
};
use netwatch_discovery::{DiscoveryScanner, Identifier, SystemResolver};
use netwatch_monitor::{Monitor, SystemPing};
use netwatch_snmp::SnmpClient;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;

/// Shared application state
pub struct AppState {
    /// Discovery scanner
    pub scanner: Arc<DiscoveryScanner>,
    /// Health-check scheduler
    pub monitor: Monitor,
    /// Device records
    pub inventory: Arc<MemoryInventory>,
    /// Event broadcast for WebSocket clients
    pub hub: Arc<EventHub>,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Create new application state
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let range = config.resolve_range()?;
        let vendors = load_vendors(&config.vendor.oui_path);

        let snmp = Arc::new(SnmpClient::new(config.to_snmp_config()));
        let identifier = Identifier::new(Arc::new(vendors))
            .with_management(snmp.clone())
            .with_resolver(Arc::new(SystemResolver))
            .with_timeout(config.discovery.identify_timeout());

        let inventory = Arc::new(MemoryInventory::new());
        let hub = Arc::new(EventHub::new(config.hub.capacity));

        let scanner = Arc::new(DiscoveryScanner::from_config(
            config.to_scanner_config(range),
            identifier,
            inventory.clone(),
            hub.clone(),
        ));

        let monitor = Monitor::new(
            config.monitor.clone(),
            Arc::new(SystemPing),
            inventory.clone(),
            Arc::new(TracingMetrics),
            hub.clone(),
        )?
        .with_management(snmp);

        info!(range = %range, "Application state ready");

        Ok(Arc::new(Self {
            scanner,
            monitor,
            inventory,
            hub,
            config,
        }))
    }

    /// Get current device list
    pub async fn devices(&self) -> Result<Vec<Device>> {
        self.inventory.list().await
    }

    /// Get a device by its id string (`mac:...` or `ip:...`)
    pub async fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let Ok(id) = id.parse::<DeviceId>() else {
            return Ok(None);
        };
        self.inventory.get(&id).await
    }

    pub async fn range(&self) -> AddressRange {
        self.scanner.get_config().await.range
    }
}

/// Vendor table from disk; an unusable file only disables vendor lookup
fn load_vendors(path: &str) -> OuiTable {
    match OuiTable::from_file(path) {
        Ok(table) => table,
        Err(e) => {
            warn!(path = %path, error = %e, "Vendor table unusable, vendor lookup disabled");
            OuiTable::new()
        }
    }
}
