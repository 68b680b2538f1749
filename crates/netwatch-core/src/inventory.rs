//! In-memory inventory store

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::device::{Device, DeviceId, DeviceStatus};
use crate::sink::InventorySink;

/// Device records held in process memory.
///
/// Upserting a device that has a hardware address retires an address-keyed
/// record for the same network address, carrying its history over.
#[derive(Debug, Default)]
pub struct MemoryInventory {
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl InventorySink for MemoryInventory {
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn upsert(&self, mut device: Device) -> Result<()> {
        let mut devices = self.devices.write().await;

        if device.id.is_hardware() {
            let address_id = DeviceId::Ip(device.ip);
            if let Some(older) = devices.remove(&address_id) {
                debug!(
                    old_id = %address_id,
                    new_id = %device.id,
                    "Unified address-keyed record onto hardware address"
                );
                device.absorb(&older);
            }
        }

        devices.insert(device.id, device);
        Ok(())
    }

    async fn record_sighting(&self, mut device: Device) -> Result<()> {
        let mut devices = self.devices.write().await;

        if device.id.is_hardware() {
            let address_id = DeviceId::Ip(device.ip);
            if let Some(older) = devices.remove(&address_id) {
                debug!(
                    old_id = %address_id,
                    new_id = %device.id,
                    "Unified address-keyed record onto hardware address"
                );
                device.status = older.status;
                device.absorb(&older);
            }
        }

        match devices.get_mut(&device.id) {
            Some(current) => current.refresh_from(&device),
            None => {
                devices.insert(device.id, device);
            }
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: &DeviceId,
        status: DeviceStatus,
        seen: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(id) else {
            return Ok(false);
        };
        device.status = status;
        if let Some(seen) = seen {
            device.touch(seen);
        }
        Ok(true)
    }
}
