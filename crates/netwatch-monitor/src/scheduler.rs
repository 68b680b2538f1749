//! Recurring health checks over the inventory
//!
//! Every tick probes each device with a short burst, decides its status,
//! publishes the transition (if any) followed by a latency event, and for
//! SNMP-capable devices turns interface counters into bandwidth points.

use anyhow::Result;
use chrono::Utc;
use netwatch_core::sink::{bandwidth_point, latency_point, BANDWIDTH, LATENCY};
use netwatch_core::{
    CounterTracker, Device, DeviceId, DeviceStatus, Event, EventHub, InterfaceSample,
    InventorySink, MetricsSink,
};
use netwatch_snmp::ManagementClient;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::health::{burst, check_ceiling, BurstSummary, HealthError};
use crate::ping::ReachabilityProbe;
use crate::status::StatusTracker;

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    /// Probes per device per tick
    pub burst_count: u32,
    pub probe_timeout_ms: u64,
    /// A burst losing at least this fraction marks the device down
    pub loss_ceiling: f64,
    /// Devices checked in parallel
    pub concurrency: usize,
    /// Poll interface counters of SNMP-capable devices
    pub bandwidth: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            burst_count: 4,
            probe_timeout_ms: 2000,
            loss_ceiling: 1.0,
            concurrency: 64,
            bandwidth: true,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), HealthError> {
        if self.burst_count == 0 {
            return Err(HealthError::EmptyBurst);
        }
        check_ceiling(self.loss_ceiling)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// What happened to one device during a tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Probed {
        status: DeviceStatus,
        summary: BurstSummary,
        bandwidth_points: usize,
    },
    /// The previous tick for this device is still running
    Skipped,
    /// Not in the inventory
    Missing,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub outcomes: Vec<(DeviceId, TickOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, id: &DeviceId) -> Option<&TickOutcome> {
        self.outcomes.iter().find(|(d, _)| d == id).map(|(_, o)| o)
    }

    pub fn probed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TickOutcome::Probed { .. }))
            .count()
    }
}

/// Health-check scheduler. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Monitor {
    config: Arc<MonitorConfig>,
    probe: Arc<dyn ReachabilityProbe>,
    management: Option<Arc<dyn ManagementClient>>,
    inventory: Arc<dyn InventorySink>,
    metrics: Arc<dyn MetricsSink>,
    hub: Arc<EventHub>,
    statuses: Arc<Mutex<StatusTracker>>,
    counters: Arc<Mutex<CounterTracker>>,
    in_flight: Arc<Mutex<HashSet<DeviceId>>>,
    permits: Arc<Semaphore>,
}

/// Per-device token; released when the device's check ends
struct DeviceGuard {
    id: DeviceId,
    in_flight: Arc<Mutex<HashSet<DeviceId>>>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        probe: Arc<dyn ReachabilityProbe>,
        inventory: Arc<dyn InventorySink>,
        metrics: Arc<dyn MetricsSink>,
        hub: Arc<EventHub>,
    ) -> Result<Self, HealthError> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Ok(Self {
            config: Arc::new(config),
            probe,
            management: None,
            inventory,
            metrics,
            hub,
            statuses: Arc::new(Mutex::new(StatusTracker::new())),
            counters: Arc::new(Mutex::new(CounterTracker::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits,
        })
    }

    /// Enable interface counter polling through `client`
    pub fn with_management(mut self, client: Arc<dyn ManagementClient>) -> Self {
        self.management = Some(client);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn try_claim(&self, id: DeviceId) -> Option<DeviceGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(id) {
            return None;
        }
        Some(DeviceGuard {
            id,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Check every listed device once. Devices are checked independently;
    /// one whose previous check is still running is skipped.
    pub async fn tick(&self, device_ids: &[DeviceId]) -> TickReport {
        let mut report = TickReport::default();
        let mut tasks = JoinSet::new();

        for &id in device_ids {
            let Some(guard) = self.try_claim(id) else {
                debug!(device = %id, "Previous check still running, skipping");
                report.outcomes.push((id, TickOutcome::Skipped));
                continue;
            };
            let monitor = self.clone();
            tasks.spawn(async move {
                let _guard = guard;
                let outcome = match monitor.check_device(id).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(device = %id, error = %e, "Health check failed");
                        TickOutcome::Failed(e.to_string())
                    }
                };
                (id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => report.outcomes.push(entry),
                Err(e) => warn!(error = %e, "Health check task aborted"),
            }
        }
        report
    }

    async fn check_device(&self, id: DeviceId) -> Result<TickOutcome> {
        let _permit = self.permits.acquire().await?;

        let Some(device) = self.inventory.get(&id).await? else {
            return Ok(TickOutcome::Missing);
        };

        let samples = burst(
            self.probe.as_ref(),
            device.ip,
            self.config.burst_count,
            self.config.probe_timeout(),
        )
        .await?;
        let summary = BurstSummary::from_samples(&samples)?;
        let success = summary.is_success(self.config.loss_ceiling);
        let now = Utc::now();

        let transition = self
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(id, device.status, success);

        // status change goes out before the latency it was decided from
        if let Some(event) = transition.event(id, now) {
            info!(
                device = %id,
                ip = %device.ip,
                from = %transition.previous,
                to = %transition.current,
                "Device status changed"
            );
            self.hub.publish(event);
        }
        self.hub.publish(Event::Latency {
            device_id: id,
            ms: summary.avg_ms,
            loss: summary.loss,
            ts: now,
        });

        let (tags, fields) = latency_point(&id, summary.avg_ms, summary.loss);
        if let Err(e) = self.metrics.write(LATENCY, &tags, &fields, now).await {
            warn!(device = %id, error = %e, "Failed to write latency point");
        }

        let bandwidth_points = if success {
            self.poll_bandwidth(&device).await
        } else {
            // the next point needs a baseline from the tick right before it
            self.forget_counters(&id);
            0
        };

        let seen = (transition.current == DeviceStatus::Up).then_some(now);
        if !self.inventory.update_status(&id, transition.current, seen).await? {
            debug!(device = %id, "Record retired during the check, dropping its state");
            self.statuses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .forget(&id);
            self.forget_counters(&id);
        }
        Ok(TickOutcome::Probed {
            status: transition.current,
            summary,
            bandwidth_points,
        })
    }

    /// Sample interface counters and publish a point per interface that has
    /// a baseline from the previous tick.
    async fn poll_bandwidth(&self, device: &Device) -> usize {
        let Some(client) = &self.management else {
            return 0;
        };
        if !self.config.bandwidth || !device.snmp_capable() {
            return 0;
        }

        let table = match client.interface_table(device.ip).await {
            Ok(table) => table,
            Err(e) => {
                debug!(device = %device.id, error = %e, "Interface counters unavailable");
                self.forget_counters(&device.id);
                return 0;
            }
        };
        let ts = Utc::now();
        let samples = table.into_iter().map(|entry| {
            (
                entry.if_index,
                InterfaceSample {
                    in_octets: entry.in_octets,
                    out_octets: entry.out_octets,
                    width: entry.counter_width,
                    ts,
                },
            )
        });

        let points = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe_tick(device.id, samples);

        for point in &points {
            let (tags, fields) = bandwidth_point(point);
            if let Err(e) = self.metrics.write(BANDWIDTH, &tags, &fields, point.ts).await {
                warn!(device = %device.id, error = %e, "Failed to write bandwidth point");
            }
            self.hub.publish(Event::from(point.clone()));
        }
        points.len()
    }

    fn forget_counters(&self, id: &DeviceId) {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget(id);
    }

    /// Tick over the whole inventory forever. Each tick finishes before the
    /// next is scheduled.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval_secs,
            burst = self.config.burst_count,
            "Monitor started"
        );
        loop {
            match self.inventory.list().await {
                Ok(devices) => {
                    let ids: Vec<DeviceId> = devices.iter().map(|d| d.id).collect();
                    let report = self.tick(&ids).await;
                    debug!(devices = ids.len(), probed = report.probed(), "Monitor tick complete");
                }
                Err(e) => warn!(error = %e, "Inventory unavailable, tick skipped"),
            }
            tokio::time::sleep(Duration::from_secs(self.config.interval_secs.max(1))).await;
        }
    }
}
