//! Discovery orchestration: concurrent probe adapters, merged into one batch

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use netwatch_core::{AddressRange, Device};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::merge::{merge, MergedDevice};
use crate::probe::{ProbeAdapter, ProbeSource};

/// Extra time an adapter gets past its collection window before it is cut off
const ADAPTER_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("discovery of {0} is already in progress")]
    CycleInProgress(AddressRange),
    #[error("inventory unavailable: {0}")]
    Inventory(#[from] anyhow::Error),
}

/// A probe method that contributed nothing to a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DegradedMethod {
    pub source: ProbeSource,
    pub reason: String,
}

/// Outcome of one discovery pass over a range
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryBatch {
    pub range: AddressRange,
    pub devices: Vec<MergedDevice>,
    pub degraded: Vec<DegradedMethod>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

impl DiscoveryBatch {
    pub fn new_devices(&self) -> impl Iterator<Item = &MergedDevice> {
        self.devices.iter().filter(|m| m.is_new())
    }
}

/// Runs the configured adapters for a range and merges their results
pub struct Orchestrator {
    adapters: Vec<ProbeAdapter>,
    running: Arc<Mutex<HashSet<AddressRange>>>,
}

/// Releases a range's slot when the pass ends, however it ends
struct RangeGuard {
    range: AddressRange,
    running: Arc<Mutex<HashSet<AddressRange>>>,
}

impl Drop for RangeGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.range);
    }
}

impl Orchestrator {
    pub fn new(adapters: Vec<ProbeAdapter>) -> Self {
        Self {
            adapters,
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a pass over `range` is running
    pub fn is_running(&self, range: &AddressRange) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(range)
    }

    fn try_claim(&self, range: AddressRange) -> Result<RangeGuard, DiscoveryError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(range) {
            return Err(DiscoveryError::CycleInProgress(range));
        }
        Ok(RangeGuard {
            range,
            running: Arc::clone(&self.running),
        })
    }

    /// Probe `range` with every adapter concurrently, each bounded by
    /// `per_method_timeout`, and merge against `snapshot`.
    ///
    /// A second call for a range that is still being probed is rejected.
    pub async fn discover(
        &self,
        range: AddressRange,
        interface: Option<&str>,
        per_method_timeout: Duration,
        snapshot: &[Device],
    ) -> Result<DiscoveryBatch, DiscoveryError> {
        let _guard = self.try_claim(range)?;
        let started = Utc::now();
        info!(range = %range, adapters = self.adapters.len(), "Starting discovery");

        let probes = self.adapters.iter().map(|adapter| async move {
            let source = adapter.source();
            let outcome = tokio::time::timeout(
                per_method_timeout + ADAPTER_GRACE,
                adapter.probe(&range, interface, per_method_timeout),
            )
            .await;
            (source, outcome)
        });

        let mut results = Vec::new();
        let mut degraded = Vec::new();
        for (source, outcome) in join_all(probes).await {
            match outcome {
                Ok(Ok(found)) => {
                    debug!(source = %source, found = found.len(), "Adapter finished");
                    results.extend(found);
                }
                Ok(Err(e)) => {
                    warn!(source = %source, error = %e, "Adapter failed");
                    degraded.push(DegradedMethod {
                        source,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(source = %source, "Adapter timed out");
                    degraded.push(DegradedMethod {
                        source,
                        reason: "timed out".to_string(),
                    });
                }
            }
        }

        let devices = merge(&results, snapshot, Utc::now());
        let batch = DiscoveryBatch {
            range,
            devices,
            degraded,
            started,
            finished: Utc::now(),
        };

        info!(
            range = %range,
            devices = batch.devices.len(),
            new = batch.new_devices().count(),
            degraded = batch.degraded.len(),
            "Discovery complete"
        );
        Ok(batch)
    }
}
