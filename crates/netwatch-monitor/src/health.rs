//! Probe bursts and their aggregation

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

use crate::ping::ReachabilityProbe;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HealthError {
    #[error("a burst needs at least one probe")]
    EmptyBurst,
    #[error("loss ceiling must be in (0, 1], got {0}")]
    InvalidCeiling(f64),
}

/// Outcome of one probe
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthSample {
    /// Round trip in milliseconds; absent when the probe was lost
    pub rtt_ms: Option<f64>,
    pub ts: DateTime<Utc>,
}

/// Aggregate of one burst
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BurstSummary {
    pub sent: u32,
    pub received: u32,
    pub avg_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    /// Lost fraction, 0.0..=1.0
    pub loss: f64,
}

impl BurstSummary {
    /// Latency over the answered probes only; loss over all of them.
    pub fn from_samples(samples: &[HealthSample]) -> Result<Self, HealthError> {
        if samples.is_empty() {
            return Err(HealthError::EmptyBurst);
        }

        let rtts: Vec<f64> = samples.iter().filter_map(|s| s.rtt_ms).collect();
        let sent = samples.len() as u32;
        let received = rtts.len() as u32;

        let (avg_ms, min_ms, max_ms) = if rtts.is_empty() {
            (None, None, None)
        } else {
            let sum: f64 = rtts.iter().sum();
            (
                Some(sum / rtts.len() as f64),
                rtts.iter().copied().reduce(f64::min),
                rtts.iter().copied().reduce(f64::max),
            )
        };

        Ok(Self {
            sent,
            received,
            avg_ms,
            min_ms,
            max_ms,
            loss: f64::from(sent - received) / f64::from(sent),
        })
    }

    /// Whether the burst counts as reachable under `ceiling`
    pub fn is_success(&self, ceiling: f64) -> bool {
        self.received > 0 && self.loss < ceiling
    }
}

/// Reject ceilings outside (0, 1]
pub fn check_ceiling(ceiling: f64) -> Result<(), HealthError> {
    if ceiling > 0.0 && ceiling <= 1.0 {
        Ok(())
    } else {
        Err(HealthError::InvalidCeiling(ceiling))
    }
}

/// Send `count` probes one after another. A probe that errors counts as lost.
pub async fn burst(
    probe: &dyn ReachabilityProbe,
    ip: IpAddr,
    count: u32,
    timeout: Duration,
) -> Result<Vec<HealthSample>, HealthError> {
    if count == 0 {
        return Err(HealthError::EmptyBurst);
    }

    let mut samples = Vec::with_capacity(count as usize);
    for seq in 0..count {
        let rtt_ms = match tokio::time::timeout(timeout, probe.probe(ip, timeout)).await {
            Ok(Ok(rtt)) => rtt,
            Ok(Err(e)) => {
                trace!(ip = %ip, seq, error = %e, "Probe failed");
                None
            }
            Err(_) => None,
        };
        samples.push(HealthSample {
            rtt_ms,
            ts: Utc::now(),
        });
    }
    Ok(samples)
}
