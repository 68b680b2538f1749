//! Narrow interfaces to the inventory store and the time-series store

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::bandwidth::BandwidthPoint;
use crate::device::{Device, DeviceId, DeviceStatus};

/// Durable device records
#[async_trait]
pub trait InventorySink: Send + Sync {
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>>;

    async fn list(&self) -> Result<Vec<Device>>;

    async fn upsert(&self, device: Device) -> Result<()>;

    /// Store a discovery sighting. An existing record only takes the
    /// attributes discovery owns; its status is kept.
    async fn record_sighting(&self, device: Device) -> Result<()>;

    /// Set the status of a stored device and, when given, its last seen time.
    /// Returns `false` without writing anything if `id` is not stored.
    async fn update_status(
        &self,
        id: &DeviceId,
        status: DeviceStatus,
        seen: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}

/// Time-series points
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, f64>,
        ts: DateTime<Utc>,
    ) -> Result<()>;
}

/// Measurement names
pub const LATENCY: &str = "latency";
pub const BANDWIDTH: &str = "bandwidth";

/// Tags and fields of a latency point: `{device_id}` / `{ms, loss}`.
/// `ms` is left out when nothing answered.
pub fn latency_point(
    device_id: &DeviceId,
    ms: Option<f64>,
    loss: f64,
) -> (BTreeMap<String, String>, BTreeMap<String, f64>) {
    let tags = BTreeMap::from([("device_id".to_string(), device_id.to_string())]);
    let mut fields = BTreeMap::from([("loss".to_string(), loss)]);
    if let Some(ms) = ms {
        fields.insert("ms".to_string(), ms);
    }
    (tags, fields)
}

/// Tags and fields of a bandwidth point: `{device_id, if_index}` / `{in_bps, out_bps}`
pub fn bandwidth_point(point: &BandwidthPoint) -> (BTreeMap<String, String>, BTreeMap<String, f64>) {
    let tags = BTreeMap::from([
        ("device_id".to_string(), point.device_id.to_string()),
        ("if_index".to_string(), point.if_index.to_string()),
    ]);
    let fields = BTreeMap::from([
        ("in_bps".to_string(), point.in_bps),
        ("out_bps".to_string(), point.out_bps),
    ]);
    (tags, fields)
}

/// Metrics sink that only logs points. Used when no time-series store is attached.
#[derive(Debug, Default, Clone)]
pub struct TracingMetrics;

#[async_trait]
impl MetricsSink for TracingMetrics {
    async fn write(
        &self,
        measurement: &str,
        tags: &BTreeMap<String, String>,
        fields: &BTreeMap<String, f64>,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        debug!(
            target: "netwatch::metrics",
            measurement,
            tags = ?tags,
            fields = ?fields,
            ts = %ts,
            "Metric point"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn id() -> DeviceId {
        DeviceId::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    }

    #[test]
    fn test_latency_point_shape() {
        let (tags, fields) = latency_point(&id(), Some(11.5), 0.2);
        assert_eq!(tags["device_id"], "ip:10.0.0.1");
        assert_eq!(fields["ms"], 11.5);
        assert_eq!(fields["loss"], 0.2);

        let (_, fields) = latency_point(&id(), None, 1.0);
        assert!(!fields.contains_key("ms"));
    }

    #[test]
    fn test_bandwidth_point_shape() {
        let point = BandwidthPoint {
            device_id: id(),
            if_index: 3,
            in_bps: 12.8,
            out_bps: 0.0,
            ts: Utc::now(),
        };
        let (tags, fields) = bandwidth_point(&point);
        assert_eq!(tags["if_index"], "3");
        assert_eq!(fields["in_bps"], 12.8);
        assert_eq!(fields.len(), 2);
    }

    #[tokio::test]
    async fn test_tracing_metrics_accepts_points() {
        let (tags, fields) = latency_point(&id(), Some(1.0), 0.0);
        TracingMetrics
            .write(LATENCY, &tags, &fields, Utc::now())
            .await
            .unwrap();
    }
}
