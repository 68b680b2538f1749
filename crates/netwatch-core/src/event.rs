//! Events published to live observers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bandwidth::BandwidthPoint;
use crate::device::{Device, DeviceId};

/// Discovery, status and metric events.
///
/// Serialized with a `type` tag, e.g. `{"type":"device_up","device_id":...,"ts":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    DeviceDiscovered {
        device: Device,
    },
    DeviceUp {
        device_id: DeviceId,
        ts: DateTime<Utc>,
    },
    DeviceDown {
        device_id: DeviceId,
        ts: DateTime<Utc>,
    },
    Latency {
        device_id: DeviceId,
        /// Average round trip of the answered probes; absent on total loss
        ms: Option<f64>,
        /// Lost fraction of the burst, 0.0..=1.0
        loss: f64,
        ts: DateTime<Utc>,
    },
    Bandwidth {
        device_id: DeviceId,
        if_index: u32,
        in_bps: f64,
        out_bps: f64,
        ts: DateTime<Utc>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::DeviceDiscovered { .. } => "device_discovered",
            Event::DeviceUp { .. } => "device_up",
            Event::DeviceDown { .. } => "device_down",
            Event::Latency { .. } => "latency",
            Event::Bandwidth { .. } => "bandwidth",
        }
    }

    /// Device the event is about
    pub fn device_id(&self) -> DeviceId {
        match self {
            Event::DeviceDiscovered { device } => device.id,
            Event::DeviceUp { device_id, .. }
            | Event::DeviceDown { device_id, .. }
            | Event::Latency { device_id, .. }
            | Event::Bandwidth { device_id, .. } => *device_id,
        }
    }
}

impl From<BandwidthPoint> for Event {
    fn from(point: BandwidthPoint) -> Self {
        Event::Bandwidth {
            device_id: point.device_id,
            if_index: point.if_index,
            in_bps: point.in_bps,
            out_bps: point.out_bps,
            ts: point.ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_event_wire_format() {
        let id = DeviceId::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);

        let json = serde_json::to_value(Event::Latency {
            device_id: id,
            ms: Some(11.5),
            loss: 0.2,
            ts,
        })
        .unwrap();
        assert_eq!(json["type"], "latency");
        assert_eq!(json["device_id"], "ip:10.0.0.5");
        assert_eq!(json["ms"], 11.5);
        assert_eq!(json["loss"], 0.2);

        let json = serde_json::to_value(Event::DeviceDown { device_id: id, ts }).unwrap();
        assert_eq!(json["type"], "device_down");
        assert_eq!(json.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_total_loss_has_null_latency() {
        let id = DeviceId::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 6)));
        let event = Event::Latency {
            device_id: id,
            ms: None,
            loss: 1.0,
            ts: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["ms"].is_null());
        assert_eq!(event.kind(), "latency");
        assert_eq!(event.device_id(), id);
    }
}
