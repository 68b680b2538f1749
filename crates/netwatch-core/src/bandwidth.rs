//! Interface counter deltas and throughput
//!
//! Interface octet counters are monotonically increasing and wrap at their
//! declared width. Two consecutive samples of the same interface give one
//! throughput point; a first sample only establishes a baseline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::device::DeviceId;

/// Declared bit width of an interface counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterWidth {
    #[serde(rename = "32")]
    Bits32,
    #[serde(rename = "64")]
    Bits64,
}

impl CounterWidth {
    /// Largest value the counter can hold before wrapping to zero
    pub fn max_value(self) -> u64 {
        match self {
            CounterWidth::Bits32 => u64::from(u32::MAX),
            CounterWidth::Bits64 => u64::MAX,
        }
    }
}

/// In/out octet counters of one interface read at the same instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSample {
    pub in_octets: u64,
    pub out_octets: u64,
    pub width: CounterWidth,
    pub ts: DateTime<Utc>,
}

/// Throughput of one interface between two samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandwidthPoint {
    pub device_id: DeviceId,
    pub if_index: u32,
    pub in_bps: f64,
    pub out_bps: f64,
    pub ts: DateTime<Utc>,
}

/// Octets counted between two readings of a counter of the given width.
///
/// Returns `None` if either reading does not fit the declared width.
pub fn counter_delta(previous: u64, current: u64, width: CounterWidth) -> Option<u64> {
    let max = width.max_value();
    if previous > max || current > max {
        return None;
    }
    if current >= previous {
        Some(current - previous)
    } else {
        // wrapped past max back through zero
        Some((max - previous) + current + 1)
    }
}

/// Throughput between two samples of the same interface.
///
/// Yields nothing for a non-positive interval (duplicate sample or clock
/// skew), for samples of different declared widths, or for values outside
/// the declared width.
pub fn delta(
    device_id: DeviceId,
    if_index: u32,
    previous: &InterfaceSample,
    current: &InterfaceSample,
) -> Option<BandwidthPoint> {
    if previous.width != current.width {
        return None;
    }

    let interval_ms = (current.ts - previous.ts).num_milliseconds();
    if interval_ms <= 0 {
        return None;
    }
    let interval_secs = interval_ms as f64 / 1000.0;

    let in_octets = counter_delta(previous.in_octets, current.in_octets, current.width)?;
    let out_octets = counter_delta(previous.out_octets, current.out_octets, current.width)?;

    Some(BandwidthPoint {
        device_id,
        if_index,
        in_bps: in_octets as f64 * 8.0 / interval_secs,
        out_bps: out_octets as f64 * 8.0 / interval_secs,
        ts: current.ts,
    })
}

/// Remembers the previous tick's samples per device.
///
/// Each tick replaces a device's baselines wholesale, so an interface missing
/// from one tick needs a fresh baseline before it produces points again.
#[derive(Debug, Default)]
pub struct CounterTracker {
    baselines: HashMap<DeviceId, HashMap<u32, InterfaceSample>>,
}

impl CounterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one tick of samples for a device, returning a point for every
    /// interface that had a valid baseline from the previous tick.
    pub fn observe_tick(
        &mut self,
        device_id: DeviceId,
        samples: impl IntoIterator<Item = (u32, InterfaceSample)>,
    ) -> Vec<BandwidthPoint> {
        let previous = self.baselines.remove(&device_id).unwrap_or_default();
        let mut current = HashMap::new();
        let mut points = Vec::new();

        for (if_index, sample) in samples {
            if let Some(prev) = previous.get(&if_index) {
                if let Some(point) = delta(device_id, if_index, prev, &sample) {
                    points.push(point);
                }
            }
            current.insert(if_index, sample);
        }

        points.sort_by_key(|p| p.if_index);
        self.baselines.insert(device_id, current);
        points
    }

    /// Drop all baselines for a device
    pub fn forget(&mut self, device_id: &DeviceId) {
        self.baselines.remove(device_id);
    }

    pub fn tracked_interfaces(&self, device_id: &DeviceId) -> usize {
        self.baselines.get(device_id).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::net::{IpAddr, Ipv4Addr};

    fn device() -> DeviceId {
        DeviceId::Ip(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
    }

    fn sample(in_octets: u64, out_octets: u64, width: CounterWidth, ts: DateTime<Utc>) -> InterfaceSample {
        InterfaceSample {
            in_octets,
            out_octets,
            width,
            ts,
        }
    }

    #[test]
    fn test_counter_delta_plain_and_wrapped() {
        assert_eq!(counter_delta(100, 350, CounterWidth::Bits32), Some(250));
        assert_eq!(counter_delta(7, 7, CounterWidth::Bits32), Some(0));
        assert_eq!(
            counter_delta(4_294_967_290, 10, CounterWidth::Bits32),
            Some(16)
        );
        assert_eq!(counter_delta(u64::MAX - 1, 3, CounterWidth::Bits64), Some(5));
    }

    #[test]
    fn test_counter_delta_rejects_values_wider_than_declared() {
        assert_eq!(counter_delta(1, 1 << 33, CounterWidth::Bits32), None);
    }

    #[test]
    fn test_wraparound_scenario_32bit() {
        let t0 = Utc::now();
        let prev = sample(4_294_967_290, 0, CounterWidth::Bits32, t0);
        let cur = sample(10, 0, CounterWidth::Bits32, t0 + Duration::seconds(10));
        let point = delta(device(), 2, &prev, &cur).unwrap();
        assert!((point.in_bps - 12.8).abs() < 1e-9);
        assert_eq!(point.out_bps, 0.0);
        assert_eq!(point.if_index, 2);
        assert_eq!(point.ts, cur.ts);
    }

    #[test]
    fn test_wrap_never_negative_for_any_pair() {
        let t0 = Utc::now();
        let values = [0u64, 1, 1000, 2_147_483_648, 4_294_967_294, 4_294_967_295];
        for &p in &values {
            for &c in &values {
                let prev = sample(p, p, CounterWidth::Bits32, t0);
                let cur = sample(c, c, CounterWidth::Bits32, t0 + Duration::seconds(1));
                let point = delta(device(), 1, &prev, &cur).unwrap();
                assert!(point.in_bps >= 0.0 && point.out_bps >= 0.0);
                let expected = if c >= p { c - p } else { (u64::from(u32::MAX) - p) + c + 1 };
                assert_eq!(point.in_bps, expected as f64 * 8.0);
            }
        }
    }

    #[test]
    fn test_non_positive_interval_yields_nothing() {
        let t0 = Utc::now();
        let prev = sample(10, 10, CounterWidth::Bits64, t0);
        let same = sample(20, 20, CounterWidth::Bits64, t0);
        let earlier = sample(20, 20, CounterWidth::Bits64, t0 - Duration::seconds(5));
        assert!(delta(device(), 1, &prev, &same).is_none());
        assert!(delta(device(), 1, &prev, &earlier).is_none());
    }

    #[test]
    fn test_width_change_yields_nothing() {
        let t0 = Utc::now();
        let prev = sample(10, 10, CounterWidth::Bits32, t0);
        let cur = sample(20, 20, CounterWidth::Bits64, t0 + Duration::seconds(1));
        assert!(delta(device(), 1, &prev, &cur).is_none());
    }

    #[test]
    fn test_tracker_needs_baseline() {
        let mut tracker = CounterTracker::new();
        let t0 = Utc::now();

        let first = tracker.observe_tick(device(), [(1, sample(0, 0, CounterWidth::Bits64, t0))]);
        assert!(first.is_empty());

        let second = tracker.observe_tick(
            device(),
            [(1, sample(1000, 500, CounterWidth::Bits64, t0 + Duration::seconds(2)))],
        );
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].in_bps, 4000.0);
        assert_eq!(second[0].out_bps, 2000.0);
    }

    #[test]
    fn test_tracker_interface_missing_from_previous_tick() {
        let mut tracker = CounterTracker::new();
        let t0 = Utc::now();
        let w = CounterWidth::Bits32;

        tracker.observe_tick(device(), [(1, sample(0, 0, w, t0)), (2, sample(0, 0, w, t0))]);
        // interface 2 disappears for one tick
        let points = tracker.observe_tick(device(), [(1, sample(10, 10, w, t0 + Duration::seconds(1)))]);
        assert_eq!(points.len(), 1);
        assert_eq!(tracker.tracked_interfaces(&device()), 1);

        let points = tracker.observe_tick(
            device(),
            [
                (1, sample(20, 20, w, t0 + Duration::seconds(2))),
                (2, sample(50, 50, w, t0 + Duration::seconds(2))),
            ],
        );
        assert_eq!(points.iter().map(|p| p.if_index).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_tracker_forget() {
        let mut tracker = CounterTracker::new();
        let t0 = Utc::now();
        tracker.observe_tick(device(), [(1, sample(0, 0, CounterWidth::Bits32, t0))]);
        tracker.forget(&device());
        let points = tracker.observe_tick(
            device(),
            [(1, sample(5, 5, CounterWidth::Bits32, t0 + Duration::seconds(1)))],
        );
        assert!(points.is_empty());
    }
}
