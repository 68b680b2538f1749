//! Up/down/unknown state machine

use chrono::{DateTime, Utc};
use netwatch_core::{DeviceId, DeviceStatus, Event};
use std::collections::HashMap;

/// Status after a burst and the change it caused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: DeviceStatus,
    pub current: DeviceStatus,
}

impl Transition {
    /// A successful burst means up, a failed one down
    pub fn after_burst(previous: DeviceStatus, success: bool) -> Self {
        let current = if success {
            DeviceStatus::Up
        } else {
            DeviceStatus::Down
        };
        Self { previous, current }
    }

    /// Event announcing this transition, if it is one worth announcing.
    ///
    /// Coming up is announced only after being down; going down is announced
    /// after being up or never probed.
    pub fn event(&self, device_id: DeviceId, ts: DateTime<Utc>) -> Option<Event> {
        match (self.previous, self.current) {
            (DeviceStatus::Down, DeviceStatus::Up) => Some(Event::DeviceUp { device_id, ts }),
            (DeviceStatus::Up | DeviceStatus::Unknown, DeviceStatus::Down) => {
                Some(Event::DeviceDown { device_id, ts })
            }
            _ => None,
        }
    }
}

/// Last decided status per device
#[derive(Debug, Default)]
pub struct StatusTracker {
    statuses: HashMap<DeviceId, DeviceStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a burst outcome. A device seen for the first time starts from
    /// `stored`, the status its inventory record carries.
    pub fn observe(&mut self, device_id: DeviceId, stored: DeviceStatus, success: bool) -> Transition {
        let previous = *self.statuses.get(&device_id).unwrap_or(&stored);
        let transition = Transition::after_burst(previous, success);
        self.statuses.insert(device_id, transition.current);
        transition
    }

    pub fn status(&self, device_id: &DeviceId) -> DeviceStatus {
        self.statuses.get(device_id).copied().unwrap_or_default()
    }

    pub fn forget(&mut self, device_id: &DeviceId) {
        self.statuses.remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn id() -> DeviceId {
        DeviceId::Ip(IpAddr::from([192, 168, 1, 9]))
    }

    fn kinds(tracker: &mut StatusTracker, outcomes: &[bool]) -> Vec<Option<&'static str>> {
        outcomes
            .iter()
            .map(|&ok| {
                tracker
                    .observe(id(), DeviceStatus::Unknown, ok)
                    .event(id(), Utc::now())
                    .map(|e| e.kind())
            })
            .collect()
    }

    #[test]
    fn test_first_success_is_silent() {
        let mut tracker = StatusTracker::new();
        assert_eq!(kinds(&mut tracker, &[true]), vec![None]);
        assert_eq!(tracker.status(&id()), DeviceStatus::Up);
    }

    #[test]
    fn test_first_failure_announces_down() {
        let mut tracker = StatusTracker::new();
        assert_eq!(kinds(&mut tracker, &[false]), vec![Some("device_down")]);
    }

    #[test]
    fn test_events_only_on_change() {
        let mut tracker = StatusTracker::new();
        let events = kinds(&mut tracker, &[true, true, false, false, true, false, true, true]);
        assert_eq!(
            events,
            vec![
                None,
                None,
                Some("device_down"),
                None,
                Some("device_up"),
                Some("device_down"),
                Some("device_up"),
                None,
            ]
        );
    }

    #[test]
    fn test_seeded_from_stored_status() {
        let mut tracker = StatusTracker::new();
        let transition = tracker.observe(id(), DeviceStatus::Down, true);
        assert_eq!(transition.previous, DeviceStatus::Down);
        assert!(matches!(
            transition.event(id(), Utc::now()),
            Some(Event::DeviceUp { .. })
        ));

        // the tracker, not the stored record, is authoritative afterwards
        let transition = tracker.observe(id(), DeviceStatus::Down, true);
        assert_eq!(transition.previous, DeviceStatus::Up);
    }
}
