//! netwatch monitor - recurring reachability and bandwidth checks
//!
//! A [`Monitor`] probes every inventoried device with a short burst each
//! tick, runs the up/down/unknown state machine and feeds SNMP interface
//! counters into the bandwidth delta engine.

pub mod health;
pub mod ping;
pub mod scheduler;
pub mod status;

pub use health::{BurstSummary, HealthError, HealthSample};
pub use ping::{ReachabilityProbe, SystemPing};
pub use scheduler::{Monitor, MonitorConfig, TickOutcome, TickReport};
pub use status::{StatusTracker, Transition};
