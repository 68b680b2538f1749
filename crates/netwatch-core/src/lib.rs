//! Netwatch Core - Device model, events, and shared engines
//!
//! This crate provides the foundational types for the netwatch system:
//! - Device and identity types for tracking discovered hosts
//! - Events and the process-wide broadcast hub
//! - Inventory and metrics sink interfaces, with an in-memory inventory
//! - Address ranges, vendor (OUI) lookup and interface counter math

pub mod bandwidth;
pub mod device;
pub mod event;
pub mod hub;
pub mod inventory;
pub mod range;
pub mod sink;
pub mod vendor;

pub use bandwidth::{BandwidthPoint, CounterTracker, CounterWidth, InterfaceSample};
pub use device::{Device, DeviceId, DeviceStatus, MacAddr, MacParseError};
pub use event::Event;
pub use hub::{EventHub, Subscription};
pub use inventory::MemoryInventory;
pub use range::{AddressRange, RangeError};
pub use sink::{InventorySink, MetricsSink, TracingMetrics};
pub use vendor::{OuiTable, VendorError, VendorLookup};
