//! netwatch discovery - finding and identifying hosts on a network
//!
//! Probe methods:
//! - ARP sweep (raw frames, `arp-scan` or the kernel neighbour table)
//! - ICMP echo sweep
//! - mDNS/DNS-SD browse
//! - statically configured hosts
//!
//! Results are merged into one device set per cycle and enriched with vendor,
//! SNMP system information and reverse DNS names.

pub mod arp;
pub mod dns;
pub mod echo;
pub mod identify;
pub mod mdns;
pub mod merge;
pub mod orchestrator;
pub mod probe;
pub mod scanner;

pub use dns::{ReverseResolver, SystemResolver};
pub use identify::{HostnameSource, IdentificationRecord, Identifier, IdentifyFlags};
pub use merge::{merge, Freshness, MergedDevice};
pub use orchestrator::{DegradedMethod, DiscoveryBatch, DiscoveryError, Orchestrator};
pub use probe::{ProbeAdapter, ProbeResult, ProbeSource, StaticHost};
pub use scanner::{DiscoveryScanner, ScanSummary, ScannerConfig};
