//! Netwatch SNMP - Management-protocol queries for identification and counters
//!
//! This crate wraps snmp2's async SNMPv2c session to read the system group
//! and walk the interface table of a device.

pub mod client;
pub mod oid;

pub use client::{InterfaceEntry, ManagementClient, SnmpClient, SnmpConfig, SnmpError, SystemInfo};
