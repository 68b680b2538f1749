//! Identification of a single device from vendor, management and DNS sources

use netwatch_core::device::tags;
use netwatch_core::{Device, MacAddr, VendorLookup};
use netwatch_snmp::ManagementClient;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::dns::ReverseResolver;

/// Default bound on each lookup
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Which lookups to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifyFlags {
    pub use_vendor: bool,
    pub use_mgmt_protocol: bool,
    pub use_reverse_dns: bool,
}

impl Default for IdentifyFlags {
    fn default() -> Self {
        Self {
            use_vendor: true,
            use_mgmt_protocol: true,
            use_reverse_dns: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostnameSource {
    Management,
    ReverseDns,
}

/// What the lookups found. Every field is optional; an empty record is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentificationRecord {
    pub vendor: Option<String>,
    pub system_name: Option<String>,
    pub system_description: Option<String>,
    /// Seconds
    pub uptime: Option<u64>,
    pub contact: Option<String>,
    pub location: Option<String>,
    pub object_id: Option<String>,
    pub hostname: Option<String>,
    pub hostname_source: Option<HostnameSource>,
}

impl IdentificationRecord {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn has_management_data(&self) -> bool {
        self.system_name.is_some()
            || self.system_description.is_some()
            || self.uptime.is_some()
            || self.contact.is_some()
            || self.location.is_some()
            || self.object_id.is_some()
    }

    /// Write the record onto a device. A management-protocol hostname
    /// replaces the current one; a reverse-DNS hostname only fills a gap.
    pub fn apply_to(&self, device: &mut Device) {
        if let Some(vendor) = &self.vendor {
            device.vendor = Some(vendor.clone());
        }

        match (&self.hostname, self.hostname_source) {
            (Some(name), Some(HostnameSource::Management)) => device.hostname = Some(name.clone()),
            (Some(name), _) if device.hostname.is_none() => device.hostname = Some(name.clone()),
            _ => {}
        }

        if !self.has_management_data() {
            return;
        }
        device.tags.insert(tags::SNMP.to_string(), "true".to_string());
        let fields = [
            (tags::SNMP_DESCRIPTION, self.system_description.clone()),
            (tags::SNMP_LOCATION, self.location.clone()),
            (tags::SNMP_CONTACT, self.contact.clone()),
            (tags::SNMP_OBJECT_ID, self.object_id.clone()),
            (tags::SNMP_UPTIME, self.uptime.map(|u| u.to_string())),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                device.tags.insert(key.to_string(), value);
            }
        }
    }
}

/// Runs the enabled lookups for a device concurrently
pub struct Identifier {
    vendor: Arc<dyn VendorLookup>,
    management: Option<Arc<dyn ManagementClient>>,
    resolver: Option<Arc<dyn ReverseResolver>>,
    timeout: Duration,
}

impl Identifier {
    pub fn new(vendor: Arc<dyn VendorLookup>) -> Self {
        Self {
            vendor,
            management: None,
            resolver: None,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_management(mut self, client: Arc<dyn ManagementClient>) -> Self {
        self.management = Some(client);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ReverseResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn identify(
        &self,
        ip: IpAddr,
        mac: Option<MacAddr>,
        flags: IdentifyFlags,
    ) -> IdentificationRecord {
        let vendor = async {
            match mac {
                Some(mac) if flags.use_vendor => self.vendor.lookup(&mac),
                _ => None,
            }
        };

        let management = async {
            match &self.management {
                Some(client) if flags.use_mgmt_protocol => {
                    bounded(self.timeout, "snmp", ip, async {
                        client.identify(ip).await.map_err(anyhow::Error::from)
                    })
                    .await
                }
                _ => None,
            }
        };

        let reverse = async {
            match &self.resolver {
                Some(resolver) if flags.use_reverse_dns => {
                    bounded(self.timeout, "reverse_dns", ip, resolver.reverse(ip))
                        .await
                        .flatten()
                }
                _ => None,
            }
        };

        let (vendor, system, reverse_name) = tokio::join!(vendor, management, reverse);

        let mut record = IdentificationRecord {
            vendor,
            ..Default::default()
        };
        if let Some(system) = system {
            record.system_name = system.system_name;
            record.system_description = system.system_description;
            record.uptime = system.uptime;
            record.contact = system.contact;
            record.location = system.location;
            record.object_id = system.object_id;
        }

        let reverse_name = reverse_name.filter(|name| *name != ip.to_string());
        if let Some(name) = record.system_name.clone() {
            record.hostname = Some(name);
            record.hostname_source = Some(HostnameSource::Management);
        } else if let Some(name) = reverse_name {
            record.hostname = Some(name);
            record.hostname_source = Some(HostnameSource::ReverseDns);
        }

        debug!(
            ip = %ip,
            vendor = ?record.vendor,
            hostname = ?record.hostname,
            source = ?record.hostname_source,
            "Identified"
        );
        record
    }
}

/// Run a lookup under a timeout; failures and timeouts yield nothing
async fn bounded<T>(
    limit: Duration,
    lookup: &str,
    ip: IpAddr,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> Option<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            trace!(ip = %ip, lookup, error = %e, "Lookup failed");
            None
        }
        Err(_) => {
            trace!(ip = %ip, lookup, "Lookup timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use netwatch_core::OuiTable;
    use netwatch_snmp::{InterfaceEntry, SnmpError, SystemInfo};

    struct FakeSnmp {
        info: Option<SystemInfo>,
        delay: Duration,
    }

    #[async_trait]
    impl ManagementClient for FakeSnmp {
        async fn identify(&self, address: IpAddr) -> Result<SystemInfo, SnmpError> {
            tokio::time::sleep(self.delay).await;
            self.info.clone().ok_or(SnmpError::Timeout(address))
        }

        async fn interface_table(&self, address: IpAddr) -> Result<Vec<InterfaceEntry>, SnmpError> {
            Err(SnmpError::Timeout(address))
        }
    }

    struct FakeDns(Option<String>);

    #[async_trait]
    impl ReverseResolver for FakeDns {
        async fn reverse(&self, _ip: IpAddr) -> anyhow::Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    fn ip() -> IpAddr {
        "192.168.1.30".parse().unwrap()
    }

    fn mac() -> MacAddr {
        "b8:27:eb:00:00:30".parse().unwrap()
    }

    fn vendors() -> Arc<dyn VendorLookup> {
        Arc::new(OuiTable::parse("B827EB,Raspberry Pi Foundation\n"))
    }

    fn snmp(name: Option<&str>) -> Arc<dyn ManagementClient> {
        Arc::new(FakeSnmp {
            info: Some(SystemInfo {
                system_name: name.map(str::to_string),
                system_description: Some("Linux pi 6.1".into()),
                uptime: Some(3600),
                location: Some("lab".into()),
                ..Default::default()
            }),
            delay: Duration::ZERO,
        })
    }

    #[tokio::test]
    async fn test_management_hostname_wins() {
        let identifier = Identifier::new(vendors())
            .with_management(snmp(Some("pi-sensor")))
            .with_resolver(Arc::new(FakeDns(Some("pi.lan".into()))));

        let record = identifier.identify(ip(), Some(mac()), IdentifyFlags::default()).await;
        assert_eq!(record.vendor.as_deref(), Some("Raspberry Pi Foundation"));
        assert_eq!(record.hostname.as_deref(), Some("pi-sensor"));
        assert_eq!(record.hostname_source, Some(HostnameSource::Management));
        assert_eq!(record.uptime, Some(3600));
    }

    #[tokio::test]
    async fn test_reverse_dns_fallback() {
        let identifier = Identifier::new(vendors())
            .with_management(snmp(None))
            .with_resolver(Arc::new(FakeDns(Some("pi.lan".into()))));

        let record = identifier.identify(ip(), Some(mac()), IdentifyFlags::default()).await;
        assert_eq!(record.hostname.as_deref(), Some("pi.lan"));
        assert_eq!(record.hostname_source, Some(HostnameSource::ReverseDns));
    }

    #[tokio::test]
    async fn test_literal_address_answer_ignored() {
        let identifier =
            Identifier::new(vendors()).with_resolver(Arc::new(FakeDns(Some("192.168.1.30".into()))));
        let record = identifier.identify(ip(), None, IdentifyFlags::default()).await;
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_lookups_contribute_nothing() {
        let identifier = Identifier::new(vendors())
            .with_management(snmp(Some("pi-sensor")))
            .with_resolver(Arc::new(FakeDns(Some("pi.lan".into()))));
        let flags = IdentifyFlags {
            use_vendor: false,
            use_mgmt_protocol: false,
            use_reverse_dns: false,
        };
        let record = identifier.identify(ip(), Some(mac()), flags).await;
        assert!(record.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_management_times_out() {
        let slow = Arc::new(FakeSnmp {
            info: Some(SystemInfo {
                system_name: Some("late".into()),
                ..Default::default()
            }),
            delay: Duration::from_secs(30),
        });
        let identifier = Identifier::new(vendors())
            .with_management(slow)
            .with_resolver(Arc::new(FakeDns(Some("pi.lan".into()))))
            .with_timeout(Duration::from_secs(1));

        let record = identifier.identify(ip(), Some(mac()), IdentifyFlags::default()).await;
        assert!(record.system_name.is_none());
        assert_eq!(record.hostname.as_deref(), Some("pi.lan"));
        assert!(record.vendor.is_some());
    }

    #[test]
    fn test_apply_to_device() {
        let mut device = Device::new(ip(), Some(mac()), Utc::now());
        device.hostname = Some("from-mdns".into());

        let reverse_only = IdentificationRecord {
            hostname: Some("pi.lan".into()),
            hostname_source: Some(HostnameSource::ReverseDns),
            ..Default::default()
        };
        reverse_only.apply_to(&mut device);
        assert_eq!(device.hostname.as_deref(), Some("from-mdns"));
        assert!(!device.snmp_capable());

        let management = IdentificationRecord {
            vendor: Some("Raspberry Pi Foundation".into()),
            system_name: Some("pi-sensor".into()),
            location: Some("lab".into()),
            uptime: Some(42),
            hostname: Some("pi-sensor".into()),
            hostname_source: Some(HostnameSource::Management),
            ..Default::default()
        };
        management.apply_to(&mut device);
        assert_eq!(device.hostname.as_deref(), Some("pi-sensor"));
        assert_eq!(device.vendor.as_deref(), Some("Raspberry Pi Foundation"));
        assert!(device.snmp_capable());
        assert_eq!(device.tags[tags::SNMP_LOCATION], "lab");
        assert_eq!(device.tags[tags::SNMP_UPTIME], "42");
        assert!(!device.tags.contains_key(tags::SNMP_CONTACT));
    }
}
