//! Reverse DNS lookups

use anyhow::Result;
use async_trait::async_trait;
use dns_lookup::lookup_addr;
use std::net::IpAddr;
use tracing::trace;

/// Address to name resolution
#[async_trait]
pub trait ReverseResolver: Send + Sync {
    async fn reverse(&self, ip: IpAddr) -> Result<Option<String>>;
}

/// Resolver backed by the system's `getnameinfo`
#[derive(Debug, Default, Clone)]
pub struct SystemResolver;

#[async_trait]
impl ReverseResolver for SystemResolver {
    async fn reverse(&self, ip: IpAddr) -> Result<Option<String>> {
        // getnameinfo blocks
        let name = tokio::task::spawn_blocking(move || lookup_addr(&ip)).await??;
        trace!(ip = %ip, name = %name, "Reverse lookup");
        Ok(usable_name(ip, &name))
    }
}

/// Resolver answers that are just the address echoed back carry no name
pub fn usable_name(ip: IpAddr, name: &str) -> Option<String> {
    let name = name.trim().trim_end_matches('.');
    if name.is_empty() || name == ip.to_string() {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_name() {
        let ip: IpAddr = "192.168.1.20".parse().unwrap();
        assert_eq!(usable_name(ip, "nas.lan.").as_deref(), Some("nas.lan"));
        assert_eq!(usable_name(ip, "192.168.1.20"), None);
        assert_eq!(usable_name(ip, ""), None);
    }
}
