//! Single reachability probes

use anyhow::Result;
use async_trait::async_trait;
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::trace;

/// One echo request and its answer
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Round trip in milliseconds, or `None` when nothing answered within `timeout`
    async fn probe(&self, ip: IpAddr, timeout: Duration) -> Result<Option<f64>>;
}

/// Echo via the system `ping` binary
#[derive(Debug, Default, Clone)]
pub struct SystemPing;

#[async_trait]
impl ReachabilityProbe for SystemPing {
    async fn probe(&self, ip: IpAddr, timeout: Duration) -> Result<Option<f64>> {
        let wait = timeout.as_secs().max(1).to_string();
        let started = tokio::time::Instant::now();
        let child = Command::new("ping")
            .args(["-n", "-c", "1", "-W", &wait, &ip.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        // ping's own -W only has second resolution
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                trace!(ip = %ip, "Ping timed out");
                return Ok(None);
            }
        };
        if !output.status.success() {
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let rtt = parse_rtt(&stdout).unwrap_or_else(|| started.elapsed().as_secs_f64() * 1000.0);
        trace!(ip = %ip, rtt_ms = rtt, "Ping reply");
        Ok(Some(rtt))
    }
}

/// Round trip from a ping reply line (`time=0.412 ms`, `time<1ms`)
pub fn parse_rtt(output: &str) -> Option<f64> {
    let start = output.find("time=").or_else(|| output.find("time<"))? + 5;
    let number: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rtt_linux() {
        let out = "PING 192.168.1.1 (192.168.1.1) 56(84) bytes of data.\n\
                   64 bytes from 192.168.1.1: icmp_seq=1 ttl=64 time=0.412 ms\n";
        assert_eq!(parse_rtt(out), Some(0.412));
    }

    #[test]
    fn test_parse_rtt_sub_millisecond_bound() {
        assert_eq!(parse_rtt("Reply from 10.0.0.1: bytes=32 time<1ms TTL=128"), Some(1.0));
    }

    #[test]
    fn test_parse_rtt_missing() {
        assert_eq!(parse_rtt("Request timeout for icmp_seq 0"), None);
        assert_eq!(parse_rtt("time=abc"), None);
    }
}
