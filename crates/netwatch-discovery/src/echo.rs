//! ICMP echo sweep using the system `ping`

use anyhow::Result;
use netwatch_core::AddressRange;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::arp::{capped_hosts, DEFAULT_MAX_HOSTS};
use crate::probe::{ProbeResult, ProbeSource};

/// Default number of pings in flight
pub const DEFAULT_CONCURRENCY: usize = 128;

/// Echo sweep settings
#[derive(Debug, Clone)]
pub struct EchoProbe {
    pub concurrency: usize,
    pub max_hosts: usize,
    /// Reply wait per ping
    pub wait: Duration,
}

impl Default for EchoProbe {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_hosts: DEFAULT_MAX_HOSTS,
            wait: Duration::from_secs(1),
        }
    }
}

impl EchoProbe {
    /// Ping every host in the range. Hosts that answered before `timeout`
    /// are returned; pings still running then are killed.
    pub async fn probe(&self, range: &AddressRange, timeout: Duration) -> Result<Vec<ProbeResult>> {
        let hosts = capped_hosts(range, self.max_hosts);
        let wait = self.wait;
        let outcome = sweep(hosts, self.concurrency, timeout, move |ip| ping_once(ip, wait)).await?;

        if outcome.unfinished > 0 {
            warn!(
                range = %range,
                answered = outcome.reachable.len(),
                unfinished = outcome.unfinished,
                "Echo sweep window closed before every host was pinged"
            );
        }
        debug!("ping found {} reachable hosts", outcome.reachable.len());
        Ok(outcome
            .reachable
            .into_iter()
            .map(|ip| ProbeResult::new(IpAddr::V4(ip), ProbeSource::Echo))
            .collect())
    }
}

/// Result of one sweep
#[derive(Debug, Default)]
pub struct Sweep {
    pub reachable: Vec<Ipv4Addr>,
    /// Hosts whose ping had not finished when the window closed
    pub unfinished: usize,
}

/// Run `ping` for each host, at most `concurrency` at a time, collecting
/// answers until `window` closes.
///
/// Fails when no ping could be run at all, so a missing or forbidden `ping`
/// shows up as a degraded method instead of an empty network.
pub async fn sweep<F, Fut>(
    hosts: Vec<Ipv4Addr>,
    concurrency: usize,
    window: Duration,
    ping: F,
) -> Result<Sweep>
where
    F: Fn(Ipv4Addr) -> Fut,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for host in hosts {
        let semaphore = Arc::clone(&semaphore);
        let attempt = ping(host);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (host, attempt.await)
        });
    }

    let mut outcome = Sweep::default();
    let mut finished = 0usize;
    let mut failed = 0usize;
    let mut last_error = None;
    let collect = async {
        while let Some(joined) = tasks.join_next().await {
            let Ok((host, result)) = joined else {
                continue;
            };
            finished += 1;
            match result {
                Ok(true) => outcome.reachable.push(host),
                Ok(false) => {}
                Err(e) => {
                    trace!(ip = %host, error = %e, "ping failed to run");
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }
    };
    let closed = tokio::time::timeout(window, collect).await.is_err();
    if closed {
        outcome.unfinished = tasks.len();
    }
    // dropping the set aborts unfinished pings and kills their children
    drop(tasks);

    if let Some(e) = last_error {
        if failed == finished {
            return Err(e.context(format!("ping could not be run for any of {} hosts", failed)));
        }
    }
    outcome.reachable.sort();
    Ok(outcome)
}

/// Single echo request; `Ok(false)` when the host did not answer
pub async fn ping_once(ip: Ipv4Addr, wait: Duration) -> Result<bool> {
    let wait_secs = wait.as_secs().max(1).to_string();
    let status = Command::new("ping")
        .args(["-n", "-q", "-c", "1", "-W", &wait_secs, &ip.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hosts(count: u8) -> Vec<Ipv4Addr> {
        (1..=count).map(|n| Ipv4Addr::new(192, 168, 1, n)).collect()
    }

    #[tokio::test]
    async fn test_sweep_fails_when_ping_cannot_run() {
        let result = sweep(hosts(8), 4, Duration::from_secs(5), |_| async {
            Err::<bool, _>(anyhow::anyhow!("No such file or directory"))
        })
        .await;
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("any of 8 hosts"));
    }

    #[tokio::test]
    async fn test_sweep_tolerates_some_failures() {
        let outcome = sweep(hosts(4), 4, Duration::from_secs(5), |ip| async move {
            match ip.octets()[3] {
                1 => Err(anyhow::anyhow!("EPERM")),
                2 => anyhow::Ok(true),
                _ => anyhow::Ok(false),
            }
        })
        .await
        .unwrap();
        assert_eq!(outcome.reachable, vec![Ipv4Addr::new(192, 168, 1, 2)]);
        assert_eq!(outcome.unfinished, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reports_unfinished_hosts() {
        let outcome = sweep(hosts(10), 1, Duration::from_millis(3500), |_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            anyhow::Ok(true)
        })
        .await
        .unwrap();
        assert_eq!(outcome.reachable.len(), 3);
        assert_eq!(outcome.unfinished, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_respects_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let ping = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            move |_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    anyhow::Ok(false)
                }
            }
        };

        let outcome = sweep(hosts(20), 4, Duration::from_secs(10), ping).await.unwrap();
        assert!(outcome.reachable.is_empty());
        assert_eq!(peak.load(Ordering::SeqCst), 4);
    }
}
