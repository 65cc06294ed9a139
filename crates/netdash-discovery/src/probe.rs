//! Active probing primitives and concurrency limits

use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::platform::{NetworkPlatform, Os};

/// Default TCP connect timeout for port checks
pub const TCP_TIMEOUT: Duration = Duration::from_millis(600);

/// Budget for one reverse DNS lookup
pub const DNS_TIMEOUT: Duration = Duration::from_millis(500);

/// Command line and hard timeout for a single ping
pub fn ping_command(os: Os, host: Ipv4Addr, timeout_ms: u64) -> (Vec<String>, Duration) {
    let host = host.to_string();
    match os {
        Os::Windows => {
            let wait = Duration::from_secs((timeout_ms / 1000 + 2).max(2));
            let argv = vec!["ping".into(), "-n".into(), "1".into(), "-w".into(), timeout_ms.to_string(), host];
            (argv, wait)
        }
        // BSD ping takes -W in milliseconds
        Os::MacOs => {
            let argv = vec!["ping".into(), "-c".into(), "1".into(), "-W".into(), timeout_ms.max(1).to_string(), host];
            (argv, Duration::from_secs(2))
        }
        Os::Linux | Os::Other => {
            let secs = (timeout_ms / 1000).max(1);
            let argv = vec!["ping".into(), "-c".into(), "1".into(), "-W".into(), secs.to_string(), host];
            (argv, Duration::from_secs(2))
        }
    }
}

/// Probe `ports` on `ip` concurrently, each connect holding a permit from `limiter`
pub async fn check_ports<P: NetworkPlatform + ?Sized>(
    platform: &P,
    ip: Ipv4Addr,
    ports: &[u16],
    limiter: &Semaphore,
    timeout: Duration,
) -> BTreeMap<u16, bool> {
    let checks = ports.iter().map(|&port| async move {
        let _permit = limiter.acquire().await.ok();
        (port, platform.tcp_connect(ip, port, timeout).await)
    });
    join_all(checks).await.into_iter().collect()
}

/// Per-operation-class parallelism ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    pub ping: usize,
    /// Hosts whose ports are probed at the same time
    pub port_hosts: usize,
    /// Open TCP connects across all hosts
    pub tcp_connect: usize,
    pub dns: usize,
    pub enrich: usize,
    /// Pings used to repopulate an empty neighbor table
    pub seed_ping: usize,
    /// Pings used to validate possibly stale neighbors
    pub validation_ping: usize,
}

impl ConcurrencyLimits {
    /// Built-in ceilings, lowered on macOS where per-process descriptor
    /// limits are small by default
    pub fn defaults_for(os: Os) -> Self {
        match os {
            Os::MacOs => Self {
                ping: 32,
                port_hosts: 32,
                tcp_connect: 64,
                dns: 8,
                enrich: 48,
                seed_ping: 8,
                validation_ping: 6,
            },
            _ => Self {
                ping: 96,
                port_hosts: 64,
                tcp_connect: 128,
                dns: 16,
                enrich: 96,
                seed_ping: 16,
                validation_ping: 8,
            },
        }
    }

    /// Defaults overridden by `NETDASH_*_CONCURRENCY` variables
    pub fn from_env(os: Os) -> Self {
        let limits = Self::with_overrides(os, |key| std::env::var(key).ok());
        limits.cap_to_fd_limit()
    }

    pub fn with_overrides(os: Os, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::defaults_for(os);
        let read = |key: &str, default: usize| -> usize {
            let value = lookup(key)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|v| *v > 0)
                .map(|v| v as usize)
                .unwrap_or(default);
            // Overrides may lower a platform ceiling but never raise it
            if os == Os::MacOs {
                value.min(default)
            } else {
                value
            }
        };
        Self {
            ping: read("NETDASH_PING_CONCURRENCY", defaults.ping),
            port_hosts: read("NETDASH_PORT_PROBE_CONCURRENCY", defaults.port_hosts),
            tcp_connect: read("NETDASH_PORT_CONN_CONCURRENCY", defaults.tcp_connect),
            dns: read("NETDASH_DNS_CONCURRENCY", defaults.dns),
            enrich: read("NETDASH_ENRICH_CONCURRENCY", defaults.enrich),
            ..defaults
        }
    }

    /// Keep TCP connects under a quarter of the soft descriptor limit
    #[cfg(unix)]
    pub fn cap_to_fd_limit(mut self) -> Self {
        match rlimit::Resource::NOFILE.get() {
            Ok((soft, _hard)) => {
                let cap = ((soft / 4) as usize).max(1);
                if self.tcp_connect > cap {
                    debug!(soft_limit = soft, cap = cap, "Capping TCP connect concurrency");
                    self.tcp_connect = cap;
                }
            }
            Err(e) => debug!(error = %e, "Could not read RLIMIT_NOFILE"),
        }
        self
    }

    #[cfg(not(unix))]
    pub fn cap_to_fd_limit(self) -> Self {
        self
    }
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self::defaults_for(Os::current())
    }
}

/// Shared semaphores for one discovery service
#[derive(Debug, Clone)]
pub struct Limiters {
    pub ping: Arc<Semaphore>,
    pub port_hosts: Arc<Semaphore>,
    pub tcp_connect: Arc<Semaphore>,
    pub dns: Arc<Semaphore>,
    pub enrich: Arc<Semaphore>,
}

impl Limiters {
    pub fn new(limits: &ConcurrencyLimits) -> Self {
        Self {
            ping: Arc::new(Semaphore::new(limits.ping.max(1))),
            port_hosts: Arc::new(Semaphore::new(limits.port_hosts.max(1))),
            tcp_connect: Arc::new(Semaphore::new(limits.tcp_connect.max(1))),
            dns: Arc::new(Semaphore::new(limits.dns.max(1))),
            enrich: Arc::new(Semaphore::new(limits.enrich.max(1))),
        }
    }
}
