//! Operating-system capability interface
//!
//! Everything discovery needs from the host OS goes through
//! [`NetworkPlatform`]. The required methods are the primitives (interface
//! enumeration, hostname, running a command); the neighbor table, routing,
//! Wi-Fi and probing operations have default implementations built on those
//! primitives that pick the right tool for [`Os`]. Tests replace the whole
//! trait with a scripted fake.

use async_trait::async_trait;
use pnet::datalink;
use pnet::ipnetwork::{IpNetwork, Ipv4Network};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::neighbors::{read_neighbor_table, NeighborEntry};
use crate::probe::{ping_command, DNS_TIMEOUT};
use crate::process::{run_command, CommandOutput};
use crate::topology::{query_default_gateway, query_gateway_mac, query_wifi_identity};
use netdash_core::is_zero_mac;

/// Host operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Os {
    /// The OS this binary was built for
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Os::Linux
        } else if cfg!(target_os = "macos") {
            Os::MacOs
        } else if cfg!(target_os = "windows") {
            Os::Windows
        } else {
            Os::Other
        }
    }
}

/// Snapshot of one local network interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    /// Administratively up
    pub is_up: bool,
    pub is_loopback: bool,
    /// IPv4 address/prefix pairs assigned to the interface
    pub ipv4: Vec<Ipv4Network>,
    /// Hardware address, normalized
    pub mac: Option<String>,
}

#[async_trait]
pub trait NetworkPlatform: Send + Sync {
    /// OS family used to pick tools and argument formats
    fn os(&self) -> Os;

    /// Current local interfaces
    fn interfaces(&self) -> Vec<LocalInterface>;

    /// This machine's hostname
    fn hostname(&self) -> String;

    /// Run an external command; never fails, see [`CommandOutput::failed`]
    async fn run(&self, argv: &[&str], timeout: Duration) -> CommandOutput;

    /// Current ARP/neighbor table, de-duplicated by IP
    async fn neighbors(&self) -> Vec<NeighborEntry> {
        read_neighbor_table(self).await
    }

    /// Default IPv4 gateway from the routing table
    async fn default_gateway(&self) -> Option<Ipv4Addr> {
        query_default_gateway(self).await
    }

    /// Gateway MAC from an ARP lookup
    async fn gateway_mac(&self, gateway: Ipv4Addr) -> Option<String> {
        query_gateway_mac(self, gateway).await
    }

    /// `ssid` or `ssid|bssid` of the joined Wi-Fi network
    async fn wifi_identity(&self) -> Option<String> {
        query_wifi_identity(self).await
    }

    /// One ICMP echo via the OS `ping` utility
    async fn ping(&self, host: Ipv4Addr, timeout_ms: u64) -> bool {
        let (argv, timeout) = ping_command(self.os(), host, timeout_ms);
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.run(&argv, timeout).await.success()
    }

    /// Open and immediately close a TCP connection
    async fn tcp_connect(&self, ip: Ipv4Addr, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                true
            }
            Ok(Err(e)) => {
                trace!(ip = %ip, port = port, error = %e, "TCP connect failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Best-effort PTR lookup within [`DNS_TIMEOUT`]
    async fn reverse_dns(&self, ip: Ipv4Addr) -> Option<String> {
        let addr = IpAddr::V4(ip);
        let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr));
        match tokio::time::timeout(DNS_TIMEOUT, lookup).await {
            // getnameinfo hands back the numeric form when there is no PTR record
            Ok(Ok(Ok(name))) if name != ip.to_string() => Some(name),
            _ => None,
        }
    }
}

/// The real OS, as selected at build time
#[derive(Debug, Clone)]
pub struct SystemPlatform {
    os: Os,
}

impl SystemPlatform {
    pub fn new() -> Self {
        Self { os: Os::current() }
    }
}

impl Default for SystemPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkPlatform for SystemPlatform {
    fn os(&self) -> Os {
        self.os
    }

    fn interfaces(&self) -> Vec<LocalInterface> {
        datalink::interfaces()
            .into_iter()
            .map(|iface| {
                let ipv4 = iface
                    .ips
                    .iter()
                    .filter_map(|net| match net {
                        IpNetwork::V4(v4) => Some(*v4),
                        IpNetwork::V6(_) => None,
                    })
                    .collect();
                let mac = iface
                    .mac
                    .map(|m| m.to_string())
                    .filter(|m| !is_zero_mac(m))
                    .map(|m| netdash_core::normalize_mac(&m));
                LocalInterface {
                    is_up: iface.is_up(),
                    is_loopback: iface.is_loopback(),
                    name: iface.name,
                    ipv4,
                    mac,
                }
            })
            .collect()
    }

    fn hostname(&self) -> String {
        dns_lookup::get_hostname().unwrap_or_else(|e| {
            debug!(error = %e, "Failed to read hostname");
            "localhost".to_string()
        })
    }

    async fn run(&self, argv: &[&str], timeout: Duration) -> CommandOutput {
        run_command(argv, timeout).await
    }
}
