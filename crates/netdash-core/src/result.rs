//! The discovery result handed to the dashboard

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::device::DeviceGroup;

/// How aggressively a cycle looks for hosts beyond the neighbor table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    /// Ping a capped number of unused addresses in the local subnet
    #[default]
    BoundedSweep,
    /// Only trust the neighbor table and the gateway
    NeighborsOnly,
}

impl FromStr for SweepMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bounded_sweep" => Ok(Self::BoundedSweep),
            "neighbors_only" | "neighbors" => Ok(Self::NeighborsOnly),
            other => Err(format!("unknown discovery mode '{}'", other)),
        }
    }
}

/// Where this cycle's neighbor table came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NeighborSource {
    /// First read returned entries
    Fresh,
    /// Entries appeared after pinging seed addresses
    SeedRepopulated,
    /// Reused the last populated table for this network
    Snapshot,
    /// Nothing available
    Empty,
}

/// Cycle diagnostics shown alongside the device lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMeta {
    pub neighbor_source: NeighborSource,
    /// Number of addresses in the ping sweep
    pub sweep_size: usize,
    pub sweep_network: Option<String>,
    /// Sweep addresses that answered ping
    pub ping_hits: usize,
    /// Sweep addresses that only answered on a TCP port
    pub port_only_hits: usize,
    pub transparent_proxy_detected: bool,
    /// MACs dropped as proxy-ARP responders
    pub proxy_arp_macs: Vec<String>,
    pub duration_ms: u64,
    /// Unix timestamp of completion
    pub completed_at: i64,
    pub gateway_ip: Option<Ipv4Addr>,
    pub gateway_mac: Option<String>,
    pub gateway_outside_sweep: bool,
    pub host_ips: Vec<Ipv4Addr>,
    /// `"name: ip"` for configured devices outside the sweep network
    pub subnet_mismatches: Option<Vec<String>>,
}

impl Default for DiscoveryMeta {
    fn default() -> Self {
        Self {
            neighbor_source: NeighborSource::Empty,
            sweep_size: 0,
            sweep_network: None,
            ping_hits: 0,
            port_only_hits: 0,
            transparent_proxy_detected: false,
            proxy_arp_macs: Vec::new(),
            duration_ms: 0,
            completed_at: 0,
            gateway_ip: None,
            gateway_mac: None,
            gateway_outside_sweep: false,
            host_ips: Vec::new(),
            subnet_mismatches: None,
        }
    }
}

/// Output of one discovery cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Detected networks, tightened to /24 for display
    pub networks: Vec<String>,
    pub neighbors_count: usize,
    pub mode: SweepMode,
    /// Configured devices, sorted by name
    pub known_devices: Vec<DeviceGroup>,
    /// Unconfigured devices, up first, then by name
    pub discovered_devices: Vec<DeviceGroup>,
    pub meta: DiscoveryMeta,
}

impl DiscoveryResult {
    /// Placeholder result carrying only the configured devices
    pub fn stub(mode: SweepMode, known_devices: Vec<DeviceGroup>) -> Self {
        Self {
            mode,
            known_devices,
            ..Self::default()
        }
    }

    pub fn up_counts(&self) -> (usize, usize) {
        (
            self.known_devices.iter().filter(|d| d.up).count(),
            self.discovered_devices.iter().filter(|d| d.up).count(),
        )
    }
}
