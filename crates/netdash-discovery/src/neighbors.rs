//! Neighbor (ARP) table collection
//!
//! Reads the OS neighbor cache with whichever tool the platform provides,
//! provokes it with a few pings when it comes back empty, and falls back to
//! the last good snapshot for the same network.

use anyhow::{Context, Result};
use futures::future::join_all;
use pnet::ipnetwork::Ipv4Network;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace};

use crate::platform::{NetworkPlatform, Os};
use netdash_core::{is_valid_mac, is_zero_mac, normalize_mac, NeighborSource};

const NEIGH_TIMEOUT: Duration = Duration::from_secs(3);
const POWERSHELL_TIMEOUT: Duration = Duration::from_secs(7);

const GET_NET_NEIGHBOR: &str = "Get-NetNeighbor -AddressFamily IPv4 | \
    Select-Object IPAddress,LinkLayerAddress,State | ConvertTo-Json";

/// Reachability state reported by the neighbor table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Incomplete,
    Permanent,
    Unknown,
}

impl NeighborState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "REACHABLE" => Self::Reachable,
            "STALE" => Self::Stale,
            "DELAY" => Self::Delay,
            "PROBE" => Self::Probe,
            "FAILED" | "UNREACHABLE" => Self::Failed,
            "INCOMPLETE" => Self::Incomplete,
            "PERMANENT" => Self::Permanent,
            _ => Self::Unknown,
        }
    }

    /// Numeric `MSFT_NetNeighbor.State` values
    fn from_cim(value: u64) -> Self {
        match value {
            0 => Self::Failed,
            1 => Self::Incomplete,
            2 => Self::Probe,
            3 => Self::Delay,
            4 => Self::Stale,
            5 => Self::Reachable,
            6 => Self::Permanent,
            _ => Self::Unknown,
        }
    }

    /// The entry does not prove a host is present right now
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Failed | Self::Incomplete)
    }
}

/// One row of the neighbor table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    /// Normalized MAC; `None` only on Windows, which can list unresolved rows
    pub mac: Option<String>,
    pub state: NeighborState,
    pub iface: Option<String>,
}

impl NeighborEntry {
    pub fn new(ip: Ipv4Addr, mac: &str) -> Self {
        Self {
            ip,
            mac: Some(normalize_mac(mac)),
            state: NeighborState::Unknown,
            iface: None,
        }
    }

    pub fn with_state(mut self, state: NeighborState) -> Self {
        self.state = state;
        self
    }

    pub fn with_iface(mut self, iface: &str) -> Self {
        self.iface = Some(iface.to_string());
        self
    }
}

/// A MAC worth keeping: well-formed, not all-zero, not broadcast
fn usable_mac(raw: &str) -> Option<String> {
    let mac = normalize_mac(raw);
    if is_valid_mac(&mac) && !is_zero_mac(&mac) && mac != "ff:ff:ff:ff:ff:ff" {
        Some(mac)
    } else {
        None
    }
}

/// Parse a line from `ip neigh show`
pub fn parse_ip_neigh_line(line: &str) -> Option<NeighborEntry> {
    // Format: "192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE"
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }

    let ip: Ipv4Addr = parts[0].parse().ok()?;
    let lladdr = parts.iter().position(|&p| p == "lladdr")?;
    let mac = usable_mac(parts.get(lladdr + 1)?)?;
    let iface = parts
        .iter()
        .position(|&p| p == "dev")
        .and_then(|i| parts.get(i + 1))
        .map(|s| s.to_string());
    let state = parts
        .last()
        .map(|s| NeighborState::parse(s))
        .unwrap_or(NeighborState::Unknown);

    Some(NeighborEntry { ip, mac: Some(mac), state, iface })
}

/// Parse a line from BSD/net-tools `arp -an`
pub fn parse_arp_an_line(line: &str) -> Option<NeighborEntry> {
    // macOS: "? (192.168.1.1) at 0:11:22:a:b:c on en0 ifscope [ethernet]"
    // Linux: "? (192.168.1.1) at aa:bb:cc:dd:ee:ff [ether] on eth0"
    if line.contains("incomplete") {
        return None;
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    let ip: Ipv4Addr = parts
        .iter()
        .find_map(|p| p.strip_prefix('(').and_then(|p| p.strip_suffix(')')))?
        .parse()
        .ok()?;
    let at = parts.iter().position(|&p| p == "at")?;
    let mac = usable_mac(parts.get(at + 1)?)?;
    let iface = parts
        .iter()
        .position(|&p| p == "on")
        .and_then(|i| parts.get(i + 1))
        .map(|s| s.to_string());

    Some(NeighborEntry {
        ip,
        mac: Some(mac),
        state: NeighborState::Unknown,
        iface,
    })
}

/// Parse a data line from Windows `arp -a`
pub fn parse_windows_arp_line(line: &str) -> Option<NeighborEntry> {
    // "  192.168.1.1           aa-bb-cc-dd-ee-ff     dynamic"
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 || !parts[1].contains('-') {
        return None;
    }
    let ip: Ipv4Addr = parts[0].parse().ok()?;
    let mac = usable_mac(parts[1])?;
    Some(NeighborEntry {
        ip,
        mac: Some(mac),
        state: NeighborState::parse(parts[2]),
        iface: None,
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CimState {
    Code(u64),
    Name(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetNeighborRow {
    #[serde(rename = "IPAddress")]
    ip_address: Option<String>,
    link_layer_address: Option<String>,
    state: Option<CimState>,
}

/// Parse `Get-NetNeighbor | ConvertTo-Json`, which emits a bare object for
/// a single row and an array otherwise
pub fn parse_net_neighbor_json(json: &str) -> Result<Vec<NeighborEntry>> {
    let rows: OneOrMany<NetNeighborRow> =
        serde_json::from_str(json.trim()).context("Invalid Get-NetNeighbor JSON")?;
    let rows = match rows {
        OneOrMany::Many(rows) => rows,
        OneOrMany::One(row) => vec![row],
    };

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let ip: Ipv4Addr = row.ip_address?.trim().parse().ok()?;
            let mac = usable_mac(row.link_layer_address.as_deref().unwrap_or(""));
            let state = match row.state {
                Some(CimState::Code(code)) => NeighborState::from_cim(code),
                Some(CimState::Name(name)) => NeighborState::parse(&name),
                None => NeighborState::Unknown,
            };
            // Resolved-but-blank rows are meaningless; unresolved ones carry state
            if mac.is_none() && !state.is_absent() {
                return None;
            }
            Some(NeighborEntry { ip, mac, state, iface: None })
        })
        .collect())
}

/// Keep one entry per IP: the last one seen, at the first one's position
pub fn dedupe_by_ip(entries: Vec<NeighborEntry>) -> Vec<NeighborEntry> {
    let mut index: HashMap<Ipv4Addr, usize> = HashMap::new();
    let mut out: Vec<NeighborEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match index.get(&entry.ip) {
            Some(&i) => out[i] = entry,
            None => {
                index.insert(entry.ip, out.len());
                out.push(entry);
            }
        }
    }
    out
}

fn parse_lines(output: &str, parse: fn(&str) -> Option<NeighborEntry>) -> Vec<NeighborEntry> {
    output.lines().filter_map(parse).collect()
}

/// Read the neighbor table with the platform's tools, never failing
pub(crate) async fn read_neighbor_table<P: NetworkPlatform + ?Sized>(
    platform: &P,
) -> Vec<NeighborEntry> {
    let entries = match platform.os() {
        Os::Windows => {
            let ps = platform
                .run(
                    &["powershell", "-NoProfile", "-NonInteractive", "-Command", GET_NET_NEIGHBOR],
                    POWERSHELL_TIMEOUT,
                )
                .await;
            let parsed = match ps.stdout_if_ok().map(parse_net_neighbor_json) {
                Some(Ok(entries)) => entries,
                Some(Err(e)) => {
                    debug!(error = %e, "Get-NetNeighbor output unusable");
                    Vec::new()
                }
                None => Vec::new(),
            };
            if parsed.is_empty() {
                let out = platform.run(&["arp", "-a"], NEIGH_TIMEOUT).await;
                parse_lines(&out.stdout, parse_windows_arp_line)
            } else {
                parsed
            }
        }
        Os::Linux => {
            let out = platform.run(&["ip", "neigh", "show"], NEIGH_TIMEOUT).await;
            let parsed = parse_lines(&out.stdout, parse_ip_neigh_line);
            if parsed.is_empty() {
                let out = platform.run(&["arp", "-an"], NEIGH_TIMEOUT).await;
                parse_lines(&out.stdout, parse_arp_an_line)
            } else {
                parsed
            }
        }
        Os::MacOs | Os::Other => {
            let out = platform.run(&["arp", "-an"], NEIGH_TIMEOUT).await;
            parse_lines(&out.stdout, parse_arp_an_line)
        }
    };
    let entries = dedupe_by_ip(entries);
    trace!(count = entries.len(), "Read neighbor table");
    entries
}

fn first_host(net: &Ipv4Network) -> Ipv4Addr {
    if net.prefix() >= 31 {
        net.network()
    } else {
        Ipv4Addr::from(u32::from(net.network()) + 1)
    }
}

/// Addresses to ping when the neighbor table is empty: the gateway, the
/// first host of each network, then configured device IPs
pub fn seed_targets(
    gateway: Option<Ipv4Addr>,
    networks: &[Ipv4Network],
    configured: &[Ipv4Addr],
    limit: usize,
) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    gateway
        .into_iter()
        .chain(networks.iter().map(first_host))
        .chain(configured.iter().copied())
        .filter(|ip| seen.insert(*ip))
        .take(limit)
        .collect()
}

/// Ping every target once, each holding a permit from `limiter`
pub async fn ping_all<P: NetworkPlatform + ?Sized>(
    platform: &P,
    targets: &[Ipv4Addr],
    timeout_ms: u64,
    limiter: &Semaphore,
) -> BTreeMap<Ipv4Addr, bool> {
    let pings = targets.iter().map(|&ip| async move {
        let _permit = limiter.acquire().await.ok();
        (ip, platform.ping(ip, timeout_ms).await)
    });
    join_all(pings).await.into_iter().collect()
}

/// Result of one neighbor collection
#[derive(Debug, Clone)]
pub struct NeighborCollection {
    pub entries: Vec<NeighborEntry>,
    pub source: NeighborSource,
}

/// Collect the neighbor table.
///
/// An empty first read triggers a seed ping round and one retry; if that is
/// still empty, `snapshot` (already vetted for age and network) is used.
pub async fn collect<P: NetworkPlatform + ?Sized>(
    platform: &P,
    seeds: &[Ipv4Addr],
    seed_timeout_ms: u64,
    seed_concurrency: usize,
    snapshot: Option<Vec<NeighborEntry>>,
) -> NeighborCollection {
    let entries = platform.neighbors().await;
    if !entries.is_empty() {
        return NeighborCollection { entries, source: NeighborSource::Fresh };
    }

    if !seeds.is_empty() {
        debug!(seeds = seeds.len(), "Neighbor table empty, pinging seed addresses");
        let limiter = Semaphore::new(seed_concurrency.max(1));
        ping_all(platform, seeds, seed_timeout_ms, &limiter).await;
        let entries = platform.neighbors().await;
        if !entries.is_empty() {
            return NeighborCollection {
                entries,
                source: NeighborSource::SeedRepopulated,
            };
        }
    }

    match snapshot {
        Some(entries) if !entries.is_empty() => {
            info!(count = entries.len(), "Using neighbor snapshot");
            NeighborCollection { entries, source: NeighborSource::Snapshot }
        }
        _ => NeighborCollection { entries: Vec::new(), source: NeighborSource::Empty },
    }
}

/// Drop neighbors that no longer answer.
///
/// Pings up to `limit` of the `eligible` IPs. When at least one answers, the
/// silent ones among them are treated as stale cache rows and removed; when
/// none answers the network is probably filtering ICMP and nothing is dropped.
pub async fn validate_stale<P: NetworkPlatform + ?Sized>(
    platform: &P,
    entries: Vec<NeighborEntry>,
    eligible: impl Fn(&NeighborEntry) -> bool,
    limit: usize,
    timeout_ms: u64,
    concurrency: usize,
) -> Vec<NeighborEntry> {
    let targets: Vec<Ipv4Addr> = entries
        .iter()
        .filter(|e| eligible(e))
        .map(|e| e.ip)
        .take(limit)
        .collect();
    if targets.is_empty() {
        return entries;
    }

    let limiter = Semaphore::new(concurrency.max(1));
    let results = ping_all(platform, &targets, timeout_ms, &limiter).await;
    if !results.values().any(|&alive| alive) {
        return entries;
    }

    let stale: HashSet<Ipv4Addr> = results
        .into_iter()
        .filter_map(|(ip, alive)| (!alive).then_some(ip))
        .collect();
    if !stale.is_empty() {
        debug!(dropped = stale.len(), "Dropping stale neighbor entries");
    }
    entries.into_iter().filter(|e| !stale.contains(&e.ip)).collect()
}
