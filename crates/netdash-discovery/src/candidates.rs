//! Candidate host set and the heuristics that keep artifacts out of it
//!
//! The pipeline order is fixed: address validity, proxy-ARP filtering,
//! neighbor admission, sweep list construction, port probing of ping
//! non-responders with transparent-proxy sampling, confirmation purge, and
//! finally the shallow fallback.

use futures::future::join_all;
use pnet::ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::neighbors::NeighborEntry;
use crate::platform::{NetworkPlatform, Os};
use crate::probe::{check_ports, Limiters};
use crate::topology::NetworkTopology;

/// Tunable constants for the candidate heuristics
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicThresholds {
    /// A MAC answering for at least this many IPs is a proxy-ARP responder
    pub proxy_arp_min_ips: usize,
    /// Non-responders probed before deciding whether to probe the rest
    pub proxy_sample_size: usize,
    /// Sampling only kicks in above this many non-responders
    pub proxy_sample_trigger: usize,
    /// Sample hit ratio above which a transparent proxy is assumed
    pub proxy_sample_ratio: f64,
    /// Port-only hits must exceed this share of the sweep...
    pub port_only_sweep_ratio: f64,
    /// ...and this absolute count to trigger confirmation
    pub port_only_min_hits: usize,
    /// Share of MAC-less, ping-silent candidates that triggers the purge
    pub no_mac_purge_ratio: f64,
    /// Sweep addresses admitted when nothing else was found
    pub fallback_admit: usize,
    /// Addresses pinged to repopulate an empty neighbor table
    pub seed_targets: usize,
    /// Neighbors pinged to detect stale entries
    pub validation_pings: usize,
}

impl Default for HeuristicThresholds {
    fn default() -> Self {
        Self {
            proxy_arp_min_ips: 10,
            proxy_sample_size: 20,
            proxy_sample_trigger: 40,
            proxy_sample_ratio: 0.8,
            port_only_sweep_ratio: 0.5,
            port_only_min_hits: 20,
            no_mac_purge_ratio: 0.8,
            fallback_admit: 64,
            seed_targets: 12,
            validation_pings: 8,
        }
    }
}

/// Address a real LAN host could have.
///
/// Rejects multicast, loopback, unspecified, link-local, the 240/4 reserved
/// block, limited broadcast and the 100.64/10 shared address space.
pub fn is_valid_host_ip(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let reserved = a >= 240;
    let shared = a == 100 && (64..128).contains(&b);
    !(ip.is_multicast()
        || ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_link_local()
        || ip.is_broadcast()
        || reserved
        || shared)
}

/// MACs that back at least `min_ips` distinct IPs
pub fn proxy_arp_macs(entries: &[NeighborEntry], min_ips: usize) -> BTreeSet<String> {
    let mut by_mac: HashMap<&str, HashSet<Ipv4Addr>> = HashMap::new();
    for entry in entries {
        if let Some(mac) = entry.mac.as_deref() {
            by_mac.entry(mac).or_default().insert(entry.ip);
        }
    }
    by_mac
        .into_iter()
        .filter(|(_, ips)| ips.len() >= min_ips)
        .map(|(mac, _)| mac.to_string())
        .collect()
}

/// Drop entries owned by a proxy-ARP MAC, except the gateway's own entry
pub fn filter_proxy_arp(
    entries: Vec<NeighborEntry>,
    macs: &BTreeSet<String>,
    gateway: Option<Ipv4Addr>,
) -> Vec<NeighborEntry> {
    if macs.is_empty() {
        return entries;
    }
    entries
        .into_iter()
        .filter(|e| {
            Some(e.ip) == gateway || !e.mac.as_ref().is_some_and(|m| macs.contains(m))
        })
        .collect()
}

/// Best-known link details for a candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateHost {
    pub mac: Option<String>,
    pub iface: Option<String>,
}

/// IPs believed present this cycle, plus link details learned for any IP
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    present: BTreeSet<Ipv4Addr>,
    learned: HashMap<Ipv4Addr, CandidateHost>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, ip: Ipv4Addr) -> bool {
        self.present.insert(ip)
    }

    /// Remember link details without marking the IP present
    pub fn learn(&mut self, ip: Ipv4Addr, mac: Option<&str>, iface: Option<&str>) {
        let host = self.learned.entry(ip).or_default();
        if let Some(mac) = mac {
            host.mac = Some(mac.to_string());
        }
        if let Some(iface) = iface {
            host.iface = Some(iface.to_string());
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.present.contains(&ip)
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }

    /// Present IPs in ascending order
    pub fn ips(&self) -> Vec<Ipv4Addr> {
        self.present.iter().copied().collect()
    }

    pub fn mac(&self, ip: Ipv4Addr) -> Option<&str> {
        self.learned.get(&ip).and_then(|h| h.mac.as_deref())
    }

    pub fn iface(&self, ip: Ipv4Addr) -> Option<&str> {
        self.learned.get(&ip).and_then(|h| h.iface.as_deref())
    }

    pub fn retain(&mut self, mut keep: impl FnMut(Ipv4Addr) -> bool) {
        self.present.retain(|ip| keep(*ip));
    }

    /// Remove present IPs learned with one of `macs`, sparing `keep`
    pub fn drop_macs(&mut self, macs: &BTreeSet<String>, keep: Option<Ipv4Addr>) -> usize {
        let before = self.present.len();
        let learned = &self.learned;
        self.present.retain(|ip| {
            Some(*ip) == keep
                || !learned
                    .get(ip)
                    .and_then(|h| h.mac.as_ref())
                    .is_some_and(|m| macs.contains(m))
        });
        before - self.present.len()
    }

    /// Admit usable neighbor entries inside the sweep network.
    ///
    /// Entries on tunnel interfaces are ignored, as are MAC-less rows except
    /// on Windows. FAILED/INCOMPLETE rows contribute their link details but
    /// are not admitted. Returns how many IPs were newly admitted.
    pub fn admit_neighbors(
        &mut self,
        entries: &[NeighborEntry],
        topology: &NetworkTopology,
        os: Os,
        excluded_macs: &BTreeSet<String>,
    ) -> usize {
        let mut admitted = 0;
        for entry in entries {
            if !is_valid_host_ip(entry.ip) || !topology.in_sweep_network(entry.ip) {
                continue;
            }
            if topology.is_tunnel(entry.iface.as_deref()) {
                continue;
            }
            if entry.mac.is_none() && os != Os::Windows {
                continue;
            }
            if entry.mac.as_ref().is_some_and(|m| excluded_macs.contains(m)) {
                continue;
            }
            self.learn(entry.ip, entry.mac.as_deref(), entry.iface.as_deref());
            if !entry.state.is_absent() && self.admit(entry.ip) {
                admitted += 1;
            }
        }
        admitted
    }
}

/// Unused host addresses of `network`, at most `max`
pub fn build_sweep_list(network: Ipv4Network, candidates: &CandidateSet, max: usize) -> Vec<Ipv4Addr> {
    let skip_edges = network.prefix() < 31;
    let (first, last) = (network.network(), network.broadcast());
    network
        .iter()
        .filter(|ip| !(skip_edges && (*ip == first || *ip == last)))
        .filter(|ip| !candidates.contains(*ip))
        .take(max)
        .collect()
}

/// `n` addresses spread evenly across `ips`
pub fn evenly_spaced_sample(ips: &[Ipv4Addr], n: usize) -> Vec<Ipv4Addr> {
    if n == 0 || ips.is_empty() {
        return Vec::new();
    }
    if ips.len() <= n {
        return ips.to_vec();
    }
    let step = ips.len() as f64 / n as f64;
    (0..n).map(|i| ips[(i as f64 * step) as usize]).collect()
}

/// Outcome of probing ping non-responders on TCP ports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortProbeOutcome {
    /// Addresses that answered on at least one port
    pub hits: BTreeSet<Ipv4Addr>,
    /// The sample looked like every address answers
    pub transparent_proxy: bool,
}

async fn probe_hosts<P: NetworkPlatform + ?Sized>(
    platform: &P,
    hosts: &[Ipv4Addr],
    ports: &[u16],
    limiters: &Limiters,
    timeout: Duration,
) -> BTreeSet<Ipv4Addr> {
    let probes = hosts.iter().map(|&ip| async move {
        let _permit = limiters.port_hosts.acquire().await.ok();
        let open = check_ports(platform, ip, ports, &limiters.tcp_connect, timeout).await;
        (ip, open.values().any(|&o| o))
    });
    join_all(probes)
        .await
        .into_iter()
        .filter_map(|(ip, hit)| hit.then_some(ip))
        .collect()
}

/// Probe non-responders on `ports`, sampling first when there are many.
///
/// When the sample answers above the threshold ratio the rest is not
/// probed and the outcome is flagged as a transparent proxy.
pub async fn probe_non_responders<P: NetworkPlatform + ?Sized>(
    platform: &P,
    non_responders: &[Ipv4Addr],
    ports: &[u16],
    thresholds: &HeuristicThresholds,
    limiters: &Limiters,
    timeout: Duration,
) -> PortProbeOutcome {
    if ports.is_empty() || non_responders.is_empty() {
        return PortProbeOutcome::default();
    }

    let mut remaining: Vec<Ipv4Addr> = non_responders.to_vec();
    let mut hits = BTreeSet::new();

    if non_responders.len() > thresholds.proxy_sample_trigger {
        let sample = evenly_spaced_sample(non_responders, thresholds.proxy_sample_size);
        let sample_hits = probe_hosts(platform, &sample, ports, limiters, timeout).await;
        let ratio = sample_hits.len() as f64 / sample.len() as f64;
        if ratio > thresholds.proxy_sample_ratio {
            warn!(
                sampled = sample.len(),
                hits = sample_hits.len(),
                "Nearly every sampled address answers on TCP, assuming a transparent proxy"
            );
            return PortProbeOutcome {
                hits: sample_hits,
                transparent_proxy: true,
            };
        }
        let sampled: HashSet<Ipv4Addr> = sample.into_iter().collect();
        remaining.retain(|ip| !sampled.contains(ip));
        hits.extend(sample_hits);
    }

    hits.extend(probe_hosts(platform, &remaining, ports, limiters, timeout).await);
    debug!(probed = non_responders.len(), hits = hits.len(), "Probed ping non-responders");
    PortProbeOutcome {
        hits,
        transparent_proxy: false,
    }
}

/// Purge port-only phantoms when the hit pattern points at an intercepting proxy.
///
/// Confirmation needs port-only hits above both the sweep-relative and the
/// absolute thresholds, and most candidates lacking both a MAC and a ping
/// reply. Returns true when the purge happened; the gateway is always kept.
pub fn confirm_transparent_proxy(
    candidates: &mut CandidateSet,
    port_only_hits: usize,
    sweep_size: usize,
    pinged: &BTreeMap<Ipv4Addr, bool>,
    gateway: Option<Ipv4Addr>,
    thresholds: &HeuristicThresholds,
) -> bool {
    let enough_hits = port_only_hits as f64 > thresholds.port_only_sweep_ratio * sweep_size as f64
        && port_only_hits > thresholds.port_only_min_hits;
    if !enough_hits || candidates.is_empty() {
        return false;
    }

    let phantom = |set: &CandidateSet, ip: Ipv4Addr| {
        set.mac(ip).is_none() && !pinged.get(&ip).copied().unwrap_or(false)
    };
    let view: &CandidateSet = candidates;
    let phantoms = view.ips().into_iter().filter(|ip| phantom(view, *ip)).count();
    if phantoms as f64 <= thresholds.no_mac_purge_ratio * candidates.len() as f64 {
        return false;
    }

    let snapshot = candidates.clone();
    candidates.retain(|ip| Some(ip) == gateway || !phantom(&snapshot, ip));
    info!(
        purged = phantoms,
        remaining = candidates.len(),
        "Purged port-only candidates behind a transparent proxy"
    );
    true
}

/// Admit the head of the sweep list when nothing else was found
pub fn admit_fallback(candidates: &mut CandidateSet, sweep: &[Ipv4Addr], limit: usize) -> usize {
    if !candidates.is_empty() || sweep.is_empty() {
        return 0;
    }
    sweep.iter().take(limit).for_each(|ip| {
        candidates.admit(*ip);
    });
    debug!(admitted = candidates.len(), "No candidates found, admitting sweep head");
    candidates.len()
}
