//! Discovery service: one cycle at a time, cached, with background refresh

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{DiscoveryCache, DEFAULT_CACHE_TTL, DEFAULT_SNAPSHOT_MAX_AGE};
use crate::candidates::{
    admit_fallback, build_sweep_list, confirm_transparent_proxy, filter_proxy_arp,
    is_valid_host_ip, probe_non_responders, proxy_arp_macs, CandidateSet, HeuristicThresholds,
};
use crate::enrich::{enrich_all, EnrichContext};
use crate::grouping::{self, gateway_outside_sweep, subnet_mismatches, DeviceGrouper};
use crate::neighbors::{self, ping_all, seed_targets, validate_stale};
use crate::platform::NetworkPlatform;
use crate::probe::{ConcurrencyLimits, Limiters, TCP_TIMEOUT};
use crate::topology::{HostIdentity, NetworkTopology};
use netdash_core::{
    DeviceGroup, DiscoveryMeta, DiscoveryResult, KnownDeviceSpec, NeighborSource, SweepMode,
};

/// Sweep cap in fast mode
pub const FAST_MAX_SWEEP_HOSTS: usize = 64;

/// Gateway pings never wait longer than this
const GATEWAY_PING_MS: u64 = 400;

/// Seed pings only need to provoke ARP, not wait for replies
const SEED_PING_MS: u64 = 300;

/// Default minimum spacing between background cycles
pub const DEFAULT_KICK_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Per-request discovery settings, usually built from the config file
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub mode: SweepMode,
    pub max_sweep_hosts: usize,
    pub ping_timeout_ms: u64,
    /// Ports probed on devices without configured ports
    pub default_ports: Vec<u16>,
    pub known_devices: Vec<KnownDeviceSpec>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: SweepMode::BoundedSweep,
            max_sweep_hosts: 256,
            ping_timeout_ms: 900,
            default_ports: vec![22, 80, 443, 3389],
            known_devices: Vec::new(),
        }
    }
}

/// Service-wide behavior, fixed at startup
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub cache_enabled: bool,
    pub neighbor_snapshot_enabled: bool,
    pub cache_ttl: Duration,
    pub snapshot_max_age: Duration,
    pub thresholds: HeuristicThresholds,
    pub limits: ConcurrencyLimits,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            neighbor_snapshot_enabled: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            snapshot_max_age: DEFAULT_SNAPSHOT_MAX_AGE,
            thresholds: HeuristicThresholds::default(),
            limits: ConcurrencyLimits::default(),
        }
    }
}

/// Runs discovery cycles against a platform and caches the results
pub struct DiscoveryService {
    platform: Arc<dyn NetworkPlatform>,
    options: ServiceOptions,
    cache: DiscoveryCache,
    limiters: Limiters,
    cycle: Mutex<()>,
    kicked: AtomicBool,
}

impl DiscoveryService {
    pub fn new(platform: Arc<dyn NetworkPlatform>, options: ServiceOptions) -> Self {
        Self {
            cache: DiscoveryCache::new(options.cache_ttl, options.snapshot_max_age),
            limiters: Limiters::new(&options.limits),
            platform,
            options,
            cycle: Mutex::new(()),
            kicked: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.options
    }

    pub fn platform(&self) -> &dyn NetworkPlatform {
        self.platform.as_ref()
    }

    /// Last completed result, however old
    pub async fn cached(&self) -> Option<DiscoveryResult> {
        self.cache.latest().await
    }

    /// A cycle finished less than `window` ago
    pub async fn completed_within(&self, window: Duration) -> bool {
        self.cache.rate_limited(window).await
    }

    /// Configured devices only, with this machine's own addresses already up
    pub fn known_stub(&self, known: &[KnownDeviceSpec]) -> Vec<DeviceGroup> {
        let identity = HostIdentity::from_interfaces(&self.platform.interfaces());
        grouping::known_stub(known, &identity)
    }

    /// A cycle is currently running
    pub fn in_flight(&self) -> bool {
        self.kicked.load(Ordering::SeqCst) || self.cycle.try_lock().is_err()
    }

    /// Run a discovery cycle, or reuse a recent one.
    ///
    /// The cycle runs on its own task so it completes even if the caller
    /// goes away; a panic inside it surfaces as [`DiscoveryError::Task`].
    pub async fn discover(
        self: &Arc<Self>,
        config: DiscoveryConfig,
        force_refresh: bool,
        fast: bool,
    ) -> Result<DiscoveryResult> {
        let service = Arc::clone(self);
        let handle =
            tokio::spawn(async move { service.serialized_cycle(config, force_refresh, fast).await });
        Ok(handle.await?)
    }

    /// Start a detached cycle unless one is running or the last finished
    /// within `window`. Returns true if a cycle was started.
    pub async fn kick(
        self: &Arc<Self>,
        config: DiscoveryConfig,
        force: bool,
        fast: bool,
        window: Duration,
    ) -> bool {
        if self.in_flight() {
            return false;
        }
        if !force && self.cache.rate_limited(window).await {
            return false;
        }
        if self
            .kicked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            match service.discover(config, force, fast).await {
                Ok(result) => debug!(
                    known = result.known_devices.len(),
                    discovered = result.discovered_devices.len(),
                    "Background discovery finished"
                ),
                Err(e) => warn!(error = %e, "Background discovery failed"),
            }
            service.kicked.store(false, Ordering::SeqCst);
        });
        true
    }

    async fn serialized_cycle(&self, config: DiscoveryConfig, force: bool, fast: bool) -> DiscoveryResult {
        let _guard = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some(stale) = self.cache.latest().await {
                    debug!("Discovery already running, serving last result");
                    return stale;
                }
                self.cycle.lock().await
            }
        };
        self.run_cycle(&config, force, fast).await
    }

    async fn run_cycle(&self, config: &DiscoveryConfig, force: bool, fast: bool) -> DiscoveryResult {
        let started = Instant::now();
        let platform = self.platform.as_ref();
        let os = platform.os();
        let thresholds = &self.options.thresholds;
        let limits = &self.options.limits;

        let topology = NetworkTopology::resolve(platform).await;
        let fingerprint = topology.fingerprint.clone();
        self.cache.observe_fingerprint(&fingerprint).await;

        if self.options.cache_enabled && !force {
            if let Some(hit) = self.cache.get(&fingerprint).await {
                debug!("Serving cached discovery result");
                return hit;
            }
        }

        let max_sweep = if fast {
            config.max_sweep_hosts.min(FAST_MAX_SWEEP_HOSTS)
        } else {
            config.max_sweep_hosts
        };
        let default_ports: &[u16] = if fast { &[] } else { &config.default_ports };
        let ping_timeout = config.ping_timeout_ms;
        let gateway = topology.gateway;

        info!(
            fast = fast,
            force = force,
            sweep_network = ?topology.sweep_network.map(|n| n.to_string()),
            "Starting discovery cycle"
        );

        let mut pinged: BTreeMap<Ipv4Addr, bool> = BTreeMap::new();
        if let Some(gw) = gateway {
            let alive = platform.ping(gw, ping_timeout.min(GATEWAY_PING_MS)).await;
            pinged.insert(gw, alive);
        }

        // Neighbor table
        let configured_ips: HashSet<Ipv4Addr> =
            config.known_devices.iter().filter_map(|k| k.match_ip).collect();
        let mut seed_candidates: Vec<Ipv4Addr> = configured_ips.iter().copied().collect();
        seed_candidates.sort();
        let seeds = seed_targets(gateway, &topology.networks, &seed_candidates, thresholds.seed_targets);
        let snapshot = if self.options.neighbor_snapshot_enabled && !force {
            self.cache.snapshot(&fingerprint).await
        } else {
            None
        };
        let collection =
            neighbors::collect(platform, &seeds, SEED_PING_MS, limits.seed_ping, snapshot).await;
        let neighbor_source = collection.source;
        if self.options.neighbor_snapshot_enabled
            && matches!(neighbor_source, NeighborSource::Fresh | NeighborSource::SeedRepopulated)
        {
            self.cache
                .store_snapshot(collection.entries.clone(), fingerprint.clone())
                .await;
        }
        let neighbors_count = collection.entries.len();

        // Proxy ARP
        let mut proxy_macs = proxy_arp_macs(&collection.entries, thresholds.proxy_arp_min_ips);
        if !proxy_macs.is_empty() {
            warn!(macs = ?proxy_macs, "Ignoring proxy-ARP responders");
        }
        let mut entries = filter_proxy_arp(collection.entries, &proxy_macs, gateway);

        if !fast {
            entries = validate_stale(
                platform,
                entries,
                |e| is_valid_host_ip(e.ip) && e.mac.is_some() && !configured_ips.contains(&e.ip),
                thresholds.validation_pings,
                ping_timeout,
                limits.validation_ping,
            )
            .await;
        }

        // Candidates
        let mut candidates = CandidateSet::new();
        if let Some(gw) = gateway {
            candidates.admit(gw);
            candidates.learn(gw, topology.gateway_mac.as_deref(), None);
        }
        candidates.admit_neighbors(&entries, &topology, os, &proxy_macs);

        let sweep: Vec<Ipv4Addr> = match (config.mode, topology.sweep_network) {
            (SweepMode::BoundedSweep, Some(network)) => build_sweep_list(network, &candidates, max_sweep),
            _ => Vec::new(),
        };

        let mut ping_hits = 0;
        let mut port_only_hits = 0;
        let mut transparent_proxy = false;

        if !sweep.is_empty() {
            let results = ping_all(platform, &sweep, ping_timeout, &self.limiters.ping).await;
            for (ip, alive) in &results {
                if *alive {
                    ping_hits += 1;
                    candidates.admit(*ip);
                }
            }
            pinged.extend(results);

            // The sweep fills the neighbor table; admit what it learned
            let after = platform.neighbors().await;
            proxy_macs.extend(proxy_arp_macs(&after, thresholds.proxy_arp_min_ips));
            let after = filter_proxy_arp(after, &proxy_macs, gateway);
            let learned = candidates.admit_neighbors(&after, &topology, os, &proxy_macs);
            let dropped = candidates.drop_macs(&proxy_macs, gateway);
            debug!(ping_hits = ping_hits, learned = learned, dropped = dropped, "Sweep complete");

            if !fast && !default_ports.is_empty() {
                let non_responders: Vec<Ipv4Addr> = sweep
                    .iter()
                    .copied()
                    .filter(|ip| !candidates.contains(*ip))
                    .collect();
                let outcome = probe_non_responders(
                    platform,
                    &non_responders,
                    default_ports,
                    thresholds,
                    &self.limiters,
                    TCP_TIMEOUT,
                )
                .await;
                port_only_hits = outcome.hits.len();
                transparent_proxy = outcome.transparent_proxy;
                if !transparent_proxy {
                    for ip in &outcome.hits {
                        candidates.admit(*ip);
                    }
                }
            }

            if !transparent_proxy
                && confirm_transparent_proxy(
                    &mut candidates,
                    port_only_hits,
                    sweep.len(),
                    &pinged,
                    gateway,
                    thresholds,
                )
            {
                transparent_proxy = true;
                port_only_hits = 0;
            }
        }

        admit_fallback(&mut candidates, &sweep, thresholds.fallback_admit);

        // Enrichment
        let ctx = EnrichContext {
            known: &config.known_devices,
            default_ports,
            gateway,
            identity: &topology.identity,
            os,
            fast,
            ping_timeout_ms: ping_timeout,
            pinged: &pinged,
            limiters: &self.limiters,
        };
        let devices = enrich_all(platform, &ctx, &candidates).await;

        // Grouping
        let hostname = platform.hostname();
        let mut grouper =
            DeviceGrouper::new(&config.known_devices, &topology.identity, &hostname, gateway);
        grouper.probe_host_ports(platform, &self.limiters).await;
        for device in &devices {
            grouper.fold(device);
        }
        let (known_devices, discovered_devices) = grouper.finish();

        let meta = DiscoveryMeta {
            neighbor_source,
            sweep_size: sweep.len(),
            sweep_network: topology.sweep_network.map(|n| n.to_string()),
            ping_hits,
            port_only_hits,
            transparent_proxy_detected: transparent_proxy,
            proxy_arp_macs: proxy_macs.into_iter().collect(),
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: chrono::Utc::now().timestamp(),
            gateway_ip: gateway,
            gateway_mac: topology.gateway_mac.clone(),
            gateway_outside_sweep: gateway_outside_sweep(gateway, topology.sweep_network),
            host_ips: topology.host_ips.clone(),
            subnet_mismatches: subnet_mismatches(&config.known_devices, topology.sweep_network),
        };

        let result = DiscoveryResult {
            networks: topology.display_networks(),
            neighbors_count,
            mode: config.mode,
            known_devices,
            discovered_devices,
            meta,
        };

        let (known_up, discovered_up) = result.up_counts();
        info!(
            known = result.known_devices.len(),
            known_up = known_up,
            discovered = result.discovered_devices.len(),
            discovered_up = discovered_up,
            duration_ms = result.meta.duration_ms,
            "Discovery cycle complete"
        );

        self.cache.mark_completed().await;
        if self.options.cache_enabled {
            self.cache.put(result.clone(), fingerprint).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::evenly_spaced_sample;
    use crate::neighbors::NeighborEntry;
    use crate::platform::LocalInterface;
    use crate::testing::FakePlatform;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn service(platform: Arc<FakePlatform>, options: ServiceOptions) -> Arc<DiscoveryService> {
        Arc::new(DiscoveryService::new(platform, options))
    }

    fn all_ips(result: &DiscoveryResult) -> Vec<Ipv4Addr> {
        result
            .known_devices
            .iter()
            .chain(result.discovered_devices.iter())
            .flat_map(|g| g.interfaces.iter().map(|i| i.ip))
            .collect()
    }

    #[tokio::test]
    async fn test_printer_matched_by_mac() {
        let mut fake = FakePlatform::home();
        fake.alive.insert(ip("192.168.1.50"));
        let platform = Arc::new(fake);
        platform.add_neighbor(NeighborEntry::new(ip("192.168.1.50"), "aa-bb-cc-dd-ee-ff").with_iface("eth0"));
        let config = DiscoveryConfig {
            known_devices: vec![KnownDeviceSpec::new("Printer")
                .with_mac("AA:BB:CC:DD:EE:FF")
                .with_ports(vec![9100])],
            ..DiscoveryConfig::default()
        };

        let result = service(platform, ServiceOptions::default())
            .discover(config, true, false)
            .await
            .unwrap();

        let printer = result
            .known_devices
            .iter()
            .find(|g| g.name == "Printer")
            .expect("printer group");
        let iface = printer.interface(ip("192.168.1.50")).expect("printer interface");
        assert!(iface.ports.contains_key(&9100));
        assert_eq!(printer.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert!(!printer.missing);
    }

    #[tokio::test]
    async fn test_proxy_arp_responder_is_excluded() {
        let platform = Arc::new(FakePlatform::home());
        for i in 100..115 {
            platform.add_neighbor(NeighborEntry::new(Ipv4Addr::new(192, 168, 1, i), "00:11:22:33:44:55"));
        }

        let result = service(platform, ServiceOptions::default())
            .discover(DiscoveryConfig::default(), true, false)
            .await
            .unwrap();

        let ips = all_ips(&result);
        assert!((100..115).all(|i| !ips.contains(&Ipv4Addr::new(192, 168, 1, i))));
        assert!(ips.contains(&ip("192.168.1.1")));
        assert_eq!(result.meta.proxy_arp_macs, vec!["00:11:22:33:44:55".to_string()]);
    }

    #[tokio::test]
    async fn test_transparent_proxy_short_circuits_probing() {
        let non_responders: Vec<Ipv4Addr> = (2..=254).map(|i| Ipv4Addr::new(192, 168, 1, i)).collect();
        let sample = evenly_spaced_sample(&non_responders, 20);
        let mut fake = FakePlatform::home();
        fake.intercept_tcp_except = Some(sample.iter().take(2).copied().collect());
        let platform = Arc::new(fake);

        let result = service(platform.clone(), ServiceOptions::default())
            .discover(DiscoveryConfig::default(), true, false)
            .await
            .unwrap();

        assert!(result.meta.transparent_proxy_detected);
        let probed = platform.tcp_hosts();
        let sampled: HashSet<Ipv4Addr> = sample.into_iter().collect();
        assert!(non_responders
            .iter()
            .filter(|ip| !sampled.contains(*ip))
            .all(|ip| !probed.contains(ip)));
        assert_eq!(all_ips(&result), vec![ip("192.168.1.1")]);
    }

    #[tokio::test]
    async fn test_cache_reused_within_ttl() {
        let platform = Arc::new(FakePlatform::home());
        let svc = service(platform.clone(), ServiceOptions::default());

        let first = svc.discover(DiscoveryConfig::default(), false, false).await.unwrap();
        let reads = platform.neighbor_reads();
        let second = svc.discover(DiscoveryConfig::default(), false, false).await.unwrap();

        assert_eq!(platform.neighbor_reads(), reads);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_fingerprint_change_bypasses_cache() {
        let platform = Arc::new(FakePlatform::home());
        let svc = service(platform.clone(), ServiceOptions::default());

        let first = svc.discover(DiscoveryConfig::default(), false, false).await.unwrap();
        assert_eq!(first.networks, vec!["192.168.1.0/24"]);

        platform.set_interfaces(vec![LocalInterface {
            name: "wlan0".into(),
            is_up: true,
            is_loopback: false,
            ipv4: vec!["10.0.0.20/24".parse().unwrap()],
            mac: Some("aa:bb:cc:00:00:21".into()),
        }]);
        let reads = platform.neighbor_reads();
        let second = svc.discover(DiscoveryConfig::default(), false, false).await.unwrap();

        assert!(platform.neighbor_reads() > reads);
        assert_eq!(second.networks, vec!["10.0.0.0/24"]);
        assert!(second.meta.gateway_outside_sweep);
    }

    #[tokio::test]
    async fn test_sweep_never_exceeds_cap() {
        let platform = Arc::new(FakePlatform::home());
        let config = DiscoveryConfig {
            max_sweep_hosts: 10,
            ..DiscoveryConfig::default()
        };
        let result = service(platform, ServiceOptions::default())
            .discover(config, true, false)
            .await
            .unwrap();
        assert_eq!(result.meta.sweep_size, 10);
    }

    #[tokio::test]
    async fn test_neighbors_only_mode_does_not_sweep() {
        let platform = Arc::new(FakePlatform::home());
        let config = DiscoveryConfig {
            mode: SweepMode::NeighborsOnly,
            ..DiscoveryConfig::default()
        };
        let result = service(platform, ServiceOptions::default())
            .discover(config, true, false)
            .await
            .unwrap();
        assert_eq!(result.meta.sweep_size, 0);
        assert_eq!(result.mode, SweepMode::NeighborsOnly);
    }

    #[tokio::test]
    async fn test_empty_table_falls_back_to_snapshot() {
        let platform = Arc::new(FakePlatform::home());
        platform.add_neighbor(NeighborEntry::new(ip("192.168.1.60"), "aa:aa:aa:aa:aa:60"));
        let options = ServiceOptions {
            cache_enabled: false,
            ..ServiceOptions::default()
        };
        let svc = service(platform.clone(), options);
        let config = DiscoveryConfig {
            mode: SweepMode::NeighborsOnly,
            ..DiscoveryConfig::default()
        };

        let first = svc.discover(config.clone(), false, true).await.unwrap();
        assert_eq!(first.meta.neighbor_source, NeighborSource::Fresh);

        platform.set_neighbors(Vec::new());
        let second = svc.discover(config, false, true).await.unwrap();
        assert_eq!(second.meta.neighbor_source, NeighborSource::Snapshot);
        assert!(all_ips(&second).contains(&ip("192.168.1.60")));
    }

    #[tokio::test]
    async fn test_disabled_cache_stores_nothing() {
        let platform = Arc::new(FakePlatform::home());
        let options = ServiceOptions {
            cache_enabled: false,
            ..ServiceOptions::default()
        };
        let svc = service(platform, options);
        svc.discover(DiscoveryConfig::default(), false, true).await.unwrap();
        assert!(svc.cached().await.is_none());
    }

    #[tokio::test]
    async fn test_kick_is_single_flight_and_rate_limited() {
        let platform = Arc::new(FakePlatform::home());
        let svc = service(platform, ServiceOptions::default());
        let window = Duration::from_secs(30);

        assert!(svc.kick(DiscoveryConfig::default(), false, true, window).await);
        assert!(!svc.kick(DiscoveryConfig::default(), false, true, window).await);

        while svc.in_flight() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(svc.cached().await.is_some());
        assert!(!svc.kick(DiscoveryConfig::default(), false, true, window).await);
        assert!(svc.kick(DiscoveryConfig::default(), true, true, window).await);
    }

    #[tokio::test]
    async fn test_port_only_phantoms_are_purged() {
        // 30 silent sweep addresses all "answer" TCP; too few to trigger sampling
        let mut fake = FakePlatform::home();
        fake.intercept_tcp_except = Some(HashSet::new());
        let platform = Arc::new(fake);
        let config = DiscoveryConfig {
            max_sweep_hosts: 30,
            ..DiscoveryConfig::default()
        };

        let result = service(platform, ServiceOptions::default())
            .discover(config, true, false)
            .await
            .unwrap();

        assert_eq!(result.meta.sweep_size, 30);
        assert!(result.meta.transparent_proxy_detected);
        assert_eq!(result.meta.port_only_hits, 0);
        assert_eq!(all_ips(&result), vec![ip("192.168.1.1")]);
    }

    #[tokio::test]
    async fn test_known_stub_uses_local_addresses() {
        let platform = Arc::new(FakePlatform::home());
        let svc = service(platform, ServiceOptions::default());
        let known = vec![
            KnownDeviceSpec::new("This laptop").with_ip(ip("192.168.1.20")),
            KnownDeviceSpec::new("NAS").with_ip(ip("192.168.1.10")),
        ];

        let stub = svc.known_stub(&known);
        let laptop = stub.iter().find(|g| g.name == "This laptop").unwrap();
        assert!(laptop.up && laptop.is_host && !laptop.missing);
        let nas = stub.iter().find(|g| g.name == "NAS").unwrap();
        assert!(nas.missing);
    }

    #[tokio::test]
    async fn test_completed_within_window() {
        let platform = Arc::new(FakePlatform::home());
        let svc = service(platform, ServiceOptions::default());
        assert!(!svc.completed_within(DEFAULT_KICK_WINDOW).await);
        svc.discover(DiscoveryConfig::default(), true, true).await.unwrap();
        assert!(svc.completed_within(DEFAULT_KICK_WINDOW).await);
    }
}
