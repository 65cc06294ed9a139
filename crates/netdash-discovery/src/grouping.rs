//! Fold enriched hosts and configured devices into logical device groups

use futures::future::join_all;
use pnet::ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::debug;

use crate::platform::NetworkPlatform;
use crate::probe::{check_ports, Limiters, TCP_TIMEOUT};
use crate::topology::HostIdentity;
use netdash_core::{
    base_name, is_dotted_quad, is_overlay_ip, normalize_mac, DeviceGroup, DiscoveredDevice,
    Interface, KnownDeviceSpec,
};

/// Group key used for the running machine when no configured device owns it
pub const HOST_FALLBACK_KEY: &str = "Host machine";

fn group_key(name: &str) -> String {
    let base = base_name(name);
    if base.is_empty() {
        name.trim().to_string()
    } else {
        base
    }
}

/// Groups by key, iterated in the order keys were first inserted
#[derive(Debug, Clone, Default)]
pub struct GroupTable {
    order: Vec<String>,
    groups: HashMap<String, DeviceGroup>,
}

impl GroupTable {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&DeviceGroup> {
        self.groups.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut DeviceGroup> {
        self.groups.get_mut(key)
    }

    /// Insert under `key`, merging into the group already there
    fn insert_or_merge(&mut self, key: String, group: DeviceGroup) {
        match self.groups.get_mut(&key) {
            Some(existing) => existing.merge(group),
            None => {
                self.order.push(key.clone());
                self.groups.insert(key, group);
            }
        }
    }

    fn get_or_insert_with(&mut self, key: &str, make: impl FnOnce() -> DeviceGroup) {
        if !self.groups.contains_key(key) {
            self.order.push(key.to_string());
            self.groups.insert(key.to_string(), make());
        }
    }

    fn remove(&mut self, key: &str) -> Option<DeviceGroup> {
        let group = self.groups.remove(key)?;
        self.order.retain(|k| k != key);
        Some(group)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceGroup)> {
        self.order
            .iter()
            .filter_map(|k| self.groups.get(k).map(|g| (k.as_str(), g)))
    }

    pub fn into_groups(self) -> Vec<DeviceGroup> {
        let Self { order, mut groups } = self;
        order.into_iter().filter_map(|k| groups.remove(&k)).collect()
    }
}

/// One group per configured device base name, with a seeded interface per
/// configured IP. Groups keep declaration order.
pub fn seed_known_groups(known: &[KnownDeviceSpec], identity: &HostIdentity) -> GroupTable {
    let mut groups = GroupTable::default();
    for spec in known {
        let key = group_key(&spec.name);
        let mut group = DeviceGroup::known(key.clone(), spec.match_mac.clone(), spec.notes.clone());
        if let Some(ip) = spec.match_ip {
            group.upsert_interface(Interface::configured(spec, ip, identity.owns_ip(ip)));
        }
        groups.insert_or_merge(key, group);
    }
    groups
}

fn owned_by_host(group: &DeviceGroup, identity: &HostIdentity) -> bool {
    group.interfaces.iter().any(|i| identity.owns_ip(i.ip))
        || group.mac.as_deref().is_some_and(|m| identity.owns_mac(m))
}

/// Flag the first declared group owning one of this machine's addresses
fn mark_host_group(groups: &mut GroupTable, identity: &HostIdentity) -> Option<String> {
    let key = groups
        .iter()
        .find(|(_, g)| owned_by_host(g, identity))
        .map(|(k, _)| k.to_string())?;
    if let Some(group) = groups.get_mut(&key) {
        group.is_host = true;
    }
    Some(key)
}

/// Configured devices alone, for display before any cycle has finished.
/// Addresses owned by this machine already count as up.
pub fn known_stub(known: &[KnownDeviceSpec], identity: &HostIdentity) -> Vec<DeviceGroup> {
    let mut table = seed_known_groups(known, identity);
    mark_host_group(&mut table, identity);
    let mut groups = table.into_groups();
    sort_by_name(&mut groups);
    groups
}

fn sort_by_name(groups: &mut [DeviceGroup]) {
    groups.sort_by_key(|g| g.name.to_lowercase());
}

/// Accumulates device groups over one cycle
pub struct DeviceGrouper<'a> {
    identity: &'a HostIdentity,
    hostname: &'a str,
    gateway: Option<Ipv4Addr>,
    groups: GroupTable,
    host_key: Option<String>,
}

impl<'a> DeviceGrouper<'a> {
    pub fn new(
        known: &'a [KnownDeviceSpec],
        identity: &'a HostIdentity,
        hostname: &'a str,
        gateway: Option<Ipv4Addr>,
    ) -> Self {
        let mut groups = seed_known_groups(known, identity);
        let host_key = mark_host_group(&mut groups, identity);
        Self {
            identity,
            hostname,
            gateway,
            groups,
            host_key,
        }
    }

    /// Probe configured ports on seeded interfaces owned by this machine
    pub async fn probe_host_ports<P: NetworkPlatform + ?Sized>(
        &mut self,
        platform: &P,
        limiters: &Limiters,
    ) {
        let targets: Vec<(String, Ipv4Addr, Vec<u16>)> = self
            .groups
            .iter()
            .flat_map(|(key, g)| {
                g.interfaces
                    .iter()
                    .filter(|i| self.identity.owns_ip(i.ip) && !i.ports.is_empty())
                    .map(move |i| (key.to_string(), i.ip, i.ports.keys().copied().collect()))
            })
            .collect();

        let probes = targets.into_iter().map(|(key, ip, ports)| async move {
            let open = check_ports(platform, ip, &ports, &limiters.tcp_connect, TCP_TIMEOUT).await;
            (key, ip, open)
        });
        for (key, ip, open) in join_all(probes).await {
            if let Some(group) = self.groups.get_mut(&key) {
                group.update_interface(ip, |iface| {
                    iface.up |= open.values().any(|&o| o);
                    iface.ports = open;
                });
            }
        }
    }

    fn find_known(&self, matches: impl Fn(&DeviceGroup) -> bool) -> Option<String> {
        self.groups
            .iter()
            .find(|(_, g)| g.known && matches(g))
            .map(|(k, _)| k.to_string())
    }

    fn host_group_key(&mut self, device: &DiscoveredDevice) -> String {
        if let Some(key) = &self.host_key {
            return key.clone();
        }
        let hostname = self.hostname.to_string();
        let mut group = DeviceGroup::synthetic(hostname, device.mac.clone());
        group.is_host = true;
        self.groups.get_or_insert_with(HOST_FALLBACK_KEY, || group);
        self.host_key = Some(HOST_FALLBACK_KEY.to_string());
        HOST_FALLBACK_KEY.to_string()
    }

    /// Fold one observed device into its group
    pub fn fold(&mut self, device: &DiscoveredDevice) {
        let mac = device.mac.as_deref().map(normalize_mac);
        let base = group_key(&device.name);

        let key = if device.is_host {
            Some(self.host_group_key(device))
        } else {
            None
        };
        let key = key
            .or_else(|| {
                let mac = mac.as_deref()?;
                self.find_known(|g| {
                    g.mac.as_deref() == Some(mac)
                        || g.interfaces.iter().any(|i| i.mac.as_deref() == Some(mac))
                })
            })
            .or_else(|| self.find_known(|g| g.name.eq_ignore_ascii_case(&base)))
            .or_else(|| self.find_known(|g| g.interface(device.ip).is_some()));

        let key = match key {
            Some(key) => key,
            None => {
                let is_gateway = self.gateway == Some(device.ip);
                let name = if is_gateway { device.name.clone() } else { base.clone() };
                let key = match &mac {
                    Some(mac) => mac.clone(),
                    None if is_gateway => device.name.clone(),
                    None if !base.is_empty() && !is_dotted_quad(&base) => base,
                    None => device.ip.to_string(),
                };
                self.groups
                    .get_or_insert_with(&key, || DeviceGroup::synthetic(name, mac.clone()));
                key
            }
        };

        if let Some(group) = self.groups.get_mut(&key) {
            group.absorb(device);
        }
    }

    /// Merge known groups whose names differ only by case into the first declared
    fn merge_known_duplicates(&mut self) {
        let mut canonical: HashMap<String, String> = HashMap::new();
        let mut duplicates: Vec<(String, String)> = Vec::new();
        for (key, group) in self.groups.iter() {
            if !group.known {
                continue;
            }
            let folded = group.name.to_lowercase();
            match canonical.get(&folded) {
                Some(target) => duplicates.push((key.to_string(), target.clone())),
                None => {
                    canonical.insert(folded, key.to_string());
                }
            }
        }
        for (dup, target) in duplicates {
            if let Some(group) = self.groups.remove(&dup) {
                debug!(from = %dup, into = %target, "Merging duplicate known device");
                if let Some(target) = self.groups.get_mut(&target) {
                    target.merge(group);
                }
            }
        }
    }

    /// Known groups sorted by name, then discovered groups with up devices first
    pub fn finish(mut self) -> (Vec<DeviceGroup>, Vec<DeviceGroup>) {
        self.merge_known_duplicates();
        let (mut known, discovered): (Vec<DeviceGroup>, Vec<DeviceGroup>) =
            self.groups.into_groups().into_iter().partition(|g| g.known);
        let mut discovered: Vec<DeviceGroup> = discovered
            .into_iter()
            .filter(|g| !g.interfaces.is_empty())
            .collect();
        sort_by_name(&mut known);
        discovered.sort_by_key(|g| (!g.up, g.name.to_lowercase()));
        (known, discovered)
    }
}

/// `"name: ip"` for configured LAN addresses outside the sweep network
pub fn subnet_mismatches(
    known: &[KnownDeviceSpec],
    sweep_network: Option<Ipv4Network>,
) -> Option<Vec<String>> {
    let network = sweep_network?;
    let mismatches: Vec<String> = known
        .iter()
        .filter_map(|k| k.match_ip.map(|ip| (k, ip)))
        .filter(|(_, ip)| !is_overlay_ip(*ip) && !network.contains(*ip))
        .map(|(k, ip)| format!("{}: {}", k.name, ip))
        .collect();
    (!mismatches.is_empty()).then_some(mismatches)
}

pub fn gateway_outside_sweep(gateway: Option<Ipv4Addr>, sweep_network: Option<Ipv4Network>) -> bool {
    match (gateway, sweep_network) {
        (Some(gw), Some(net)) => !net.contains(gw),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ConcurrencyLimits;
    use crate::testing::FakePlatform;
    use netdash_core::ConnectionType;
    use std::collections::{BTreeMap, HashSet};

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn device(addr: &str, name: &str, mac: Option<&str>, up: bool) -> DiscoveredDevice {
        DiscoveredDevice {
            ip: ip(addr),
            name: name.to_string(),
            mac: mac.map(String::from),
            known: false,
            notes: String::new(),
            ping: up,
            ports: BTreeMap::new(),
            up,
            iface: None,
            connection_type: ConnectionType::Wired,
            is_host: false,
        }
    }

    fn identity(addr: &str) -> HostIdentity {
        let mut id = HostIdentity::default();
        id.ips.insert(ip(addr));
        id
    }

    #[test]
    fn test_seed_merges_interfaces_by_base_name() {
        let known = vec![
            KnownDeviceSpec::new("NAS").with_ip(ip("192.168.1.10")),
            KnownDeviceSpec::new("NAS (Tailscale)").with_ip(ip("100.100.1.10")),
        ];
        let groups = seed_known_groups(&known, &HostIdentity::default());
        assert_eq!(groups.len(), 1);
        let nas = groups.get("NAS").unwrap();
        assert_eq!(nas.interfaces.len(), 2);
        assert!(nas.missing);
        assert!(!nas.up);
        assert!(nas.has_overlay);
    }

    #[test]
    fn test_host_owned_seed_is_up() {
        let known = vec![KnownDeviceSpec::new("Laptop").with_ip(ip("192.168.1.20"))];
        let id = identity("192.168.1.20");
        let grouper = DeviceGrouper::new(&known, &id, "laptop", None);
        let (known, _) = grouper.finish();
        assert!(known[0].up);
        assert!(!known[0].missing);
        assert!(known[0].is_host);
    }

    #[test]
    fn test_host_group_follows_declaration_order() {
        let known = vec![
            KnownDeviceSpec::new("Zed workstation").with_ip(ip("192.168.1.20")),
            KnownDeviceSpec::new("Alpha laptop").with_ip(ip("127.0.0.1")),
        ];
        let mut id = identity("192.168.1.20");
        id.ips.insert(ip("127.0.0.1"));
        let grouper = DeviceGrouper::new(&known, &id, "zed", None);
        let (known, _) = grouper.finish();
        let host: Vec<&str> = known.iter().filter(|g| g.is_host).map(|g| g.name.as_str()).collect();
        assert_eq!(host, vec!["Zed workstation"]);
    }

    #[tokio::test]
    async fn test_probe_host_ports_only_touches_own_addresses() {
        let mut fake = FakePlatform::home();
        fake.open_ports.insert(ip("192.168.1.20"), vec![22]);
        let known = vec![
            KnownDeviceSpec::new("Laptop")
                .with_ip(ip("192.168.1.20"))
                .with_ports(vec![22, 8080]),
            KnownDeviceSpec::new("NAS")
                .with_ip(ip("192.168.1.10"))
                .with_ports(vec![445]),
        ];
        let id = identity("192.168.1.20");
        let limiters = Limiters::new(&ConcurrencyLimits::default());
        let mut grouper = DeviceGrouper::new(&known, &id, "laptop", None);
        grouper.probe_host_ports(&fake, &limiters).await;
        let (known, _) = grouper.finish();

        let laptop = known.iter().find(|g| g.name == "Laptop").unwrap();
        let iface = laptop.interface(ip("192.168.1.20")).unwrap();
        assert_eq!(iface.ports.get(&22), Some(&true));
        assert_eq!(iface.ports.get(&8080), Some(&false));
        assert!(laptop.up);

        let expected: HashSet<Ipv4Addr> = [ip("192.168.1.20")].into_iter().collect();
        assert_eq!(fake.tcp_hosts(), expected);
    }

    #[test]
    fn test_fold_by_mac_into_known_group() {
        let known = vec![KnownDeviceSpec::new("Printer").with_mac("AA:BB:CC:DD:EE:FF").with_ports(vec![9100])];
        let id = HostIdentity::default();
        let mut grouper = DeviceGrouper::new(&known, &id, "host", None);
        grouper.fold(&device("192.168.1.50", "printer.lan", Some("aa:bb:cc:dd:ee:ff"), true));
        let (known, discovered) = grouper.finish();
        assert!(discovered.is_empty());
        assert_eq!(known[0].name, "Printer");
        assert!(!known[0].missing);
        assert!(known[0].interface(ip("192.168.1.50")).is_some());
    }

    #[test]
    fn test_observed_interface_replaces_seed() {
        let known = vec![KnownDeviceSpec::new("TV").with_ip(ip("192.168.1.30"))];
        let id = HostIdentity::default();
        let mut grouper = DeviceGrouper::new(&known, &id, "host", None);
        let mut tv = device("192.168.1.30", "TV", None, true);
        tv.known = true;
        grouper.fold(&tv);
        let (known, _) = grouper.finish();
        assert_eq!(known[0].interfaces.len(), 1);
        assert!(!known[0].interfaces[0].missing);
        assert!(known[0].up);
    }

    #[test]
    fn test_host_device_without_config_uses_hostname() {
        let id = identity("192.168.1.20");
        let mut grouper = DeviceGrouper::new(&[], &id, "my-laptop", None);
        let mut me = device("192.168.1.20", "192.168.1.20", Some("aa:aa:aa:aa:aa:20"), true);
        me.is_host = true;
        grouper.fold(&me);
        let (_, discovered) = grouper.finish();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].name, "my-laptop");
        assert!(discovered[0].is_host);
    }

    #[test]
    fn test_synthetic_keys_and_gateway_name() {
        let id = HostIdentity::default();
        let gw = ip("192.168.1.1");
        let mut grouper = DeviceGrouper::new(&[], &id, "host", Some(gw));
        grouper.fold(&device("192.168.1.1", "Gateway (192.168.1.1)", None, true));
        grouper.fold(&device("192.168.1.60", "phone.local", Some("aa:aa:aa:aa:aa:60"), false));
        grouper.fold(&device("192.168.1.61", "phone.lan", Some("aa:aa:aa:aa:aa:60"), true));
        grouper.fold(&device("192.168.1.70", "192.168.1.70", None, false));
        let (_, discovered) = grouper.finish();

        let names: Vec<&str> = discovered.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Gateway (192.168.1.1)", "phone", "192.168.1.70"]);
        assert_eq!(discovered[1].interfaces.len(), 2);
        assert!(discovered[1].up);
    }

    #[test]
    fn test_known_groups_merge_case_insensitively() {
        let known = vec![
            KnownDeviceSpec::new("Desktop").with_ip(ip("192.168.1.40")),
            KnownDeviceSpec::new("desktop").with_ip(ip("192.168.1.41")),
        ];
        let id = HostIdentity::default();
        let grouper = DeviceGrouper::new(&known, &id, "host", None);
        let (known, _) = grouper.finish();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].interfaces.len(), 2);
    }

    #[test]
    fn test_case_duplicates_merge_into_first_declared() {
        let known = vec![
            KnownDeviceSpec::new("desktop").with_ip(ip("192.168.1.41")),
            KnownDeviceSpec::new("Desktop").with_ip(ip("192.168.1.40")),
        ];
        let id = HostIdentity::default();
        let (known, _) = DeviceGrouper::new(&known, &id, "host", None).finish();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].name, "desktop");
        assert_eq!(known[0].interfaces[0].ip, ip("192.168.1.41"));
    }

    #[test]
    fn test_discovered_sort_puts_up_first() {
        let id = HostIdentity::default();
        let mut grouper = DeviceGrouper::new(&[], &id, "host", None);
        grouper.fold(&device("10.0.0.2", "alpha", Some("aa:aa:aa:aa:aa:02"), false));
        grouper.fold(&device("10.0.0.3", "Zulu", Some("aa:aa:aa:aa:aa:03"), true));
        grouper.fold(&device("10.0.0.4", "bravo", Some("aa:aa:aa:aa:aa:04"), true));
        let (_, discovered) = grouper.finish();
        let names: Vec<&str> = discovered.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["bravo", "Zulu", "alpha"]);
    }

    #[test]
    fn test_diagnostics() {
        let known = vec![
            KnownDeviceSpec::new("Cam").with_ip(ip("10.1.1.5")),
            KnownDeviceSpec::new("NAS").with_ip(ip("192.168.1.10")),
            KnownDeviceSpec::new("NAS ts").with_ip(ip("100.90.1.1")),
        ];
        let net: Ipv4Network = "192.168.1.0/24".parse().unwrap();
        assert_eq!(subnet_mismatches(&known, Some(net)), Some(vec!["Cam: 10.1.1.5".to_string()]));
        assert_eq!(subnet_mismatches(&known, None), None);
        assert!(gateway_outside_sweep(Some(ip("10.0.0.1")), Some(net)));
        assert!(!gateway_outside_sweep(Some(ip("192.168.1.1")), Some(net)));
    }

    #[test]
    fn test_known_stub_sorted() {
        let known = vec![KnownDeviceSpec::new("zeta"), KnownDeviceSpec::new("Alpha")];
        let names: Vec<String> = known_stub(&known, &HostIdentity::default())
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "zeta"]);
    }

    #[test]
    fn test_known_stub_marks_host_addresses_up() {
        let known = vec![
            KnownDeviceSpec::new("Laptop").with_ip(ip("127.0.0.1")),
            KnownDeviceSpec::new("NAS").with_ip(ip("192.168.1.10")),
        ];
        let stub = known_stub(&known, &identity("127.0.0.1"));
        let laptop = stub.iter().find(|g| g.name == "Laptop").unwrap();
        assert!(laptop.up);
        assert!(!laptop.missing);
        assert!(laptop.is_host);
        let nas = stub.iter().find(|g| g.name == "NAS").unwrap();
        assert!(!nas.up);
        assert!(nas.missing);
        assert!(!nas.is_host);
    }
}
