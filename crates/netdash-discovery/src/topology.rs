//! Local network topology: subnets, host identity, gateway, Wi-Fi, fingerprint

use pnet::ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, trace};

use crate::platform::{LocalInterface, NetworkPlatform, Os};
use netdash_core::{
    is_overlay_ip, is_valid_mac, is_zero_mac, normalize_mac, FingerprintInputs,
    NetworkFingerprint,
};

/// Interface name prefixes for VPN, mesh, and virtual bridge adapters
pub const TUNNEL_PREFIXES: &[&str] = &[
    "utun", "tun", "tap", "wg", "tailscale", "ts", "vpn", "ppp", "awdl", "llw", "p2p", "bridge",
];

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

const AIRPORT: &str =
    "/System/Library/PrivateFrameworks/Apple80211.framework/Versions/Current/Resources/airport";

pub fn is_tunnel_interface(name: &str) -> bool {
    let name = name.to_lowercase();
    TUNNEL_PREFIXES.iter().any(|p| name.starts_with(p))
}

fn is_active(iface: &LocalInterface) -> bool {
    iface.is_up && !iface.is_loopback && !is_tunnel_interface(&iface.name)
}

/// Network containing `net`, with the host bits cleared
fn canonical(net: Ipv4Network) -> Ipv4Network {
    Ipv4Network::new(net.network(), net.prefix()).unwrap_or(net)
}

/// Subnets of active, non-tunnel interfaces, de-duplicated and sorted
pub fn local_networks(interfaces: &[LocalInterface]) -> Vec<Ipv4Network> {
    let nets: BTreeSet<Ipv4Network> = interfaces
        .iter()
        .filter(|i| is_active(i))
        .flat_map(|i| i.ipv4.iter())
        .filter(|net| !net.ip().is_loopback())
        .map(|net| canonical(*net))
        .collect();
    nets.into_iter().collect()
}

/// Addresses of active interfaces, excluding loopback and overlay addresses
pub fn active_host_ips(interfaces: &[LocalInterface]) -> Vec<Ipv4Addr> {
    let ips: BTreeSet<Ipv4Addr> = interfaces
        .iter()
        .filter(|i| is_active(i))
        .flat_map(|i| i.ipv4.iter().map(|n| n.ip()))
        .filter(|ip| !ip.is_loopback() && !is_overlay_ip(*ip))
        .collect();
    ips.into_iter().collect()
}

/// Every address and MAC that belongs to the running machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub ips: BTreeSet<Ipv4Addr>,
    pub macs: BTreeSet<String>,
}

impl HostIdentity {
    pub fn from_interfaces(interfaces: &[LocalInterface]) -> Self {
        let mut ips: BTreeSet<Ipv4Addr> = interfaces
            .iter()
            .flat_map(|i| i.ipv4.iter().map(|n| n.ip()))
            .collect();
        ips.insert(Ipv4Addr::LOCALHOST);
        let macs = interfaces
            .iter()
            .filter_map(|i| i.mac.as_deref())
            .filter(|m| !is_zero_mac(m))
            .map(normalize_mac)
            .collect();
        Self { ips, macs }
    }

    pub fn owns_ip(&self, ip: Ipv4Addr) -> bool {
        self.ips.contains(&ip)
    }

    pub fn owns_mac(&self, mac: &str) -> bool {
        self.macs.contains(&normalize_mac(mac))
    }
}

/// Clamp networks wider than /24 to the /24 around `anchor`
pub fn tighten(net: Ipv4Network, anchor: Ipv4Addr) -> Ipv4Network {
    if net.prefix() >= 24 {
        return net;
    }
    Ipv4Network::new(anchor, 24).map(canonical).unwrap_or(net)
}

/// Pick the one network worth sweeping.
///
/// Prefers the network holding a host address, then the one holding the
/// gateway (both tightened to /24), then the smallest network.
pub fn preferred_sweep_network(
    networks: &[Ipv4Network],
    host_ips: &[Ipv4Addr],
    gateway: Option<Ipv4Addr>,
) -> Option<Ipv4Network> {
    for ip in host_ips {
        if let Some(net) = networks.iter().find(|n| n.contains(*ip)) {
            return Some(tighten(*net, *ip));
        }
    }
    if let Some(gw) = gateway {
        if let Some(net) = networks.iter().find(|n| n.contains(gw)) {
            return Some(tighten(*net, gw));
        }
    }
    networks.iter().max_by_key(|n| n.prefix()).copied()
}

/// Networks as shown on the dashboard: anything wider than /24 is narrowed
/// to the /24 around the first host address inside it
pub fn display_networks(networks: &[Ipv4Network], host_ips: &[Ipv4Addr]) -> Vec<String> {
    networks
        .iter()
        .map(|net| {
            let anchor = host_ips
                .iter()
                .copied()
                .find(|ip| net.contains(*ip))
                .unwrap_or_else(|| net.network());
            tighten(*net, anchor).to_string()
        })
        .collect()
}

/// Gateway from `ip route show default`
pub fn parse_ip_route_default(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.first() != Some(&"default") {
            return None;
        }
        let via = parts.iter().position(|&p| p == "via")?;
        parts.get(via + 1)?.parse().ok()
    })
}

/// Gateway from macOS `netstat -rn`, skipping default routes through tunnels
pub fn parse_netstat_default(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        // Destination Gateway Flags Netif [Expire]
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 || parts[0] != "default" || !parts[1].contains('.') {
            return None;
        }
        if is_tunnel_interface(parts[3]) {
            return None;
        }
        parts[1].parse().ok()
    })
}

/// Gateway from macOS `route -n get default`
pub fn parse_route_get(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        if key.trim() == "gateway" {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Gateway from Windows `route print -4 0.0.0.0`
pub fn parse_windows_route(output: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 3 && parts[0] == "0.0.0.0" && parts[1] == "0.0.0.0" {
            parts[2].parse().ok()
        } else {
            None
        }
    })
}

/// First non-zero MAC printed by `arp` for a single address
pub fn parse_arp_mac(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .filter(|tok| tok.contains(':') || tok.contains('-'))
        .find(|tok| is_valid_mac(tok) && !is_zero_mac(tok))
        .map(normalize_mac)
}

fn wifi_identity(ssid: Option<&str>, bssid: Option<&str>) -> Option<String> {
    let ssid = ssid.map(str::trim).filter(|s| !s.is_empty())?;
    match bssid.map(str::trim).filter(|b| !b.is_empty()) {
        Some(bssid) => Some(format!("{}|{}", ssid, bssid.to_lowercase())),
        None => Some(ssid.to_string()),
    }
}

/// `key: value` lines from airport `-I` and `netsh wlan show interfaces`
fn parse_keyed_wifi(output: &str) -> Option<String> {
    let mut ssid = None;
    let mut bssid = None;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "SSID" if ssid.is_none() => ssid = Some(value),
            "BSSID" if bssid.is_none() => bssid = Some(value),
            _ => {}
        }
    }
    wifi_identity(ssid, bssid)
}

pub fn parse_airport(output: &str) -> Option<String> {
    parse_keyed_wifi(output)
}

pub fn parse_netsh_wlan(output: &str) -> Option<String> {
    parse_keyed_wifi(output)
}

/// Active SSID from `nmcli -t -f active,ssid dev wifi`
pub fn parse_nmcli(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("yes:"))
        .and_then(|ssid| wifi_identity(Some(ssid), None))
}

pub(crate) async fn query_default_gateway<P: NetworkPlatform + ?Sized>(
    platform: &P,
) -> Option<Ipv4Addr> {
    let gateway = match platform.os() {
        Os::Windows => platform
            .run(&["route", "print", "-4", "0.0.0.0"], QUERY_TIMEOUT)
            .await
            .stdout_if_ok()
            .and_then(parse_windows_route),
        Os::MacOs => {
            let netstat = platform.run(&["netstat", "-rn"], QUERY_TIMEOUT).await;
            match netstat.stdout_if_ok().and_then(parse_netstat_default) {
                Some(gw) => Some(gw),
                None => platform
                    .run(&["route", "-n", "get", "default"], QUERY_TIMEOUT)
                    .await
                    .stdout_if_ok()
                    .and_then(parse_route_get),
            }
        }
        Os::Linux | Os::Other => platform
            .run(&["ip", "route", "show", "default"], QUERY_TIMEOUT)
            .await
            .stdout_if_ok()
            .and_then(parse_ip_route_default),
    };
    trace!(gateway = ?gateway, "Default gateway");
    gateway
}

pub(crate) async fn query_gateway_mac<P: NetworkPlatform + ?Sized>(
    platform: &P,
    gateway: Ipv4Addr,
) -> Option<String> {
    let ip = gateway.to_string();
    let argv: [&str; 3] = match platform.os() {
        Os::Windows => ["arp", "-a", &ip],
        _ => ["arp", "-n", &ip],
    };
    let out = platform.run(&argv, QUERY_TIMEOUT).await;
    // BSD arp exits non-zero for unknown hosts but still prints a line
    parse_arp_mac(&out.stdout)
}

pub(crate) async fn query_wifi_identity<P: NetworkPlatform + ?Sized>(
    platform: &P,
) -> Option<String> {
    match platform.os() {
        Os::MacOs => platform
            .run(&[AIRPORT, "-I"], QUERY_TIMEOUT)
            .await
            .stdout_if_ok()
            .and_then(parse_airport),
        Os::Windows => platform
            .run(&["netsh", "wlan", "show", "interfaces"], QUERY_TIMEOUT)
            .await
            .stdout_if_ok()
            .and_then(parse_netsh_wlan),
        Os::Linux | Os::Other => {
            let iwgetid = platform.run(&["iwgetid", "-r"], QUERY_TIMEOUT).await;
            if let Some(ssid) = iwgetid
                .stdout_if_ok()
                .and_then(|s| wifi_identity(Some(s), None))
            {
                return Some(ssid);
            }
            platform
                .run(&["nmcli", "-t", "-f", "active,ssid", "dev", "wifi"], QUERY_TIMEOUT)
                .await
                .stdout_if_ok()
                .and_then(parse_nmcli)
        }
    }
}

/// Everything one cycle needs to know about where the host is attached
#[derive(Debug, Clone)]
pub struct NetworkTopology {
    pub interfaces: Vec<LocalInterface>,
    /// Active non-tunnel subnets
    pub networks: Vec<Ipv4Network>,
    /// Active, non-loopback, non-overlay host addresses
    pub host_ips: Vec<Ipv4Addr>,
    pub identity: HostIdentity,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_mac: Option<String>,
    pub wifi: Option<String>,
    pub sweep_network: Option<Ipv4Network>,
    pub fingerprint: NetworkFingerprint,
}

impl NetworkTopology {
    /// Query the platform; every lookup fails soft
    pub async fn resolve<P: NetworkPlatform + ?Sized>(platform: &P) -> Self {
        let interfaces = platform.interfaces();
        let gateway = platform.default_gateway().await;
        let gateway_mac = match gateway {
            Some(gw) => platform.gateway_mac(gw).await,
            None => None,
        };
        let wifi = platform.wifi_identity().await;
        Self::from_parts(interfaces, gateway, gateway_mac, wifi)
    }

    pub fn from_parts(
        interfaces: Vec<LocalInterface>,
        gateway: Option<Ipv4Addr>,
        gateway_mac: Option<String>,
        wifi: Option<String>,
    ) -> Self {
        let networks = local_networks(&interfaces);
        let host_ips = active_host_ips(&interfaces);
        let identity = HostIdentity::from_interfaces(&interfaces);
        let sweep_network = preferred_sweep_network(&networks, &host_ips, gateway);

        let addrs = interfaces
            .iter()
            .filter(|i| is_active(i))
            .flat_map(|i| i.ipv4.iter().map(move |n| format!("{}:{}", i.name, n)))
            .collect();
        let fingerprint = NetworkFingerprint::compute(&FingerprintInputs {
            nets: networks.iter().map(|n| n.to_string()).collect(),
            addrs,
            gateway: gateway.map(|g| g.to_string()).unwrap_or_default(),
            gateway_mac: gateway_mac.clone().unwrap_or_default(),
            wifi: wifi.clone().unwrap_or_default(),
        });

        debug!(
            networks = networks.len(),
            gateway = ?gateway,
            sweep_network = ?sweep_network.map(|n| n.to_string()),
            "Resolved network topology"
        );

        Self {
            interfaces,
            networks,
            host_ips,
            identity,
            gateway,
            gateway_mac,
            wifi,
            sweep_network,
            fingerprint,
        }
    }

    pub fn in_sweep_network(&self, ip: Ipv4Addr) -> bool {
        self.sweep_network.is_some_and(|n| n.contains(ip))
    }

    pub fn display_networks(&self) -> Vec<String> {
        display_networks(&self.networks, &self.host_ips)
    }

    /// Names of tunnel interfaces, to reject neighbors learned on them
    pub fn is_tunnel(&self, iface: Option<&str>) -> bool {
        iface.is_some_and(is_tunnel_interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, cidr: &str, mac: Option<&str>) -> LocalInterface {
        LocalInterface {
            name: name.to_string(),
            is_up: true,
            is_loopback: name == "lo",
            ipv4: vec![cidr.parse().unwrap()],
            mac: mac.map(String::from),
        }
    }

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tunnel_interfaces() {
        assert!(is_tunnel_interface("utun3"));
        assert!(is_tunnel_interface("tailscale0"));
        assert!(is_tunnel_interface("WG0"));
        assert!(is_tunnel_interface("bridge100"));
        assert!(!is_tunnel_interface("eth0"));
        assert!(!is_tunnel_interface("en0"));
        assert!(!is_tunnel_interface("wlan0"));
    }

    #[test]
    fn test_local_networks_skip_tunnels_and_loopback() {
        let ifaces = vec![
            iface("lo", "127.0.0.1/8", None),
            iface("eth0", "192.168.1.20/24", Some("aa:bb:cc:00:00:01")),
            iface("tailscale0", "100.101.1.2/32", None),
        ];
        assert_eq!(local_networks(&ifaces), vec![net("192.168.1.0/24")]);
        assert_eq!(active_host_ips(&ifaces), vec![ip("192.168.1.20")]);
    }

    #[test]
    fn test_down_interfaces_are_inactive() {
        let mut down = iface("eth1", "10.0.0.5/24", None);
        down.is_up = false;
        assert!(local_networks(&[down.clone()]).is_empty());
        assert!(active_host_ips(&[down]).is_empty());
    }

    #[test]
    fn test_host_identity_includes_localhost_and_macs() {
        let ifaces = vec![iface("eth0", "192.168.1.20/24", Some("AA-BB-CC-00-00-01"))];
        let identity = HostIdentity::from_interfaces(&ifaces);
        assert!(identity.owns_ip(Ipv4Addr::LOCALHOST));
        assert!(identity.owns_ip(ip("192.168.1.20")));
        assert!(identity.owns_mac("aa:bb:cc:00:00:01"));
    }

    #[test]
    fn test_preferred_sweep_network_tightens_wide_host_network() {
        let nets = vec![net("10.0.0.0/16")];
        let chosen = preferred_sweep_network(&nets, &[ip("10.0.42.7")], None);
        assert_eq!(chosen, Some(net("10.0.42.0/24")));
    }

    #[test]
    fn test_preferred_sweep_network_falls_back_to_gateway_then_smallest() {
        let nets = vec![net("10.0.0.0/16"), net("192.168.5.0/26")];
        let by_gateway = preferred_sweep_network(&nets, &[], Some(ip("10.0.3.1")));
        assert_eq!(by_gateway, Some(net("10.0.3.0/24")));

        let smallest = preferred_sweep_network(&nets, &[], None);
        assert_eq!(smallest, Some(net("192.168.5.0/26")));

        assert_eq!(preferred_sweep_network(&[], &[], None), None);
    }

    #[test]
    fn test_display_networks() {
        let nets = vec![net("10.0.0.0/16"), net("172.16.0.0/12"), net("192.168.1.0/24")];
        let shown = display_networks(&nets, &[ip("10.0.9.4")]);
        assert_eq!(shown, vec!["10.0.9.0/24", "172.16.0.0/24", "192.168.1.0/24"]);
    }

    #[test]
    fn test_parse_ip_route_default() {
        let out = "default via 192.168.1.1 dev eth0 proto dhcp metric 100\n";
        assert_eq!(parse_ip_route_default(out), Some(ip("192.168.1.1")));
        assert_eq!(parse_ip_route_default("192.168.1.0/24 dev eth0\n"), None);
    }

    #[test]
    fn test_parse_netstat_prefers_non_tunnel_route() {
        let out = "\
Routing tables

Internet:
Destination        Gateway            Flags               Netif Expire
default            link#22            UCSg                utun4
default            10.8.0.1           UGScg               utun3
default            192.168.1.1        UGScg                 en0
127                127.0.0.1          UCS                   lo0
";
        assert_eq!(parse_netstat_default(out), Some(ip("192.168.1.1")));
    }

    #[test]
    fn test_parse_route_get() {
        let out = "   route to: default\ndestination: default\n    gateway: 192.168.0.254\n  interface: en0\n";
        assert_eq!(parse_route_get(out), Some(ip("192.168.0.254")));
    }

    #[test]
    fn test_parse_windows_route() {
        let out = "\
IPv4 Route Table
===========================================================================
Active Routes:
Network Destination        Netmask          Gateway       Interface  Metric
          0.0.0.0          0.0.0.0      192.168.1.1    192.168.1.42     25
";
        assert_eq!(parse_windows_route(out), Some(ip("192.168.1.1")));
    }

    #[test]
    fn test_parse_arp_mac_variants() {
        let bsd = "? (192.168.1.1) at 0:11:22:a:b:c on en0 ifscope [ethernet]";
        assert_eq!(parse_arp_mac(bsd).as_deref(), Some("00:11:22:0a:0b:0c"));

        let windows = "\nInterface: 192.168.1.42 --- 0x5\n  Internet Address      Physical Address      Type\n  192.168.1.1           AA-BB-CC-DD-EE-FF     dynamic\n";
        assert_eq!(parse_arp_mac(windows).as_deref(), Some("aa:bb:cc:dd:ee:ff"));

        assert_eq!(parse_arp_mac("192.168.1.9 (192.168.1.9) -- no entry"), None);
    }

    #[test]
    fn test_parse_wifi_identity() {
        let airport = "     agrCtlRSSI: -51\n          BSSID: AA:BB:CC:DD:EE:01\n           SSID: HomeNet\n";
        assert_eq!(parse_airport(airport).as_deref(), Some("HomeNet|aa:bb:cc:dd:ee:01"));

        let netsh = "    Name                   : Wi-Fi\n    SSID                   : Office\n    BSSID                  : 11:22:33:44:55:66\n";
        assert_eq!(parse_netsh_wlan(netsh).as_deref(), Some("Office|11:22:33:44:55:66"));

        assert_eq!(parse_nmcli("no:Neighbor\nyes:HomeNet\n").as_deref(), Some("HomeNet"));
        assert_eq!(parse_nmcli("no:Neighbor\n"), None);
    }

    #[test]
    fn test_fingerprint_changes_with_network() {
        let a = NetworkTopology::from_parts(
            vec![iface("eth0", "192.168.1.20/24", None)],
            Some(ip("192.168.1.1")),
            None,
            None,
        );
        let b = NetworkTopology::from_parts(
            vec![iface("eth0", "10.0.0.20/24", None)],
            Some(ip("10.0.0.1")),
            None,
            None,
        );
        assert_ne!(a.fingerprint, b.fingerprint);
        assert_eq!(a.sweep_network, Some(net("192.168.1.0/24")));
        assert!(a.in_sweep_network(ip("192.168.1.77")));
        assert!(!a.in_sweep_network(ip("10.0.0.1")));
    }
}
