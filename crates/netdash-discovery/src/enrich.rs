//! Turn candidate IPs into named, probed devices

use futures::future::join_all;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::candidates::CandidateSet;
use crate::platform::{NetworkPlatform, Os};
use crate::probe::{check_ports, Limiters, TCP_TIMEOUT};
use crate::topology::HostIdentity;
use netdash_core::{match_known, ConnectionType, DiscoveredDevice, KnownDeviceSpec};

/// Guess the link type from the interface a neighbor was learned on
pub fn classify_connection(iface: Option<&str>, os: Os) -> ConnectionType {
    let Some(name) = iface.map(str::to_lowercase) else {
        return ConnectionType::Wired;
    };
    let wireless = name.starts_with('w')
        || name.contains("air")
        || name.contains("wireless")
        || (os == Os::MacOs && name == "en0");
    if wireless {
        ConnectionType::Wireless
    } else {
        ConnectionType::Wired
    }
}

pub fn gateway_name(ip: Ipv4Addr) -> String {
    format!("Gateway ({})", ip)
}

/// Inputs shared by every enrichment in a cycle
pub struct EnrichContext<'a> {
    pub known: &'a [KnownDeviceSpec],
    pub default_ports: &'a [u16],
    pub gateway: Option<Ipv4Addr>,
    pub identity: &'a HostIdentity,
    pub os: Os,
    /// Skip DNS, port probes and fresh pings
    pub fast: bool,
    pub ping_timeout_ms: u64,
    /// Ping results already gathered this cycle
    pub pinged: &'a BTreeMap<Ipv4Addr, bool>,
    pub limiters: &'a Limiters,
}

/// Enrich one candidate
pub async fn enrich_one<P: NetworkPlatform + ?Sized>(
    platform: &P,
    ctx: &EnrichContext<'_>,
    ip: Ipv4Addr,
    mac: Option<String>,
    iface: Option<String>,
) -> DiscoveredDevice {
    let known = match_known(ctx.known, ip, mac.as_deref());

    let name = match known {
        _ if ctx.gateway == Some(ip) => gateway_name(ip),
        Some(spec) => spec.name.clone(),
        None if !ctx.fast => {
            let _permit = ctx.limiters.dns.acquire().await.ok();
            platform.reverse_dns(ip).await.unwrap_or_else(|| ip.to_string())
        }
        None => ip.to_string(),
    };

    let ports = match known {
        Some(spec) if !spec.ports.is_empty() => spec.ports.as_slice(),
        _ => ctx.default_ports,
    };
    let ports = if ctx.fast || ports.is_empty() {
        BTreeMap::new()
    } else {
        let _permit = ctx.limiters.port_hosts.acquire().await.ok();
        check_ports(platform, ip, ports, &ctx.limiters.tcp_connect, TCP_TIMEOUT).await
    };

    let ping = match ctx.pinged.get(&ip) {
        Some(&result) => result,
        None if ctx.fast => false,
        None => {
            let _permit = ctx.limiters.ping.acquire().await.ok();
            platform.ping(ip, ctx.ping_timeout_ms).await
        }
    };

    let is_host = ctx.identity.owns_ip(ip)
        || mac.as_deref().is_some_and(|m| ctx.identity.owns_mac(m));

    DiscoveredDevice {
        ip,
        name,
        known: known.is_some(),
        notes: known.map(|k| k.notes.clone()).unwrap_or_default(),
        up: ping || ports.values().any(|&open| open),
        ping,
        ports,
        connection_type: classify_connection(iface.as_deref(), ctx.os),
        iface,
        mac,
        is_host,
    }
}

/// Enrich every present candidate, in ascending IP order
pub async fn enrich_all<P: NetworkPlatform + ?Sized>(
    platform: &P,
    ctx: &EnrichContext<'_>,
    candidates: &CandidateSet,
) -> Vec<DiscoveredDevice> {
    let jobs = candidates.ips().into_iter().map(|ip| {
        let mac = candidates.mac(ip).map(String::from);
        let iface = candidates.iface(ip).map(String::from);
        async move {
            let _permit = ctx.limiters.enrich.acquire().await.ok();
            enrich_one(platform, ctx, ip, mac, iface).await
        }
    });
    join_all(jobs).await
}
