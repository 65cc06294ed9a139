//! Scripted platform for cycle-level tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::neighbors::NeighborEntry;
use crate::platform::{LocalInterface, NetworkPlatform, Os};
use crate::process::CommandOutput;

pub struct FakePlatform {
    pub os: Os,
    pub interfaces: Mutex<Vec<LocalInterface>>,
    pub gateway: Option<Ipv4Addr>,
    pub gateway_mac: Option<String>,
    pub neighbors: Mutex<Vec<NeighborEntry>>,
    /// Entries that land in the neighbor table once their IP is pinged
    pub learned_on_ping: Mutex<Vec<NeighborEntry>>,
    /// Hosts that answer ping
    pub alive: HashSet<Ipv4Addr>,
    pub open_ports: HashMap<Ipv4Addr, Vec<u16>>,
    /// Every TCP connect succeeds except to these hosts
    pub intercept_tcp_except: Option<HashSet<Ipv4Addr>>,
    pub neighbor_reads: AtomicUsize,
    pub tcp_hosts: Mutex<HashSet<Ipv4Addr>>,
}

impl FakePlatform {
    /// Host 192.168.1.20/24 on eth0 behind gateway 192.168.1.1
    pub fn home() -> Self {
        Self {
            os: Os::Linux,
            interfaces: Mutex::new(vec![LocalInterface {
                name: "eth0".into(),
                is_up: true,
                is_loopback: false,
                ipv4: vec!["192.168.1.20/24".parse().unwrap()],
                mac: Some("aa:bb:cc:00:00:20".into()),
            }]),
            gateway: Some(Ipv4Addr::new(192, 168, 1, 1)),
            gateway_mac: Some("00:00:5e:00:01:01".into()),
            neighbors: Mutex::new(vec![NeighborEntry::new(
                Ipv4Addr::new(192, 168, 1, 1),
                "00:00:5e:00:01:01",
            )
            .with_iface("eth0")]),
            learned_on_ping: Mutex::new(Vec::new()),
            alive: [Ipv4Addr::new(192, 168, 1, 1)].into_iter().collect(),
            open_ports: HashMap::new(),
            intercept_tcp_except: None,
            neighbor_reads: AtomicUsize::new(0),
            tcp_hosts: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_neighbor(&self, entry: NeighborEntry) {
        self.neighbors.lock().unwrap().push(entry);
    }

    pub fn set_neighbors(&self, entries: Vec<NeighborEntry>) {
        *self.neighbors.lock().unwrap() = entries;
    }

    pub fn set_interfaces(&self, interfaces: Vec<LocalInterface>) {
        *self.interfaces.lock().unwrap() = interfaces;
    }

    pub fn neighbor_reads(&self) -> usize {
        self.neighbor_reads.load(Ordering::SeqCst)
    }

    pub fn tcp_hosts(&self) -> HashSet<Ipv4Addr> {
        self.tcp_hosts.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkPlatform for FakePlatform {
    fn os(&self) -> Os {
        self.os
    }

    fn interfaces(&self) -> Vec<LocalInterface> {
        self.interfaces.lock().unwrap().clone()
    }

    fn hostname(&self) -> String {
        "test-host".to_string()
    }

    async fn run(&self, _argv: &[&str], _timeout: Duration) -> CommandOutput {
        CommandOutput::failed("not scripted")
    }

    async fn neighbors(&self) -> Vec<NeighborEntry> {
        self.neighbor_reads.fetch_add(1, Ordering::SeqCst);
        self.neighbors.lock().unwrap().clone()
    }

    async fn default_gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    async fn gateway_mac(&self, _gateway: Ipv4Addr) -> Option<String> {
        self.gateway_mac.clone()
    }

    async fn wifi_identity(&self) -> Option<String> {
        None
    }

    async fn ping(&self, host: Ipv4Addr, _timeout_ms: u64) -> bool {
        let mut pending = self.learned_on_ping.lock().unwrap();
        let (learned, rest): (Vec<NeighborEntry>, Vec<NeighborEntry>) =
            pending.drain(..).partition(|e| e.ip == host);
        *pending = rest;
        self.neighbors.lock().unwrap().extend(learned);
        self.alive.contains(&host)
    }

    async fn tcp_connect(&self, ip: Ipv4Addr, port: u16, _timeout: Duration) -> bool {
        self.tcp_hosts.lock().unwrap().insert(ip);
        if let Some(except) = &self.intercept_tcp_except {
            return !except.contains(&ip);
        }
        self.open_ports.get(&ip).is_some_and(|ports| ports.contains(&port))
    }

    async fn reverse_dns(&self, _ip: Ipv4Addr) -> Option<String> {
        None
    }
}
