//! Device types for observed hosts and the logical devices shown on the dashboard

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::known::{is_overlay_ip, KnownDeviceSpec};

/// How a host is attached to the network, guessed from its interface name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    Wired,
    Wireless,
}

/// Which network an interface address lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// Ordinary LAN address
    Local,
    /// Mesh-VPN overlay address
    Overlay,
}

impl InterfaceKind {
    pub fn for_ip(ip: Ipv4Addr) -> Self {
        if is_overlay_ip(ip) {
            Self::Overlay
        } else {
            Self::Local
        }
    }
}

/// Enrichment result for a single IP seen during a discovery cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub ip: Ipv4Addr,
    /// Display name (gateway label, known-device name, reverse DNS name, or the raw IP)
    pub name: String,
    pub mac: Option<String>,
    /// Matched a configured device
    pub known: bool,
    pub notes: String,
    /// Answered an ICMP echo
    pub ping: bool,
    /// Port probe results
    pub ports: BTreeMap<u16, bool>,
    /// Answered ping or has any open port
    pub up: bool,
    /// Local interface the neighbor entry was learned on
    pub iface: Option<String>,
    pub connection_type: ConnectionType,
    /// Address belongs to the machine running discovery
    pub is_host: bool,
}

/// One network address of a logical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub ip: Ipv4Addr,
    pub mac: Option<String>,
    pub ping: bool,
    pub ports: BTreeMap<u16, bool>,
    pub up: bool,
    /// Configured but never observed this cycle
    pub missing: bool,
    #[serde(rename = "type")]
    pub kind: InterfaceKind,
    /// Name the interface was configured or observed under, before normalization
    pub original_name: String,
    pub connection_type: ConnectionType,
    pub iface: Option<String>,
}

impl Interface {
    /// Placeholder for an IP taken from configuration.
    ///
    /// Addresses owned by the running machine are reachable by definition and
    /// start out up; everything else is missing until observed.
    pub fn configured(spec: &KnownDeviceSpec, ip: Ipv4Addr, host_owned: bool) -> Self {
        Self {
            ip,
            mac: spec.match_mac.clone(),
            ping: host_owned,
            ports: spec.ports.iter().map(|&p| (p, false)).collect(),
            up: host_owned,
            missing: !host_owned,
            kind: InterfaceKind::for_ip(ip),
            original_name: spec.name.clone(),
            connection_type: ConnectionType::Wired,
            iface: None,
        }
    }

    /// Interface record for a host seen on the network
    pub fn observed(device: &DiscoveredDevice) -> Self {
        Self {
            ip: device.ip,
            mac: device.mac.clone(),
            ping: device.ping,
            ports: device.ports.clone(),
            up: device.up,
            missing: false,
            kind: InterfaceKind::for_ip(device.ip),
            original_name: device.name.clone(),
            connection_type: device.connection_type,
            iface: device.iface.clone(),
        }
    }
}

/// A logical device aggregating every interface believed to belong to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    /// Canonical (base) name
    pub name: String,
    pub mac: Option<String>,
    /// Declared in configuration
    pub known: bool,
    pub notes: String,
    /// Any interface is up
    pub up: bool,
    /// No interface has been observed
    pub missing: bool,
    /// This is the machine running discovery
    pub is_host: bool,
    /// Any interface is on the mesh-VPN overlay
    pub has_overlay: bool,
    pub interfaces: Vec<Interface>,
}

impl DeviceGroup {
    /// Empty group for a configured device, missing until an interface shows up
    pub fn known(name: impl Into<String>, mac: Option<String>, notes: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mac,
            known: true,
            notes: notes.into(),
            up: false,
            missing: true,
            is_host: false,
            has_overlay: false,
            interfaces: Vec::new(),
        }
    }

    /// Empty group for a host that matched no configured device
    pub fn synthetic(name: impl Into<String>, mac: Option<String>) -> Self {
        Self {
            known: false,
            ..Self::known(name, mac, "")
        }
    }

    /// Recompute the fields that are derived from the interface list
    fn refresh(&mut self) {
        self.up = self.interfaces.iter().any(|i| i.up);
        self.missing = self.interfaces.iter().all(|i| i.missing);
        self.has_overlay = self
            .interfaces
            .iter()
            .any(|i| i.kind == InterfaceKind::Overlay);
    }

    fn fill_mac(&mut self, mac: Option<&String>) {
        if self.mac.is_none() {
            self.mac = mac.cloned();
        }
    }

    fn fill_notes(&mut self, notes: &str) {
        if self.notes.is_empty() && !notes.is_empty() {
            self.notes = notes.to_string();
        }
    }

    pub fn interface(&self, ip: Ipv4Addr) -> Option<&Interface> {
        self.interfaces.iter().find(|i| i.ip == ip)
    }

    pub fn interface_mut(&mut self, ip: Ipv4Addr) -> Option<&mut Interface> {
        self.interfaces.iter_mut().find(|i| i.ip == ip)
    }

    /// Insert an interface, replacing any existing one with the same IP
    pub fn upsert_interface(&mut self, interface: Interface) {
        match self.interface_mut(interface.ip) {
            Some(existing) => *existing = interface,
            None => self.interfaces.push(interface),
        }
        self.refresh();
    }

    /// Update a single interface in place and re-derive group state
    pub fn update_interface(&mut self, ip: Ipv4Addr, update: impl FnOnce(&mut Interface)) {
        if let Some(interface) = self.interface_mut(ip) {
            update(interface);
        }
        self.refresh();
    }

    /// Fold an observed host into this group
    pub fn absorb(&mut self, device: &DiscoveredDevice) {
        self.known |= device.known;
        self.is_host |= device.is_host;
        self.fill_mac(device.mac.as_ref());
        self.fill_notes(&device.notes);
        self.upsert_interface(Interface::observed(device));
    }

    /// Merge another group into this one.
    ///
    /// Flags are OR-ed, scalars keep the first non-empty value, and interfaces
    /// are unioned by IP with this group's entry winning on collision.
    pub fn merge(&mut self, other: DeviceGroup) {
        self.known |= other.known;
        self.is_host |= other.is_host;
        self.fill_mac(other.mac.as_ref());
        self.fill_notes(&other.notes);
        for interface in other.interfaces {
            if self.interface(interface.ip).is_none() {
                self.interfaces.push(interface);
            }
        }
        self.refresh();
    }
}
