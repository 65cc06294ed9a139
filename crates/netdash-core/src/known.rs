//! User-configured known devices and how observed hosts are matched to them

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::mac::normalize_mac;

/// A device declared in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDeviceSpec {
    /// Display name as configured
    pub name: String,
    /// IP address to match, if any
    pub match_ip: Option<Ipv4Addr>,
    /// MAC address to match (normalized lowercase colon-hex), if any
    pub match_mac: Option<String>,
    /// Ports to probe for this device
    pub ports: Vec<u16>,
    /// Free-form notes shown on the dashboard
    pub notes: String,
}

impl KnownDeviceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            match_ip: None,
            match_mac: None,
            ports: Vec::new(),
            notes: String::new(),
        }
    }

    pub fn with_ip(mut self, ip: Ipv4Addr) -> Self {
        self.match_ip = Some(ip);
        self
    }

    /// Set the MAC to match; the value is normalized
    pub fn with_mac(mut self, mac: &str) -> Self {
        self.match_mac = Some(normalize_mac(mac));
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

/// Find the configured device an observed host belongs to.
///
/// Any IP match outranks any MAC match; within each kind the first device in
/// declaration order wins.
pub fn match_known<'a>(
    known: &'a [KnownDeviceSpec],
    ip: Ipv4Addr,
    mac: Option<&str>,
) -> Option<&'a KnownDeviceSpec> {
    if let Some(found) = known.iter().find(|k| k.match_ip == Some(ip)) {
        return Some(found);
    }
    let mac = normalize_mac(mac?);
    known.iter().find(|k| {
        k.match_mac
            .as_deref()
            .is_some_and(|expected| normalize_mac(expected) == mac)
    })
}

/// True for addresses handed out by the mesh-VPN overlay
pub fn is_overlay_ip(ip: Ipv4Addr) -> bool {
    ip.octets()[0] == 100
}
