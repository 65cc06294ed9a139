//! Configuration loading and validation
//!
//! Configuration problems never stop the daemon: a missing or unreadable
//! file falls back to defaults, and questionable values are reported as
//! warnings alongside the loaded config.

use anyhow::{Context, Result};
use netdash_core::{is_valid_mac, KnownDeviceSpec, SweepMode};
use netdash_discovery::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{info, warn};

/// Sweep bounds above this are allowed but flagged
const LARGE_SWEEP_WARNING: usize = 1024;

/// Display name for a device entry without one
const UNNAMED_DEVICE: &str = "Unnamed";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub discovery: DiscoverySettings,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the API server
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// `bounded_sweep` or `neighbors_only`
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_max_sweep_hosts")]
    pub max_sweep_hosts: usize,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Ports probed on devices that configure none
    #[serde(default = "default_ports")]
    pub default_ports: Vec<u16>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_sweep_hosts: default_max_sweep_hosts(),
            ping_timeout_ms: default_ping_timeout_ms(),
            default_ports: default_ports(),
        }
    }
}

fn default_mode() -> String {
    "bounded_sweep".to_string()
}

fn default_max_sweep_hosts() -> usize {
    256
}

fn default_ping_timeout_ms() -> u64 {
    900
}

fn default_ports() -> Vec<u16> {
    vec![22, 80, 443, 3389]
}

/// A known device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "match")]
    pub matcher: MatchConfig,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub notes: String,
}

/// How to recognize a known device; kept as strings so bad values become
/// warnings instead of parse errors
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchConfig {
    pub ip: Option<String>,
    pub mac: Option<String>,
}

impl MatchConfig {
    fn ip(&self) -> Option<Ipv4Addr> {
        self.ip.as_deref().and_then(|ip| ip.trim().parse().ok())
    }

    fn mac(&self) -> Option<&str> {
        self.mac.as_deref().filter(|mac| is_valid_mac(mac))
    }
}

/// A config plus everything questionable found while loading it
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: Config,
    pub warnings: Vec<String>,
}

impl Config {
    pub fn mode(&self) -> SweepMode {
        self.discovery.mode.parse().unwrap_or_default()
    }

    /// Known devices in declaration order
    pub fn known_devices(&self) -> Vec<KnownDeviceSpec> {
        self.devices
            .iter()
            .map(|d| {
                let name = match d.name.trim() {
                    "" => UNNAMED_DEVICE,
                    name => name,
                };
                let mut spec = KnownDeviceSpec::new(name)
                    .with_ports(d.ports.clone())
                    .with_notes(d.notes.clone());
                if let Some(ip) = d.matcher.ip() {
                    spec = spec.with_ip(ip);
                }
                if let Some(mac) = d.matcher.mac() {
                    spec = spec.with_mac(mac);
                }
                spec
            })
            .collect()
    }

    /// Convert to the discovery engine's settings
    pub fn to_discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            mode: self.mode(),
            max_sweep_hosts: self.discovery.max_sweep_hosts,
            ping_timeout_ms: self.discovery.ping_timeout_ms,
            default_ports: self.discovery.default_ports.clone(),
            known_devices: self.known_devices(),
        }
    }

    /// Informational problems with the loaded values
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.discovery.mode.parse::<SweepMode>() {
            warnings.push(format!("discovery.mode: {}, using bounded_sweep", e));
        }
        if self.discovery.max_sweep_hosts > LARGE_SWEEP_WARNING {
            warnings.push(format!(
                "discovery.max_sweep_hosts = {} is unusually large",
                self.discovery.max_sweep_hosts
            ));
        }

        for (i, device) in self.devices.iter().enumerate() {
            let label = if device.name.trim().is_empty() {
                format!("devices[{}]", i)
            } else {
                device.name.clone()
            };
            if device.name.trim().is_empty() {
                warnings.push(format!("{}: missing name", label));
            }
            if device.matcher.ip.is_none() && device.matcher.mac.is_none() {
                warnings.push(format!("{}: no match.ip or match.mac, it will never be seen", label));
            }
            if let Some(ip) = &device.matcher.ip {
                if device.matcher.ip().is_none() {
                    warnings.push(format!("{}: invalid match.ip '{}'", label, ip));
                }
            }
            if let Some(mac) = &device.matcher.mac {
                if device.matcher.mac().is_none() {
                    warnings.push(format!("{}: invalid match.mac '{}'", label, mac));
                }
            }
        }
        warnings
    }
}

/// Parse TOML, reporting sections that are absent from the file
pub fn parse_config(content: &str) -> Result<LoadedConfig> {
    let table: toml::Table = toml::from_str(content).context("Invalid TOML")?;
    let config: Config = toml::from_str(content).context("Invalid configuration")?;

    let mut warnings = Vec::new();
    if !table.contains_key("discovery") {
        warnings.push("No [discovery] section, using defaults".to_string());
    }
    if !table.contains_key("devices") {
        warnings.push("No [[devices]] configured".to_string());
    }
    warnings.extend(config.validate());
    Ok(LoadedConfig { config, warnings })
}

/// Load configuration from file, falling back to defaults on any error
pub fn load_config(path: &Path) -> LoadedConfig {
    if !path.exists() {
        info!(path = %path.display(), "Configuration file not found, using defaults");
        return LoadedConfig {
            config: Config::default(),
            warnings: vec![format!("Configuration file {} not found", path.display())],
        };
    }

    let loaded = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))
        .and_then(|content| parse_config(&content));

    match loaded {
        Ok(loaded) => {
            info!(
                path = %path.display(),
                devices = loaded.config.devices.len(),
                warnings = loaded.warnings.len(),
                "Loaded configuration"
            );
            loaded
        }
        Err(e) => {
            warn!(path = %path.display(), error = %format!("{:#}", e), "Configuration unusable, using defaults");
            LoadedConfig {
                config: Config::default(),
                warnings: vec![format!("{:#}", e)],
            }
        }
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Boolean environment flag (`1`, `true`, `yes`, `on`)
pub fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| is_truthy(&v)).unwrap_or(false)
}
