//! netdash Core - Data model for home network discovery
//!
//! This crate provides the foundational types for the netdash system:
//! - Known-device declarations and the rules for matching hosts to them
//! - Discovered devices, interfaces, and logical device groups
//! - MAC and device-name normalization
//! - Network fingerprinting and the discovery result

pub mod device;
pub mod fingerprint;
pub mod known;
pub mod mac;
pub mod naming;
pub mod result;

pub use device::{ConnectionType, DeviceGroup, DiscoveredDevice, Interface, InterfaceKind};
pub use fingerprint::{sha256_hex, FingerprintInputs, NetworkFingerprint};
pub use known::{is_overlay_ip, match_known, KnownDeviceSpec};
pub use mac::{is_valid_mac, is_zero_mac, normalize_mac};
pub use naming::{base_name, is_dotted_quad};
pub use result::{DiscoveryMeta, DiscoveryResult, NeighborSource, SweepMode};
