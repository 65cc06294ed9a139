//! Network identity fingerprint
//!
//! The fingerprint is a SHA256 over a canonical JSON rendering of the
//! current network identity: active subnets, interface addresses, the
//! gateway and its MAC, and the Wi-Fi identity. Any change means the host
//! has moved to a different network and every cached discovery artifact is
//! stale.

use serde::{Deserialize, Serialize};

/// Raw inputs hashed into a [`NetworkFingerprint`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintInputs {
    /// Active non-tunnel subnets in CIDR notation
    pub nets: Vec<String>,
    /// `iface:ip/prefix` pairs of active non-tunnel interfaces
    pub addrs: Vec<String>,
    pub gateway: String,
    pub gateway_mac: String,
    pub wifi: String,
}

/// Opaque hash identifying the network the host is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkFingerprint(pub String);

impl NetworkFingerprint {
    /// Hash the inputs; list order does not matter
    pub fn compute(inputs: &FingerprintInputs) -> Self {
        let mut canonical = inputs.clone();
        canonical.nets.sort();
        canonical.addrs.sort();
        let payload = serde_json::to_string(&canonical).unwrap_or_default();
        Self(sha256_hex(payload.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NetworkFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute SHA256 hash of data and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}
