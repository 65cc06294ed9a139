//! netdash Discovery - Home network device discovery
//!
//! One discovery cycle runs these stages in order:
//! - Topology: local subnets, gateway, Wi-Fi identity, network fingerprint
//! - Neighbor table collection with seed pings and snapshot fallback
//! - Candidate building: bounded ping sweep, proxy-ARP and transparent-proxy filtering
//! - Enrichment: names, liveness, open ports, connection type
//! - Grouping against the configured known devices
//!
//! [`DiscoveryService`] serializes cycles, caches results per network, and
//! runs rate-limited background refreshes.

pub mod cache;
pub mod candidates;
pub mod engine;
pub mod enrich;
pub mod grouping;
pub mod neighbors;
pub mod platform;
pub mod probe;
pub mod process;
pub mod topology;

#[cfg(test)]
mod testing;

pub use candidates::HeuristicThresholds;
pub use engine::{
    DiscoveryConfig, DiscoveryError, DiscoveryService, ServiceOptions, DEFAULT_KICK_WINDOW,
};
pub use neighbors::{NeighborEntry, NeighborState};
pub use platform::{NetworkPlatform, Os, SystemPlatform};
pub use probe::ConcurrencyLimits;
