//! Discovery result cache and neighbor snapshot
//!
//! One slot per service. Everything in it is keyed to the network
//! fingerprint: a fingerprint change clears the slot before anything else
//! reads it.

use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

use crate::neighbors::NeighborEntry;
use netdash_core::{DiscoveryResult, NetworkFingerprint};

/// How long a completed result is reused verbatim
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Oldest neighbor snapshot that may stand in for an empty table
pub const DEFAULT_SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct CachedResult {
    result: DiscoveryResult,
    stored_at: Instant,
    fingerprint: NetworkFingerprint,
}

#[derive(Debug, Clone)]
struct NeighborSnapshot {
    entries: Vec<NeighborEntry>,
    taken_at: Instant,
    fingerprint: NetworkFingerprint,
}

#[derive(Debug, Default)]
struct CacheSlot {
    result: Option<CachedResult>,
    snapshot: Option<NeighborSnapshot>,
    last_completed: Option<Instant>,
    fingerprint: Option<NetworkFingerprint>,
}

#[derive(Debug)]
pub struct DiscoveryCache {
    slot: RwLock<CacheSlot>,
    ttl: Duration,
    snapshot_max_age: Duration,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration, snapshot_max_age: Duration) -> Self {
        Self {
            slot: RwLock::new(CacheSlot::default()),
            ttl,
            snapshot_max_age,
        }
    }

    /// Record the current fingerprint; on change, invalidate everything
    /// stored for the old one. Returns true if it changed.
    pub async fn observe_fingerprint(&self, fingerprint: &NetworkFingerprint) -> bool {
        let previous = self.slot.write().await.fingerprint.replace(fingerprint.clone());
        let changed = previous.is_some_and(|fp| &fp != fingerprint);
        if changed {
            info!("Network fingerprint changed, clearing discovery cache");
            self.invalidate().await;
        }
        changed
    }

    /// Drop the stored result, the neighbor snapshot and the rate-limit timer
    pub async fn invalidate(&self) {
        let mut slot = self.slot.write().await;
        slot.result = None;
        slot.snapshot = None;
        slot.last_completed = None;
    }

    /// Result stored within the TTL under the same fingerprint
    pub async fn get(&self, fingerprint: &NetworkFingerprint) -> Option<DiscoveryResult> {
        let slot = self.slot.read().await;
        slot.result
            .as_ref()
            .filter(|c| &c.fingerprint == fingerprint && c.stored_at.elapsed() < self.ttl)
            .map(|c| c.result.clone())
    }

    /// Last stored result regardless of age
    pub async fn latest(&self) -> Option<DiscoveryResult> {
        self.slot.read().await.result.as_ref().map(|c| c.result.clone())
    }

    pub async fn put(&self, result: DiscoveryResult, fingerprint: NetworkFingerprint) {
        let mut slot = self.slot.write().await;
        slot.result = Some(CachedResult {
            result,
            stored_at: Instant::now(),
            fingerprint,
        });
    }

    /// Neighbor snapshot usable for `fingerprint`, if young enough
    pub async fn snapshot(&self, fingerprint: &NetworkFingerprint) -> Option<Vec<NeighborEntry>> {
        let slot = self.slot.read().await;
        slot.snapshot
            .as_ref()
            .filter(|s| &s.fingerprint == fingerprint && s.taken_at.elapsed() < self.snapshot_max_age)
            .map(|s| s.entries.clone())
    }

    pub async fn store_snapshot(&self, entries: Vec<NeighborEntry>, fingerprint: NetworkFingerprint) {
        if entries.is_empty() {
            return;
        }
        let mut slot = self.slot.write().await;
        slot.snapshot = Some(NeighborSnapshot {
            entries,
            taken_at: Instant::now(),
            fingerprint,
        });
    }

    pub async fn mark_completed(&self) {
        self.slot.write().await.last_completed = Some(Instant::now());
    }

    /// A cycle completed less than `window` ago
    pub async fn rate_limited(&self, window: Duration) -> bool {
        self.slot
            .read()
            .await
            .last_completed
            .is_some_and(|t| t.elapsed() < window)
    }
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_SNAPSHOT_MAX_AGE)
    }
}
