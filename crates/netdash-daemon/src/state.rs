//! Application state management

use netdash_discovery::{DiscoveryConfig, DiscoveryService};
use std::sync::Arc;

use crate::config::LoadedConfig;

/// Shared application state
pub struct AppState {
    /// Discovery engine with its cache
    pub service: Arc<DiscoveryService>,
    /// Discovery settings derived from the config file
    pub discovery: DiscoveryConfig,
    /// Problems found while loading configuration
    pub config_warnings: Vec<String>,
    pub hostname: String,
}

impl AppState {
    pub fn new(service: Arc<DiscoveryService>, loaded: &LoadedConfig) -> Arc<Self> {
        let hostname = service.platform().hostname();
        Arc::new(Self {
            discovery: loaded.config.to_discovery_config(),
            config_warnings: loaded.warnings.clone(),
            hostname,
            service,
        })
    }

    pub fn cache_enabled(&self) -> bool {
        self.service.options().cache_enabled
    }

    pub fn neighbor_snapshot_enabled(&self) -> bool {
        self.service.options().neighbor_snapshot_enabled
    }
}
