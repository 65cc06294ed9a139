//! netdash daemon - Main entry point
//!
//! Loads the known-device configuration and serves the status API, or runs
//! a single discovery and prints it.

mod api;
mod config;
mod server;
mod state;

use anyhow::Result;
use clap::Parser;
use netdash_discovery::{ConcurrencyLimits, DiscoveryService, Os, ServiceOptions, SystemPlatform};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "netdash")]
#[command(about = "Home network device discovery daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "netdash.toml")]
    config: PathBuf,

    /// Bind address for the API server
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Disable discovery result caching
    #[arg(long)]
    no_cache: bool,

    /// Run a single discovery, print it as JSON and exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("netdash v{}", env!("CARGO_PKG_VERSION"));

    let mut loaded = config::load_config(&args.config);
    if let Some(bind) = args.bind {
        loaded.config.daemon.bind = bind;
    }
    for warning in &loaded.warnings {
        warn!(warning = %warning, "Configuration");
    }

    let os = Os::current();
    let options = ServiceOptions {
        cache_enabled: !(args.no_cache || config::env_flag("NETDASH_DISABLE_CACHE")),
        neighbor_snapshot_enabled: !config::env_flag("NETDASH_DISABLE_NEIGHBOR_SNAPSHOT"),
        limits: ConcurrencyLimits::from_env(os),
        ..ServiceOptions::default()
    };
    info!(
        mode = ?loaded.config.mode(),
        known = loaded.config.devices.len(),
        cache = options.cache_enabled,
        snapshot = options.neighbor_snapshot_enabled,
        "Discovery configured"
    );

    let service = Arc::new(DiscoveryService::new(Arc::new(SystemPlatform::new()), options));
    let state = state::AppState::new(service, &loaded);

    if args.scan_once {
        info!("Running single discovery");
        let result = state.service.discover(state.discovery.clone(), true, false).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        server::run(state, &loaded.config.daemon.bind).await?;
    }

    Ok(())
}
