// =============================================================================
// Trading engine — main entry point
// =============================================================================
//
// Starts in Demo + Paused mode for safety; a user must explicitly switch to
// Live trading via a `UserSettingsChanged` command. Boot order: load config,
// build every shared collaborator once as an `Arc`, run `RecoveryCoordinator`
// to rehydrate sessions that were active before the last shutdown, then hand
// control to `MarketDataHub` and `SessionSupervisor` for the life of the
// process.
// =============================================================================

mod account_feed;
mod cache;
mod config;
mod credentials;
mod domain;
mod error;
mod eventbus;
mod exchange;
mod market_data;
mod notify;
mod recovery;
mod risk;
mod store;
mod strategy;
mod supervisor;
mod types;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cache::InMemorySnapshotCache;
use crate::config::RuntimeConfig;
use crate::credentials::EnvCredentialProvider;
use crate::eventbus::EventBus;
use crate::exchange::InstrumentCache;
use crate::market_data::MarketDataHub;
use crate::notify::LoggingNotifier;
use crate::recovery::RecoveryCoordinator;
use crate::store::InMemoryOrderStore;
use crate::supervisor::SessionSupervisor;
use crate::types::AccountMode;

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";
const ORDER_STORE_SNAPSHOT_PATH: &str = "order_store_snapshot.json";
const ORDER_STORE_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("trading engine starting up");

    let mut config = RuntimeConfig::load(RUNTIME_CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: always force Demo + Paused on startup. Users opt into Live
    // trading explicitly after the engine is up.
    config.account_mode = AccountMode::Demo;

    if let Ok(syms) = std::env::var("ENGINE_SYMBOLS") {
        let symbols: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !symbols.is_empty() {
            config.symbols = symbols;
        }
    }

    info!(
        symbols = ?config.symbols,
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        recoverable_sessions = config.active_user_ids.len(),
        "runtime config loaded"
    );

    // ── Shared collaborators, constructed once for the life of the process ──
    let bus = Arc::new(EventBus::new());
    let runtime_config = Arc::new(RwLock::new(config));
    let store = Arc::new(InMemoryOrderStore::new());
    if let Err(e) = store.load_snapshot(ORDER_STORE_SNAPSHOT_PATH) {
        warn!(error = %e, "no usable order store snapshot, starting with an empty store");
    }
    tokio::spawn(store.clone().run_periodic_snapshots(
        ORDER_STORE_SNAPSHOT_PATH.into(),
        ORDER_STORE_SNAPSHOT_INTERVAL,
    ));
    let cache = Arc::new(InMemorySnapshotCache::new());
    let notifier = Arc::new(LoggingNotifier);
    let credentials = Arc::new(EnvCredentialProvider);
    let instrument_ttl = Duration::from_secs(runtime_config.read().instrument_cache_ttl_secs);
    let instrument_cache = Arc::new(InstrumentCache::new(instrument_ttl));
    let market_data = MarketDataHub::new(bus.clone());

    tokio::spawn(market_data.clone().run());

    let supervisor = SessionSupervisor::new(
        bus.clone(),
        runtime_config.clone(),
        store.clone(),
        cache.clone(),
        notifier.clone(),
        credentials.clone(),
        instrument_cache.clone(),
        market_data.clone(),
    );
    tokio::spawn(supervisor.clone().run());

    let recovery = RecoveryCoordinator::new(bus.clone(), runtime_config.clone(), notifier.clone());
    recovery.run_once().await;

    info!("all subsystems running — press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    if let Err(e) = runtime_config.read().save(RUNTIME_CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }
    if let Err(e) = store.save_snapshot(ORDER_STORE_SNAPSHOT_PATH) {
        error!(error = %e, "failed to save order store snapshot on shutdown");
    }

    info!("trading engine shut down complete");
    Ok(())
}
