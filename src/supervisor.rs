// =============================================================================
// SessionSupervisor — per-user session lifecycle
// =============================================================================
//
// Owns the set of live `StrategyInstance`s and `AccountFeed`s for every user
// currently trading, and the per-user `RiskEngine`. Reacts to lifecycle
// events on the bus rather than being driven directly by callers, the same
// shape the teacher's `app_state.rs` + `main.rs` wire components together
// with, generalized from "one global set of subsystems" to "one set per
// user session".
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::account_feed::AccountFeed;
use crate::cache::SnapshotCache;
use crate::config::RuntimeConfig;
use crate::credentials::CredentialProvider;
use crate::domain::StrategyConfig;
use crate::eventbus::{Event, EventBus};
use crate::exchange::{ExchangeClient, InstrumentCache};
use crate::market_data::MarketDataHub;
use crate::notify::{notify_fire_and_forget, Notifier, ParseMode};
use crate::risk::RiskEngine;
use crate::store::OrderStore;
use crate::strategy::{NeverSignalAnalyzer, PassthroughSpikeDetector, SignalAnalyzer, SpikeDetector, StrategyInstance, StrategyInstanceDeps};
use crate::types::{AccountMode, AccountPriority, StrategyType};

fn rest_base_url(mode: AccountMode) -> &'static str {
    match mode {
        AccountMode::Demo => "https://api-demo.bybit.com",
        AccountMode::Live => "https://api.bybit.com",
    }
}

fn private_stream_url(mode: AccountMode) -> &'static str {
    match mode {
        AccountMode::Demo => "wss://stream-demo.bybit.com/v5/private",
        AccountMode::Live => "wss://stream.bybit.com/v5/private",
    }
}

/// Settings whose change reshapes a session's risk breakers or the set of
/// accounts/symbols it spans — these require tearing the session down and
/// rebuilding it rather than a live config push, per the risk/global split.
fn is_critical_setting(key: &str) -> bool {
    matches!(
        key,
        "trading_mode"
            | "account_mode"
            | "symbols"
            | "max_accounts_per_user"
            | "max_daily_loss_pct"
            | "max_consecutive_losses"
            | "max_drawdown_pct"
            | "max_daily_trades"
    )
}

/// Everything spawned for one user's active trading session.
struct UserSession {
    risk: Arc<RiskEngine>,
    instances: HashMap<(String, AccountPriority), Arc<StrategyInstance>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SessionSupervisor {
    bus: Arc<EventBus>,
    runtime_config: Arc<SyncRwLock<RuntimeConfig>>,
    store: Arc<dyn OrderStore>,
    cache: Arc<dyn SnapshotCache>,
    notifier: Arc<dyn Notifier>,
    credentials: Arc<dyn CredentialProvider>,
    instrument_cache: Arc<InstrumentCache>,
    market_data: Arc<MarketDataHub>,
    signal_analyzer: Arc<dyn SignalAnalyzer>,
    spike_detector: Arc<dyn SpikeDetector>,
    sessions: AsyncMutex<HashMap<i64, UserSession>>,
    /// Per-user strategy tunables, authoritative source for what a session's
    /// instances are built and updated with. Not part of `RuntimeConfig`
    /// since it varies per user rather than process-wide.
    user_strategy_configs: SyncRwLock<HashMap<i64, StrategyConfig>>,
}

impl SessionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<EventBus>,
        runtime_config: Arc<SyncRwLock<RuntimeConfig>>,
        store: Arc<dyn OrderStore>,
        cache: Arc<dyn SnapshotCache>,
        notifier: Arc<dyn Notifier>,
        credentials: Arc<dyn CredentialProvider>,
        instrument_cache: Arc<InstrumentCache>,
        market_data: Arc<MarketDataHub>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            runtime_config,
            store,
            cache,
            notifier,
            credentials,
            instrument_cache,
            market_data,
            signal_analyzer: Arc::new(NeverSignalAnalyzer),
            spike_detector: Arc::new(PassthroughSpikeDetector::default()),
            sessions: AsyncMutex::new(HashMap::new()),
            user_strategy_configs: SyncRwLock::new(HashMap::new()),
        })
    }

    /// Record a user's edited strategy configuration and notify the bus.
    /// Critical keys (risk, global) restart the session on receipt of the
    /// resulting event; everything else is pushed straight into the running
    /// instances without interrupting an open position.
    pub async fn update_user_strategy_config(&self, user_id: i64, cfg: StrategyConfig, changed_keys: Vec<String>) {
        self.user_strategy_configs.write().insert(user_id, cfg);
        self.bus.publish(Event::UserSettingsChanged { user_id, changed_keys });
    }

    /// Consume lifecycle events forever. Run as its own task from `main`.
    #[instrument(skip(self), name = "session_supervisor_run")]
    pub async fn run(self: Arc<Self>) {
        let (mut rx, _handle) = self.bus.subscribe(None);
        while let Some(event) = rx.recv().await {
            match event {
                Event::UserSessionStartRequested { user_id } => self.start_session(user_id).await,
                Event::UserSessionStopRequested { user_id, reason } => self.stop_session(user_id, &reason).await,
                Event::RiskLimitExceeded { user_id, limit_type, .. } => self.handle_risk_limit_exceeded(user_id, &limit_type).await,
                Event::UserSettingsChanged { user_id, changed_keys } => self.handle_settings_changed(user_id, changed_keys).await,
                _ => {}
            }
        }
    }

    #[instrument(skip(self), fields(user_id))]
    async fn start_session(self: &Arc<Self>, user_id: i64) {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&user_id) {
            warn!(user_id, "session start requested but a session is already running");
            return;
        }

        let rc = self.runtime_config.read().clone();

        // Primary (account_priority 1) credentials double as the source for
        // starting capital: the percentage-based risk breakers need a real
        // equity figure, not a guess, so this is built before the RiskEngine
        // rather than inside the per-account loop below.
        let primary_creds = self.credentials.get_api_keys(user_id, 1).await.ok();
        let primary_client = primary_creds
            .as_ref()
            .map(|c| Arc::new(ExchangeClient::new(c.api_key.clone(), c.api_secret.clone(), rest_base_url(rc.account_mode))));

        let starting_capital = match &primary_client {
            Some(client) => match client.get_wallet_balance().await {
                Ok(balance) => balance.equity,
                Err(e) => {
                    warn!(user_id, error = %e, "wallet balance fetch failed — falling back to placeholder starting capital");
                    rust_decimal::Decimal::from(10_000)
                }
            },
            None => rust_decimal::Decimal::from(10_000),
        };

        let risk = Arc::new(RiskEngine::new(
            starting_capital,
            rust_decimal::Decimal::try_from(rc.max_daily_loss_pct / 100.0).unwrap_or_default(),
            rc.max_consecutive_losses,
            rust_decimal::Decimal::try_from(rc.max_drawdown_pct / 100.0).unwrap_or_default(),
            rc.max_daily_trades,
        ));

        let mut session = UserSession {
            risk: risk.clone(),
            instances: HashMap::new(),
            tasks: Vec::new(),
        };

        for account_priority in 1..=rc.max_accounts_per_user {
            let client = if account_priority == 1 {
                match &primary_client {
                    Some(c) => c.clone(),
                    None => {
                        warn!(user_id, account_priority, "no credentials for account slot — skipping");
                        continue;
                    }
                }
            } else {
                let creds = match self.credentials.get_api_keys(user_id, account_priority).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(user_id, account_priority, error = %e, "no credentials for account slot — skipping");
                        continue;
                    }
                };
                Arc::new(ExchangeClient::new(creds.api_key, creds.api_secret, rest_base_url(rc.account_mode)))
            };

            let account_feed = AccountFeed::new(
                user_id,
                account_priority,
                client.clone(),
                self.store.clone(),
                self.bus.clone(),
                private_stream_url(rc.account_mode),
            );
            session.tasks.push(tokio::spawn(account_feed.run()));

            for symbol in &rc.symbols {
                let deps = StrategyInstanceDeps {
                    user_id,
                    symbol: symbol.clone(),
                    account_priority,
                    strategy_type: StrategyType::SignalScalper,
                    client: client.clone(),
                    store: self.store.clone(),
                    bus: self.bus.clone(),
                    instrument_cache: self.instrument_cache.clone(),
                    risk: risk.clone(),
                    cache: self.cache.clone(),
                    notifier: self.notifier.clone(),
                    signal_analyzer: self.signal_analyzer.clone(),
                    spike_detector: self.spike_detector.clone(),
                    runtime_config: self.runtime_config.clone(),
                    strategy_config: self.user_strategy_configs.read().get(&user_id).cloned().unwrap_or_default(),
                };
                let instance = StrategyInstance::new(deps);
                self.market_data.subscribe(symbol, user_id).await;
                let (instance_rx, _sub_handle) = self.bus.subscribe(Some(user_id));
                session.tasks.push(tokio::spawn(instance.clone().run(instance_rx)));
                session.instances.insert((symbol.clone(), account_priority), instance);
            }
        }

        info!(user_id, instances = session.instances.len(), "user session started");
        notify_fire_and_forget(self.notifier.clone(), user_id, "Trading session started".to_string(), ParseMode::PlainText);
        sessions.insert(user_id, session);

        let mut rc = self.runtime_config.write();
        if !rc.active_user_ids.contains(&user_id) {
            rc.active_user_ids.push(user_id);
        }
    }

    #[instrument(skip(self))]
    async fn stop_session(&self, user_id: i64, reason: &str) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(&user_id) else {
            warn!(user_id, "session stop requested but no session is running");
            return;
        };
        for instance in session.instances.values() {
            instance.request_stop();
        }
        info!(user_id, reason, "session stop requested — instances will exit once any open position closes");
        notify_fire_and_forget(
            self.notifier.clone(),
            user_id,
            format!("Trading session stopping: {reason}"),
            ParseMode::PlainText,
        );
        // Account feeds and fully-stopped instance tasks are left running
        // until their own loops observe the stop; the session entry is
        // removed so a subsequent start doesn't see a stale "already
        // running" guard. Outstanding task handles are intentionally
        // dropped rather than aborted — aborting mid-close could interrupt
        // an in-flight order submission.
        sessions.remove(&user_id);
        self.runtime_config.write().active_user_ids.retain(|id| *id != user_id);
    }

    /// Critical settings (risk, global) restart the session so the
    /// `RiskEngine` and account/symbol set rebuild from scratch; everything
    /// else is pushed directly into the already-running instances.
    #[instrument(skip(self, changed_keys))]
    async fn handle_settings_changed(self: &Arc<Self>, user_id: i64, changed_keys: Vec<String>) {
        if changed_keys.iter().any(|k| is_critical_setting(k)) {
            info!(user_id, ?changed_keys, "critical setting changed — restarting session");
            if self.sessions.lock().await.contains_key(&user_id) {
                self.stop_session(user_id, "critical settings change").await;
                self.start_session(user_id).await;
            }
            return;
        }

        let Some(cfg) = self.user_strategy_configs.read().get(&user_id).cloned() else {
            return;
        };
        let sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&user_id) {
            for instance in session.instances.values() {
                instance.update_strategy_config(cfg.clone());
            }
            info!(user_id, ?changed_keys, instances = session.instances.len(), "non-critical setting change pushed to running instances");
        }
    }

    async fn handle_risk_limit_exceeded(&self, user_id: i64, limit_type: &str) {
        let sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&user_id) {
            session.risk.kill();
        }
        error!(user_id, limit_type, "risk limit exceeded — kill switch activated for user");
        notify_fire_and_forget(
            self.notifier.clone(),
            user_id,
            format!("Risk limit exceeded ({limit_type}) — trading halted"),
            ParseMode::PlainText,
        );
    }
}
