// =============================================================================
// StrategyInstance — the per-(user, symbol, account) trading state machine
// =============================================================================
//
// One instance owns exactly one (user_id, symbol, account_priority, strategy_type)
// slot. All position mutation happens under `state`, a single non-reentrant
// async mutex; helper methods that run while the lock is already held take
// `&mut InstanceState` rather than re-locking.
//
// Order submission follows a create-pending-before-submit protocol
// (`OrderStore::create_order_pending` before the exchange call) so a crash
// between "sent to exchange" and "recorded locally" never produces an order
// this engine doesn't know about. Because Bybit's private stream's `order`
// topic is not trusted for fill detection (see `account_feed.rs`), every
// submission spawns a short-lived polling task that confirms the fill via
// REST and republishes it onto the event bus as `Event::OrderFilled`.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{strategy_snapshot_key, SnapshotCache, STRATEGY_SNAPSHOT_TTL};
use crate::config::RuntimeConfig;
use crate::domain::{generate_client_order_id, PositionState, StrategyConfig, Trade};
use crate::error::StrategyError;
use crate::eventbus::{Event, EventBus};
use crate::exchange::{ExchangeClient, InstrumentCache};
use crate::notify::{notify_fire_and_forget, Notifier, ParseMode};
use crate::risk::RiskEngine;
use crate::store::{NewOrder, OrderStore};
use crate::strategy::signal::{Signal, SignalAnalyzer, SpikeDetector};
use crate::strategy::snapshot::StrategySnapshot;
use crate::types::{AccountPriority, Direction, OrderPurpose, OrderStatus, OrderType, Side, StrategyType};

/// Six fractions of notional defining the trailing-exit ladder. Level 1 is
/// the activation gate; the rest describe how the ladder would tighten at
/// higher profit levels for a future implementation — today's exit rule
/// triggers once peak unrealized PnL clears level 1 and then drops back
/// more than 20% off its own peak.
const TRAILING_LEVELS_PCT: [Decimal; 6] = [
    Decimal::from_parts(20, 0, 0, false, 2),
    Decimal::from_parts(35, 0, 0, false, 2),
    Decimal::from_parts(70, 0, 0, false, 2),
    Decimal::from_parts(115, 0, 0, false, 2),
    Decimal::from_parts(155, 0, 0, false, 2),
    Decimal::from_parts(225, 0, 0, false, 2),
];
const TRAILING_DRAWDOWN_FRACTION: Decimal = Decimal::from_parts(20, 0, 0, false, 2);
const FILL_POLL_ATTEMPTS: u32 = 3;
const FILL_POLL_SPACING: Duration = Duration::from_millis(300);

/// Mutable position/signal state, exclusively owned behind `StrategyInstance::state`.
#[derive(Debug, Default)]
pub struct InstanceState {
    pub position: PositionState,
    pub last_signal: Option<Signal>,
    pub confirmation_count: u32,
    pub post_reversal: bool,
    pub consecutive_holds: u32,
    /// Exchange order id of an order this instance is waiting to see filled
    /// or rejected/cancelled. While set, new entry/averaging/exit decisions
    /// are suppressed to keep the exactly-once protocol from double-firing.
    pub awaiting_order: Option<String>,
    /// Set when `create_trade` reports a store integrity violation after an
    /// entry fill already happened on the exchange. New entries are refused
    /// until `clear_defensive_hold` is called after manual inspection.
    pub defensive_hold: bool,
}

/// Dependencies collected at construction; grouped into one struct because
/// `StrategyInstance` sits at the intersection of every other subsystem.
pub struct StrategyInstanceDeps {
    pub user_id: i64,
    pub symbol: String,
    pub account_priority: AccountPriority,
    pub strategy_type: StrategyType,
    pub client: Arc<ExchangeClient>,
    pub store: Arc<dyn OrderStore>,
    pub bus: Arc<EventBus>,
    pub instrument_cache: Arc<InstrumentCache>,
    pub risk: Arc<RiskEngine>,
    pub cache: Arc<dyn SnapshotCache>,
    pub notifier: Arc<dyn Notifier>,
    pub signal_analyzer: Arc<dyn SignalAnalyzer>,
    pub spike_detector: Arc<dyn SpikeDetector>,
    pub runtime_config: Arc<SyncRwLock<RuntimeConfig>>,
    pub strategy_config: StrategyConfig,
}

pub struct StrategyInstance {
    user_id: i64,
    symbol: String,
    account_priority: AccountPriority,
    strategy_type: StrategyType,
    client: Arc<ExchangeClient>,
    store: Arc<dyn OrderStore>,
    bus: Arc<EventBus>,
    instrument_cache: Arc<InstrumentCache>,
    risk: Arc<RiskEngine>,
    cache: Arc<dyn SnapshotCache>,
    notifier: Arc<dyn Notifier>,
    signal_analyzer: Arc<dyn SignalAnalyzer>,
    spike_detector: Arc<dyn SpikeDetector>,
    runtime_config: Arc<SyncRwLock<RuntimeConfig>>,
    strategy_config: SyncRwLock<StrategyConfig>,
    state: AsyncMutex<InstanceState>,
    /// Set by `request_stop`. A stop with an active position is deferred:
    /// the instance keeps running until the position closes on its own,
    /// then exits its event loop on the next iteration.
    stop_requested: AtomicBool,
}

impl StrategyInstance {
    pub fn new(deps: StrategyInstanceDeps) -> Arc<Self> {
        Arc::new(Self {
            user_id: deps.user_id,
            symbol: deps.symbol,
            account_priority: deps.account_priority,
            strategy_type: deps.strategy_type,
            client: deps.client,
            store: deps.store,
            bus: deps.bus,
            instrument_cache: deps.instrument_cache,
            risk: deps.risk,
            cache: deps.cache,
            notifier: deps.notifier,
            signal_analyzer: deps.signal_analyzer,
            spike_detector: deps.spike_detector,
            runtime_config: deps.runtime_config,
            strategy_config: SyncRwLock::new(deps.strategy_config),
            state: AsyncMutex::new(InstanceState::default()),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Push a freshly edited config in from `SessionSupervisor` when a user
    /// changes their settings. The bus-carried `UserSettingsChanged` event
    /// only names which keys changed, not their values — the supervisor is
    /// expected to call this before (or instead of relying on) that event.
    pub fn update_strategy_config(&self, cfg: StrategyConfig) {
        *self.strategy_config.write() = cfg;
    }

    /// Resume entries after a defensive hold, once the store/exchange
    /// divergence that triggered it has been inspected and resolved.
    pub async fn clear_defensive_hold(&self) {
        let mut guard = self.state.lock().await;
        guard.defensive_hold = false;
        info!("defensive hold cleared — entries resumed");
    }

    fn ensure_not_defensive_hold(&self, guard: &InstanceState) -> Result<(), StrategyError> {
        if guard.defensive_hold {
            return Err(StrategyError::DefensiveHold);
        }
        Ok(())
    }

    /// Request that this instance stop trading. If a position is active the
    /// stop is deferred until it closes; `run` exits its loop at that point.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Drive this instance's event loop forever, or until a deferred stop
    /// request is satisfied by the active position closing.
    #[instrument(skip(self, rx), name = "strategy_instance_run", fields(user_id = self.user_id, symbol = %self.symbol))]
    pub async fn run(self: Arc<Self>, mut rx: tokio::sync::mpsc::Receiver<Event>) {
        self.try_load_snapshot().await;
        while let Some(event) = rx.recv().await {
            self.handle_event(&event).await;
            if self.stop_requested.load(Ordering::SeqCst) {
                let guard = self.state.lock().await;
                if !guard.position.active {
                    info!("stop request satisfied — strategy instance exiting");
                    break;
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: &Event) {
        match event {
            Event::NewCandle { symbol, interval, close, .. } if symbol == &self.symbol => {
                self.on_new_candle(interval, *close).await;
            }
            Event::PriceUpdate { symbol, price, .. } if symbol == &self.symbol => {
                self.on_price_update(*price).await;
            }
            Event::OrderFilled {
                symbol,
                account_priority,
                exchange_order_id,
                side,
                qty,
                price,
                fee,
                ..
            } if symbol == &self.symbol && *account_priority == self.account_priority => {
                self.on_order_filled(exchange_order_id, *side, *qty, *price, *fee).await;
            }
            Event::OrderUpdate { symbol, exchange_order_id, status, .. } if symbol == &self.symbol => {
                self.on_order_update(exchange_order_id, status).await;
            }
            Event::UserSettingsChanged { changed_keys, .. } => {
                debug!(?changed_keys, "settings changed notification received");
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------------
    // Candle-driven signal evaluation (§4.7.2 / §4.7.8)
    // -------------------------------------------------------------------------

    async fn on_new_candle(self: &Arc<Self>, interval: &str, close: Decimal) {
        if interval == "1m" {
            self.spike_detector.observe(&self.symbol, close).await;
            return;
        }
        let analysis_interval = self.runtime_config.read().analysis_interval.clone();
        if interval != analysis_interval {
            return;
        }
        let signal = self.signal_analyzer.analyze(&self.symbol, close).await;
        let mut guard = self.state.lock().await;
        if guard.awaiting_order.is_some() {
            return;
        }
        if guard.position.active {
            self.handle_signal_while_active(&mut guard, signal, close).await;
        } else if !self.stop_requested.load(Ordering::SeqCst) {
            self.handle_signal_while_inactive(&mut guard, signal, close).await;
        }
        self.persist_snapshot(&guard).await;
    }

    /// The instance is flat. Accumulate confirmations for a non-Hold signal,
    /// respect cooldowns, consult the spike detector, then enter.
    async fn handle_signal_while_inactive(self: &Arc<Self>, guard: &mut InstanceState, signal: Signal, close: Decimal) {
        if let Err(e) = self.ensure_not_defensive_hold(guard) {
            debug!(error = %e, "skipping entry evaluation");
            return;
        }
        let Signal::Long | Signal::Short = signal else {
            guard.last_signal = None;
            guard.confirmation_count = 0;
            return;
        };

        let now = Utc::now();
        let rc = self.runtime_config.read().clone();
        if let Some(last_close) = guard.position.last_close_time {
            if (now - last_close).num_seconds() < rc.cooldown_seconds as i64 {
                return;
            }
        }
        if let Some(last_reversal) = guard.position.last_reversal_time {
            if (now - last_reversal).num_seconds() < rc.reversal_cooldown_seconds as i64 {
                return;
            }
        }

        // A fresh signal matching the direction of the trade that *just*
        // closed needs one extra confirmation: start counting at zero
        // instead of one so the normal +1-per-candle accumulation takes an
        // extra candle to reach the threshold.
        let starts_at_zero = guard
            .position
            .last_closed_direction
            .map(|closed_dir| closed_dir.opening_side() == signal_side(signal))
            .unwrap_or(false);

        if Some(signal) == guard.last_signal {
            guard.confirmation_count += 1;
        } else {
            guard.confirmation_count = if starts_at_zero { 0 } else { 1 };
            guard.last_signal = Some(signal);
        }

        // The extra-confirmation floor only applies after a loss or a
        // reversal exit; a clean, well-performing run is entered at exactly
        // the operator-configured threshold, even below 2.
        let cautious = guard.post_reversal || guard.position.last_trade_was_loss;
        let required = if cautious {
            rc.signal_confirmations_required.max(2)
        } else {
            rc.signal_confirmations_required
        };
        if guard.confirmation_count < required {
            return;
        }

        let advice = self.spike_detector.advise(&self.symbol, signal).await;
        if !advice.should_enter {
            return;
        }

        guard.confirmation_count = 0;
        guard.last_signal = None;
        guard.post_reversal = false;

        let cfg = self.strategy_config.read().clone();
        let instrument = match self.instrument_cache.get(&self.client, &self.symbol).await {
            Ok(Some(i)) => i,
            Ok(None) => {
                warn!(symbol = %self.symbol, "no instrument metadata available — skipping entry");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh instrument metadata — skipping entry");
                return;
            }
        };

        let notional = cfg.order_amount * Decimal::from(cfg.leverage);
        let qty = ExchangeClient::calculate_quantity_from_notional(&instrument, notional, close);
        if qty.is_zero() {
            warn!(symbol = %self.symbol, %notional, "computed entry quantity below minimum order size");
            return;
        }

        if let Err(e) = self.client.set_leverage(&self.symbol, cfg.leverage).await {
            warn!(error = %e, "failed to set leverage before entry — continuing with existing leverage");
        }

        guard.position.frozen_config = Some(cfg.clone());
        let side = signal_side(advice.final_signal);
        if let Err(e) = self
            .submit_order(guard, side, qty, OrderPurpose::Open, false, cfg.leverage, None)
            .await
        {
            warn!(error = %e, "failed to submit entry order");
            guard.position.frozen_config = None;
        }
    }

    /// The instance holds a position. React to the opposite signal
    /// (reversal, only when flat-or-profitable), a repeated Hold (double
    /// hold exit), or ignore a same-direction repeat.
    async fn handle_signal_while_active(self: &Arc<Self>, guard: &mut InstanceState, signal: Signal, close: Decimal) {
        let pnl = guard.position.unrealized_pnl(close);
        let active_direction = guard.position.direction;
        let opposite = match active_direction {
            Direction::Long => Signal::Short,
            Direction::Short => Signal::Long,
        };

        if signal == Signal::Hold {
            guard.consecutive_holds += 1;
            if guard.consecutive_holds >= 2 && pnl >= Decimal::ZERO {
                guard.consecutive_holds = 0;
                self.close_position(guard, "double_hold_signal").await;
            }
            return;
        }

        guard.consecutive_holds = 0;
        if signal == opposite && pnl >= Decimal::ZERO {
            guard.position.last_reversal_time = Some(Utc::now());
            guard.post_reversal = true;
            self.close_position(guard, "signal_reversal").await;
        }
    }

    // -------------------------------------------------------------------------
    // Price-driven averaging and exit evaluation (§4.7.5)
    // -------------------------------------------------------------------------

    async fn on_price_update(self: &Arc<Self>, price: Decimal) {
        let mut guard = self.state.lock().await;
        if !guard.position.active || guard.awaiting_order.is_some() {
            return;
        }

        self.evaluate_stagnation(&mut guard, price);

        let averaging_enabled = guard
            .position
            .frozen_config
            .as_ref()
            .map(|c| c.enable_averaging)
            .unwrap_or(true);
        if averaging_enabled {
            self.maybe_average(&mut guard, price).await;
            if !guard.position.active || guard.awaiting_order.is_some() {
                self.persist_snapshot(&guard).await;
                return;
            }
        }

        let pnl = guard.position.unrealized_pnl(price);
        if guard.position.use_breakeven_exit {
            self.evaluate_breakeven_exit(&mut guard, price, pnl).await;
        } else {
            self.evaluate_trailing_exit(&mut guard, pnl).await;
        }
        self.persist_snapshot(&guard).await;
    }

    fn pnl_pct(&self, position: &PositionState, mark_price: Decimal) -> Decimal {
        if position.current_total_margin.is_zero() {
            return Decimal::ZERO;
        }
        position.unrealized_pnl(mark_price) / position.current_total_margin * Decimal::from(100)
    }

    fn evaluate_stagnation(&self, guard: &mut InstanceState, price: Decimal) {
        let Some(cfg) = guard.position.frozen_config.clone() else {
            return;
        };
        if !cfg.enable_stagnation_detector || guard.position.use_breakeven_exit {
            return;
        }
        let (min_loss, max_loss) = cfg.stagnation_range;
        let pnl_pct = self.pnl_pct(&guard.position, price);
        let in_band = pnl_pct <= -min_loss && pnl_pct >= -max_loss;
        if !in_band {
            guard.position.stagnation_started_at = None;
            return;
        }
        let now = Utc::now();
        let started_at = *guard.position.stagnation_started_at.get_or_insert(now);
        let elapsed_secs = (now - started_at).num_seconds().max(0) as u64;
        let threshold_secs = (Decimal::from(cfg.stagnation_observation_seconds) * cfg.stagnation_multiplier)
            .to_u64()
            .unwrap_or(cfg.stagnation_observation_seconds);
        if elapsed_secs >= threshold_secs {
            info!(symbol = %self.symbol, %pnl_pct, "stagnation window elapsed — switching to breakeven exit");
            guard.position.use_breakeven_exit = true;
            guard.position.stagnation_started_at = None;
        }
    }

    async fn maybe_average(self: &Arc<Self>, guard: &mut InstanceState, price: Decimal) {
        let Some(cfg) = guard.position.frozen_config.clone() else {
            return;
        };
        if guard.position.averaging_count >= cfg.max_averaging_count {
            return;
        }
        let pnl_pct = self.pnl_pct(&guard.position, price);
        if pnl_pct > -cfg.averaging_trigger_pct {
            return;
        }

        let instrument = match self.instrument_cache.get(&self.client, &self.symbol).await {
            Ok(Some(i)) => i,
            _ => return,
        };
        let base_notional = cfg.order_amount * Decimal::from(cfg.leverage);
        let growth = pow_decimal(cfg.averaging_multiplier, guard.position.averaging_count + 1);
        let averaging_notional = base_notional * growth;
        let qty = ExchangeClient::calculate_quantity_from_notional(&instrument, averaging_notional, price);
        if qty.is_zero() {
            return;
        }

        let side = guard.position.direction.opening_side();
        let trade_id = guard.position.active_trade_id;
        if let Err(e) = self
            .submit_order(guard, side, qty, OrderPurpose::Averaging, false, cfg.leverage, trade_id)
            .await
        {
            warn!(error = %e, "failed to submit averaging order");
        }
    }

    async fn evaluate_trailing_exit(self: &Arc<Self>, guard: &mut InstanceState, pnl: Decimal) {
        let cfg = guard.position.frozen_config.clone().unwrap_or_default();
        let notional = cfg.order_amount * Decimal::from(cfg.leverage) * pow_decimal(cfg.averaging_multiplier.max(Decimal::ONE), guard.position.averaging_count);
        let activation_pnl = notional * TRAILING_LEVELS_PCT[0] / Decimal::from(100);

        if pnl > guard.position.peak_unrealized_pnl {
            guard.position.peak_unrealized_pnl = pnl;
        }
        if guard.position.peak_unrealized_pnl <= activation_pnl {
            return;
        }
        let drawdown = guard.position.peak_unrealized_pnl - pnl;
        let trigger = guard.position.peak_unrealized_pnl * TRAILING_DRAWDOWN_FRACTION;
        if drawdown > trigger {
            self.close_position(guard, "trailing_exit").await;
        }
    }

    async fn evaluate_breakeven_exit(self: &Arc<Self>, guard: &mut InstanceState, price: Decimal, pnl: Decimal) {
        let break_even = match self.client.get_positions(Some(&self.symbol)).await {
            Ok(list) => list.into_iter().find(|p| p.symbol == self.symbol).and_then(|p| p.break_even_price),
            Err(e) => {
                debug!(error = %e, "failed to fetch break-even price — falling back to zero-PnL gate");
                None
            }
        };
        let should_close = match break_even {
            Some(be) => match guard.position.direction {
                Direction::Long => price >= be,
                Direction::Short => price <= be,
            },
            None => pnl >= Decimal::ZERO,
        };
        if should_close {
            self.close_position(guard, "breakeven_exit").await;
        }
    }

    async fn close_position(self: &Arc<Self>, guard: &mut InstanceState, reason: &str) {
        if guard.position.total_size.is_zero() {
            return;
        }
        let side = guard.position.direction.closing_side();
        let qty = guard.position.total_size;
        let trade_id = guard.position.active_trade_id;
        let leverage = guard.position.frozen_config.as_ref().map(|c| c.leverage).unwrap_or(1);
        info!(symbol = %self.symbol, reason, %qty, "closing position");
        if let Err(e) = self
            .submit_order(guard, side, qty, OrderPurpose::Close, true, leverage, trade_id)
            .await
        {
            warn!(error = %e, reason, "failed to submit close order");
        }
    }

    // -------------------------------------------------------------------------
    // Stop-loss management (§4.7.6)
    // -------------------------------------------------------------------------

    async fn install_initial_stop_loss(&self, guard: &mut InstanceState, cfg: &StrategyConfig) {
        if !cfg.enable_stop_loss {
            return;
        }
        let Some(instrument) = self.instrument_cache.get(&self.client, &self.symbol).await.ok().flatten() else {
            return;
        };
        let sl = compute_stop_loss(
            guard.position.direction,
            guard.position.initial_entry_price,
            guard.position.initial_margin,
            guard.position.initial_size,
            cfg.averaging_stop_loss_pct,
            &instrument,
        );
        if let Some(sl_price) = sl {
            match self.client.set_trading_stop(&self.symbol, Some(sl_price), None).await {
                Ok(_) => guard.position.stop_loss_price = Some(sl_price),
                Err(e) => warn!(error = %e, "failed to install initial stop-loss"),
            }
        }
    }

    async fn install_post_averaging_stop_loss(&self, guard: &mut InstanceState, cfg: &StrategyConfig) {
        if !cfg.enable_stop_loss {
            return;
        }
        let Some(instrument) = self.instrument_cache.get(&self.client, &self.symbol).await.ok().flatten() else {
            return;
        };
        let sl = compute_stop_loss(
            guard.position.direction,
            guard.position.average_entry_price,
            guard.position.current_total_margin,
            guard.position.total_size,
            cfg.averaging_stop_loss_pct,
            &instrument,
        );
        if let Some(sl_price) = sl {
            match self.client.set_trading_stop(&self.symbol, Some(sl_price), None).await {
                Ok(_) => guard.position.stop_loss_price = Some(sl_price),
                Err(e) => warn!(error = %e, "failed to update stop-loss after averaging"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Order submission and fill handling (§4.7.3 / §4.7.4)
    // -------------------------------------------------------------------------

    async fn submit_order(
        self: &Arc<Self>,
        guard: &mut InstanceState,
        side: Side,
        qty: Decimal,
        purpose: OrderPurpose,
        reduce_only: bool,
        leverage: u32,
        trade_id: Option<uuid::Uuid>,
    ) -> Result<(), StrategyError> {
        let client_order_id = generate_client_order_id(self.account_priority, &self.symbol);
        let new_order = NewOrder {
            client_order_id: client_order_id.clone(),
            user_id: self.user_id,
            symbol: self.symbol.clone(),
            account_priority: self.account_priority,
            side,
            order_type: OrderType::Market,
            quantity: qty,
            price: None,
            purpose,
            strategy_type: self.strategy_type,
            trade_id,
            leverage,
            reduce_only,
            metadata: Some(serde_json::json!({ "purpose": purpose.to_string() })),
        };
        self.store.create_order_pending(new_order).await?;

        match self.client.place_order(&self.symbol, side, reduce_only, qty, None, &client_order_id).await {
            Ok(ack) => {
                self.store.bind_exchange_id(&client_order_id, &ack.exchange_order_id).await?;
                self.store.set_new(&client_order_id).await?;
                guard.awaiting_order = Some(ack.exchange_order_id.clone());
                self.spawn_fill_poll(ack.exchange_order_id, side);
                Ok(())
            }
            Err(e) => {
                let _ = self.store.delete_order(&client_order_id).await;
                Err(StrategyError::Exchange(e))
            }
        }
    }

    /// Bybit's Market order fills are usually reflected on the private
    /// stream, but not reliably enough to trust exclusively (§4.5). Poll up
    /// to 3 times, 300ms apart, and synthesize `OrderFilled` on success.
    fn spawn_fill_poll(self: &Arc<Self>, exchange_order_id: String, side: Side) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            for attempt in 1..=FILL_POLL_ATTEMPTS {
                tokio::time::sleep(FILL_POLL_SPACING).await;
                match this.client.get_order_status(&this.symbol, &exchange_order_id).await {
                    Ok(Some(snapshot)) if snapshot.status == "Filled" => {
                        this.bus.publish(Event::OrderFilled {
                            user_id: this.user_id,
                            exchange_order_id: exchange_order_id.clone(),
                            symbol: this.symbol.clone(),
                            account_priority: this.account_priority,
                            side,
                            qty: snapshot.filled_qty,
                            price: snapshot.avg_price.unwrap_or(Decimal::ZERO),
                            fee: snapshot.fee,
                        });
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(attempt, error = %e, "fill poll attempt failed"),
                }
            }
            warn!(exchange_order_id, "exhausted fill poll attempts without confirmation");
        });
    }

    async fn on_order_filled(self: &Arc<Self>, exchange_order_id: &str, side: Side, qty: Decimal, price: Decimal, fee: Decimal) {
        let mut guard = self.state.lock().await;
        if guard.position.processed_orders.contains(exchange_order_id) {
            return;
        }
        let Some(order) = self.store.get_order_by_exchange_id(exchange_order_id).await else {
            return;
        };
        if order.user_id != self.user_id || order.symbol != self.symbol || order.account_priority != self.account_priority {
            return;
        }

        guard.position.processed_orders.insert(exchange_order_id.to_string());
        if let Err(e) = self
            .store
            .update_order_status(exchange_order_id, OrderStatus::Filled, Some(qty), Some(price), Some(fee), None)
            .await
        {
            warn!(error = %e, "failed to record filled order status");
        }

        match order.purpose {
            OrderPurpose::Open => {
                self.apply_open_fill(&mut guard, side, qty, price, fee, order.leverage).await;
                guard.awaiting_order = None;
                self.persist_snapshot(&guard).await;
            }
            OrderPurpose::Averaging => {
                self.apply_averaging_fill(&mut guard, qty, price, fee).await;
                guard.awaiting_order = None;
                self.persist_snapshot(&guard).await;
            }
            OrderPurpose::Close | OrderPurpose::Stop => {
                guard.awaiting_order = None;
                self.apply_close_fill(&mut guard, price, fee).await;
            }
        }
    }

    async fn apply_open_fill(&self, guard: &mut InstanceState, side: Side, qty: Decimal, price: Decimal, fee: Decimal, leverage: u32) {
        let direction = Direction::from(side);
        let margin = (price * qty) / Decimal::from(leverage.max(1));

        guard.position.active = true;
        guard.position.direction = direction;
        guard.position.initial_entry_price = price;
        guard.position.initial_size = qty;
        guard.position.average_entry_price = price;
        guard.position.total_size = qty;
        guard.position.averaging_count = 0;
        guard.position.initial_margin = margin;
        guard.position.current_total_margin = margin;
        guard.position.accumulated_fees = fee;
        guard.position.peak_unrealized_pnl = Decimal::ZERO;
        guard.position.use_breakeven_exit = false;
        guard.position.stagnation_started_at = None;

        let trade = Trade::new(self.user_id, self.symbol.clone(), self.account_priority, self.strategy_type, side, price, qty, leverage);
        let trade_id = trade.id;
        guard.position.active_trade_id = Some(trade_id);
        if let Err(e) = self.store.create_trade(trade).await {
            error!(error = %e, "failed to record opened trade — rolling back, entries suspended until cleared");
            guard.position.active = false;
            guard.position.active_trade_id = None;
            guard.defensive_hold = true;
            notify_fire_and_forget(
                self.notifier.clone(),
                self.user_id,
                format!("Store integrity violation opening {} — entries suspended until manually cleared", self.symbol),
                ParseMode::PlainText,
            );
            return;
        }

        let cfg = guard.position.frozen_config.clone().unwrap_or_default();
        self.install_initial_stop_loss(guard, &cfg).await;

        notify_fire_and_forget(
            self.notifier.clone(),
            self.user_id,
            format!("Opened {direction:?} {qty} {} @ {price}", self.symbol),
            ParseMode::PlainText,
        );
    }

    async fn apply_averaging_fill(&self, guard: &mut InstanceState, qty: Decimal, price: Decimal, fee: Decimal) {
        let prior_value = guard.position.average_entry_price * guard.position.total_size;
        let new_total = guard.position.total_size + qty;
        if !new_total.is_zero() {
            guard.position.average_entry_price = (prior_value + price * qty) / new_total;
            guard.position.total_size = new_total;
        }
        guard.position.averaging_count += 1;

        let leverage = guard.position.frozen_config.as_ref().map(|c| c.leverage).unwrap_or(1);
        guard.position.current_total_margin += (price * qty) / Decimal::from(leverage.max(1));
        guard.position.accumulated_fees += fee;
        guard.position.peak_unrealized_pnl = Decimal::ZERO;

        if let Some(trade_id) = guard.position.active_trade_id {
            if let Err(e) = self
                .store
                .update_trade_on_averaging(trade_id, guard.position.average_entry_price, guard.position.total_size)
                .await
            {
                warn!(error = %e, "failed to record averaging fill on trade");
            }
        }

        let cfg = guard.position.frozen_config.clone().unwrap_or_default();
        self.install_post_averaging_stop_loss(guard, &cfg).await;

        notify_fire_and_forget(
            self.notifier.clone(),
            self.user_id,
            format!(
                "Averaged {} — new size {}, avg entry {}",
                self.symbol, guard.position.total_size, guard.position.average_entry_price
            ),
            ParseMode::PlainText,
        );
    }

    async fn apply_close_fill(self: &Arc<Self>, guard: &mut InstanceState, price: Decimal, fee: Decimal) {
        let pnl = guard.position.unrealized_pnl(price) - guard.position.accumulated_fees - fee;
        let was_loss = pnl < Decimal::ZERO;

        if let Some(trade_id) = guard.position.active_trade_id {
            if let Err(e) = self.store.update_trade_on_close(trade_id, price, pnl, fee, Utc::now()).await {
                warn!(error = %e, "failed to record trade close");
            }
        }
        self.risk.record_trade_result(pnl);
        let stats = self.store.update_strategy_stats(self.user_id, self.strategy_type, pnl).await.ok();

        // Clear the exchange-side stop-loss before resetting local state —
        // a stale stop left behind on a flat position is a dangling
        // exposure on the next manual or engine-driven position.
        if let Err(e) = self.client.set_trading_stop(&self.symbol, Some(Decimal::ZERO), None).await {
            debug!(error = %e, "failed to clear stop-loss after close (already flat is fine)");
        }

        notify_fire_and_forget(
            self.notifier.clone(),
            self.user_id,
            format!("Closed {} — pnl {pnl}", self.symbol),
            ParseMode::PlainText,
        );

        guard.position.reset_after_close(was_loss, Utc::now());

        let key = strategy_snapshot_key(self.user_id, &self.symbol, self.strategy_type);
        let (total_pnl, wins, losses) = stats.unwrap_or((Decimal::ZERO, 0, 0));
        let snapshot = StrategySnapshot::from_position(&guard.position, total_pnl, wins, losses);
        if let Ok(json) = serde_json::to_string(&snapshot) {
            self.cache.put(&key, json, STRATEGY_SNAPSHOT_TTL).await;
        }
    }

    async fn on_order_update(&self, exchange_order_id: &str, status: &str) {
        let mut guard = self.state.lock().await;
        if guard.awaiting_order.as_deref() != Some(exchange_order_id) {
            return;
        }
        if status == "Cancelled" || status == "Rejected" {
            warn!(exchange_order_id, status, "engine order did not fill — clearing in-flight marker");
            guard.awaiting_order = None;
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot persistence (§4.7.7)
    // -------------------------------------------------------------------------

    async fn try_load_snapshot(self: &Arc<Self>) {
        let key = strategy_snapshot_key(self.user_id, &self.symbol, self.strategy_type);
        let mut guard = self.state.lock().await;
        if let Some(raw) = self.cache.get(&key).await {
            match serde_json::from_str::<StrategySnapshot>(&raw) {
                Ok(snapshot) => {
                    guard.position = snapshot.into_position();
                    info!(symbol = %self.symbol, active = guard.position.active, "loaded strategy snapshot on startup");
                }
                Err(e) => warn!(error = %e, "failed to parse strategy snapshot — starting flat"),
            }
        }
        self.reconcile_with_exchange(&mut guard).await;
    }

    /// Bind whatever was just loaded (a snapshot, or nothing) to exchange
    /// reality before the instance starts reacting to new events. Covers
    /// both the normal boot path and `RecoveryCoordinator`'s rehydration:
    /// every instance goes through this exactly once, in `run`, regardless
    /// of who constructed it.
    async fn reconcile_with_exchange(self: &Arc<Self>, guard: &mut InstanceState) {
        let live = match self.client.get_positions(Some(&self.symbol)).await {
            Ok(positions) => positions.into_iter().find(|p| !p.size.is_zero()),
            Err(e) => {
                warn!(error = %e, "startup reconciliation could not reach the exchange — trusting local state as-is");
                return;
            }
        };

        match (&live, guard.position.active) {
            (Some(live), false) => {
                warn!(symbol = %self.symbol, "exchange holds an open position this instance did not know about — rehydrating");
                let cfg = self.strategy_config.read().clone();
                let direction = if live.side == "Sell" { Direction::Short } else { Direction::Long };
                guard.position.active = true;
                guard.position.direction = direction;
                guard.position.initial_entry_price = live.avg_price;
                guard.position.average_entry_price = live.avg_price;
                guard.position.initial_size = live.size;
                guard.position.total_size = live.size;
                guard.position.averaging_count = 0;
                guard.position.initial_margin = (live.avg_price * live.size) / Decimal::from(cfg.leverage.max(1));
                guard.position.current_total_margin = guard.position.initial_margin;
                guard.position.frozen_config = Some(cfg);
            }
            (None, true) => {
                warn!(symbol = %self.symbol, "snapshot says active but the exchange holds no position — clearing local state");
                guard.position = PositionState::default();
            }
            _ => {}
        }

        let Some(exchange_order_id) = guard.awaiting_order.clone() else {
            return;
        };
        match self.client.get_order_status(&self.symbol, &exchange_order_id).await {
            Ok(Some(snapshot)) if snapshot.status == "Filled" => {
                let side = self
                    .store
                    .get_order_by_exchange_id(&exchange_order_id)
                    .await
                    .map(|o| o.side)
                    .unwrap_or(Side::Buy);
                info!(exchange_order_id, "startup reconciliation found a fill this instance had not processed");
                self.bus.publish(Event::OrderFilled {
                    user_id: self.user_id,
                    exchange_order_id,
                    symbol: self.symbol.clone(),
                    account_priority: self.account_priority,
                    side,
                    qty: snapshot.filled_qty,
                    price: snapshot.avg_price.unwrap_or_default(),
                    fee: snapshot.fee,
                });
            }
            Ok(Some(snapshot)) if snapshot.status == "Cancelled" || snapshot.status == "Rejected" => {
                guard.awaiting_order = None;
            }
            Ok(_) => {}
            Err(e) => warn!(exchange_order_id, error = %e, "startup reconciliation failed to fetch awaited order status"),
        }
    }

    async fn persist_snapshot(&self, guard: &InstanceState) {
        let key = strategy_snapshot_key(self.user_id, &self.symbol, self.strategy_type);
        let snapshot = StrategySnapshot::from_position(&guard.position, Decimal::ZERO, 0, 0);
        if let Ok(json) = serde_json::to_string(&snapshot) {
            self.cache.put(&key, json, STRATEGY_SNAPSHOT_TTL).await;
        }
    }
}

fn signal_side(signal: Signal) -> Side {
    match signal {
        Signal::Long => Side::Buy,
        Signal::Short => Side::Sell,
        Signal::Hold => Side::Buy, // unreachable in practice — callers guard on Long/Short
    }
}

fn pow_decimal(base: Decimal, exp: u32) -> Decimal {
    let mut result = Decimal::ONE;
    for _ in 0..exp {
        result *= base;
    }
    result
}

/// `sl_price = entry ∓ (max_loss / qty) * 1.05`, where `max_loss = margin *
/// (stop_loss_pct / 100)`. The 5% buffer absorbs slippage between the
/// computed level and the exchange's actual trigger fill.
fn compute_stop_loss(
    direction: Direction,
    entry: Decimal,
    margin: Decimal,
    qty: Decimal,
    stop_loss_pct: Decimal,
    instrument: &crate::domain::Instrument,
) -> Option<Decimal> {
    if qty.is_zero() {
        return None;
    }
    let max_loss = margin * (stop_loss_pct / Decimal::from(100));
    let gap = (max_loss / qty) * Decimal::new(105, 2);
    let raw = match direction {
        Direction::Long => entry - gap,
        Direction::Short => entry + gap,
    };
    if raw <= Decimal::ZERO {
        return None;
    }
    Some(instrument.snap_price(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn instrument() -> crate::domain::Instrument {
        crate::domain::Instrument {
            symbol: "BTCUSDT".to_string(),
            tick_size: dec!(0.1),
            qty_step: dec!(0.001),
            min_order_qty: dec!(0.001),
            status: "Trading".to_string(),
        }
    }

    #[test]
    fn stop_loss_below_entry_for_long() {
        let sl = compute_stop_loss(Direction::Long, dec!(100), dec!(10), dec!(1), dec!(40), &instrument());
        assert!(sl.unwrap() < dec!(100));
    }

    #[test]
    fn stop_loss_above_entry_for_short() {
        let sl = compute_stop_loss(Direction::Short, dec!(100), dec!(10), dec!(1), dec!(40), &instrument());
        assert!(sl.unwrap() > dec!(100));
    }

    #[test]
    fn stop_loss_none_for_zero_qty() {
        assert!(compute_stop_loss(Direction::Long, dec!(100), dec!(10), Decimal::ZERO, dec!(40), &instrument()).is_none());
    }

    #[test]
    fn pow_decimal_computes_integer_powers() {
        assert_eq!(pow_decimal(dec!(1.5), 0), dec!(1));
        assert_eq!(pow_decimal(dec!(1.5), 2), dec!(2.25));
    }

    #[test]
    fn signal_side_maps_long_and_short() {
        assert_eq!(signal_side(Signal::Long), Side::Buy);
        assert_eq!(signal_side(Signal::Short), Side::Sell);
    }
}
