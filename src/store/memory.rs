use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{NewOrder, OrderStore};
use crate::domain::order::PENDING_EXCHANGE_ID;
use crate::domain::{Order, Trade};
use crate::error::StoreError;
use crate::types::{AccountPriority, OrderPurpose, OrderStatus, StrategyType, TradeStatus};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StrategyStat {
    cumulative_pnl: Decimal,
    wins: u32,
    losses: u32,
}

struct Inner {
    orders_by_db_id: HashMap<u64, Order>,
    client_id_to_db_id: HashMap<String, u64>,
    exchange_id_to_db_id: HashMap<String, u64>,
    trades: HashMap<Uuid, Trade>,
    strategy_stats: HashMap<(i64, StrategyType), StrategyStat>,
}

/// In-memory `OrderStore`, the bundled implementation for this core. A
/// relational store fills the same trait for production multi-process
/// deployment (see SPEC_FULL.md §6.2); the invariants below hold either way.
pub struct InMemoryOrderStore {
    inner: RwLock<Inner>,
    next_db_id: AtomicU64,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                orders_by_db_id: HashMap::new(),
                client_id_to_db_id: HashMap::new(),
                exchange_id_to_db_id: HashMap::new(),
                trades: HashMap::new(),
                strategy_stats: HashMap::new(),
            }),
            next_db_id: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct StrategyStatEntry {
    user_id: i64,
    strategy_type: StrategyType,
    stat: StrategyStat,
}

/// On-disk shape of an `InMemoryOrderStore`. Flat and index-free — the
/// lookup maps (`client_id_to_db_id`, `exchange_id_to_db_id`) are rebuilt
/// from `orders` on load rather than serialized, since `HashMap` keyed by a
/// tuple (as `strategy_stats` is in memory) has no direct JSON encoding.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    next_db_id: u64,
    orders: Vec<Order>,
    trades: Vec<Trade>,
    strategy_stats: Vec<StrategyStatEntry>,
}

impl InMemoryOrderStore {
    fn to_snapshot(&self) -> Snapshot {
        let inner = self.inner.read();
        Snapshot {
            next_db_id: self.next_db_id.load(Ordering::Relaxed),
            orders: inner.orders_by_db_id.values().cloned().collect(),
            trades: inner.trades.values().cloned().collect(),
            strategy_stats: inner
                .strategy_stats
                .iter()
                .map(|(&(user_id, strategy_type), stat)| StrategyStatEntry {
                    user_id,
                    strategy_type,
                    stat: stat.clone(),
                })
                .collect(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut client_id_to_db_id = HashMap::new();
        let mut exchange_id_to_db_id = HashMap::new();
        let mut orders_by_db_id = HashMap::new();
        for order in snapshot.orders {
            client_id_to_db_id.insert(order.client_order_id.clone(), order.db_id);
            if order.exchange_order_id != PENDING_EXCHANGE_ID {
                exchange_id_to_db_id.insert(order.exchange_order_id.clone(), order.db_id);
            }
            orders_by_db_id.insert(order.db_id, order);
        }
        let trades = snapshot.trades.into_iter().map(|t| (t.id, t)).collect();
        let strategy_stats = snapshot
            .strategy_stats
            .into_iter()
            .map(|e| ((e.user_id, e.strategy_type), e.stat))
            .collect();
        Self {
            inner: RwLock::new(Inner {
                orders_by_db_id,
                client_id_to_db_id,
                exchange_id_to_db_id,
                trades,
                strategy_stats,
            }),
            next_db_id: AtomicU64::new(snapshot.next_db_id),
        }
    }

    /// Persist every order, trade and strategy stat to `path` using an
    /// atomic write (write to `.tmp`, then rename), matching
    /// `config::RuntimeConfig::save`.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&self.to_snapshot())?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, path)?;
        debug!(path = %path.display(), "order store snapshot saved (atomic)");
        Ok(())
    }

    /// Load a previously saved snapshot from `path`, replacing this store's
    /// contents in place.
    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        let restored = Self::from_snapshot(snapshot);
        let mut inner = self.inner.write();
        *inner = restored.inner.into_inner();
        self.next_db_id
            .store(restored.next_db_id.load(Ordering::Relaxed), Ordering::Relaxed);
        info!(path = %path.display(), orders = inner.orders_by_db_id.len(), trades = inner.trades.len(), "order store snapshot loaded");
        Ok(())
    }

    /// Save a snapshot to `path` every `interval`, logging and continuing on
    /// failure rather than aborting the loop — a single bad write should not
    /// stop future snapshot attempts.
    pub async fn run_periodic_snapshots(self: std::sync::Arc<Self>, path: std::path::PathBuf, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.save_snapshot(&path) {
                warn!(error = %e, path = %path.display(), "periodic order store snapshot failed");
            }
        }
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create_order_pending(&self, new_order: NewOrder) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        if inner.client_id_to_db_id.contains_key(&new_order.client_order_id) {
            return Err(StoreError::DuplicateClientOrderId(new_order.client_order_id));
        }
        let db_id = self.next_db_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let order = Order {
            db_id,
            client_order_id: new_order.client_order_id.clone(),
            exchange_order_id: PENDING_EXCHANGE_ID.to_string(),
            user_id: new_order.user_id,
            symbol: new_order.symbol,
            account_priority: new_order.account_priority,
            side: new_order.side,
            order_type: new_order.order_type,
            quantity: new_order.quantity,
            price: new_order.price,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            commission: Decimal::ZERO,
            profit: None,
            status: OrderStatus::Pending,
            purpose: new_order.purpose,
            strategy_type: new_order.strategy_type,
            trade_id: new_order.trade_id,
            leverage: new_order.leverage,
            reduce_only: new_order.reduce_only,
            created_at: now,
            updated_at: now,
            metadata: new_order.metadata,
        };
        inner.client_id_to_db_id.insert(new_order.client_order_id.clone(), db_id);
        inner.orders_by_db_id.insert(db_id, order);
        debug!(db_id, client_order_id = %new_order.client_order_id, "order pending record created");
        Ok(db_id)
    }

    async fn bind_exchange_id(&self, client_order_id: &str, exchange_order_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let db_id = *inner
            .client_id_to_db_id
            .get(client_order_id)
            .ok_or_else(|| StoreError::OrderNotFound(client_order_id.to_string()))?;
        inner
            .exchange_id_to_db_id
            .insert(exchange_order_id.to_string(), db_id);
        if let Some(order) = inner.orders_by_db_id.get_mut(&db_id) {
            order.exchange_order_id = exchange_order_id.to_string();
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_new(&self, client_order_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let db_id = *inner
            .client_id_to_db_id
            .get(client_order_id)
            .ok_or_else(|| StoreError::OrderNotFound(client_order_id.to_string()))?;
        if let Some(order) = inner.orders_by_db_id.get_mut(&db_id) {
            order.status = OrderStatus::New;
            order.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_order(&self, client_order_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(db_id) = inner.client_id_to_db_id.remove(client_order_id) {
            if let Some(order) = inner.orders_by_db_id.remove(&db_id) {
                inner.exchange_id_to_db_id.remove(&order.exchange_order_id);
            }
        }
        Ok(())
    }

    async fn update_order_status(
        &self,
        exchange_order_id: &str,
        status: OrderStatus,
        filled_qty: Option<Decimal>,
        avg_price: Option<Decimal>,
        fee: Option<Decimal>,
        profit: Option<Decimal>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let db_id = *inner
            .exchange_id_to_db_id
            .get(exchange_order_id)
            .ok_or_else(|| StoreError::OrderNotFound(exchange_order_id.to_string()))?;
        let order = inner
            .orders_by_db_id
            .get_mut(&db_id)
            .ok_or_else(|| StoreError::OrderNotFound(exchange_order_id.to_string()))?;

        // Idempotent terminal write: once a terminal status is recorded,
        // a second terminal write may update bookkeeping fields but must
        // not re-stamp profit (prevents double counting on duplicate
        // fill events).
        let already_terminal = order.status.is_terminal();
        order.status = status;
        if let Some(q) = filled_qty {
            order.filled_quantity = q;
        }
        if let Some(p) = avg_price {
            order.average_fill_price = Some(p);
        }
        if let Some(f) = fee {
            order.commission = f;
        }
        if let Some(p) = profit {
            if !already_terminal {
                order.profit = Some(p);
            } else {
                warn!(exchange_order_id, "ignoring profit on already-terminal order (duplicate event)");
            }
        }
        order.updated_at = Utc::now();
        Ok(())
    }

    async fn get_order_by_exchange_id(&self, exchange_order_id: &str) -> Option<Order> {
        let inner = self.inner.read();
        let db_id = inner.exchange_id_to_db_id.get(exchange_order_id)?;
        inner.orders_by_db_id.get(db_id).cloned()
    }

    async fn get_order_by_client_id(&self, client_order_id: &str) -> Option<Order> {
        let inner = self.inner.read();
        let db_id = inner.client_id_to_db_id.get(client_order_id)?;
        inner.orders_by_db_id.get(db_id).cloned()
    }

    async fn get_active_orders_for_sync(&self, user_id: i64, account_priority: AccountPriority) -> Vec<Order> {
        let inner = self.inner.read();
        inner
            .orders_by_db_id
            .values()
            .filter(|o| {
                o.user_id == user_id
                    && o.account_priority == account_priority
                    && matches!(o.status, OrderStatus::New | OrderStatus::Filled)
            })
            .cloned()
            .collect()
    }

    async fn has_pending_close_order(&self, user_id: i64, symbol: &str, account_priority: AccountPriority) -> bool {
        let inner = self.inner.read();
        inner.orders_by_db_id.values().any(|o| {
            o.user_id == user_id
                && o.symbol == symbol
                && o.account_priority == account_priority
                && o.purpose == OrderPurpose::Close
                && o.status == OrderStatus::New
        })
    }

    async fn has_unclosed_position(&self, user_id: i64, symbol: &str, account_priority: AccountPriority) -> bool {
        let inner = self.inner.read();
        inner.trades.values().any(|t| {
            t.user_id == user_id
                && t.symbol == symbol
                && t.account_priority == account_priority
                && t.status == TradeStatus::Open
        })
    }

    async fn get_all_open_positions(&self, user_id: i64) -> Vec<Trade> {
        let inner = self.inner.read();
        inner
            .trades
            .values()
            .filter(|t| t.user_id == user_id && t.status == TradeStatus::Open)
            .cloned()
            .collect()
    }

    async fn create_trade(&self, trade: Trade) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let duplicate = inner.trades.values().any(|t| {
            t.user_id == trade.user_id
                && t.symbol == trade.symbol
                && t.account_priority == trade.account_priority
                && t.status == TradeStatus::Open
        });
        if duplicate {
            return Err(StoreError::DuplicateOpenTrade {
                user_id: trade.user_id,
                symbol: trade.symbol,
                account_priority: trade.account_priority,
            });
        }
        inner.trades.insert(trade.id, trade);
        Ok(())
    }

    async fn update_trade_on_averaging(
        &self,
        trade_id: Uuid,
        new_entry_price: Decimal,
        new_qty: Decimal,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let trade = inner
            .trades
            .get_mut(&trade_id)
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        trade.entry_price = new_entry_price;
        trade.quantity = new_qty;
        Ok(())
    }

    async fn update_trade_on_close(
        &self,
        trade_id: Uuid,
        exit_price: Decimal,
        pnl: Decimal,
        commission: Decimal,
        exit_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let trade = inner
            .trades
            .get_mut(&trade_id)
            .ok_or(StoreError::TradeNotFound(trade_id))?;
        trade.exit_price = Some(exit_price);
        trade.profit = Some(pnl);
        trade.commission += commission;
        trade.exit_time = Some(exit_time);
        trade.status = TradeStatus::Closed;
        Ok(())
    }

    async fn update_strategy_stats(
        &self,
        user_id: i64,
        strategy_type: StrategyType,
        pnl: Decimal,
    ) -> Result<(Decimal, u32, u32), StoreError> {
        let mut inner = self.inner.write();
        let stat = inner
            .strategy_stats
            .entry((user_id, strategy_type))
            .or_insert_with(StrategyStat::default);
        stat.cumulative_pnl += pnl;
        if pnl >= Decimal::ZERO {
            stat.wins += 1;
        } else {
            stat.losses += 1;
        }
        Ok((stat.cumulative_pnl, stat.wins, stat.losses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderType, Side};
    use rust_decimal_macros::dec;

    fn sample_new_order(client_order_id: &str) -> NewOrder {
        NewOrder {
            client_order_id: client_order_id.to_string(),
            user_id: 1,
            symbol: "BTCUSDT".into(),
            account_priority: 1,
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: dec!(1),
            price: None,
            purpose: OrderPurpose::Open,
            strategy_type: StrategyType::SignalScalper,
            trade_id: None,
            leverage: 10,
            reduce_only: false,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn duplicate_client_order_id_rejected() {
        let store = InMemoryOrderStore::new();
        store.create_order_pending(sample_new_order("a")).await.unwrap();
        let err = store.create_order_pending(sample_new_order("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateClientOrderId(_)));
    }

    #[tokio::test]
    async fn bind_then_lookup_by_exchange_id() {
        let store = InMemoryOrderStore::new();
        store.create_order_pending(sample_new_order("a")).await.unwrap();
        store.bind_exchange_id("a", "EXCH1").await.unwrap();
        let order = store.get_order_by_exchange_id("EXCH1").await.unwrap();
        assert_eq!(order.client_order_id, "a");
    }

    #[tokio::test]
    async fn second_open_trade_for_same_slot_rejected() {
        let store = InMemoryOrderStore::new();
        let trade = Trade::new(
            1,
            "BTCUSDT".into(),
            1,
            StrategyType::SignalScalper,
            Side::Buy,
            dec!(100),
            dec!(1),
            10,
        );
        store.create_trade(trade.clone()).await.unwrap();
        let mut second = Trade::new(
            1,
            "BTCUSDT".into(),
            1,
            StrategyType::SignalScalper,
            Side::Buy,
            dec!(101),
            dec!(1),
            10,
        );
        second.id = Uuid::new_v4();
        let err = store.create_trade(second).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateOpenTrade { .. }));
    }

    #[tokio::test]
    async fn duplicate_terminal_write_does_not_restamp_profit() {
        let store = InMemoryOrderStore::new();
        store.create_order_pending(sample_new_order("a")).await.unwrap();
        store.bind_exchange_id("a", "EXCH1").await.unwrap();
        store
            .update_order_status(
                "EXCH1",
                OrderStatus::Filled,
                Some(dec!(1)),
                Some(dec!(100)),
                Some(dec!(0.1)),
                Some(dec!(5)),
            )
            .await
            .unwrap();
        store
            .update_order_status("EXCH1", OrderStatus::Filled, None, None, None, Some(dec!(999)))
            .await
            .unwrap();
        let order = store.get_order_by_exchange_id("EXCH1").await.unwrap();
        assert_eq!(order.profit, Some(dec!(5)));
    }
}
