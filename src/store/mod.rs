// =============================================================================
// Order store — the authoritative ownership ledger
// =============================================================================
//
// `OrderStore` is the seam a real deployment backs with a relational store
// (users / orders / trades / strategy stats tables, per SPEC_FULL.md §6.2).
// This core ships an in-memory implementation behind `parking_lot::RwLock`,
// matching the teacher's `PositionManager` storage pattern. `InMemoryOrderStore`
// additionally offers `save_snapshot`/`load_snapshot`/`run_periodic_snapshots`
// (inherent methods, not part of the trait — a relational backend persists
// through its own engine instead) using the same atomic tmp+rename write as
// `config::RuntimeConfig::save`.
//
// Every order submitted by the engine has a record here *before* it is
// sent to the exchange (`create_order_pending`); a strategy only ever acts
// on an order event if the order is present here with a matching
// (user, symbol, account_priority) — everything else is a manual order on
// the exchange and must be ignored.
// =============================================================================

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{Order, Trade};
use crate::error::StoreError;
use crate::types::{AccountPriority, OrderStatus, Side, StrategyType};

pub use memory::InMemoryOrderStore;

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub client_order_id: String,
    pub user_id: i64,
    pub symbol: String,
    pub account_priority: AccountPriority,
    pub side: Side,
    pub order_type: crate::types::OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub purpose: crate::types::OrderPurpose,
    pub strategy_type: StrategyType,
    pub trade_id: Option<Uuid>,
    pub leverage: u32,
    pub reduce_only: bool,
    pub metadata: Option<serde_json::Value>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create_order_pending(&self, new_order: NewOrder) -> Result<u64, StoreError>;
    async fn bind_exchange_id(&self, client_order_id: &str, exchange_order_id: &str) -> Result<(), StoreError>;
    async fn set_new(&self, client_order_id: &str) -> Result<(), StoreError>;
    async fn delete_order(&self, client_order_id: &str) -> Result<(), StoreError>;

    async fn update_order_status(
        &self,
        exchange_order_id: &str,
        status: OrderStatus,
        filled_qty: Option<Decimal>,
        avg_price: Option<Decimal>,
        fee: Option<Decimal>,
        profit: Option<Decimal>,
    ) -> Result<(), StoreError>;

    async fn get_order_by_exchange_id(&self, exchange_order_id: &str) -> Option<Order>;
    async fn get_order_by_client_id(&self, client_order_id: &str) -> Option<Order>;

    async fn get_active_orders_for_sync(&self, user_id: i64, account_priority: AccountPriority) -> Vec<Order>;
    async fn has_pending_close_order(&self, user_id: i64, symbol: &str, account_priority: AccountPriority) -> bool;
    async fn has_unclosed_position(&self, user_id: i64, symbol: &str, account_priority: AccountPriority) -> bool;
    async fn get_all_open_positions(&self, user_id: i64) -> Vec<Trade>;

    async fn create_trade(&self, trade: Trade) -> Result<(), StoreError>;
    async fn update_trade_on_averaging(
        &self,
        trade_id: Uuid,
        new_entry_price: Decimal,
        new_qty: Decimal,
    ) -> Result<(), StoreError>;
    async fn update_trade_on_close(
        &self,
        trade_id: Uuid,
        exit_price: Decimal,
        pnl: Decimal,
        commission: Decimal,
        exit_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn update_strategy_stats(
        &self,
        user_id: i64,
        strategy_type: StrategyType,
        pnl: Decimal,
    ) -> Result<(Decimal, u32, u32), StoreError>;
}
