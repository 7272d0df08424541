use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AccountPriority, OrderPurpose, OrderStatus, OrderType, Side, StrategyType};

/// Sentinel written into `exchange_order_id` between `create_order_pending`
/// and the exchange's acknowledgment, so a crash before the ack leaves a
/// record that is unambiguously "never left the building".
pub const PENDING_EXCHANGE_ID: &str = "PENDING";

/// One order, local or exchange-bound, with the engine's bookkeeping on top
/// of what the exchange reports. Serializable so `OrderStore` can snapshot
/// it to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub db_id: u64,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub user_id: i64,
    pub symbol: String,
    pub account_priority: AccountPriority,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub commission: Decimal,
    pub profit: Option<Decimal>,
    pub status: OrderStatus,
    pub purpose: OrderPurpose,
    pub strategy_type: StrategyType,
    pub trade_id: Option<Uuid>,
    pub leverage: u32,
    pub reduce_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Free-form context carried alongside the order (e.g. which signal or
    /// averaging step produced it); opaque to the engine, surfaced as-is to
    /// operator tooling.
    pub metadata: Option<serde_json::Value>,
}

impl Order {
    pub fn is_pending(&self) -> bool {
        self.exchange_order_id == PENDING_EXCHANGE_ID
    }

    /// True once the order is bound to a real exchange id and reported New
    /// or beyond.
    pub fn is_live(&self) -> bool {
        !self.is_pending() && self.status != OrderStatus::Pending
    }
}

/// Generate a client order id that embeds enough context for a human to
/// recognize it among manual orders in an exchange UI, plus a random suffix
/// so concurrent submissions within the same millisecond never collide.
pub fn generate_client_order_id(account_priority: AccountPriority, symbol: &str) -> String {
    use rand::Rng;
    let epoch_ms = Utc::now().timestamp_millis();
    let suffix: u32 = rand::thread_rng().gen_range(1000..9999);
    format!("bot{account_priority}_{symbol}_{epoch_ms}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_order_ids_are_unique_across_calls() {
        let a = generate_client_order_id(1, "BTCUSDT");
        let b = generate_client_order_id(1, "BTCUSDT");
        assert_ne!(a, b);
        assert!(a.starts_with("bot1_BTCUSDT_"));
    }

    #[test]
    fn pending_sentinel_detected() {
        let order = Order {
            db_id: 1,
            client_order_id: "x".into(),
            exchange_order_id: PENDING_EXCHANGE_ID.into(),
            user_id: 1,
            symbol: "BTCUSDT".into(),
            account_priority: 1,
            side: Side::Buy,
            order_type: OrderType::Market,
            quantity: Decimal::ONE,
            price: None,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            commission: Decimal::ZERO,
            profit: None,
            status: OrderStatus::Pending,
            purpose: OrderPurpose::Open,
            strategy_type: StrategyType::SignalScalper,
            trade_id: None,
            leverage: 10,
            reduce_only: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: None,
        };
        assert!(order.is_pending());
        assert!(!order.is_live());
    }
}
