use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AccountPriority, Side, StrategyType, TradeStatus};

/// The logical position between an Open order and its matching Close order.
/// Exactly one `Open` trade may exist per (user, symbol, account_priority)
/// at any instant — enforced by `OrderStore::create_trade`. Serializable so
/// `OrderStore` can snapshot it to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub user_id: i64,
    pub symbol: String,
    pub account_priority: AccountPriority,
    pub strategy_type: StrategyType,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub exit_price: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub commission: Decimal,
    pub leverage: u32,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub status: TradeStatus,
    /// Free-form context carried alongside the trade, opaque to the engine.
    pub metadata: Option<serde_json::Value>,
}

impl Trade {
    pub fn new(
        user_id: i64,
        symbol: String,
        account_priority: AccountPriority,
        strategy_type: StrategyType,
        side: Side,
        entry_price: Decimal,
        quantity: Decimal,
        leverage: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            symbol,
            account_priority,
            strategy_type,
            side,
            entry_price,
            quantity,
            exit_price: None,
            profit: None,
            commission: Decimal::ZERO,
            leverage,
            entry_time: Utc::now(),
            exit_time: None,
            status: TradeStatus::Open,
            metadata: None,
        }
    }

    /// Recompute the volume-weighted average entry price after an averaging
    /// fill of `added_qty` at `fill_price`, and grow the recorded quantity.
    pub fn apply_averaging(&mut self, fill_price: Decimal, added_qty: Decimal) {
        let prior_value = self.entry_price * self.quantity;
        let new_qty = self.quantity + added_qty;
        if new_qty.is_zero() {
            return;
        }
        self.entry_price = (prior_value + fill_price * added_qty) / new_qty;
        self.quantity = new_qty;
    }

    pub fn close(&mut self, exit_price: Decimal, profit: Decimal, commission_delta: Decimal) {
        self.exit_price = Some(exit_price);
        self.profit = Some(profit);
        self.commission += commission_delta;
        self.exit_time = Some(Utc::now());
        self.status = TradeStatus::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn averaging_computes_volume_weighted_price() {
        let mut trade = Trade::new(
            1,
            "BTCUSDT".into(),
            1,
            StrategyType::SignalScalper,
            Side::Buy,
            dec!(100),
            dec!(1),
            10,
        );
        trade.apply_averaging(dec!(90), dec!(1));
        assert_eq!(trade.entry_price, dec!(95));
        assert_eq!(trade.quantity, dec!(2));
    }

    #[test]
    fn close_sets_terminal_fields() {
        let mut trade = Trade::new(
            1,
            "BTCUSDT".into(),
            1,
            StrategyType::SignalScalper,
            Side::Buy,
            dec!(100),
            dec!(1),
            10,
        );
        trade.close(dec!(105), dec!(5), dec!(0.1));
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.exit_price, Some(dec!(105)));
        assert_eq!(trade.profit, Some(dec!(5)));
        assert!(trade.exit_time.is_some());
    }
}
