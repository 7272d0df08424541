use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::StrategyConfig;
use crate::types::Direction;

/// In-memory position state owned exclusively by one `StrategyInstance`.
/// Nothing outside the instance's own locked handler should read or write
/// this directly.
#[derive(Debug, Clone)]
pub struct PositionState {
    pub active: bool,
    pub direction: Direction,
    pub initial_entry_price: Decimal,
    pub initial_size: Decimal,
    pub average_entry_price: Decimal,
    pub total_size: Decimal,
    pub averaging_count: u32,
    pub initial_margin: Decimal,
    pub current_total_margin: Decimal,
    pub accumulated_fees: Decimal,
    pub peak_unrealized_pnl: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub use_breakeven_exit: bool,
    pub frozen_config: Option<StrategyConfig>,
    pub active_trade_id: Option<Uuid>,

    /// Order ids (exchange-side) already consumed by `handle_order_filled`
    /// for this position's lifetime. Cleared on close.
    pub processed_orders: HashSet<String>,

    /// Stagnation observer: set when price first enters the configured
    /// loss band, cleared when it leaves.
    pub stagnation_started_at: Option<DateTime<Utc>>,

    pub last_trade_was_loss: bool,
    pub last_close_time: Option<DateTime<Utc>>,
    pub last_reversal_time: Option<DateTime<Utc>>,

    /// Direction of the most recently closed trade. Drives the "extra
    /// confirmation required" rule: a fresh signal in the same direction
    /// as the trade that just closed starts confirmation counting at zero
    /// instead of one.
    pub last_closed_direction: Option<Direction>,
}

impl Default for PositionState {
    fn default() -> Self {
        Self {
            active: false,
            direction: Direction::Long,
            initial_entry_price: Decimal::ZERO,
            initial_size: Decimal::ZERO,
            average_entry_price: Decimal::ZERO,
            total_size: Decimal::ZERO,
            averaging_count: 0,
            initial_margin: Decimal::ZERO,
            current_total_margin: Decimal::ZERO,
            accumulated_fees: Decimal::ZERO,
            peak_unrealized_pnl: Decimal::ZERO,
            stop_loss_price: None,
            use_breakeven_exit: false,
            frozen_config: None,
            active_trade_id: None,
            processed_orders: HashSet::new(),
            stagnation_started_at: None,
            last_trade_was_loss: false,
            last_close_time: None,
            last_reversal_time: None,
            last_closed_direction: None,
        }
    }
}

impl PositionState {
    /// Unrealized PnL at `mark_price`, signed by direction.
    pub fn unrealized_pnl(&self, mark_price: Decimal) -> Decimal {
        let diff = match self.direction {
            Direction::Long => mark_price - self.average_entry_price,
            Direction::Short => self.average_entry_price - mark_price,
        };
        diff * self.total_size
    }

    /// Reset all mutable position fields after a close, returning the
    /// instance to signal-watching mode. `was_loss` and `now` feed the
    /// cooldown logic for the *next* entry decision.
    pub fn reset_after_close(&mut self, was_loss: bool, now: DateTime<Utc>) {
        let last_reversal_time = self.last_reversal_time;
        let last_closed_direction = Some(self.direction);
        *self = PositionState {
            last_trade_was_loss: was_loss,
            last_close_time: Some(now),
            last_reversal_time,
            last_closed_direction,
            ..PositionState::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn unrealized_pnl_long_and_short() {
        let mut pos = PositionState {
            direction: Direction::Long,
            average_entry_price: dec!(100),
            total_size: dec!(2),
            ..PositionState::default()
        };
        assert_eq!(pos.unrealized_pnl(dec!(105)), dec!(10));

        pos.direction = Direction::Short;
        assert_eq!(pos.unrealized_pnl(dec!(95)), dec!(10));
    }

    #[test]
    fn reset_after_close_preserves_cooldown_fields_only() {
        let mut pos = PositionState {
            active: true,
            total_size: dec!(5),
            processed_orders: HashSet::from(["o1".to_string()]),
            ..PositionState::default()
        };
        let now = Utc::now();
        pos.reset_after_close(true, now);
        assert!(!pos.active);
        assert_eq!(pos.total_size, Decimal::ZERO);
        assert!(pos.processed_orders.is_empty());
        assert!(pos.last_trade_was_loss);
        assert_eq!(pos.last_close_time, Some(now));
    }
}
