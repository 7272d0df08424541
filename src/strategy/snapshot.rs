// =============================================================================
// Strategy instance persistent snapshot — SnapshotCache-backed
// =============================================================================

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{PositionState, StrategyConfig};
use crate::types::Direction;

/// Everything needed to reconstruct a `PositionState` after a restart,
/// per SPEC_FULL.md §4.7.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub active: bool,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub position_size: Decimal,
    pub averaging_count: u32,
    pub total_size: Decimal,
    pub average_entry_price: Decimal,
    pub initial_margin: Decimal,
    pub current_total_margin: Decimal,
    pub use_breakeven_exit: bool,
    pub stagnation_started_at: Option<DateTime<Utc>>,
    pub processed_orders: HashSet<String>,
    pub active_trade_db_id: Option<Uuid>,
    pub frozen_config: Option<StrategyConfig>,
    pub cumulative_pnl: Decimal,
    pub wins: u32,
    pub losses: u32,
}

impl StrategySnapshot {
    pub fn from_position(position: &PositionState, cumulative_pnl: Decimal, wins: u32, losses: u32) -> Self {
        Self {
            active: position.active,
            direction: position.direction,
            entry_price: position.initial_entry_price,
            position_size: position.initial_size,
            averaging_count: position.averaging_count,
            total_size: position.total_size,
            average_entry_price: position.average_entry_price,
            initial_margin: position.initial_margin,
            current_total_margin: position.current_total_margin,
            use_breakeven_exit: position.use_breakeven_exit,
            stagnation_started_at: position.stagnation_started_at,
            processed_orders: position.processed_orders.clone(),
            active_trade_db_id: position.active_trade_id,
            frozen_config: position.frozen_config.clone(),
            cumulative_pnl,
            wins,
            losses,
        }
    }

    /// Rehydrate a `PositionState` from this snapshot. Cooldown-only fields
    /// (`last_close_time`, `last_reversal_time`, `last_trade_was_loss`,
    /// `last_closed_direction`) are not part of the snapshot — they only
    /// matter while inactive, and an inactive snapshot carries no position
    /// to restore anyway.
    pub fn into_position(self) -> PositionState {
        PositionState {
            active: self.active,
            direction: self.direction,
            initial_entry_price: self.entry_price,
            initial_size: self.position_size,
            average_entry_price: self.average_entry_price,
            total_size: self.total_size,
            averaging_count: self.averaging_count,
            initial_margin: self.initial_margin,
            current_total_margin: self.current_total_margin,
            accumulated_fees: Decimal::ZERO,
            peak_unrealized_pnl: Decimal::ZERO,
            stop_loss_price: None,
            use_breakeven_exit: self.use_breakeven_exit,
            frozen_config: self.frozen_config,
            active_trade_id: self.active_trade_db_id,
            processed_orders: self.processed_orders,
            stagnation_started_at: self.stagnation_started_at,
            ..PositionState::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_trips_through_json() {
        let position = PositionState {
            active: true,
            direction: Direction::Long,
            total_size: dec!(2),
            average_entry_price: dec!(100),
            ..PositionState::default()
        };
        let snapshot = StrategySnapshot::from_position(&position, dec!(50), 3, 1);
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: StrategySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.total_size, dec!(2));
        assert_eq!(restored.wins, 3);

        let rehydrated = restored.into_position();
        assert!(rehydrated.active);
        assert_eq!(rehydrated.average_entry_price, dec!(100));
    }
}
