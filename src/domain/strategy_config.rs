use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

fn default_averaging_trigger_pct() -> Decimal {
    Decimal::new(8, 1) // 0.8%
}

fn default_averaging_multiplier() -> Decimal {
    Decimal::new(15, 1) // 1.5x
}

fn default_averaging_stop_loss_pct() -> Decimal {
    Decimal::new(4, 1) // 0.4%
}

fn default_max_averaging_count() -> u32 {
    2
}

fn default_stagnation_observation_seconds() -> u64 {
    180
}

fn default_stagnation_multiplier() -> Decimal {
    Decimal::ONE
}

fn default_true() -> bool {
    true
}

/// Per-(user, symbol, strategy) tunables. A copy is snapshotted into
/// `PositionState::frozen_config` at entry and held immutable for the
/// lifetime of that position so mid-trade config edits cannot alter
/// in-flight behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub order_amount: Decimal,
    pub leverage: u32,

    #[serde(default = "default_averaging_trigger_pct")]
    pub averaging_trigger_pct: Decimal,
    #[serde(default = "default_averaging_multiplier")]
    pub averaging_multiplier: Decimal,
    #[serde(default = "default_averaging_stop_loss_pct")]
    pub averaging_stop_loss_pct: Decimal,
    #[serde(default = "default_max_averaging_count")]
    pub max_averaging_count: u32,

    #[serde(default = "default_true")]
    pub enable_stop_loss: bool,
    #[serde(default = "default_true")]
    pub enable_averaging: bool,
    #[serde(default = "default_true")]
    pub enable_stagnation_detector: bool,

    /// (min_loss_pct, max_loss_pct) band the price must remain within for
    /// the stagnation detector to accumulate observation time.
    #[serde(default = "default_stagnation_range")]
    pub stagnation_range: (Decimal, Decimal),
    #[serde(default = "default_stagnation_observation_seconds")]
    pub stagnation_observation_seconds: u64,
    #[serde(default = "default_stagnation_multiplier")]
    pub stagnation_multiplier: Decimal,
}

fn default_stagnation_range() -> (Decimal, Decimal) {
    (Decimal::new(2, 1), Decimal::new(6, 1)) // 0.2% .. 0.6%
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            order_amount: Decimal::new(100, 0),
            leverage: 10,
            averaging_trigger_pct: default_averaging_trigger_pct(),
            averaging_multiplier: default_averaging_multiplier(),
            averaging_stop_loss_pct: default_averaging_stop_loss_pct(),
            max_averaging_count: default_max_averaging_count(),
            enable_stop_loss: true,
            enable_averaging: true,
            enable_stagnation_detector: true,
            stagnation_range: default_stagnation_range(),
            stagnation_observation_seconds: default_stagnation_observation_seconds(),
            stagnation_multiplier: default_stagnation_multiplier(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = StrategyConfig::default();
        assert_eq!(cfg.max_averaging_count, 2);
        assert!(cfg.enable_stop_loss);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{ "order_amount": "50", "leverage": 5 }"#;
        let cfg: StrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.leverage, 5);
        assert_eq!(cfg.max_averaging_count, 2);
        assert!(cfg.enable_averaging);
    }
}
