// =============================================================================
// Runtime configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable that is not frozen into a position at entry time (see
// `domain::StrategyConfig`) lives here. Persistence uses an atomic
// tmp-then-rename write so a crash mid-save never corrupts the file on
// disk, and every field carries a serde default so that adding a field
// never breaks loading an older config written before it existed.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]
}

fn default_max_accounts_per_user() -> u8 {
    3
}

fn default_cooldown_seconds() -> u64 {
    60
}

fn default_reversal_cooldown_seconds() -> u64 {
    60
}

fn default_signal_confirmations_required() -> u32 {
    2
}

fn default_analysis_interval() -> String {
    "5m".to_string()
}

fn default_max_daily_loss_pct() -> f64 {
    3.0
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_max_drawdown_pct() -> f64 {
    5.0
}

fn default_max_daily_trades() -> u32 {
    50
}

fn default_instrument_cache_ttl_secs() -> u64 {
    300
}

/// Top-level engine configuration, shared across all users and sessions.
///
/// Every field has a serde default so older JSON files missing newer fields
/// still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,

    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_max_accounts_per_user")]
    pub max_accounts_per_user: u8,

    #[serde(default = "default_analysis_interval")]
    pub analysis_interval: String,

    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    #[serde(default = "default_reversal_cooldown_seconds")]
    pub reversal_cooldown_seconds: u64,

    #[serde(default = "default_signal_confirmations_required")]
    pub signal_confirmations_required: u32,

    #[serde(default = "default_instrument_cache_ttl_secs")]
    pub instrument_cache_ttl_secs: u64,

    // --- risk defaults, overridable per user by RiskEngine construction ---
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,

    /// Users whose sessions were marked `autotrade_enabled` the last time
    /// this config was saved. `RecoveryCoordinator` reads this list at boot
    /// to know which users to rehydrate; `SessionSupervisor` keeps it in
    /// sync as sessions start and stop.
    #[serde(default)]
    pub active_user_ids: Vec<i64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            max_accounts_per_user: default_max_accounts_per_user(),
            analysis_interval: default_analysis_interval(),
            cooldown_seconds: default_cooldown_seconds(),
            reversal_cooldown_seconds: default_reversal_cooldown_seconds(),
            signal_confirmations_required: default_signal_confirmations_required(),
            instrument_cache_ttl_secs: default_instrument_cache_ttl_secs(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_daily_trades: default_max_daily_trades(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, trading_mode = %config.trading_mode, "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) so a crash mid-write cannot corrupt
    /// the file already on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialize runtime config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.max_accounts_per_user, 3);
        assert_eq!(cfg.signal_confirmations_required, 2);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.cooldown_seconds, 60);
        assert_eq!(cfg.max_consecutive_losses, 5);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETHUSDT"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.max_daily_trades, 50);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("scalper-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime.json");
        let cfg = RuntimeConfig::default();
        cfg.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(cfg.symbols, loaded.symbols);
        std::fs::remove_dir_all(&dir).ok();
    }
}
