// =============================================================================
// Risk engine — per-user circuit breakers protecting capital
// =============================================================================
//
// Circuit breakers:
//   1. Daily Loss        — trips when cumulative daily PnL loss exceeds a
//                          percentage of starting capital.
//   2. Consecutive Losses — trips after N consecutive losing trades.
//   3. Max Drawdown       — trips when intra-day drawdown from peak equity
//                          exceeds the threshold.
//   4. Trade Limit        — trips when daily trade count reaches the cap.
//
// The engine resets its daily statistics automatically when the date rolls
// over (checked lazily on the next call, not via a background timer).
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

/// Snapshot of a single circuit breaker, for observability.
#[derive(Debug, Clone)]
pub struct CircuitBreakerInfo {
    pub name: &'static str,
    pub current: Decimal,
    pub limit: Decimal,
    pub tripped: bool,
}

struct Inner {
    daily_pnl: Decimal,
    consecutive_losses: u32,
    daily_trades_count: u32,
    daily_wins: u32,
    daily_losses: u32,
    max_drawdown_today: Decimal,
    peak_equity_today: Decimal,
    current_date: String,
    killed: bool,
}

/// One instance per user. Consulted by `SessionSupervisor` before spawning
/// new entries and updated by `StrategyInstance` on every trade close.
pub struct RiskEngine {
    state: RwLock<Inner>,
    capital: Decimal,
    max_daily_loss_pct: Decimal,
    max_consecutive_losses: u32,
    max_drawdown_pct: Decimal,
    max_daily_trades: u32,
}

impl RiskEngine {
    pub fn new(
        capital: Decimal,
        max_daily_loss_pct: Decimal,
        max_consecutive_losses: u32,
        max_drawdown_pct: Decimal,
        max_daily_trades: u32,
    ) -> Self {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        info!(
            %capital,
            %max_daily_loss_pct,
            max_consecutive_losses,
            %max_drawdown_pct,
            max_daily_trades,
            "risk engine initialized"
        );
        Self {
            state: RwLock::new(Inner {
                daily_pnl: Decimal::ZERO,
                consecutive_losses: 0,
                daily_trades_count: 0,
                daily_wins: 0,
                daily_losses: 0,
                max_drawdown_today: Decimal::ZERO,
                peak_equity_today: capital,
                current_date: today,
                killed: false,
            }),
            capital,
            max_daily_loss_pct,
            max_consecutive_losses,
            max_drawdown_pct,
            max_daily_trades,
        }
    }

    /// Record a completed trade's realized PnL and update all counters.
    pub fn record_trade_result(&self, pnl: Decimal) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        s.daily_pnl += pnl;
        s.daily_trades_count += 1;
        if pnl >= Decimal::ZERO {
            s.daily_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.daily_losses += 1;
            s.consecutive_losses += 1;
        }

        let current_equity = self.capital + s.daily_pnl;
        if current_equity > s.peak_equity_today {
            s.peak_equity_today = current_equity;
        }
        let drawdown = if s.peak_equity_today > Decimal::ZERO {
            (s.peak_equity_today - current_equity) / s.peak_equity_today
        } else {
            Decimal::ZERO
        };
        if drawdown > s.max_drawdown_today {
            s.max_drawdown_today = drawdown;
        }

        debug!(
            %pnl,
            daily_pnl = %s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            daily_trades = s.daily_trades_count,
            drawdown = %s.max_drawdown_today,
            "trade result recorded"
        );
    }

    /// Returns `(true, None)` if all breakers are clear, or `(false,
    /// Some(reason))` for the first tripped breaker found.
    pub fn can_trade(&self) -> (bool, Option<String>) {
        self.maybe_reset_daily();
        let s = self.state.read();

        if s.killed {
            return (false, Some("kill switch activated".to_string()));
        }

        let daily_loss_pct = if self.capital > Decimal::ZERO {
            (-s.daily_pnl) / self.capital
        } else {
            Decimal::ZERO
        };
        if daily_loss_pct >= self.max_daily_loss_pct {
            let msg = format!(
                "daily loss breaker tripped: {daily_loss_pct} lost (limit {})",
                self.max_daily_loss_pct
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if s.consecutive_losses >= self.max_consecutive_losses {
            let msg = format!(
                "consecutive losses breaker tripped: {} losses (limit {})",
                s.consecutive_losses, self.max_consecutive_losses
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if s.max_drawdown_today >= self.max_drawdown_pct {
            let msg = format!(
                "max drawdown breaker tripped: {} (limit {})",
                s.max_drawdown_today, self.max_drawdown_pct
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        if s.daily_trades_count >= self.max_daily_trades {
            let msg = format!(
                "trade limit breaker tripped: {} trades today (limit {})",
                s.daily_trades_count, self.max_daily_trades
            );
            warn!("{msg}");
            return (false, Some(msg));
        }

        (true, None)
    }

    pub fn circuit_breakers(&self) -> Vec<CircuitBreakerInfo> {
        self.maybe_reset_daily();
        let s = self.state.read();
        let daily_loss_pct = if self.capital > Decimal::ZERO {
            (-s.daily_pnl) / self.capital
        } else {
            Decimal::ZERO
        };
        vec![
            CircuitBreakerInfo {
                name: "daily_loss",
                current: daily_loss_pct.max(Decimal::ZERO),
                limit: self.max_daily_loss_pct,
                tripped: daily_loss_pct >= self.max_daily_loss_pct,
            },
            CircuitBreakerInfo {
                name: "consecutive_losses",
                current: Decimal::from(s.consecutive_losses),
                limit: Decimal::from(self.max_consecutive_losses),
                tripped: s.consecutive_losses >= self.max_consecutive_losses,
            },
            CircuitBreakerInfo {
                name: "max_drawdown",
                current: s.max_drawdown_today,
                limit: self.max_drawdown_pct,
                tripped: s.max_drawdown_today >= self.max_drawdown_pct,
            },
            CircuitBreakerInfo {
                name: "trade_limit",
                current: Decimal::from(s.daily_trades_count),
                limit: Decimal::from(self.max_daily_trades),
                tripped: s.daily_trades_count >= self.max_daily_trades,
            },
        ]
    }

    pub fn reset_daily(&self) {
        let mut s = self.state.write();
        let today = Utc::now().format("%Y-%m-%d").to_string();
        Self::do_reset(&mut s, &today, self.capital);
        info!(date = %today, "daily risk counters reset (manual)");
    }

    pub fn kill(&self) {
        let mut s = self.state.write();
        s.killed = true;
        warn!("kill switch activated — all trading halted for this user");
    }

    fn maybe_reset_daily(&self) {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        {
            let s = self.state.read();
            if s.current_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.current_date != today {
            info!(old_date = %s.current_date, new_date = %today, "date rolled — resetting daily risk counters");
            Self::do_reset(&mut s, &today, self.capital);
        }
    }

    fn do_reset(s: &mut Inner, date: &str, capital: Decimal) {
        s.daily_pnl = Decimal::ZERO;
        s.consecutive_losses = 0;
        s.daily_trades_count = 0;
        s.daily_wins = 0;
        s.daily_losses = 0;
        s.max_drawdown_today = Decimal::ZERO;
        s.peak_equity_today = capital;
        s.current_date = date.to_string();
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("capital", &self.capital)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn engine() -> RiskEngine {
        RiskEngine::new(dec!(1000), dec!(0.03), 5, dec!(0.05), 50)
    }

    #[test]
    fn trips_daily_loss_breaker() {
        let e = engine();
        e.record_trade_result(dec!(-40));
        let (allowed, reason) = e.can_trade();
        assert!(!allowed);
        assert!(reason.unwrap().contains("daily loss"));
    }

    #[test]
    fn trips_consecutive_losses_breaker() {
        let e = engine();
        for _ in 0..5 {
            e.record_trade_result(dec!(-1));
        }
        let (allowed, reason) = e.can_trade();
        assert!(!allowed);
        assert!(reason.unwrap().contains("consecutive losses"));
    }

    #[test]
    fn win_resets_consecutive_losses() {
        let e = engine();
        e.record_trade_result(dec!(-1));
        e.record_trade_result(dec!(-1));
        e.record_trade_result(dec!(5));
        let (allowed, _) = e.can_trade();
        assert!(allowed);
    }

    #[test]
    fn kill_switch_blocks_trading() {
        let e = engine();
        e.kill();
        let (allowed, reason) = e.can_trade();
        assert!(!allowed);
        assert_eq!(reason.unwrap(), "kill switch activated");
    }
}
