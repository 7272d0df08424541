// =============================================================================
// External strategy subsystems — signal analysis and spike detection
// =============================================================================
//
// Both are out of scope as *implementations* (SPEC_FULL.md §1): the trading
// engine depends only on these trait contracts. The default implementations
// below are deterministic placeholders that make `StrategyInstance`
// independently testable without a real EMA/RSI/regime stack behind them.
// =============================================================================

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Long,
    Short,
    Hold,
}

#[async_trait]
pub trait SignalAnalyzer: Send + Sync {
    /// Evaluate a confirmed candle close on the analysis interval and
    /// return a directional signal.
    async fn analyze(&self, symbol: &str, close: Decimal) -> Signal;
}

/// Always holds. Safe default: a production deployment supplies the real
/// EMA/RSI/ATR/regime-aware analyzer; wiring it in is a configuration
/// change, not a code change, at the `StrategyInstance` construction site.
pub struct NeverSignalAnalyzer;

#[async_trait]
impl SignalAnalyzer for NeverSignalAnalyzer {
    async fn analyze(&self, _symbol: &str, _close: Decimal) -> Signal {
        Signal::Hold
    }
}

/// Outcome of consulting the spike detector for a proposed entry signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpikeAdvice {
    pub should_enter: bool,
    pub final_signal: Signal,
    pub reversed: bool,
}

#[async_trait]
pub trait SpikeDetector: Send + Sync {
    /// Feed a confirmed 1-minute close into the detector's bounded history.
    async fn observe(&self, symbol: &str, close: Decimal);

    /// Given a proposed entry signal, advise whether to enter and with
    /// which (possibly reversed) final signal.
    async fn advise(&self, symbol: &str, proposed: Signal) -> SpikeAdvice;
}

/// Always enters, never reverses. Keeps a bounded rolling history per
/// symbol so a real implementation's shape (buffer of recent 1m closes) is
/// already in place to be swapped in.
pub struct PassthroughSpikeDetector {
    history: Mutex<std::collections::HashMap<String, VecDeque<Decimal>>>,
    capacity: usize,
}

impl PassthroughSpikeDetector {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(std::collections::HashMap::new()),
            capacity,
        }
    }
}

impl Default for PassthroughSpikeDetector {
    fn default() -> Self {
        Self::new(120)
    }
}

#[async_trait]
impl SpikeDetector for PassthroughSpikeDetector {
    async fn observe(&self, symbol: &str, close: Decimal) {
        let mut history = self.history.lock();
        let buf = history.entry(symbol.to_string()).or_default();
        buf.push_back(close);
        while buf.len() > self.capacity {
            buf.pop_front();
        }
    }

    async fn advise(&self, _symbol: &str, proposed: Signal) -> SpikeAdvice {
        SpikeAdvice {
            should_enter: true,
            final_signal: proposed,
            reversed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn never_analyzer_always_holds() {
        let analyzer = NeverSignalAnalyzer;
        assert_eq!(analyzer.analyze("BTCUSDT", dec!(100)).await, Signal::Hold);
    }

    #[tokio::test]
    async fn passthrough_detector_never_reverses() {
        let detector = PassthroughSpikeDetector::default();
        detector.observe("BTCUSDT", dec!(100)).await;
        let advice = detector.advise("BTCUSDT", Signal::Long).await;
        assert!(advice.should_enter);
        assert!(!advice.reversed);
        assert_eq!(advice.final_signal, Signal::Long);
    }

    #[tokio::test]
    async fn history_buffer_trims_to_capacity() {
        let detector = PassthroughSpikeDetector::new(3);
        for i in 0..10 {
            detector.observe("ETHUSDT", Decimal::from(i)).await;
        }
        let history = detector.history.lock();
        assert_eq!(history.get("ETHUSDT").unwrap().len(), 3);
    }
}
