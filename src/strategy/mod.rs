// =============================================================================
// Strategy — per-slot trading state machine and its pluggable subsystems
// =============================================================================

mod instance;
mod signal;
pub mod snapshot;

pub use instance::{InstanceState, StrategyInstance, StrategyInstanceDeps};
pub use signal::{NeverSignalAnalyzer, PassthroughSpikeDetector, Signal, SignalAnalyzer, SpikeAdvice, SpikeDetector};
