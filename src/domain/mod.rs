// =============================================================================
// Core data model — instruments, orders, trades, and in-memory position state
// =============================================================================
//
// Every monetary or size quantity is a `rust_decimal::Decimal`. Binary floats
// cannot represent exchange tick/step grids exactly and silently accumulate
// error across averaging — not acceptable for position sizing or PnL.
// =============================================================================

mod instrument;
mod order;
mod position;
mod strategy_config;
mod trade;

pub use instrument::Instrument;
pub use order::{generate_client_order_id, Order, PENDING_EXCHANGE_ID};
pub use position::PositionState;
pub use strategy_config::StrategyConfig;
pub use trade::Trade;
