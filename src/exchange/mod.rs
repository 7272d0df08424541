mod client;
mod instrument_cache;

pub use client::{ClosedPnl, ExchangeClient, Kline, OrderAck, OrderStatusSnapshot, PositionSnapshot, Ticker, WalletBalance};
pub use instrument_cache::InstrumentCache;
