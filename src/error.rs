// =============================================================================
// Error taxonomy — typed kinds at component boundaries, anyhow at the edges
// =============================================================================

use thiserror::Error;

/// Errors surfaced by the exchange client and consumed by strategy/supervisor
/// code that needs to branch on *kind* rather than just log and bail.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),

    #[error("permanent exchange error (code {code}): {message}")]
    Permanent { code: i64, message: String },

    #[error("authentication failed (code {code}): {message}")]
    AuthFailure { code: i64, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response decode error: {0}")]
    Decode(String),
}

impl ExchangeError {
    /// Some exchange response codes indicate an outcome that is functionally
    /// a success for the caller (order already gone, value already set).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::Timeout(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::AuthFailure { .. })
    }
}

/// Errors raised by the order/trade store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate client_order_id: {0}")]
    DuplicateClientOrderId(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("attempted to open a second position for ({user_id}, {symbol}, {account_priority})")]
    DuplicateOpenTrade {
        user_id: i64,
        symbol: String,
        account_priority: u8,
    },

    #[error("trade not found: {0}")]
    TradeNotFound(uuid::Uuid),

    #[error("persistence io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised while driving a strategy instance's state machine.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("computed quantity below minimum order size for {symbol}")]
    QuantityBelowMinimum { symbol: String },

    #[error("unable to compute stop-loss for {symbol}: {reason}")]
    StopLossUnavailable { symbol: String, reason: String },

    #[error("instance is in defensive hold after a store integrity violation")]
    DefensiveHold,
}
