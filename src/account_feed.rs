// =============================================================================
// Account feed — authenticated private stream for one (user, account)
// =============================================================================
//
// One instance per (user_id, account_priority) with its own credentials.
// Subscribes to `order` and `position` topics on the private WebSocket.
// Order fills on this stream are intentionally NOT trusted as the
// authoritative Filled signal — that comes from the strategy's own
// API-polling confirmation right after it places an order (SPEC_FULL.md
// §4.7.3). This feed only reacts to Cancelled/Rejected transitions and to
// position-side-effects (manual closes, drift after a reconnect).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::PENDING_EXCHANGE_ID;
use crate::eventbus::{Event, EventBus};
use crate::exchange::ExchangeClient;
use crate::store::OrderStore;
use crate::types::{AccountPriority, Direction, OrderStatus, Side};

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

fn parse_order_status(raw: &str) -> Option<OrderStatus> {
    match raw {
        "New" | "Untriggered" => Some(OrderStatus::New),
        "PartiallyFilled" => Some(OrderStatus::PartiallyFilled),
        "Filled" => Some(OrderStatus::Filled),
        "Cancelled" | "Deactivated" => Some(OrderStatus::Cancelled),
        "Rejected" => Some(OrderStatus::Rejected),
        _ => None,
    }
}

fn parse_side(raw: &str) -> Option<Side> {
    match raw {
        "Buy" => Some(Side::Buy),
        "Sell" => Some(Side::Sell),
        _ => None,
    }
}

/// One authenticated private-stream connection, covering every symbol the
/// account trades (Bybit's private topics are account-wide, not per-symbol).
pub struct AccountFeed {
    user_id: i64,
    account_priority: AccountPriority,
    client: Arc<ExchangeClient>,
    store: Arc<dyn OrderStore>,
    bus: Arc<EventBus>,
    private_stream_url: String,
}

impl AccountFeed {
    pub fn new(
        user_id: i64,
        account_priority: AccountPriority,
        client: Arc<ExchangeClient>,
        store: Arc<dyn OrderStore>,
        bus: Arc<EventBus>,
        private_stream_url: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            account_priority,
            client,
            store,
            bus,
            private_stream_url: private_stream_url.into(),
        })
    }

    /// Drive this account's private stream forever, reconnecting with a
    /// 5-second pause on any disconnect or error.
    #[instrument(skip(self), name = "account_feed_run", fields(user_id = self.user_id, account = self.account_priority))]
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "account feed stream error — reconnecting in 5s");
            }
            tokio::time::sleep(RECONNECT_PAUSE).await;
        }
    }

    async fn run_once(&self) -> Result<()> {
        info!(url = %self.private_stream_url, "connecting to private account stream");
        let (ws_stream, _resp) = connect_async(&self.private_stream_url)
            .await
            .context("failed to connect to private account stream")?;
        let (mut write, mut read) = ws_stream.split();

        let (api_key, expires, sig) = self.client.ws_auth_frame();
        let auth_frame = json!({ "op": "auth", "args": [api_key, expires, sig] }).to_string();
        write
            .send(Message::Text(auth_frame))
            .await
            .context("failed to send auth frame")?;

        let subscribe_frame = json!({ "op": "subscribe", "args": ["order", "position"] }).to_string();
        write
            .send(Message::Text(subscribe_frame))
            .await
            .context("failed to send subscribe frame")?;

        info!("private account stream authenticated and subscribed");
        self.reconcile_on_connect().await;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = self.handle_message(&text).await {
                        debug!(error = %e, "ignoring unparseable account stream message");
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("private account stream read error"),
                None => {
                    warn!("private account stream ended");
                    return Ok(());
                }
            }
        }
    }

    /// Immediately after (re)auth, re-check every order this account has
    /// open or recently placed: if the exchange says Filled but we haven't
    /// observed that yet, synthesize an `OrderFilled` event so the strategy
    /// re-enters its (idempotent) fill handler.
    async fn reconcile_on_connect(&self) {
        let orders = self
            .store
            .get_active_orders_for_sync(self.user_id, self.account_priority)
            .await;
        for order in orders {
            if order.exchange_order_id == PENDING_EXCHANGE_ID {
                continue;
            }
            match self.client.get_order_status(&order.symbol, &order.exchange_order_id).await {
                Ok(Some(snapshot)) if snapshot.status == "Filled" => {
                    info!(
                        exchange_order_id = %order.exchange_order_id,
                        symbol = %order.symbol,
                        "reconnect reconciliation found a fill the strategy has not processed"
                    );
                    self.bus.publish(Event::OrderFilled {
                        user_id: self.user_id,
                        exchange_order_id: order.exchange_order_id.clone(),
                        symbol: order.symbol.clone(),
                        account_priority: self.account_priority,
                        side: order.side,
                        qty: snapshot.filled_qty,
                        price: snapshot.avg_price.unwrap_or(order.price.unwrap_or(Decimal::ZERO)),
                        fee: snapshot.fee,
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(
                    exchange_order_id = %order.exchange_order_id,
                    error = %e,
                    "reconnect reconciliation failed to fetch order status"
                ),
            }
        }
    }

    async fn handle_message(&self, text: &str) -> Result<()> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        let Some(topic) = root.get("topic").and_then(|t| t.as_str()) else {
            return Ok(());
        };
        match topic {
            "order" => self.handle_order_update(&root).await,
            "position" => self.handle_position_update(&root).await,
            _ => {}
        }
        Ok(())
    }

    async fn handle_order_update(&self, root: &serde_json::Value) {
        let Some(entries) = root.get("data").and_then(|d| d.as_array()) else {
            return;
        };
        for entry in entries {
            let Some(exchange_order_id) = entry.get("orderId").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(raw_status) = entry.get("orderStatus").and_then(|v| v.as_str()) else {
                continue;
            };

            let owned = self.store.get_order_by_exchange_id(exchange_order_id).await;
            let Some(owned_order) = owned else {
                debug!(exchange_order_id, "order update for unknown order — manual user action, ignoring");
                continue;
            };

            let Some(status) = parse_order_status(raw_status) else {
                continue;
            };

            match status {
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    if let Err(e) = self
                        .store
                        .update_order_status(exchange_order_id, status, None, None, None, None)
                        .await
                    {
                        warn!(exchange_order_id, error = %e, "failed to record order status update");
                        continue;
                    }
                    self.bus.publish(Event::OrderUpdate {
                        user_id: self.user_id,
                        exchange_order_id: exchange_order_id.to_string(),
                        symbol: owned_order.symbol.clone(),
                        status: raw_status.to_string(),
                    });
                }
                // Filled statuses are intentionally ignored here — the
                // strategy's own polling confirmation is authoritative.
                OrderStatus::Filled | OrderStatus::PartiallyFilled | OrderStatus::New | OrderStatus::Pending => {}
            }
        }
    }

    async fn handle_position_update(&self, root: &serde_json::Value) {
        let Some(entries) = root.get("data").and_then(|d| d.as_array()) else {
            return;
        };
        for entry in entries {
            let Some(symbol) = entry.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let size: Decimal = entry
                .get("size")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            let side = entry
                .get("side")
                .and_then(|v| v.as_str())
                .and_then(parse_side);
            let entry_price: Decimal = entry
                .get("entryPrice")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            let mark_price: Decimal = entry
                .get("markPrice")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);
            let unrealized_pnl: Decimal = entry
                .get("unrealisedPnl")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(Decimal::ZERO);

            self.bus.publish(Event::PositionUpdate {
                user_id: self.user_id,
                symbol: symbol.to_string(),
                account_priority: self.account_priority,
                direction: side.map(Direction::from).unwrap_or(Direction::Long),
                size,
                entry_price,
                mark_price,
                unrealized_pnl,
            });

            if size.is_zero() {
                self.handle_position_closed_to_zero(symbol).await;
            }
        }
    }

    async fn handle_position_closed_to_zero(&self, symbol: &str) {
        if self
            .store
            .has_pending_close_order(self.user_id, symbol, self.account_priority)
            .await
        {
            debug!(symbol, "position closed to zero via engine-authored close order — expected");
            return;
        }
        if self
            .store
            .has_unclosed_position(self.user_id, symbol, self.account_priority)
            .await
        {
            warn!(symbol, "position closed to zero with no matching engine close order — manual close");
            self.bus.publish(Event::PositionClosed {
                user_id: self.user_id,
                symbol: symbol.to_string(),
                account_priority: self.account_priority,
                closed_manually: true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_order_statuses() {
        assert_eq!(parse_order_status("New"), Some(OrderStatus::New));
        assert_eq!(parse_order_status("Cancelled"), Some(OrderStatus::Cancelled));
        assert_eq!(parse_order_status("Rejected"), Some(OrderStatus::Rejected));
        assert_eq!(parse_order_status("gibberish"), None);
    }

    #[test]
    fn parses_known_sides() {
        assert_eq!(parse_side("Buy"), Some(Side::Buy));
        assert_eq!(parse_side("Sell"), Some(Side::Sell));
        assert_eq!(parse_side("Flat"), None);
    }
}
