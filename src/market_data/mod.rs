// =============================================================================
// Market data hub — one shared public-stream connection, fanned out by symbol
// =============================================================================
//
// A single WebSocket connection to the exchange's public linear-perpetual
// stream carries `publicTrade` and `kline` topics for every symbol any user
// is currently interested in. Subscriber bookkeeping is refcounted per
// symbol: the first interested user triggers a `subscribe` frame, the last
// one leaving triggers `unsubscribe`. Reconnects pause 5 seconds and
// re-subscribe to every symbol still tracked.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::eventbus::{Event, EventBus};

const PUBLIC_STREAM_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// Normalize the exchange's raw kline interval token (`"1"`, `"5"`, `"60"`,
/// ...) to the canonical form used everywhere else in this crate (`"1m"`,
/// `"5m"`, `"1h"`, ...).
fn normalize_interval(raw: &str) -> String {
    match raw {
        "1" => "1m".to_string(),
        "3" => "3m".to_string(),
        "5" => "5m".to_string(),
        "15" => "15m".to_string(),
        "30" => "30m".to_string(),
        "60" => "1h".to_string(),
        "120" => "2h".to_string(),
        "240" => "4h".to_string(),
        "D" => "1d".to_string(),
        "W" => "1w".to_string(),
        other => other.to_string(),
    }
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

struct Inner {
    /// symbol -> set of interested user ids.
    subscribers: HashMap<String, HashSet<i64>>,
}

/// Shared, process-wide handle to the public market data stream. Cloned
/// `Arc`s are handed to every `StrategyInstance` so it can subscribe for
/// the symbols it trades without knowing about the connection itself.
pub struct MarketDataHub {
    bus: Arc<EventBus>,
    inner: RwLock<Inner>,
    sink: AsyncMutex<Option<WsSink>>,
}

impl MarketDataHub {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            inner: RwLock::new(Inner {
                subscribers: HashMap::new(),
            }),
            sink: AsyncMutex::new(None),
        })
    }

    /// Register interest in `symbol` on behalf of `user_id`. Sends a live
    /// subscribe frame if the connection is up and this is the first
    /// subscriber for the symbol.
    pub async fn subscribe(&self, symbol: &str, user_id: i64) {
        let first_subscriber = {
            let mut inner = self.inner.write();
            let set = inner.subscribers.entry(symbol.to_string()).or_default();
            let was_empty = set.is_empty();
            set.insert(user_id);
            was_empty
        };
        if first_subscriber {
            self.send_subscribe_frame(&[symbol]).await;
        }
    }

    /// Remove `user_id`'s interest in `symbol`. Sends an unsubscribe frame
    /// if this was the last remaining subscriber.
    pub async fn unsubscribe(&self, symbol: &str, user_id: i64) {
        let last_subscriber = {
            let mut inner = self.inner.write();
            let Some(set) = inner.subscribers.get_mut(symbol) else {
                return;
            };
            set.remove(&user_id);
            let now_empty = set.is_empty();
            if now_empty {
                inner.subscribers.remove(symbol);
            }
            now_empty
        };
        if last_subscriber {
            self.send_unsubscribe_frame(&[symbol]).await;
        }
    }

    fn known_symbols(&self) -> Vec<String> {
        self.inner.read().subscribers.keys().cloned().collect()
    }

    fn interested_users(&self, symbol: &str) -> Vec<i64> {
        self.inner
            .read()
            .subscribers
            .get(symbol)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn send_subscribe_frame(&self, symbols: &[&str]) {
        self.send_topic_frame("subscribe", symbols).await;
    }

    async fn send_unsubscribe_frame(&self, symbols: &[&str]) {
        self.send_topic_frame("unsubscribe", symbols).await;
    }

    async fn send_topic_frame(&self, op: &str, symbols: &[&str]) {
        let mut args = Vec::with_capacity(symbols.len() * 3);
        for sym in symbols {
            args.push(format!("publicTrade.{sym}"));
            args.push(format!("kline.5.{sym}"));
            args.push(format!("kline.1.{sym}"));
        }
        let frame = json!({ "op": op, "args": args }).to_string();
        let mut guard = self.sink.lock().await;
        if let Some(sink) = guard.as_mut() {
            if let Err(e) = sink.send(Message::Text(frame)).await {
                warn!(error = %e, "failed to send {op} frame on market data stream");
            }
        }
    }

    /// Drive the public stream connection. Reconnects forever on error or
    /// disconnect; returns only if the process is shutting down (it never
    /// does on its own — callers run this in a dedicated task).
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "market data stream error — reconnecting in 5s");
            }
            *self.sink.lock().await = None;
            tokio::time::sleep(RECONNECT_PAUSE).await;
        }
    }

    async fn run_once(&self) -> Result<()> {
        info!(url = PUBLIC_STREAM_URL, "connecting to public market data stream");
        let (ws_stream, _resp) = connect_async(PUBLIC_STREAM_URL)
            .await
            .context("failed to connect to public market data stream")?;
        info!("public market data stream connected");

        let (write, mut read) = ws_stream.split();
        *self.sink.lock().await = Some(write);

        let known = self.known_symbols();
        if !known.is_empty() {
            let refs: Vec<&str> = known.iter().map(String::as_str).collect();
            self.send_subscribe_frame(&refs).await;
        }

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = self.handle_message(&text) {
                        debug!(error = %e, "ignoring unparseable market data message");
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return Err(e).context("market data stream read error");
                }
                None => {
                    warn!("public market data stream ended");
                    return Ok(());
                }
            }
        }
    }

    fn handle_message(&self, text: &str) -> Result<()> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        let Some(topic) = root.get("topic").and_then(|t| t.as_str()) else {
            return Ok(());
        };

        if let Some(symbol) = topic.strip_prefix("publicTrade.") {
            self.handle_trade_payload(symbol, &root);
        } else if let Some(rest) = topic.strip_prefix("kline.") {
            let mut parts = rest.splitn(2, '.');
            let raw_interval = parts.next().unwrap_or_default();
            let symbol = parts.next().unwrap_or_default();
            self.handle_kline_payload(symbol, raw_interval, &root);
        }
        Ok(())
    }

    fn handle_trade_payload(&self, symbol: &str, root: &serde_json::Value) {
        let Some(entries) = root.get("data").and_then(|d| d.as_array()) else {
            return;
        };
        let Some(last) = entries.last() else { return };
        let Some(price_str) = last.get("p").and_then(|v| v.as_str()) else {
            return;
        };
        let Ok(price) = price_str.parse::<Decimal>() else {
            return;
        };
        for user_id in self.interested_users(symbol) {
            self.bus.publish(Event::PriceUpdate {
                user_id,
                symbol: symbol.to_string(),
                price,
            });
        }
    }

    fn handle_kline_payload(&self, symbol: &str, raw_interval: &str, root: &serde_json::Value) {
        let Some(entries) = root.get("data").and_then(|d| d.as_array()) else {
            return;
        };
        for entry in entries {
            let confirmed = entry.get("confirm").and_then(|v| v.as_bool()).unwrap_or(false);
            if !confirmed {
                continue;
            }
            let Some(close_str) = entry.get("close").and_then(|v| v.as_str()) else {
                continue;
            };
            let Ok(close) = close_str.parse::<Decimal>() else {
                continue;
            };
            let interval = normalize_interval(raw_interval);
            let confirmed_at = chrono::Utc::now();
            for user_id in self.interested_users(symbol) {
                self.bus.publish(Event::NewCandle {
                    user_id,
                    symbol: symbol.to_string(),
                    interval: interval.clone(),
                    close,
                    confirmed_at,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_intervals() {
        assert_eq!(normalize_interval("1"), "1m");
        assert_eq!(normalize_interval("5"), "5m");
        assert_eq!(normalize_interval("60"), "1h");
        assert_eq!(normalize_interval("D"), "1d");
    }

    #[test]
    fn passes_through_unknown_interval() {
        assert_eq!(normalize_interval("weird"), "weird");
    }

    #[tokio::test]
    async fn subscribe_tracks_first_and_last_subscriber() {
        let bus = Arc::new(EventBus::new());
        let hub = MarketDataHub::new(bus);
        hub.subscribe("BTCUSDT", 1).await;
        hub.subscribe("BTCUSDT", 2).await;
        assert_eq!(hub.interested_users("BTCUSDT").len(), 2);
        hub.unsubscribe("BTCUSDT", 1).await;
        assert_eq!(hub.interested_users("BTCUSDT").len(), 1);
        hub.unsubscribe("BTCUSDT", 2).await;
        assert!(hub.known_symbols().is_empty());
    }

    #[test]
    fn handle_trade_payload_emits_last_price_only() {
        let bus = Arc::new(EventBus::new());
        let hub = MarketDataHub::new(bus.clone());
        {
            let mut inner = hub.inner.write();
            inner
                .subscribers
                .entry("BTCUSDT".to_string())
                .or_default()
                .insert(7);
        }
        let (mut rx, _handle) = bus.subscribe(Some(7));
        let payload = json!({
            "topic": "publicTrade.BTCUSDT",
            "data": [
                { "p": "100.5" },
                { "p": "101.25" }
            ]
        });
        hub.handle_trade_payload("BTCUSDT", &payload);
        let event = rx.try_recv().expect("event published");
        match event {
            Event::PriceUpdate { price, .. } => assert_eq!(price, "101.25".parse::<Decimal>().unwrap()),
            _ => panic!("unexpected event"),
        }
    }

    #[test]
    fn handle_kline_payload_skips_unconfirmed_candles() {
        let bus = Arc::new(EventBus::new());
        let hub = MarketDataHub::new(bus.clone());
        {
            let mut inner = hub.inner.write();
            inner
                .subscribers
                .entry("ETHUSDT".to_string())
                .or_default()
                .insert(3);
        }
        let (mut rx, _handle) = bus.subscribe(Some(3));
        let payload = json!({
            "topic": "kline.5.ETHUSDT",
            "data": [
                { "confirm": false, "close": "10.0" },
                { "confirm": true, "close": "11.5" }
            ]
        });
        hub.handle_kline_payload("ETHUSDT", "5", &payload);
        let event = rx.try_recv().expect("one confirmed candle published");
        match event {
            Event::NewCandle { interval, close, .. } => {
                assert_eq!(interval, "5m");
                assert_eq!(close, "11.5".parse::<Decimal>().unwrap());
            }
            _ => panic!("unexpected event"),
        }
        assert!(rx.try_recv().is_err());
    }
}
