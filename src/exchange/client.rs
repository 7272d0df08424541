// =============================================================================
// Exchange client — HMAC-SHA256 signed REST access to one (user, account)
// =============================================================================
//
// SECURITY: the secret is never logged or serialized. Every signed request
// carries X-BAPI-API-KEY, X-BAPI-SIGN, X-BAPI-TIMESTAMP and a 5000 ms
// recv-window to tolerate clock drift between this process and the
// exchange.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::domain::Instrument;
use crate::error::ExchangeError;
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;
const MIN_REQUEST_SPACING: Duration = Duration::from_millis(100);
const MAX_RETRIES: u32 = 3;

/// Response codes that mean "the requested end state already holds" rather
/// than failure, per the exchange's documented idempotency exceptions.
const CODE_ORDER_ALREADY_GONE: i64 = 110001;
const CODE_LEVERAGE_NOT_MODIFIED: i64 = 110043;
const CODE_TRADING_STOP_NOT_MODIFIED: i64 = 34040;

fn is_auth_fatal(code: i64) -> bool {
    matches!(code, 10003 | 10004)
}

#[derive(Debug, Deserialize)]
struct RetEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: T,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ticker {
    #[serde(rename = "lastPrice", with = "rust_decimal::serde::str")]
    pub last: Decimal,
    #[serde(rename = "bid1Price", with = "rust_decimal::serde::str")]
    pub bid: Decimal,
    #[serde(rename = "ask1Price", with = "rust_decimal::serde::str")]
    pub ask: Decimal,
    #[serde(rename = "volume24h", with = "rust_decimal::serde::str")]
    pub volume_24h: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub size: Decimal,
    #[serde(rename = "avgPrice", with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    #[serde(rename = "breakEvenPrice", default, with = "rust_decimal::serde::str_option")]
    pub break_even_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ClosedPnl {
    pub closed_pnl: Decimal,
    pub exit_price: Decimal,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Kline {
    pub start_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Account-wide balance snapshot, USDT-denominated.
#[derive(Debug, Clone, Default)]
pub struct WalletBalance {
    pub equity: Decimal,
    pub available: Decimal,
    pub unrealized: Decimal,
}

/// Map this crate's canonical interval token ("5m", "1h", ...), the same
/// spelling `MarketDataHub` normalizes incoming kline topics to, back to the
/// exchange's raw `interval` query parameter ("5", "60", "D", ...).
fn bybit_interval_token(interval: &str) -> &str {
    match interval {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "2h" => "120",
        "4h" => "240",
        "1d" => "D",
        "1w" => "W",
        other => other,
    }
}

/// Signed REST access to the exchange, bound to exactly one (user, account).
/// Never shared across accounts — each account gets its own client built
/// with its own credentials.
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    last_request_at: Mutex<HashMap<&'static str, std::time::Instant>>,
    request_seq: AtomicI64,
}

impl ExchangeClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .timeout(Duration::from_secs(60))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.into(),
            http,
            last_request_at: Mutex::new(HashMap::new()),
            request_seq: AtomicI64::new(0),
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Enforce a minimum spacing between requests to the same logical
    /// endpoint, regardless of retries elsewhere.
    async fn throttle(&self, endpoint: &'static str) {
        let wait = {
            let mut last = self.last_request_at.lock();
            let now = std::time::Instant::now();
            let wait = last
                .get(endpoint)
                .and_then(|t| MIN_REQUEST_SPACING.checked_sub(now.duration_since(*t)));
            last.insert(endpoint, now);
            wait
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }

    async fn signed_get<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        query: &str,
    ) -> Result<T, ExchangeError> {
        self.execute_with_retry(endpoint, || async {
            let ts = Self::timestamp_ms();
            let payload = format!("{ts}{}{RECV_WINDOW_MS}{query}", self.api_key);
            let sig = self.sign(&payload);
            let url = if query.is_empty() {
                format!("{}{path}", self.base_url)
            } else {
                format!("{}{path}?{query}", self.base_url)
            };
            self.throttle(endpoint).await;
            let resp = self
                .http
                .get(&url)
                .header("X-BAPI-API-KEY", &self.api_key)
                .header("X-BAPI-SIGN", sig)
                .header("X-BAPI-SIGN-TYPE", "2")
                .header("X-BAPI-TIMESTAMP", ts.to_string())
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string())
                .send()
                .await
                .map_err(ExchangeError::Transport)?;
            self.decode_envelope(resp).await
        })
        .await
    }

    async fn signed_post<B: Serialize, T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        path: &str,
        body: &B,
    ) -> Result<T, ExchangeError> {
        self.execute_with_retry(endpoint, || async {
            let ts = Self::timestamp_ms();
            let body_json = serde_json::to_string(body)
                .map_err(|e| ExchangeError::Decode(e.to_string()))?;
            let payload = format!("{ts}{}{RECV_WINDOW_MS}{body_json}", self.api_key);
            let sig = self.sign(&payload);
            let url = format!("{}{path}", self.base_url);
            self.throttle(endpoint).await;
            let resp = self
                .http
                .post(&url)
                .header("X-BAPI-API-KEY", &self.api_key)
                .header("X-BAPI-SIGN", sig)
                .header("X-BAPI-SIGN-TYPE", "2")
                .header("X-BAPI-TIMESTAMP", ts.to_string())
                .header("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string())
                .header("Content-Type", "application/json")
                .body(body_json)
                .send()
                .await
                .map_err(ExchangeError::Transport)?;
            self.decode_envelope(resp).await
        })
        .await
    }

    async fn decode_envelope<T: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<T, ExchangeError> {
        let status = resp.status();
        let text = resp.text().await.map_err(ExchangeError::Transport)?;
        if !status.is_success() {
            return Err(ExchangeError::Transient(format!("http {status}: {text}")));
        }
        let envelope: RetEnvelope<T> =
            serde_json::from_str(&text).map_err(|e| ExchangeError::Decode(format!("{e}: {text}")))?;
        if envelope.ret_code == 0 {
            return Ok(envelope.result);
        }
        if is_auth_fatal(envelope.ret_code) {
            return Err(ExchangeError::AuthFailure {
                code: envelope.ret_code,
                message: envelope.ret_msg,
            });
        }
        Err(ExchangeError::Permanent {
            code: envelope.ret_code,
            message: envelope.ret_msg,
        })
    }

    /// Retry transient errors up to `MAX_RETRIES` times with linear backoff.
    /// Fatal auth errors never retry.
    async fn execute_with_retry<T, F, Fut>(&self, endpoint: &'static str, mut f: F) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    let delay = Duration::from_millis(200 * attempt as u64);
                    warn!(endpoint, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying exchange request");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::get_ticker")]
    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        #[derive(Deserialize)]
        struct List {
            list: Vec<Ticker>,
        }
        let query = format!("category=linear&symbol={symbol}");
        let list: List = self.signed_get("market.tickers", "/v5/market/tickers", &query).await?;
        list.list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Decode("empty ticker list".into()))
    }

    #[instrument(skip(self), name = "exchange::get_instruments")]
    pub async fn get_instruments(&self) -> Result<HashMap<String, Instrument>, ExchangeError> {
        #[derive(Deserialize)]
        struct RawInstrument {
            symbol: String,
            status: String,
            #[serde(rename = "priceFilter")]
            price_filter: RawPriceFilter,
            #[serde(rename = "lotSizeFilter")]
            lot_size_filter: RawLotSizeFilter,
        }
        #[derive(Deserialize)]
        struct RawPriceFilter {
            #[serde(rename = "tickSize", with = "rust_decimal::serde::str")]
            tick_size: Decimal,
        }
        #[derive(Deserialize)]
        struct RawLotSizeFilter {
            #[serde(rename = "qtyStep", with = "rust_decimal::serde::str")]
            qty_step: Decimal,
            #[serde(rename = "minOrderQty", with = "rust_decimal::serde::str")]
            min_order_qty: Decimal,
        }
        #[derive(Deserialize)]
        struct Page {
            list: Vec<RawInstrument>,
            #[serde(rename = "nextPageCursor")]
            next_page_cursor: String,
        }

        let mut out = HashMap::new();
        let mut cursor = String::new();
        loop {
            let query = if cursor.is_empty() {
                "category=linear&limit=1000".to_string()
            } else {
                format!("category=linear&limit=1000&cursor={cursor}")
            };
            let page: Page = self
                .signed_get("market.instruments-info", "/v5/market/instruments-info", &query)
                .await?;
            let done = page.next_page_cursor.is_empty();
            for raw in page.list {
                out.insert(
                    raw.symbol.clone(),
                    Instrument {
                        symbol: raw.symbol,
                        tick_size: raw.price_filter.tick_size,
                        qty_step: raw.lot_size_filter.qty_step,
                        min_order_qty: raw.lot_size_filter.min_order_qty,
                        status: raw.status,
                    },
                );
            }
            if done {
                break;
            }
            cursor = page.next_page_cursor;
        }
        debug!(count = out.len(), "instrument metadata fetched");
        Ok(out)
    }

    /// Fetch the most recent `limit` confirmed klines for `symbol` at
    /// `interval` (canonical form, e.g. "5m"), ordered ascending by
    /// `start_time`. The exchange itself returns newest-first.
    #[instrument(skip(self), name = "exchange::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>, ExchangeError> {
        #[derive(Deserialize)]
        struct List {
            list: Vec<[String; 7]>,
        }
        let token = bybit_interval_token(interval);
        let query = format!("category=linear&symbol={symbol}&interval={token}&limit={limit}");
        let list: List = self.signed_get("market.kline", "/v5/market/kline", &query).await?;

        let mut klines = Vec::with_capacity(list.list.len());
        for [start, open, high, low, close, volume, _turnover] in list.list {
            let start_ms: i64 = start
                .parse()
                .map_err(|_| ExchangeError::Decode(format!("bad kline start_time: {start}")))?;
            klines.push(Kline {
                start_time: DateTime::from_timestamp_millis(start_ms).unwrap_or_else(Utc::now),
                open: open.parse().map_err(|_| ExchangeError::Decode(format!("bad kline open: {open}")))?,
                high: high.parse().map_err(|_| ExchangeError::Decode(format!("bad kline high: {high}")))?,
                low: low.parse().map_err(|_| ExchangeError::Decode(format!("bad kline low: {low}")))?,
                close: close.parse().map_err(|_| ExchangeError::Decode(format!("bad kline close: {close}")))?,
                volume: volume.parse().map_err(|_| ExchangeError::Decode(format!("bad kline volume: {volume}")))?,
            });
        }
        klines.sort_by_key(|k| k.start_time);
        Ok(klines)
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    /// Account equity/available/unrealized, USDT-denominated. Tries the
    /// unified-trading account first and falls back to the contract account
    /// (the shape a demo or classic-account user sees) if that comes back
    /// empty or rejected.
    #[instrument(skip(self), name = "exchange::get_wallet_balance")]
    pub async fn get_wallet_balance(&self) -> Result<WalletBalance, ExchangeError> {
        if let Some(balance) = self.wallet_balance_for_account_type("UNIFIED").await? {
            return Ok(balance);
        }
        self.wallet_balance_for_account_type("CONTRACT")
            .await?
            .ok_or_else(|| ExchangeError::Decode("empty wallet balance list for both UNIFIED and CONTRACT".into()))
    }

    async fn wallet_balance_for_account_type(&self, account_type: &'static str) -> Result<Option<WalletBalance>, ExchangeError> {
        #[derive(Deserialize)]
        struct Account {
            #[serde(rename = "totalEquity", with = "rust_decimal::serde::str")]
            total_equity: Decimal,
            #[serde(rename = "totalAvailableBalance", default, with = "rust_decimal::serde::str_option")]
            total_available_balance: Option<Decimal>,
            #[serde(rename = "totalPerpUPL", default, with = "rust_decimal::serde::str_option")]
            total_perp_upl: Option<Decimal>,
        }
        #[derive(Deserialize)]
        struct List {
            list: Vec<Account>,
        }
        let query = format!("accountType={account_type}");
        let result = self
            .signed_get::<List>("account.wallet-balance", "/v5/account/wallet-balance", &query)
            .await;
        let list = match result {
            Ok(list) => list,
            Err(ExchangeError::Permanent { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(list.list.into_iter().next().map(|a| WalletBalance {
            equity: a.total_equity,
            available: a.total_available_balance.unwrap_or(a.total_equity),
            unrealized: a.total_perp_upl.unwrap_or(Decimal::ZERO),
        }))
    }

    #[instrument(skip(self), name = "exchange::get_positions")]
    pub async fn get_positions(&self, symbol: Option<&str>) -> Result<Vec<PositionSnapshot>, ExchangeError> {
        #[derive(Deserialize)]
        struct List {
            list: Vec<PositionSnapshot>,
        }
        let query = match symbol {
            Some(s) => format!("category=linear&symbol={s}"),
            None => "category=linear&settleCoin=USDT".to_string(),
        };
        let list: List = self.signed_get("position.list", "/v5/position/list", &query).await?;
        Ok(list.list.into_iter().filter(|p| !p.size.is_zero()).collect())
    }

    #[instrument(skip(self), name = "exchange::get_closed_pnl")]
    pub async fn get_closed_pnl(&self, symbol: &str, limit: u32) -> Result<Option<ClosedPnl>, ExchangeError> {
        #[derive(Deserialize)]
        struct Entry {
            #[serde(rename = "closedPnl", with = "rust_decimal::serde::str")]
            closed_pnl: Decimal,
            #[serde(rename = "avgExitPrice", with = "rust_decimal::serde::str")]
            avg_exit_price: Decimal,
            #[serde(rename = "updatedTime")]
            updated_time: String,
        }
        #[derive(Deserialize)]
        struct List {
            list: Vec<Entry>,
        }
        let query = format!("category=linear&symbol={symbol}&limit={limit}");
        let list: List = self
            .signed_get("position.closed-pnl", "/v5/position/closed-pnl", &query)
            .await?;
        Ok(list.list.into_iter().next().map(|e| ClosedPnl {
            closed_pnl: e.closed_pnl,
            exit_price: e.avg_exit_price,
            closed_at: e
                .updated_time
                .parse::<i64>()
                .ok()
                .and_then(|ms| DateTime::from_timestamp_millis(ms))
                .unwrap_or_else(Utc::now),
        }))
    }

    // -------------------------------------------------------------------------
    // Order management
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::place_order")]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: Side,
        reduce_only: bool,
        qty: Decimal,
        price: Option<Decimal>,
        client_order_id: &str,
    ) -> Result<OrderAck, ExchangeError> {
        #[derive(Serialize)]
        struct Body<'a> {
            category: &'static str,
            symbol: &'a str,
            side: &'static str,
            #[serde(rename = "orderType")]
            order_type: &'static str,
            qty: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            price: Option<String>,
            #[serde(rename = "reduceOnly")]
            reduce_only: bool,
            #[serde(rename = "orderLinkId")]
            order_link_id: &'a str,
        }
        #[derive(Deserialize)]
        struct Ack {
            #[serde(rename = "orderId")]
            order_id: String,
        }

        let body = Body {
            category: "linear",
            symbol,
            side: match side {
                Side::Buy => "Buy",
                Side::Sell => "Sell",
            },
            order_type: if price.is_some() { "Limit" } else { "Market" },
            qty: canonical_decimal(qty),
            price: price.map(canonical_decimal),
            reduce_only,
            order_link_id: client_order_id,
        };

        let ack: Ack = self.signed_post("order.create", "/v5/order/create", &body).await?;
        Ok(OrderAck {
            exchange_order_id: ack.order_id,
        })
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, exchange_order_id: &str) -> Result<bool, ExchangeError> {
        #[derive(Serialize)]
        struct Body<'a> {
            category: &'static str,
            symbol: &'a str,
            #[serde(rename = "orderId")]
            order_id: &'a str,
        }
        let body = Body {
            category: "linear",
            symbol,
            order_id: exchange_order_id,
        };
        match self
            .signed_post::<_, serde_json::Value>("order.cancel", "/v5/order/cancel", &body)
            .await
        {
            Ok(_) => Ok(true),
            Err(ExchangeError::Permanent { code, .. }) if code == CODE_ORDER_ALREADY_GONE => Ok(true),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "exchange::get_order_status")]
    pub async fn get_order_status(&self, symbol: &str, exchange_order_id: &str) -> Result<Option<OrderStatusSnapshot>, ExchangeError> {
        #[derive(Deserialize)]
        struct Entry {
            #[serde(rename = "orderId")]
            order_id: String,
            #[serde(rename = "orderStatus")]
            order_status: String,
            #[serde(rename = "cumExecQty", with = "rust_decimal::serde::str")]
            cum_exec_qty: Decimal,
            #[serde(rename = "avgPrice", default, with = "rust_decimal::serde::str_option")]
            avg_price: Option<Decimal>,
            #[serde(rename = "cumExecFee", with = "rust_decimal::serde::str")]
            cum_exec_fee: Decimal,
        }
        #[derive(Deserialize)]
        struct List {
            list: Vec<Entry>,
        }

        let query = format!("category=linear&symbol={symbol}&orderId={exchange_order_id}");
        let realtime: List = self.signed_get("order.realtime", "/v5/order/realtime", &query).await?;
        let entry = if let Some(e) = realtime.list.into_iter().next() {
            Some(e)
        } else {
            let history: List = self.signed_get("order.history", "/v5/order/history", &query).await?;
            history.list.into_iter().next()
        };

        Ok(entry.map(|e| OrderStatusSnapshot {
            exchange_order_id: e.order_id,
            status: e.order_status,
            filled_qty: e.cum_exec_qty,
            avg_price: e.avg_price,
            fee: e.cum_exec_fee,
        }))
    }

    #[instrument(skip(self), name = "exchange::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<bool, ExchangeError> {
        #[derive(Serialize)]
        struct Body<'a> {
            category: &'static str,
            symbol: &'a str,
            #[serde(rename = "buyLeverage")]
            buy_leverage: String,
            #[serde(rename = "sellLeverage")]
            sell_leverage: String,
        }
        let body = Body {
            category: "linear",
            symbol,
            buy_leverage: leverage.to_string(),
            sell_leverage: leverage.to_string(),
        };
        match self
            .signed_post::<_, serde_json::Value>("position.set-leverage", "/v5/position/set-leverage", &body)
            .await
        {
            Ok(_) => Ok(true),
            Err(ExchangeError::Permanent { code, .. }) if code == CODE_LEVERAGE_NOT_MODIFIED => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Set or clear the position's stop-loss / take-profit. Passing `None`
    /// leaves the field untouched on the exchange; passing `Some(zero)`
    /// clears it.
    #[instrument(skip(self), name = "exchange::set_trading_stop")]
    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<bool, ExchangeError> {
        #[derive(Serialize)]
        struct Body<'a> {
            category: &'static str,
            symbol: &'a str,
            #[serde(rename = "positionIdx")]
            position_idx: u8,
            #[serde(skip_serializing_if = "Option::is_none", rename = "stopLoss")]
            stop_loss: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none", rename = "takeProfit")]
            take_profit: Option<String>,
        }
        let body = Body {
            category: "linear",
            symbol,
            position_idx: 0,
            stop_loss: stop_loss.map(canonical_decimal),
            take_profit: take_profit.map(canonical_decimal),
        };
        match self
            .signed_post::<_, serde_json::Value>("position.trading-stop", "/v5/position/trading-stop", &body)
            .await
        {
            Ok(_) => Ok(true),
            Err(ExchangeError::Permanent { code, .. }) if code == CODE_TRADING_STOP_NOT_MODIFIED => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Compute an order quantity from `notional` at `leverage`, rounded
    /// down to the instrument's `qty_step`. Returns zero (caller must
    /// reject) if the result is below `min_order_qty`.
    pub fn calculate_quantity_from_notional(
        instrument: &Instrument,
        notional_usdt: Decimal,
        price: Decimal,
    ) -> Decimal {
        if price.is_zero() {
            return Decimal::ZERO;
        }
        let raw_qty = notional_usdt / price;
        let snapped = instrument.snap_qty(raw_qty);
        if snapped < instrument.min_order_qty {
            Decimal::ZERO
        } else {
            snapped
        }
    }

    /// Monotonic per-client sequence number, handy for correlating log
    /// lines for requests issued back to back within the same millisecond.
    pub fn next_seq(&self) -> i64 {
        self.request_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// API key, for frames/logging that need to identify (not authenticate)
    /// the account. The secret itself is never exposed.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Build the auth frame triple for the private WebSocket stream: sign
    /// `"GET/realtime" || expires_ms` and expire 10 s from now.
    pub fn ws_auth_frame(&self) -> (String, i64, String) {
        let expires = Self::timestamp_ms() + 10_000;
        let payload = format!("GET/realtime{expires}");
        let sig = self.sign(&payload);
        (self.api_key.clone(), expires, sig)
    }
}

#[derive(Debug, Clone)]
pub struct OrderStatusSnapshot {
    pub exchange_order_id: String,
    pub status: String,
    pub filled_qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub fee: Decimal,
}

/// Render a `Decimal` the way the exchange expects: no exponent notation,
/// trailing zeros stripped, so order-size parsers on both ends agree.
fn canonical_decimal(d: Decimal) -> String {
    d.normalize().to_string()
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn canonical_decimal_strips_trailing_zeros() {
        assert_eq!(canonical_decimal(dec!(0.500000)), "0.5");
        assert_eq!(canonical_decimal(dec!(10)), "10");
    }

    #[test]
    fn quantity_below_minimum_returns_zero() {
        let instrument = Instrument {
            symbol: "BTCUSDT".into(),
            tick_size: dec!(0.1),
            qty_step: dec!(0.001),
            min_order_qty: dec!(0.01),
            status: "Trading".into(),
        };
        let qty = ExchangeClient::calculate_quantity_from_notional(&instrument, dec!(1), dec!(50000));
        assert_eq!(qty, Decimal::ZERO);
    }

    #[test]
    fn quantity_rounds_down_to_step() {
        let instrument = Instrument {
            symbol: "BTCUSDT".into(),
            tick_size: dec!(0.1),
            qty_step: dec!(0.001),
            min_order_qty: dec!(0.001),
            status: "Trading".into(),
        };
        let qty = ExchangeClient::calculate_quantity_from_notional(&instrument, dec!(1000), dec!(50000));
        // 1000/50000 = 0.02 exactly, stays at step.
        assert_eq!(qty, dec!(0.02));
    }

    #[test]
    fn auth_codes_are_fatal() {
        assert!(is_auth_fatal(10003));
        assert!(is_auth_fatal(10004));
        assert!(!is_auth_fatal(110001));
    }

    #[test]
    fn ws_auth_frame_expires_ten_seconds_out() {
        let client = ExchangeClient::new("key", "secret", "https://api-demo.bybit.com");
        let (api_key, expires, sig) = client.ws_auth_frame();
        assert_eq!(api_key, "key");
        let now = ExchangeClient::timestamp_ms();
        assert!(expires > now + 9000 && expires <= now + 10000);
        assert!(!sig.is_empty());
    }
}
