//! HTTP gateway to the exchange REST API.
//!
//! Wraps `reqwest::Client` with request signing, rate-limit charging, a
//! cached server-time offset for signed timestamps, and retry on
//! transient failure. Market data responses decode through
//! `data::decode`; account and order responses use the typed structs in
//! `rest::types`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::Sha256;

use crate::clock::Clock;
use crate::config::{Credentials, EngineConfig};
use crate::data::decode;
use crate::data::records::{Kline, OrderBook, PriceTick, Ticker24h, TradeRecord};
use crate::error::MarketError;
use crate::limiter::RateLimiter;
use crate::rest::types::{
    AccountInfo, ApiErrorBody, CancelAllResponse, ExchangeInfo, LeverageResponse, OrderResponse,
    PositionRisk, ServerTimeResponse,
};
use crate::retry::{retry, RetryPolicy};

type HmacSha256 = Hmac<Sha256>;

/// How long a fetched server-time offset stays valid.
const TIME_SYNC_REFRESH: Duration = Duration::from_secs(300);

/// Uppercase a symbol for REST query strings, trimming whitespace.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Percent-encode a query value (RFC 3986 unreserved set kept).
fn urlencode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}

/// Query string builder preserving insertion order.
#[derive(Debug, Clone, Default)]
struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: &str, value: impl ToString) {
        self.pairs.push((key.to_string(), value.to_string()));
    }

    fn push_opt(&mut self, key: &str, value: Option<impl ToString>) {
        if let Some(value) = value {
            self.push(key, value);
        }
    }

    fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// HMAC-SHA256 signature over a query string, lowercase hex.
fn sign(secret: &str, query_string: &str) -> Result<String, MarketError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| MarketError::auth(format!("invalid secret key: {e}")))?;
    mac.update(query_string.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, MarketError> {
    serde_json::from_value(value)
        .map_err(|e| MarketError::validation(format!("unexpected response shape: {e}")))
}

struct TimeSync {
    offset_ms: i64,
    refreshed_at: Option<Instant>,
}

/// Rate-limited, optionally signed REST client.
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    time_sync: Mutex<TimeSync>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl RestClient {
    pub fn new(
        config: &EngineConfig,
        credentials: Option<Credentials>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("binance-feed/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            credentials,
            limiter,
            clock,
            retry_policy: RetryPolicy::default(),
            time_sync: Mutex::new(TimeSync {
                offset_ms: 0,
                refreshed_at: None,
            }),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Single HTTP attempt with error classification.
    async fn send_once(
        &self,
        method: Method,
        url: String,
        api_key: Option<&str>,
    ) -> Result<Value, MarketError> {
        let mut request = self.client.request(method, &url);
        if let Some(key) = api_key {
            request = request.header("X-MBX-APIKEY", key);
        }
        let response = request.send().await.map_err(MarketError::from)?;
        let status = response.status();

        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| MarketError::validation(format!("malformed response body: {e}")));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(parsed) => (parsed.code, parsed.msg),
            Err(_) => {
                let mut trimmed = body.trim().to_string();
                trimmed.truncate(200);
                (i64::from(status.as_u16()), trimmed)
            }
        };

        match status.as_u16() {
            429 => Err(MarketError::RateLimited {
                message,
                retry_after,
            }),
            401 | 403 => Err(MarketError::auth(format!("{code}: {message}"))),
            500..=599 => Err(MarketError::network(format!(
                "server error {code}: {message}"
            ))),
            _ => Err(MarketError::Api { code, message }),
        }
    }

    /// Unsigned GET with rate-limit charge and transient-failure retry.
    async fn public_request(
        &self,
        path: &str,
        query: Query,
        weight: u32,
    ) -> Result<Value, MarketError> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query.encode())
        };
        let (result, _) = retry(&self.retry_policy, MarketError::is_retryable, || {
            let url = url.clone();
            async move {
                self.limiter.charge_read(weight).await;
                self.send_once(Method::GET, url, None).await
            }
        })
        .await;
        result
    }

    /// Signed request: appends `timestamp` and `signature`, sends the API
    /// key header, and charges the order bucket for order mutations.
    ///
    /// Fails fast with an auth error when no credentials are configured.
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        query: Query,
        weight: u32,
        order_mutation: bool,
    ) -> Result<Value, MarketError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| MarketError::auth("API credentials not configured"))?;

        let (result, _) = retry(&self.retry_policy, MarketError::is_retryable, || {
            let method = method.clone();
            let query = query.clone();
            async move {
                if order_mutation {
                    self.limiter.charge_order().await;
                } else {
                    self.limiter.charge_read(weight).await;
                }
                let mut signed = query;
                signed.push("timestamp", self.signed_timestamp().await);
                let query_string = signed.encode();
                let signature = sign(credentials.api_secret().expose_secret(), &query_string)?;
                let url = format!(
                    "{}{}?{}&signature={}",
                    self.base_url, path, query_string, signature
                );
                self.send_once(method, url, Some(credentials.api_key().expose_secret()))
                    .await
            }
        })
        .await;
        result
    }

    /// Local time adjusted by the cached server-time offset.
    ///
    /// The offset refreshes at most every 5 minutes; a failed refresh
    /// keeps the previous offset and tries again on the next signed call.
    async fn signed_timestamp(&self) -> i64 {
        let needs_refresh = {
            let sync = self.time_sync.lock().unwrap();
            sync.refreshed_at
                .map(|at| at.elapsed() >= TIME_SYNC_REFRESH)
                .unwrap_or(true)
        };
        if needs_refresh {
            match self.fetch_server_time().await {
                Ok(server_ms) => {
                    let offset = server_ms - self.clock.now_ms();
                    let mut sync = self.time_sync.lock().unwrap();
                    sync.offset_ms = offset;
                    sync.refreshed_at = Some(Instant::now());
                    tracing::debug!(offset_ms = offset, "server time offset refreshed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "server time refresh failed, keeping cached offset");
                }
            }
        }
        let offset = self.time_sync.lock().unwrap().offset_ms;
        self.clock.now_ms() + offset
    }

    async fn fetch_server_time(&self) -> Result<i64, MarketError> {
        self.limiter.charge_read(1).await;
        let url = format!("{}/fapi/v1/time", self.base_url);
        let value = self.send_once(Method::GET, url, None).await?;
        let response: ServerTimeResponse = from_value(value)?;
        if !response.is_valid() {
            return Err(MarketError::validation(format!(
                "invalid server time: {}",
                response.server_time
            )));
        }
        Ok(response.server_time)
    }

    // ----- public market data -----------------------------------------

    /// Best bid/ask for a symbol (`GET /fapi/v1/ticker/bookTicker`).
    pub async fn get_current_price(&self, symbol: &str) -> Result<PriceTick, MarketError> {
        let mut query = Query::new();
        query.push("symbol", normalize_symbol(symbol));
        let value = self
            .public_request("/fapi/v1/ticker/bookTicker", query, 2)
            .await?;
        decode::decode_price_tick(&value)
    }

    /// Order book snapshot (`GET /fapi/v1/depth`).
    pub async fn get_order_book(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> Result<OrderBook, MarketError> {
        let symbol = normalize_symbol(symbol);
        let limit_value = limit.unwrap_or(100);
        let mut query = Query::new();
        query.push("symbol", &symbol);
        query.push("limit", limit_value);
        let weight = match limit_value {
            0..=50 => 2,
            51..=100 => 5,
            101..=500 => 10,
            _ => 20,
        };
        let value = self.public_request("/fapi/v1/depth", query, weight).await?;
        decode::decode_order_book(&symbol, &value)
    }

    /// Recent trades (`GET /fapi/v1/trades`). Trades failing validation
    /// are dropped from the result.
    pub async fn get_recent_trades(
        &self,
        symbol: &str,
        limit: Option<u32>,
    ) -> Result<Vec<TradeRecord>, MarketError> {
        let mut query = Query::new();
        query.push("symbol", normalize_symbol(symbol));
        query.push_opt("limit", limit);
        let value = self.public_request("/fapi/v1/trades", query, 5).await?;
        let rows = value
            .as_array()
            .ok_or_else(|| MarketError::validation("trades response is not an array"))?;
        let now_ms = self.clock.now_ms();
        let mut trades = Vec::with_capacity(rows.len());
        for row in rows {
            match decode::decode_trade(row, now_ms) {
                Ok(trade) => trades.push(trade),
                Err(err) => tracing::debug!(error = %err, "dropping invalid trade"),
            }
        }
        Ok(trades)
    }

    /// Candlesticks (`GET /fapi/v1/klines`).
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Kline>, MarketError> {
        let mut query = Query::new();
        query.push("symbol", normalize_symbol(symbol));
        query.push("interval", interval);
        query.push_opt("limit", limit);
        let weight = match limit.unwrap_or(500) {
            0..=100 => 1,
            101..=500 => 2,
            _ => 5,
        };
        let value = self.public_request("/fapi/v1/klines", query, weight).await?;
        let rows = value
            .as_array()
            .ok_or_else(|| MarketError::validation("klines response is not an array"))?;
        rows.iter().map(decode::decode_kline).collect()
    }

    /// 24-hour statistics (`GET /fapi/v1/ticker/24hr`).
    pub async fn get_24hr_ticker(&self, symbol: &str) -> Result<Ticker24h, MarketError> {
        let mut query = Query::new();
        query.push("symbol", normalize_symbol(symbol));
        let value = self.public_request("/fapi/v1/ticker/24hr", query, 1).await?;
        decode::decode_ticker24h(&value)
    }

    /// Connectivity check (`GET /fapi/v1/ping`).
    pub async fn ping(&self) -> Result<(), MarketError> {
        self.public_request("/fapi/v1/ping", Query::new(), 1)
            .await
            .map(|_| ())
    }

    /// Exchange server time in epoch milliseconds.
    pub async fn server_time(&self) -> Result<i64, MarketError> {
        self.fetch_server_time().await
    }

    /// Exchange metadata (`GET /fapi/v1/exchangeInfo`).
    pub async fn get_exchange_info(&self) -> Result<ExchangeInfo, MarketError> {
        let value = self
            .public_request("/fapi/v1/exchangeInfo", Query::new(), 1)
            .await?;
        from_value(value)
    }

    // ----- signed operations ------------------------------------------

    /// Place an order (`POST /fapi/v1/order`). Limit orders default to
    /// GTC. Failures wrap the root cause with the order parameters.
    pub async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: &str,
        price: Option<&str>,
    ) -> Result<OrderResponse, MarketError> {
        let symbol = normalize_symbol(symbol);
        let mut query = Query::new();
        query.push("symbol", &symbol);
        query.push("side", side);
        query.push("type", order_type);
        query.push("quantity", quantity);
        if let Some(price) = price {
            query.push("price", price);
            query.push("timeInForce", "GTC");
        }
        self.signed_request(Method::POST, "/fapi/v1/order", query, 1, true)
            .await
            .and_then(from_value)
            .map_err(|err| MarketError::OrderExecution {
                symbol,
                side: side.to_string(),
                quantity: quantity.to_string(),
                message: err.to_string(),
            })
    }

    /// Cancel an order (`DELETE /fapi/v1/order`).
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<OrderResponse, MarketError> {
        let symbol = normalize_symbol(symbol);
        let mut query = Query::new();
        query.push("symbol", &symbol);
        query.push("orderId", order_id);
        self.signed_request(Method::DELETE, "/fapi/v1/order", query, 1, true)
            .await
            .and_then(from_value)
            .map_err(|err| MarketError::OrderExecution {
                symbol,
                side: "CANCEL".to_string(),
                quantity: order_id.to_string(),
                message: err.to_string(),
            })
    }

    /// Query one order (`GET /fapi/v1/order`).
    pub async fn get_order_status(
        &self,
        symbol: &str,
        order_id: i64,
    ) -> Result<OrderResponse, MarketError> {
        let mut query = Query::new();
        query.push("symbol", normalize_symbol(symbol));
        query.push("orderId", order_id);
        self.signed_request(Method::GET, "/fapi/v1/order", query, 1, false)
            .await
            .and_then(from_value)
    }

    /// Open orders, optionally filtered by symbol
    /// (`GET /fapi/v1/openOrders`).
    pub async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderResponse>, MarketError> {
        let mut query = Query::new();
        query.push_opt("symbol", symbol.map(normalize_symbol));
        let weight = if symbol.is_some() { 1 } else { 40 };
        self.signed_request(Method::GET, "/fapi/v1/openOrders", query, weight, false)
            .await
            .and_then(from_value)
    }

    /// Cancel every open order on a symbol
    /// (`DELETE /fapi/v1/allOpenOrders`).
    pub async fn cancel_all_open_orders(
        &self,
        symbol: &str,
    ) -> Result<CancelAllResponse, MarketError> {
        let mut query = Query::new();
        query.push("symbol", normalize_symbol(symbol));
        self.signed_request(Method::DELETE, "/fapi/v1/allOpenOrders", query, 1, true)
            .await
            .and_then(from_value)
    }

    /// Position information (`GET /fapi/v2/positionRisk`).
    pub async fn get_position_risk(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<PositionRisk>, MarketError> {
        let mut query = Query::new();
        query.push_opt("symbol", symbol.map(normalize_symbol));
        self.signed_request(Method::GET, "/fapi/v2/positionRisk", query, 5, false)
            .await
            .and_then(from_value)
    }

    /// Account balances and margin (`GET /fapi/v2/account`).
    pub async fn get_account_info(&self) -> Result<AccountInfo, MarketError> {
        self.signed_request(Method::GET, "/fapi/v2/account", Query::new(), 5, false)
            .await
            .and_then(from_value)
    }

    /// Change initial leverage (`POST /fapi/v1/leverage`).
    pub async fn change_leverage(
        &self,
        symbol: &str,
        leverage: u32,
    ) -> Result<LeverageResponse, MarketError> {
        let mut query = Query::new();
        query.push("symbol", normalize_symbol(symbol));
        query.push("leverage", leverage);
        self.signed_request(Method::POST, "/fapi/v1/leverage", query, 1, false)
            .await
            .and_then(from_value)
    }

    /// Switch margin type between ISOLATED and CROSSED
    /// (`POST /fapi/v1/marginType`).
    pub async fn change_margin_type(
        &self,
        symbol: &str,
        margin_type: &str,
    ) -> Result<(), MarketError> {
        let mut query = Query::new();
        query.push("symbol", normalize_symbol(symbol));
        query.push("marginType", margin_type);
        self.signed_request(Method::POST, "/fapi/v1/marginType", query, 1, false)
            .await
            .map(|_| ())
    }
}
