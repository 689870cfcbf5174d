// =============================================================================
// Binance USDT-M Futures Gateway — HMAC-SHA256 signed REST adapter
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms; clock skew
// against the venue is measured once at startup via /fapi/v1/time and folded
// into every request timestamp.
//
// This venue requires quantities snapped to the LOT_SIZE step and prices to
// the PRICE_FILTER tick; callers pass already-snapped decimals, which are
// rendered without exponents.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::config::VenueConfig;
use crate::gateway::ratelimit::TokenBucket;
use crate::gateway::{with_retry, GatewayError, GatewayResult, VenueGateway};
use crate::types::{
    is_perpetual_quote, now_ms, Order, OrderKind, OrderStatus, Side, SymbolMeta, Ticker, Venue,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://fapi.binance.com";

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Conservative request budget (venue allows more).
const REQUESTS_PER_SEC: f64 = 20.0;

/// "Unknown order sent" — returned for cancels of already-final orders.
const ERR_UNKNOWN_ORDER: i64 = -2011;
/// "Order does not exist."
const ERR_NO_SUCH_ORDER: i64 = -2013;
/// "No need to change margin type."
const ERR_MARGIN_NOT_MODIFIED: i64 = -4046;

pub struct BinanceGateway {
    secret: String,
    base_url: String,
    http: reqwest::Client,
    bucket: TokenBucket,
    /// Venue clock minus local clock, in milliseconds.
    time_offset_ms: AtomicI64,
    fetch_only: bool,
    quote: String,
    meta_cache: RwLock<HashMap<String, SymbolMeta>>,
}

impl BinanceGateway {
    pub fn new(cfg: &VenueConfig, quote: impl Into<String>) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&cfg.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            secret: cfg.secret.clone(),
            base_url: BASE_URL.to_string(),
            http,
            bucket: TokenBucket::new(REQUESTS_PER_SEC),
            time_offset_ms: AtomicI64::new(0),
            fetch_only: cfg.fetch_only,
            quote: quote.into(),
            meta_cache: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Clock sync & signing
    // -------------------------------------------------------------------------

    /// Measure the venue clock offset once; call at startup.
    pub async fn sync_time(&self) -> GatewayResult<()> {
        let body = self.request_public("/fapi/v1/time", "").await?;
        let server_ms = body["serverTime"]
            .as_i64()
            .ok_or_else(|| GatewayError::Protocol("time response missing serverTime".into()))?;
        let offset = server_ms - now_ms();
        self.time_offset_ms.store(offset, Ordering::Relaxed);
        info!(offset_ms = offset, "binance clock offset measured");
        Ok(())
    }

    /// Produce an HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms(&self) -> i64 {
        now_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn request_public(&self, path: &str, query: &str) -> GatewayResult<serde_json::Value> {
        self.execute(reqwest::Method::GET, path, query).await
    }

    async fn request_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> GatewayResult<serde_json::Value> {
        let query = self.signed_query(params);
        self.execute(method, path, &query).await
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> GatewayResult<serde_json::Value> {
        self.bucket.acquire().await;

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self.http.request(method, &url).send().await?;
        let status = resp.status();

        if status.as_u16() == 429 {
            return Err(GatewayError::RateLimited);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("invalid JSON from {path}: {e}")))?;

        if !status.is_success() {
            let code = body["code"].as_i64().unwrap_or(0);
            let msg = body["msg"].as_str().unwrap_or("").to_string();
            if code != 0 {
                if code == ERR_UNKNOWN_ORDER || code == ERR_NO_SUCH_ORDER {
                    return Err(GatewayError::OrderNotFound(msg));
                }
                return Err(GatewayError::Venue { code, message: msg });
            }
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        Ok(body)
    }

    fn require_order_entry(&self) -> GatewayResult<()> {
        if self.fetch_only {
            return Err(GatewayError::Domain(
                "binance is configured fetch-only; order entry disabled".into(),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Parsing
    // -------------------------------------------------------------------------

    fn parse_order(&self, symbol: &str, v: &serde_json::Value) -> GatewayResult<Order> {
        let id = match &v["orderId"] {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s.clone(),
            _ => return Err(GatewayError::Protocol("order response missing orderId".into())),
        };

        let side = match v["side"].as_str() {
            Some("BUY") => Side::Buy,
            Some("SELL") => Side::Sell,
            other => {
                return Err(GatewayError::Protocol(format!(
                    "unexpected order side: {other:?}"
                )))
            }
        };

        let kind = match v["type"].as_str() {
            Some("MARKET") => OrderKind::Market,
            _ => OrderKind::Limit,
        };

        let requested_qty = parse_decimal(&v["origQty"])?;
        let filled_qty = parse_decimal(&v["executedQty"]).unwrap_or(Decimal::ZERO);
        let price = parse_decimal(&v["price"]).ok().filter(|p| !p.is_zero());
        let avg = parse_decimal(&v["avgPrice"]).ok().filter(|p| !p.is_zero());
        let cost = parse_decimal(&v["cumQuote"]).unwrap_or(Decimal::ZERO);

        let status = map_status(v["status"].as_str().unwrap_or(""))?;

        Ok(Order {
            id,
            venue: Venue::Binance,
            symbol: symbol.to_string(),
            side,
            kind,
            requested_qty,
            requested_price: price,
            filled_qty,
            avg_fill_price: avg,
            cumulative_cost: cost,
            status,
            created_at_ms: v["time"].as_i64().unwrap_or(0),
            updated_at_ms: v["updateTime"].as_i64().unwrap_or(0),
        })
    }
}

/// Map a venue-native order status onto the canonical set.
fn map_status(raw: &str) -> GatewayResult<OrderStatus> {
    match raw {
        "NEW" => Ok(OrderStatus::Pending),
        "PARTIALLY_FILLED" => Ok(OrderStatus::Partial),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => Ok(OrderStatus::Cancelled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        other => Err(GatewayError::Protocol(format!(
            "unknown binance order status: {other}"
        ))),
    }
}

/// Parse a JSON value that may be either a string or a number into `Decimal`.
fn parse_decimal(v: &serde_json::Value) -> GatewayResult<Decimal> {
    match v {
        serde_json::Value::String(s) => Decimal::from_str(s)
            .map_err(|e| GatewayError::Protocol(format!("bad decimal '{s}': {e}"))),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| GatewayError::Protocol(format!("bad decimal '{n}': {e}"))),
        _ => Err(GatewayError::Protocol(format!(
            "expected decimal, got: {v}"
        ))),
    }
}

#[async_trait]
impl VenueGateway for BinanceGateway {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn order_entry_enabled(&self) -> bool {
        !self.fetch_only
    }

    async fn fetch_symbols(&self) -> GatewayResult<Vec<SymbolMeta>> {
        let body = with_retry("binance.fetch_symbols", || {
            self.request_public("/fapi/v1/exchangeInfo", "")
        })
        .await?;

        let raw = body["symbols"]
            .as_array()
            .ok_or_else(|| GatewayError::Protocol("exchangeInfo missing symbols".into()))?;

        let mut metas = Vec::new();
        for item in raw {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            if item["status"].as_str() != Some("TRADING")
                || item["contractType"].as_str() != Some("PERPETUAL")
                || item["quoteAsset"].as_str() != Some(self.quote.as_str())
                || !is_perpetual_quote(symbol, &self.quote)
            {
                continue;
            }

            let mut min_qty = Decimal::new(1, 3); // 0.001 fallback
            let mut qty_step = Decimal::new(1, 3);
            let mut tick_size = Decimal::new(1, 2);

            if let Some(filters) = item["filters"].as_array() {
                for f in filters {
                    match f["filterType"].as_str() {
                        Some("LOT_SIZE") => {
                            if let Ok(v) = parse_decimal(&f["minQty"]) {
                                min_qty = v;
                            }
                            if let Ok(v) = parse_decimal(&f["stepSize"]) {
                                qty_step = v;
                            }
                        }
                        Some("PRICE_FILTER") => {
                            if let Ok(v) = parse_decimal(&f["tickSize"]) {
                                tick_size = v;
                            }
                        }
                        _ => {}
                    }
                }
            }

            metas.push(SymbolMeta {
                symbol: symbol.to_string(),
                min_qty,
                qty_step,
                tick_size,
            });
        }

        let mut cache = self.meta_cache.write();
        for meta in &metas {
            cache.insert(meta.symbol.clone(), meta.clone());
        }
        drop(cache);

        debug!(count = metas.len(), "binance symbol metadata fetched");
        Ok(metas)
    }

    async fn symbol_meta(&self, symbol: &str) -> GatewayResult<SymbolMeta> {
        if let Some(meta) = self.meta_cache.read().get(symbol) {
            return Ok(meta.clone());
        }
        self.fetch_symbols().await?;
        self.meta_cache
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::Domain(format!("{symbol} is not tradable on binance")))
    }

    async fn fetch_tickers(&self) -> GatewayResult<HashMap<String, Ticker>> {
        let body = with_retry("binance.fetch_tickers", || {
            self.request_public("/fapi/v1/ticker/24hr", "")
        })
        .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| GatewayError::Protocol("24hr ticker response not an array".into()))?;

        let mut tickers = HashMap::new();
        for item in raw {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            if !is_perpetual_quote(symbol, &self.quote) {
                continue;
            }
            let last_price: f64 = item["lastPrice"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            if last_price <= 0.0 {
                continue;
            }
            let volume: f64 = item["quoteVolume"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);

            tickers.insert(
                symbol.to_string(),
                Ticker {
                    symbol: symbol.to_string(),
                    last_price,
                    bid: None,
                    ask: None,
                    volume_24h: volume,
                    timestamp_ms: now_ms(),
                },
            );
        }
        Ok(tickers)
    }

    async fn fetch_volumes_24h(&self) -> GatewayResult<HashMap<String, f64>> {
        let tickers = self.fetch_tickers().await?;
        Ok(tickers
            .into_iter()
            .map(|(symbol, t)| (symbol, t.volume_24h))
            .collect())
    }

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<Order> {
        self.require_order_entry()?;

        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let params = format!(
            "symbol={symbol}&side={side_str}&type=LIMIT&quantity={}&price={}&timeInForce=GTC",
            qty.normalize(),
            price.normalize()
        );

        debug!(symbol, side = %side, %qty, %price, "binance placing limit order");
        let body = self
            .request_signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        self.parse_order(symbol, &body)
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> GatewayResult<Order> {
        self.require_order_entry()?;

        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let params = format!(
            "symbol={symbol}&side={side_str}&type=MARKET&quantity={}",
            qty.normalize()
        );

        debug!(symbol, side = %side, %qty, "binance placing market order");
        let body = self
            .request_signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        self.parse_order(symbol, &body)
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> GatewayResult<Order> {
        let params = format!("symbol={symbol}&orderId={id}");
        let body = with_retry("binance.fetch_order", || {
            self.request_signed(reqwest::Method::GET, "/fapi/v1/order", &params)
        })
        .await?;
        self.parse_order(symbol, &body)
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> GatewayResult<Order> {
        let params = format!("symbol={symbol}&orderId={id}");
        debug!(symbol, order_id = id, "binance cancelling order");
        let body = self
            .request_signed(reqwest::Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        self.parse_order(symbol, &body)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        match self
            .request_signed(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(GatewayError::Venue { message, .. })
                if message.to_lowercase().contains("not modified") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_isolated_margin(&self, symbol: &str) -> GatewayResult<()> {
        let params = format!("symbol={symbol}&marginType=ISOLATED");
        match self
            .request_signed(reqwest::Method::POST, "/fapi/v1/marginType", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(GatewayError::Venue { code, message })
                if code == ERR_MARGIN_NOT_MODIFIED
                    || message.to_lowercase().contains("no need to change margin type") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_balance(&self, asset: &str) -> GatewayResult<f64> {
        let body = with_retry("binance.fetch_balance", || {
            self.request_signed(reqwest::Method::GET, "/fapi/v2/balance", "")
        })
        .await?;

        let entries = body
            .as_array()
            .ok_or_else(|| GatewayError::Protocol("balance response not an array".into()))?;

        for entry in entries {
            if entry["asset"].as_str() == Some(asset) {
                let free: f64 = entry["availableBalance"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0);
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in binance balances; treating as 0");
        Ok(0.0)
    }
}

impl std::fmt::Debug for BinanceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceGateway")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("fetch_only", &self.fetch_only)
            .finish()
    }
}
