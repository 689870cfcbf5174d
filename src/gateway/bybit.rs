// =============================================================================
// Bybit v5 Linear Gateway — signed REST adapter
// =============================================================================
//
// v5 signing: HMAC-SHA256 over `timestamp + api_key + recv_window + payload`
// where payload is the query string for GETs and the JSON body for POSTs.
// The signature travels in X-BAPI-* headers rather than the query.
//
// This venue accepts free-form decimal quantities, but we keep values snapped
// to the instrument's qtyStep anyway so both legs of a pair stay symmetric.
// Idempotency quirks handled here: retCode 110043 ("leverage not modified")
// and margin-mode "not modified" count as success; cancels of already-final
// orders answer "order not exists or too late to cancel" and surface as
// OrderNotFound for the safe-cancel path to resolve.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::config::VenueConfig;
use crate::gateway::ratelimit::TokenBucket;
use crate::gateway::{with_retry, GatewayError, GatewayResult, VenueGateway};
use crate::types::{
    is_perpetual_quote, now_ms, Order, OrderKind, OrderStatus, Side, SymbolMeta, Ticker, Venue,
};

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://api.bybit.com";

const RECV_WINDOW: &str = "5000";

/// Conservative request budget (venue allows more).
const REQUESTS_PER_SEC: f64 = 10.0;

/// "leverage not modified"
const ERR_LEVERAGE_NOT_MODIFIED: i64 = 110043;
/// "Isolated margin mode is not modified"
const ERR_MARGIN_NOT_MODIFIED: i64 = 110026;

pub struct BybitGateway {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    bucket: TokenBucket,
    fetch_only: bool,
    quote: String,
    meta_cache: RwLock<HashMap<String, SymbolMeta>>,
}

impl BybitGateway {
    pub fn new(cfg: &VenueConfig, quote: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: cfg.api_key.clone(),
            secret: cfg.secret.clone(),
            base_url: BASE_URL.to_string(),
            http,
            bucket: TokenBucket::new(REQUESTS_PER_SEC),
            fetch_only: cfg.fetch_only,
            quote: quote.into(),
            meta_cache: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// v5 signature: HMAC-SHA256 over timestamp + key + recv_window + payload.
    fn sign(&self, timestamp: &str, payload: &str) -> String {
        let message = format!("{timestamp}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(message.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn auth_headers(&self, timestamp: &str, signature: &str) -> reqwest::header::HeaderMap {
        use reqwest::header::{HeaderMap, HeaderValue};
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&self.api_key) {
            headers.insert("X-BAPI-API-KEY", v);
        }
        if let Ok(v) = HeaderValue::from_str(signature) {
            headers.insert("X-BAPI-SIGN", v);
        }
        headers.insert("X-BAPI-SIGN-TYPE", HeaderValue::from_static("2"));
        if let Ok(v) = HeaderValue::from_str(timestamp) {
            headers.insert("X-BAPI-TIMESTAMP", v);
        }
        headers.insert("X-BAPI-RECV-WINDOW", HeaderValue::from_static(RECV_WINDOW));
        headers
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Run one request and unwrap the `{retCode, retMsg, result}` envelope.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> GatewayResult<serde_json::Value> {
        self.bucket.acquire().await;

        let resp = request.send().await?;
        let status = resp.status();

        if status.as_u16() == 429 {
            return Err(GatewayError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Protocol(format!("invalid JSON from {path}: {e}")))?;

        let code = body["retCode"].as_i64().unwrap_or(-1);
        if code != 0 {
            let message = body["retMsg"].as_str().unwrap_or("").to_string();
            if message.contains("order not exists or too late to cancel") {
                return Err(GatewayError::OrderNotFound(message));
            }
            return Err(GatewayError::Venue { code, message });
        }

        Ok(body["result"].clone())
    }

    async fn get_public(&self, path: &str, query: &str) -> GatewayResult<serde_json::Value> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let req = self.http.get(&url);
        self.execute(req, path).await
    }

    async fn get_signed(&self, path: &str, query: &str) -> GatewayResult<serde_json::Value> {
        let timestamp = now_ms().to_string();
        let signature = self.sign(&timestamp, query);
        let url = format!("{}{}?{}", self.base_url, path, query);
        let req = self
            .http
            .get(&url)
            .headers(self.auth_headers(&timestamp, &signature));
        self.execute(req, path).await
    }

    async fn post_signed(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> GatewayResult<serde_json::Value> {
        let payload = body.to_string();
        let timestamp = now_ms().to_string();
        let signature = self.sign(&timestamp, &payload);
        let url = format!("{}{}", self.base_url, path);
        let req = self
            .http
            .post(&url)
            .headers(self.auth_headers(&timestamp, &signature))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        self.execute(req, path).await
    }

    fn require_order_entry(&self) -> GatewayResult<()> {
        if self.fetch_only {
            return Err(GatewayError::Domain(
                "bybit is configured fetch-only; order entry disabled".into(),
            ));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Parsing
    // -------------------------------------------------------------------------

    fn parse_order(&self, symbol: &str, v: &serde_json::Value) -> GatewayResult<Order> {
        let id = v["orderId"]
            .as_str()
            .ok_or_else(|| GatewayError::Protocol("order response missing orderId".into()))?
            .to_string();

        let side = match v["side"].as_str() {
            Some("Buy") => Side::Buy,
            Some("Sell") => Side::Sell,
            other => {
                return Err(GatewayError::Protocol(format!(
                    "unexpected order side: {other:?}"
                )))
            }
        };

        let kind = match v["orderType"].as_str() {
            Some("Market") => OrderKind::Market,
            _ => OrderKind::Limit,
        };

        let requested_qty = parse_decimal_field(&v["qty"])?;
        let filled_qty = parse_decimal_field(&v["cumExecQty"]).unwrap_or(Decimal::ZERO);
        let price = parse_decimal_field(&v["price"]).ok().filter(|p| !p.is_zero());
        let avg = parse_decimal_field(&v["avgPrice"]).ok().filter(|p| !p.is_zero());
        let cost = parse_decimal_field(&v["cumExecValue"]).unwrap_or(Decimal::ZERO);

        let status = map_status(v["orderStatus"].as_str().unwrap_or(""))?;

        Ok(Order {
            id,
            venue: Venue::Bybit,
            symbol: symbol.to_string(),
            side,
            kind,
            requested_qty,
            requested_price: price,
            filled_qty,
            avg_fill_price: avg,
            cumulative_cost: cost,
            status,
            created_at_ms: v["createdTime"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            updated_at_ms: v["updatedTime"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }
}

/// Map a venue-native order status onto the canonical set.
fn map_status(raw: &str) -> GatewayResult<OrderStatus> {
    match raw {
        "New" | "Created" | "Untriggered" => Ok(OrderStatus::Pending),
        "PartiallyFilled" => Ok(OrderStatus::Partial),
        "Filled" => Ok(OrderStatus::Filled),
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => Ok(OrderStatus::Cancelled),
        "Rejected" => Ok(OrderStatus::Rejected),
        other => Err(GatewayError::Protocol(format!(
            "unknown bybit order status: {other}"
        ))),
    }
}

/// Bybit renders every numeric field as a string; empty strings mean absent.
fn parse_decimal_field(v: &serde_json::Value) -> GatewayResult<Decimal> {
    match v.as_str() {
        Some("") | None => Err(GatewayError::Protocol("missing decimal field".into())),
        Some(s) => Decimal::from_str(s)
            .map_err(|e| GatewayError::Protocol(format!("bad decimal '{s}': {e}"))),
    }
}

#[async_trait]
impl VenueGateway for BybitGateway {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    fn order_entry_enabled(&self) -> bool {
        !self.fetch_only
    }

    async fn fetch_symbols(&self) -> GatewayResult<Vec<SymbolMeta>> {
        let mut metas = Vec::new();
        let mut cursor = String::new();

        loop {
            let query = if cursor.is_empty() {
                "category=linear&limit=1000".to_string()
            } else {
                format!("category=linear&limit=1000&cursor={cursor}")
            };

            let result = with_retry("bybit.fetch_symbols", || {
                self.get_public("/v5/market/instruments-info", &query)
            })
            .await?;

            let list = result["list"]
                .as_array()
                .ok_or_else(|| GatewayError::Protocol("instruments-info missing list".into()))?;

            for item in list {
                let symbol = item["symbol"].as_str().unwrap_or_default();
                if item["status"].as_str() != Some("Trading")
                    || item["contractType"].as_str() != Some("LinearPerpetual")
                    || !is_perpetual_quote(symbol, &self.quote)
                {
                    continue;
                }

                let lot = &item["lotSizeFilter"];
                let price_filter = &item["priceFilter"];

                metas.push(SymbolMeta {
                    symbol: symbol.to_string(),
                    min_qty: parse_decimal_field(&lot["minOrderQty"])
                        .unwrap_or_else(|_| Decimal::new(1, 3)),
                    qty_step: parse_decimal_field(&lot["qtyStep"])
                        .unwrap_or_else(|_| Decimal::new(1, 3)),
                    tick_size: parse_decimal_field(&price_filter["tickSize"])
                        .unwrap_or_else(|_| Decimal::new(1, 2)),
                });
            }

            cursor = result["nextPageCursor"].as_str().unwrap_or_default().to_string();
            if cursor.is_empty() {
                break;
            }
        }

        let mut cache = self.meta_cache.write();
        for meta in &metas {
            cache.insert(meta.symbol.clone(), meta.clone());
        }
        drop(cache);

        debug!(count = metas.len(), "bybit symbol metadata fetched");
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
            .ok_or_else(|| GatewayError::Domain(format!("{symbol} is not tradable on bybit")))
    }

    async fn fetch_tickers(&self) -> GatewayResult<HashMap<String, Ticker>> {
        let result = with_retry("bybit.fetch_tickers", || {
            self.get_public("/v5/market/tickers", "category=linear")
        })
        .await?;

        let list = result["list"]
            .as_array()
            .ok_or_else(|| GatewayError::Protocol("tickers missing list".into()))?;

        let mut tickers = HashMap::new();
        for item in list {
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

            let bid: Option<f64> = item["bid1Price"].as_str().and_then(|s| s.parse().ok());
            let ask: Option<f64> = item["ask1Price"].as_str().and_then(|s| s.parse().ok());
            let turnover: f64 = item["turnover24h"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);

            tickers.insert(
                symbol.to_string(),
                Ticker {
                    symbol: symbol.to_string(),
                    last_price,
                    bid: bid.filter(|p| *p > 0.0),
                    ask: ask.filter(|p| *p > 0.0),
                    volume_24h: turnover,
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

        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side_str(side),
            "orderType": "Limit",
            "qty": qty.normalize().to_string(),
            "price": price.normalize().to_string(),
            "timeInForce": "GTC",
        });

        debug!(symbol, side = %side, %qty, %price, "bybit placing limit order");
        let result = self.post_signed("/v5/order/create", body).await?;
        let id = result["orderId"]
            .as_str()
            .ok_or_else(|| GatewayError::Protocol("create response missing orderId".into()))?;

        // The create ack carries only the id; fetch the full order state.
        self.fetch_order(id, symbol).await
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> GatewayResult<Order> {
        self.require_order_entry()?;

        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "side": side_str(side),
            "orderType": "Market",
            "qty": qty.normalize().to_string(),
        });

        debug!(symbol, side = %side, %qty, "bybit placing market order");
        let result = self.post_signed("/v5/order/create", body).await?;
        let id = result["orderId"]
            .as_str()
            .ok_or_else(|| GatewayError::Protocol("create response missing orderId".into()))?;

        self.fetch_order(id, symbol).await
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> GatewayResult<Order> {
        // The realtime endpoint answers for open AND recently closed orders,
        // which is what reconciliation needs.
        let query = format!("category=linear&symbol={symbol}&orderId={id}");
        let result = with_retry("bybit.fetch_order", || {
            self.get_signed("/v5/order/realtime", &query)
        })
        .await?;

        let item = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .ok_or_else(|| GatewayError::OrderNotFound(id.to_string()))?;

        self.parse_order(symbol, item)
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> GatewayResult<Order> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "orderId": id,
        });

        debug!(symbol, order_id = id, "bybit cancelling order");
        self.post_signed("/v5/order/cancel", body).await?;

        // The cancel ack carries only ids; fetch for authoritative fills.
        self.fetch_order(id, symbol).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });

        match self.post_signed("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            Err(GatewayError::Venue { code, message })
                if code == ERR_LEVERAGE_NOT_MODIFIED
                    || message.contains("leverage not modified") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_isolated_margin(&self, symbol: &str) -> GatewayResult<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": symbol,
            "tradeMode": 1,
            "buyLeverage": "1",
            "sellLeverage": "1",
        });

        match self.post_signed("/v5/position/switch-isolated", body).await {
            Ok(_) => Ok(()),
            Err(GatewayError::Venue { code, message })
                if code == ERR_MARGIN_NOT_MODIFIED || message.contains("not modified") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_balance(&self, asset: &str) -> GatewayResult<f64> {
        let query = format!("accountType=UNIFIED&coin={asset}");
        let result = with_retry("bybit.fetch_balance", || {
            self.get_signed("/v5/account/wallet-balance", &query)
        })
        .await?;

        let coins = result["list"]
            .as_array()
            .and_then(|l| l.first())
            .and_then(|acct| acct["coin"].as_array())
            .ok_or_else(|| GatewayError::Protocol("wallet-balance missing coin list".into()))?;

        for coin in coins {
            if coin["coin"].as_str() == Some(asset) {
                let free: f64 = coin["availableToWithdraw"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| coin["walletBalance"].as_str().and_then(|s| s.parse().ok()))
                    .unwrap_or(0.0);
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in bybit wallet; treating as 0");
        Ok(0.0)
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "Buy",
        Side::Sell => "Sell",
    }
}

impl std::fmt::Debug for BybitGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitGateway")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("fetch_only", &self.fetch_only)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> BybitGateway {
        let cfg = VenueConfig {
            enabled: true,
            fetch_only: false,
            api_key: "test-key".into(),
            secret: "test-secret".into(),
            max_reconnect_attempts: 0,
        };
        BybitGateway::new(&cfg, "USDT")
    }

    #[test]
    fn signature_is_deterministic_and_hex() {
        let gw = gateway();
        let a = gw.sign("1718000000000", "category=linear&symbol=BTCUSDT");
        let b = gw.sign("1718000000000", "category=linear&symbol=BTCUSDT");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        // Any payload change must change the signature.
        let c = gw.sign("1718000000000", "category=linear&symbol=ETHUSDT");
        assert_ne!(a, c);
    }

    #[test]
    fn status_mapping_covers_canonical_set() {
        assert_eq!(map_status("New").unwrap(), OrderStatus::Pending);
        assert_eq!(map_status("PartiallyFilled").unwrap(), OrderStatus::Partial);
        assert_eq!(map_status("Filled").unwrap(), OrderStatus::Filled);
        assert_eq!(map_status("Cancelled").unwrap(), OrderStatus::Cancelled);
        assert_eq!(
            map_status("PartiallyFilledCanceled").unwrap(),
            OrderStatus::Cancelled
        );
        assert_eq!(map_status("Rejected").unwrap(), OrderStatus::Rejected);
        assert!(map_status("Mystery").is_err());
    }

    #[test]
    fn parses_filled_order_from_realtime_response() {
        let gw = gateway();
        let item: serde_json::Value = serde_json::from_str(
            r#"{
                "symbol": "BANANAS31USDT",
                "orderType": "Limit",
                "orderId": "db84d4a7-8800-4292-a027-abb8a08528c1",
                "avgPrice": "0.008805",
                "orderStatus": "Filled",
                "cumExecValue": "9.6855",
                "price": "0.008805",
                "createdTime": "1750991251841",
                "timeInForce": "GTC",
                "side": "Buy",
                "cumExecQty": "1100",
                "qty": "1100",
                "updatedTime": "1750991253554"
            }"#,
        )
        .unwrap();

        let order = gw.parse_order("BANANAS31USDT", &item).unwrap();
        assert_eq!(order.id, "db84d4a7-8800-4292-a027-abb8a08528c1");
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.requested_qty, Decimal::from(1100));
        assert_eq!(order.filled_qty, Decimal::from(1100));
        assert_eq!(
            order.avg_fill_price.unwrap(),
            Decimal::from_str("0.008805").unwrap()
        );
        assert_eq!(order.created_at_ms, 1750991251841);
    }

    #[test]
    fn empty_string_fields_read_as_absent() {
        assert!(parse_decimal_field(&serde_json::Value::String(String::new())).is_err());
        assert!(parse_decimal_field(&serde_json::Value::Null).is_err());
        assert_eq!(
            parse_decimal_field(&serde_json::Value::String("1.5".into())).unwrap(),
            Decimal::from_str("1.5").unwrap()
        );
    }
}
