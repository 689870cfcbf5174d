// =============================================================================
// Bybit Linear Perpetual Price Feed — publicTrade stream + metadata refresh
// =============================================================================
//
// Discovery: /v5/market/instruments-info?category=linear (cursor-paginated),
// filtered to Trading linear perpetuals in the quote currency; dated
// contracts (BTCUSDT-26DEC25 form) are excluded. Streaming: one connection to
// the v5 linear public endpoint, subscribing publicTrade topics in chunks of
// 10 per subscribe message (venue limit). 24h turnover comes from the bulk
// /v5/market/tickers endpoint.
//
// The venue expects an application-level {"op":"ping"} every 20 seconds and
// sends its own pings, which must be answered with {"op":"pong"}. The
// reconnect budget defaults to unbounded for this venue.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::feed::binance::reconnect_delay;
use crate::feed::PriceBoard;
use crate::types::is_perpetual_quote;

const REST_URL: &str = "https://api.bybit.com";
const WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";

/// Venue limit on topics per subscribe message.
const MAX_TOPICS_PER_SUBSCRIBE: usize = 10;

/// Keepalive ping cadence required by the venue.
const KEEPALIVE_SECS: u64 = 20;

pub struct BybitFeed {
    board: Arc<PriceBoard>,
    http: reqwest::Client,
    quote: String,
    max_reconnect_attempts: u32,
    refresh_interval: Duration,
}

impl BybitFeed {
    pub fn new(
        board: Arc<PriceBoard>,
        quote: impl Into<String>,
        max_reconnect_attempts: u32,
        refresh_interval_secs: u64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            board,
            http,
            quote: quote.into(),
            max_reconnect_attempts,
            refresh_interval: Duration::from_secs(refresh_interval_secs.max(60)),
        }
    }

    /// Run the feed until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        // ── Discovery (retried until it succeeds or we shut down) ──────
        let mut symbols = loop {
            if *shutdown.borrow() {
                return;
            }
            match self.fetch_perp_symbols().await {
                Ok(symbols) if !symbols.is_empty() => break symbols,
                Ok(_) => warn!("bybit returned no tradable perpetual symbols"),
                Err(e) => warn!(error = %e, "bybit symbol discovery failed"),
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        };

        info!(count = symbols.len(), "bybit perpetual symbols discovered");

        if let Err(e) = self.refresh_volumes().await {
            warn!(error = %e, "bybit 24h volume snapshot failed");
        }

        let mut next_refresh = tokio::time::Instant::now() + self.refresh_interval;

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self
                .stream_trades(&symbols, &mut shutdown, &mut attempt, &mut next_refresh)
                .await
            {
                Ok(StreamEnd::Shutdown) => return,
                Ok(StreamEnd::Resubscribe(fresh)) => {
                    symbols = fresh;
                    continue;
                }
                Err(e) => error!(error = %e, "bybit trade stream dropped"),
            }

            attempt += 1;
            if self.max_reconnect_attempts > 0 && attempt > self.max_reconnect_attempts {
                error!(
                    attempts = attempt - 1,
                    "bybit feed giving up after exhausting reconnect budget"
                );
                return;
            }

            let delay = reconnect_delay(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "bybit feed reconnecting");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    // -------------------------------------------------------------------------
    // REST metadata
    // -------------------------------------------------------------------------

    /// Fetch all tradable linear-perpetual symbols in the quote currency.
    async fn fetch_perp_symbols(&self) -> Result<Vec<String>> {
        let mut symbols = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut url =
                format!("{REST_URL}/v5/market/instruments-info?category=linear&limit=1000");
            if !cursor.is_empty() {
                url.push_str(&format!("&cursor={cursor}"));
            }

            let body: serde_json::Value = self
                .http
                .get(&url)
                .send()
                .await
                .context("GET /v5/market/instruments-info request failed")?
                .json()
                .await
                .context("failed to parse instruments-info response")?;

            if body["retCode"].as_i64().unwrap_or(-1) != 0 {
                anyhow::bail!(
                    "bybit instruments-info error: {}",
                    body["retMsg"].as_str().unwrap_or("unknown")
                );
            }

            let list = body["result"]["list"]
                .as_array()
                .context("instruments-info response missing result.list")?;

            for item in list {
                let symbol = item["symbol"].as_str().unwrap_or_default();
                let status = item["status"].as_str().unwrap_or_default();
                let contract_type = item["contractType"].as_str().unwrap_or_default();

                if status == "Trading"
                    && contract_type == "LinearPerpetual"
                    && is_perpetual_quote(symbol, &self.quote)
                {
                    symbols.push(symbol.to_string());
                }
            }

            cursor = body["result"]["nextPageCursor"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            if cursor.is_empty() {
                break;
            }
        }

        Ok(symbols)
    }

    /// Fetch the 24h turnover snapshot and merge it into the board.
    async fn refresh_volumes(&self) -> Result<usize> {
        let url = format!("{REST_URL}/v5/market/tickers?category=linear");
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .context("GET /v5/market/tickers request failed")?
            .json()
            .await
            .context("failed to parse tickers response")?;

        if body["retCode"].as_i64().unwrap_or(-1) != 0 {
            anyhow::bail!(
                "bybit tickers error: {}",
                body["retMsg"].as_str().unwrap_or("unknown")
            );
        }

        let list = body["result"]["list"]
            .as_array()
            .context("tickers response missing result.list")?;

        let mut volumes = std::collections::HashMap::new();
        for item in list {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            if !is_perpetual_quote(symbol, &self.quote) {
                continue;
            }
            // turnover24h is already quote-currency notional.
            let turnover: f64 = item["turnover24h"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            volumes.insert(symbol.to_string(), turnover);
        }

        let count = volumes.len();
        self.board.set_volumes(volumes);
        debug!(count, "bybit 24h turnover refreshed");
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    /// One connection lifetime: subscribe, read trades, keep the link alive,
    /// refresh metadata on cadence.
    async fn stream_trades(
        &self,
        symbols: &[String],
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
        next_refresh: &mut tokio::time::Instant,
    ) -> Result<StreamEnd> {
        let (ws, _response) = connect_async(WS_URL)
            .await
            .context("failed to connect to bybit trade stream")?;
        info!(count = symbols.len(), "bybit trade stream connected");

        let (mut write, mut read) = ws.split();

        // Subscribe in chunks to respect the per-message topic limit.
        for chunk in symbols.chunks(MAX_TOPICS_PER_SUBSCRIBE) {
            let args: Vec<String> = chunk.iter().map(|s| format!("publicTrade.{s}")).collect();
            let msg = serde_json::json!({ "op": "subscribe", "args": args });
            write
                .send(Message::Text(msg.to_string()))
                .await
                .context("failed to send bybit subscription")?;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        debug!(topics = symbols.len(), "bybit subscriptions sent");

        let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_SECS));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(StreamEnd::Shutdown);
                }
                _ = keepalive.tick() => {
                    let ping = serde_json::json!({ "op": "ping" });
                    write
                        .send(Message::Text(ping.to_string()))
                        .await
                        .context("failed to send bybit keepalive ping")?;
                }
                _ = tokio::time::sleep_until(*next_refresh) => {
                    *next_refresh = tokio::time::Instant::now() + self.refresh_interval;
                    if let Err(e) = self.refresh_volumes().await {
                        warn!(error = %e, "bybit 24h turnover refresh failed");
                    }
                    match self.fetch_perp_symbols().await {
                        Ok(fresh) => {
                            let old: HashSet<&String> = symbols.iter().collect();
                            let new: HashSet<&String> = fresh.iter().collect();
                            if old != new {
                                info!(
                                    old = symbols.len(),
                                    new = fresh.len(),
                                    "bybit symbol universe changed; resubscribing"
                                );
                                let _ = write.send(Message::Close(None)).await;
                                return Ok(StreamEnd::Resubscribe(fresh));
                            }
                        }
                        Err(e) => warn!(error = %e, "bybit symbol refresh failed"),
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        *attempt = 0;
                        if let Some(pong) = self.handle_message(&text) {
                            write
                                .send(Message::Text(pong))
                                .await
                                .context("failed to answer bybit ping")?;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        *attempt = 0;
                        write
                            .send(Message::Pong(payload))
                            .await
                            .context("failed to answer bybit transport ping")?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("bybit trade stream read error"),
                    None => anyhow::bail!("bybit trade stream ended"),
                }
            }
        }
    }

    /// Process one text frame. Returns a pong payload when the venue pinged
    /// us at the application level.
    fn handle_message(&self, text: &str) -> Option<String> {
        let data: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "invalid bybit JSON frame");
                return None;
            }
        };

        match data["op"].as_str() {
            Some("ping") => {
                let pong = serde_json::json!({ "op": "pong", "args": data["args"].clone() });
                return Some(pong.to_string());
            }
            Some("pong") => return None,
            Some("subscribe") => {
                if data["success"].as_bool() == Some(false) {
                    warn!(frame = %text, "bybit subscription rejected");
                }
                return None;
            }
            _ => {}
        }

        if let Some((symbol, price)) = parse_public_trade(&data) {
            self.board.update_price(&symbol, price);
        }
        None
    }
}

enum StreamEnd {
    Shutdown,
    Resubscribe(Vec<String>),
}

/// Extract `(symbol, last trade price)` from a publicTrade frame.
///
/// Expected shape:
/// ```json
/// { "topic": "publicTrade.BTCUSDT",
///   "data": [ { "p": "37000.5", "v": "0.1", "S": "Buy" } ] }
/// ```
fn parse_public_trade(data: &serde_json::Value) -> Option<(String, f64)> {
    let topic = data["topic"].as_str()?;
    let symbol = topic.strip_prefix("publicTrade.")?;

    let trades = data["data"].as_array()?;
    let latest = trades.last()?;
    let price: f64 = latest["p"].as_str()?.parse().ok()?;

    Some((symbol.to_string(), price))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_public_trade_frame() {
        let frame: serde_json::Value = serde_json::from_str(
            r#"{
                "topic": "publicTrade.BTCUSDT",
                "data": [
                    {"p": "36999.0", "v": "0.2", "S": "Sell"},
                    {"p": "37000.5", "v": "0.1", "S": "Buy"}
                ]
            }"#,
        )
        .unwrap();

        // The last trade in the batch wins.
        let (symbol, price) = parse_public_trade(&frame).unwrap();
        assert_eq!(symbol, "BTCUSDT");
        assert!((price - 37000.5).abs() < f64::EPSILON);
    }

    #[test]
    fn ignores_non_trade_frames() {
        let ack: serde_json::Value =
            serde_json::from_str(r#"{"op":"subscribe","success":true}"#).unwrap();
        assert!(parse_public_trade(&ack).is_none());

        let other: serde_json::Value =
            serde_json::from_str(r#"{"topic":"tickers.BTCUSDT","data":{}}"#).unwrap();
        assert!(parse_public_trade(&other).is_none());
    }

    #[test]
    fn ping_frames_are_answered_with_pong() {
        let board = Arc::new(PriceBoard::new(crate::types::Venue::Bybit));
        let feed = BybitFeed::new(board, "USDT", 0, 3600);

        let pong = feed
            .handle_message(r#"{"op":"ping","args":["1718000000000"]}"#)
            .expect("ping must be answered");
        let parsed: serde_json::Value = serde_json::from_str(&pong).unwrap();
        assert_eq!(parsed["op"].as_str(), Some("pong"));

        assert!(feed.handle_message(r#"{"op":"pong"}"#).is_none());
    }

    #[test]
    fn trade_frames_update_the_board() {
        let board = Arc::new(PriceBoard::new(crate::types::Venue::Bybit));
        let feed = BybitFeed::new(board.clone(), "USDT", 0, 3600);

        feed.handle_message(
            r#"{"topic":"publicTrade.ETHUSDT","data":[{"p":"3000.25","v":"1"}]}"#,
        );

        let snap = board.snapshot();
        assert!((snap["ETHUSDT"].last_price - 3000.25).abs() < f64::EPSILON);
    }
}
