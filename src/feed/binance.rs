// =============================================================================
// Binance Futures Price Feed — aggTrade streams + periodic metadata refresh
// =============================================================================
//
// Discovery: /fapi/v1/exchangeInfo filtered to TRADING + PERPETUAL + quote
// currency. Streaming: aggTrade for all discovered symbols, chunked at 200
// streams per connection (venue limit). 24h quote volumes come from the bulk
// /fapi/v1/ticker/24hr endpoint and are refreshed on the metadata cadence.
//
// Reconnects use exponential backoff min(1s * 2^attempt, 60s); the attempt
// counter resets on any successful message. The reconnect budget is bounded
// for this venue (configurable, 0 = unbounded).
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::feed::PriceBoard;
use crate::types::is_perpetual_quote;

const REST_URL: &str = "https://fapi.binance.com";
const WS_URL: &str = "wss://fstream.binance.com/ws";

/// Venue limit on streams multiplexed over one connection.
const MAX_STREAMS_PER_CONNECTION: usize = 200;

/// Backoff delay for reconnect `attempt` (1-based): min(1s * 2^(n-1), 60s).
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_secs((1u64 << exp).min(60))
}

pub struct BinanceFeed {
    board: Arc<PriceBoard>,
    http: reqwest::Client,
    quote: String,
    max_reconnect_attempts: u32,
    refresh_interval: Duration,
}

impl BinanceFeed {
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

    /// Run the feed until shutdown: discover symbols, stream prices in
    /// chunks, refresh volumes and the symbol universe periodically.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        'outer: loop {
            // ── Discovery (retried until it succeeds or we shut down) ──
            let symbols = loop {
                if *shutdown.borrow() {
                    return;
                }
                match self.fetch_perp_symbols().await {
                    Ok(symbols) if !symbols.is_empty() => break symbols,
                    Ok(_) => warn!("binance returned no tradable perpetual symbols"),
                    Err(e) => warn!(error = %e, "binance symbol discovery failed"),
                }
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            };

            info!(count = symbols.len(), "binance perpetual symbols discovered");

            if let Err(e) = self.refresh_volumes().await {
                warn!(error = %e, "binance 24h volume snapshot failed");
            }

            // ── Stream tasks, one per chunk ────────────────────────────
            let handles: Vec<JoinHandle<()>> = symbols
                .chunks(MAX_STREAMS_PER_CONNECTION)
                .map(|chunk| {
                    let feed = self.clone();
                    let chunk = chunk.to_vec();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move { feed.run_chunk(chunk, shutdown).await })
                })
                .collect();

            info!(
                connections = handles.len(),
                "binance trade streams launched"
            );

            // ── Refresh cycle ──────────────────────────────────────────
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        for h in &handles {
                            h.abort();
                        }
                        return;
                    }
                    _ = tokio::time::sleep(self.refresh_interval) => {
                        if let Err(e) = self.refresh_volumes().await {
                            warn!(error = %e, "binance 24h volume refresh failed");
                        }
                        match self.fetch_perp_symbols().await {
                            Ok(fresh) => {
                                let old: HashSet<&String> = symbols.iter().collect();
                                let new: HashSet<&String> = fresh.iter().collect();
                                if old != new {
                                    info!(
                                        old = symbols.len(),
                                        new = fresh.len(),
                                        "binance symbol universe changed; resubscribing"
                                    );
                                    for h in &handles {
                                        h.abort();
                                    }
                                    continue 'outer;
                                }
                            }
                            Err(e) => warn!(error = %e, "binance symbol refresh failed"),
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // REST metadata
    // -------------------------------------------------------------------------

    /// Fetch all currently tradable perpetual symbols in the configured quote
    /// currency.
    async fn fetch_perp_symbols(&self) -> Result<Vec<String>> {
        let url = format!("{REST_URL}/fapi/v1/exchangeInfo");
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/exchangeInfo request failed")?
            .json()
            .await
            .context("failed to parse exchangeInfo response")?;

        let raw = body["symbols"]
            .as_array()
            .context("exchangeInfo response missing 'symbols' array")?;

        let mut symbols = Vec::new();
        for item in raw {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            let status = item["status"].as_str().unwrap_or_default();
            let contract_type = item["contractType"].as_str().unwrap_or_default();
            let quote_asset = item["quoteAsset"].as_str().unwrap_or_default();

            if status == "TRADING"
                && contract_type == "PERPETUAL"
                && quote_asset == self.quote
                && is_perpetual_quote(symbol, &self.quote)
            {
                symbols.push(symbol.to_string());
            }
        }
        Ok(symbols)
    }

    /// Fetch the 24h quote-volume snapshot and merge it into the board.
    async fn refresh_volumes(&self) -> Result<usize> {
        let url = format!("{REST_URL}/fapi/v1/ticker/24hr");
        let body: serde_json::Value = self
            .http
            .get(&url)
            .send()
            .await
            .context("GET /fapi/v1/ticker/24hr request failed")?
            .json()
            .await
            .context("failed to parse 24hr ticker response")?;

        let raw = body.as_array().context("24hr ticker response is not an array")?;

        let mut volumes = std::collections::HashMap::new();
        for item in raw {
            let symbol = item["symbol"].as_str().unwrap_or_default();
            if !is_perpetual_quote(symbol, &self.quote) {
                continue;
            }
            let volume: f64 = item["quoteVolume"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            volumes.insert(symbol.to_string(), volume);
        }

        let count = volumes.len();
        self.board.set_volumes(volumes);
        debug!(count, "binance 24h volumes refreshed");
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    /// Reconnect loop for one chunk of symbols.
    async fn run_chunk(&self, symbols: Vec<String>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.stream_chunk(&symbols, &mut shutdown, &mut attempt).await {
                Ok(()) => return, // clean shutdown
                Err(e) => {
                    error!(
                        count = symbols.len(),
                        error = %e,
                        "binance trade stream dropped"
                    );
                }
            }

            attempt += 1;
            if self.max_reconnect_attempts > 0 && attempt > self.max_reconnect_attempts {
                error!(
                    attempts = attempt - 1,
                    "binance feed giving up after exhausting reconnect budget"
                );
                return;
            }

            let delay = reconnect_delay(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "binance feed reconnecting");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection lifetime: connect, read trades, publish prices.
    /// Returns Ok on shutdown, Err when the stream drops.
    async fn stream_chunk(
        &self,
        symbols: &[String],
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> Result<()> {
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| format!("{}@aggTrade", s.to_lowercase()))
            .collect();
        let url = format!("{WS_URL}/{}", streams.join("/"));

        let (ws, _response) = connect_async(&url)
            .await
            .context("failed to connect to binance trade stream")?;
        info!(count = symbols.len(), "binance trade stream connected");

        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        *attempt = 0;
                        match parse_agg_trade(&text) {
                            Ok((symbol, price)) => self.board.update_price(&symbol, price),
                            Err(e) => debug!(error = %e, "failed to parse aggTrade message"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        *attempt = 0;
                        write
                            .send(Message::Pong(payload))
                            .await
                            .context("failed to answer binance ping")?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("binance trade stream read error"),
                    None => anyhow::bail!("binance trade stream ended"),
                }
            }
        }
    }
}

/// Parse a Binance aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "m": true }
/// ```
fn parse_agg_trade(text: &str) -> Result<(String, f64)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;

    let symbol = root["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    Ok((symbol, price))
}
