// =============================================================================
// Spread Aggregator — joins the two price boards into per-symbol spread series
// =============================================================================
//
// Every tick the aggregator snapshots both boards, intersects the symbol
// sets, computes the signed spread percentage for each common symbol and
// appends it to a bounded ring buffer. Obviously bad ticks (price ratio over
// 10x, or a spread outside the price-band cap) are rejected before they can
// poison the buffers.
//
// Spread convention: (binance_price - bybit_price) / min(...) * 100. A
// positive sign means venue A (Binance) is richer.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::AggregationConfig;
use crate::feed::PriceBoard;
use crate::types::now_ms;

/// Sign classification of one spread sample against the entry threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadSign {
    Positive,
    Negative,
    Neutral,
}

/// One spread observation. Immutable once created.
#[derive(Debug, Clone, Copy)]
pub struct SpreadSample {
    pub ts_ms: i64,
    pub binance_price: f64,
    pub bybit_price: f64,
    pub binance_volume: f64,
    pub bybit_volume: f64,
    /// Signed percent: positive ⇔ Binance richer.
    pub spread_pct: f64,
    pub sign: SpreadSign,
}

/// Classify a signed spread percentage against `threshold` (absolute).
/// Exact equality on the boundary maps to the threshold's sign.
pub fn classify_spread(spread_pct: f64, threshold: f64) -> SpreadSign {
    let threshold = threshold.abs();
    if spread_pct >= threshold {
        SpreadSign::Positive
    } else if spread_pct <= -threshold {
        SpreadSign::Negative
    } else {
        SpreadSign::Neutral
    }
}

/// Reject obviously bad tick pairs before they reach the buffers.
///
/// A price ratio above 10x between venues, or an absolute spread above the
/// band cap for the pair's average price, indicates a stale or corrupt tick
/// rather than a tradable dislocation.
fn passes_sanity_filter(binance_price: f64, bybit_price: f64, spread_pct: f64) -> bool {
    let (hi, lo) = if binance_price > bybit_price {
        (binance_price, bybit_price)
    } else {
        (bybit_price, binance_price)
    };
    if lo <= 0.0 || hi / lo > 10.0 {
        return false;
    }

    let avg = (binance_price + bybit_price) / 2.0;
    let cap = if avg >= 1000.0 {
        1.0
    } else if avg >= 10.0 {
        2.0
    } else if avg >= 0.1 {
        5.0
    } else {
        10.0
    };

    spread_pct.abs() <= cap
}

/// Joins the two feeds into bounded per-symbol spread histories.
pub struct SpreadAggregator {
    binance: Arc<PriceBoard>,
    bybit: Arc<PriceBoard>,
    buffers: RwLock<HashMap<String, VecDeque<SpreadSample>>>,
    max_history: usize,
    threshold: f64,
    stale_ttl_secs: u64,
    interval: Duration,
}

impl SpreadAggregator {
    pub fn new(
        binance: Arc<PriceBoard>,
        bybit: Arc<PriceBoard>,
        cfg: &AggregationConfig,
        threshold: f64,
    ) -> Self {
        Self {
            binance,
            bybit,
            buffers: RwLock::new(HashMap::new()),
            max_history: cfg.max_history.max(1),
            threshold,
            stale_ttl_secs: cfg.stale_feed_ttl_secs,
            interval: Duration::from_secs_f64(cfg.interval.max(0.05)),
        }
    }

    /// Run the periodic aggregation loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            max_history = self.max_history,
            threshold = self.threshold,
            "spread aggregator started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("spread aggregator stopping");
                    return;
                }
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    /// One aggregation pass. Public so the selection logic can be exercised
    /// deterministically.
    pub fn tick(&self) {
        let binance = self.binance.snapshot();
        let bybit = self.bybit.snapshot();

        if binance.is_empty() || bybit.is_empty() {
            debug!(
                binance = binance.len(),
                bybit = bybit.len(),
                "aggregator tick skipped: a feed is empty"
            );
            return;
        }

        if self.binance.is_stale(self.stale_ttl_secs) || self.bybit.is_stale(self.stale_ttl_secs) {
            warn!(
                ttl_secs = self.stale_ttl_secs,
                "aggregator tick dropped: a feed has gone stale"
            );
            return;
        }

        let ts_ms = now_ms();
        let mut appended = 0usize;

        let mut buffers = self.buffers.write();
        for (symbol, b_sample) in binance.iter() {
            let Some(y_sample) = bybit.get(symbol) else {
                continue;
            };

            let binance_price = b_sample.last_price;
            let bybit_price = y_sample.last_price;
            if binance_price <= 0.0 || bybit_price <= 0.0 {
                continue;
            }

            let spread_pct =
                (binance_price - bybit_price) / binance_price.min(bybit_price) * 100.0;

            if !passes_sanity_filter(binance_price, bybit_price, spread_pct) {
                debug!(
                    symbol,
                    binance_price, bybit_price, spread_pct, "sample rejected by sanity filter"
                );
                continue;
            }

            let sample = SpreadSample {
                ts_ms,
                binance_price,
                bybit_price,
                binance_volume: b_sample.volume24h,
                bybit_volume: y_sample.volume24h,
                spread_pct,
                sign: classify_spread(spread_pct, self.threshold),
            };

            let buffer = buffers
                .entry(symbol.clone())
                .or_insert_with(|| VecDeque::with_capacity(self.max_history));
            if buffer.len() == self.max_history {
                buffer.pop_front();
            }
            buffer.push_back(sample);
            appended += 1;
        }
        drop(buffers);

        debug!(appended, "aggregator tick complete");
    }

    // -------------------------------------------------------------------------
    // Read access
    // -------------------------------------------------------------------------

    /// Latest sample for one symbol.
    pub fn latest(&self, symbol: &str) -> Option<SpreadSample> {
        self.buffers
            .read()
            .get(symbol)
            .and_then(|b| b.back())
            .copied()
    }

    /// Last `n` samples (oldest first) for one symbol. Empty when the symbol
    /// has no buffer.
    pub fn window(&self, symbol: &str, n: usize) -> Vec<SpreadSample> {
        let buffers = self.buffers.read();
        match buffers.get(symbol) {
            Some(buffer) => {
                let skip = buffer.len().saturating_sub(n);
                buffer.iter().skip(skip).copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// Latest sample per symbol, for the monitor's scan.
    pub fn latest_by_symbol(&self) -> Vec<(String, SpreadSample)> {
        self.buffers
            .read()
            .iter()
            .filter_map(|(symbol, buffer)| buffer.back().map(|s| (symbol.clone(), *s)))
            .collect()
    }

    /// Number of samples buffered for one symbol.
    pub fn buffer_len(&self, symbol: &str) -> usize {
        self.buffers.read().get(symbol).map_or(0, |b| b.len())
    }

    pub fn symbol_count(&self) -> usize {
        self.buffers.read().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Venue;

    fn boards() -> (Arc<PriceBoard>, Arc<PriceBoard>) {
        (
            Arc::new(PriceBoard::new(Venue::Binance)),
            Arc::new(PriceBoard::new(Venue::Bybit)),
        )
    }

    fn aggregator(
        binance: Arc<PriceBoard>,
        bybit: Arc<PriceBoard>,
        max_history: usize,
        threshold: f64,
    ) -> SpreadAggregator {
        let cfg = AggregationConfig {
            interval: 1.0,
            max_history,
            stale_feed_ttl_secs: 60,
        };
        SpreadAggregator::new(binance, bybit, &cfg, threshold)
    }

    #[test]
    fn sign_classification_with_boundary_equality() {
        assert_eq!(classify_spread(0.6, 0.5), SpreadSign::Positive);
        assert_eq!(classify_spread(0.5, 0.5), SpreadSign::Positive);
        assert_eq!(classify_spread(0.49, 0.5), SpreadSign::Neutral);
        assert_eq!(classify_spread(-0.49, 0.5), SpreadSign::Neutral);
        assert_eq!(classify_spread(-0.5, 0.5), SpreadSign::Negative);
        assert_eq!(classify_spread(-0.7, 0.5), SpreadSign::Negative);
    }

    #[test]
    fn spread_is_signed_against_the_cheaper_venue() {
        let (binance, bybit) = boards();
        let mut volumes = std::collections::HashMap::new();
        volumes.insert("BTCUSDT".to_string(), 8_000_000.0);
        binance.set_volumes(volumes.clone());
        bybit.set_volumes(volumes);

        binance.update_price("BTCUSDT", 50_050.0);
        bybit.update_price("BTCUSDT", 50_000.0);

        let agg = aggregator(binance, bybit, 10, 0.05);
        agg.tick();

        let sample = agg.latest("BTCUSDT").unwrap();
        assert!((sample.spread_pct - 0.1).abs() < 1e-9);
        assert_eq!(sample.sign, SpreadSign::Positive);
        // Per-venue volumes travel with the sample.
        assert!((sample.binance_volume - 8_000_000.0).abs() < f64::EPSILON);
        assert!((sample.bybit_volume - 8_000_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn only_common_symbols_are_buffered() {
        let (binance, bybit) = boards();
        binance.update_price("BTCUSDT", 50_000.0);
        binance.update_price("ONLYAUSDT", 1.0);
        bybit.update_price("BTCUSDT", 50_010.0);
        bybit.update_price("ONLYBUSDT", 1.0);

        let agg = aggregator(binance, bybit, 10, 0.5);
        agg.tick();

        assert_eq!(agg.symbol_count(), 1);
        assert!(agg.latest("BTCUSDT").is_some());
        assert!(agg.latest("ONLYAUSDT").is_none());
    }

    #[test]
    fn buffer_is_bounded_and_ordered() {
        let (binance, bybit) = boards();
        let agg = aggregator(binance.clone(), bybit.clone(), 5, 0.5);

        for i in 0..12 {
            binance.update_price("ETHUSDT", 3000.0 + i as f64);
            bybit.update_price("ETHUSDT", 3000.0);
            agg.tick();
        }

        assert_eq!(agg.buffer_len("ETHUSDT"), 5);

        let window = agg.window("ETHUSDT", 5);
        assert_eq!(window.len(), 5);
        for pair in window.windows(2) {
            assert!(pair[0].ts_ms <= pair[1].ts_ms, "samples must stay ordered");
        }
        // newest sample reflects the last published price
        assert!((window[4].binance_price - 3011.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_feed_produces_no_samples() {
        let (binance, bybit) = boards();
        binance.update_price("BTCUSDT", 50_000.0);
        // bybit never receives a price

        let agg = aggregator(binance, bybit, 10, 0.5);
        for _ in 0..3 {
            agg.tick();
        }

        assert_eq!(agg.symbol_count(), 0);
    }

    #[test]
    fn sanity_filter_rejects_bad_ticks() {
        // ratio above 10x
        assert!(!passes_sanity_filter(100.0, 5.0, 1900.0));
        // high-price band allows at most 1%
        assert!(!passes_sanity_filter(2020.0, 2000.0, 1.0000001));
        assert!(passes_sanity_filter(2010.0, 2000.0, 0.5));
        // mid band allows 2%
        assert!(passes_sanity_filter(101.5, 100.0, 1.5));
        assert!(!passes_sanity_filter(103.0, 100.0, 3.0));
        // sub-0.1 band allows 10%
        assert!(passes_sanity_filter(0.0108, 0.01, 8.0));
    }

    #[test]
    fn oversized_spread_never_reaches_buffer() {
        let (binance, bybit) = boards();
        binance.update_price("BTCUSDT", 60_000.0); // 20% apart: clearly bad
        bybit.update_price("BTCUSDT", 50_000.0);

        let agg = aggregator(binance, bybit, 10, 0.5);
        agg.tick();

        assert!(agg.latest("BTCUSDT").is_none());
    }

    #[test]
    fn window_shorter_than_request_returns_what_exists() {
        let (binance, bybit) = boards();
        binance.update_price("BTCUSDT", 50_000.0);
        bybit.update_price("BTCUSDT", 50_010.0);

        let agg = aggregator(binance, bybit, 10, 0.5);
        agg.tick();
        agg.tick();

        assert_eq!(agg.window("BTCUSDT", 5).len(), 2);
        assert!(agg.window("UNSEEN", 5).is_empty());
    }
}
