// =============================================================================
// Price Board — copy-on-write per-venue price/volume map
// =============================================================================
//
// Each venue feed is the single writer of its board. Readers take a snapshot
// by cloning an Arc and never hold a lock across downstream work; the writer
// mutates through Arc::make_mut, which only copies the map while a snapshot
// is outstanding.
// =============================================================================

pub mod binance;
pub mod bybit;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::types::{now_ms, Venue};

/// One streamed price observation joined with the latest 24h volume snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PriceSample {
    pub last_price: f64,
    /// 24h quote-currency notional, from the periodic bulk-ticker snapshot.
    pub volume24h: f64,
    pub observed_at_ms: i64,
}

/// Shared `{symbol → PriceSample}` map for one venue.
pub struct PriceBoard {
    venue: Venue,
    map: RwLock<Arc<HashMap<String, PriceSample>>>,
    /// 24h volumes are refreshed on a much slower cadence than prices and
    /// merged into samples as prices arrive.
    volumes: RwLock<HashMap<String, f64>>,
    last_write: RwLock<Option<Instant>>,
}

impl PriceBoard {
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            map: RwLock::new(Arc::new(HashMap::new())),
            volumes: RwLock::new(HashMap::new()),
            last_write: RwLock::new(None),
        }
    }

    pub fn venue(&self) -> Venue {
        self.venue
    }

    /// Record a streamed last-trade price. Non-positive prices are rejected
    /// at this boundary.
    pub fn update_price(&self, symbol: &str, price: f64) {
        if price <= 0.0 || !price.is_finite() {
            debug!(venue = %self.venue, symbol, price, "ignoring non-positive price");
            return;
        }

        let volume = self.volumes.read().get(symbol).copied().unwrap_or(0.0);
        let sample = PriceSample {
            last_price: price,
            volume24h: volume,
            observed_at_ms: now_ms(),
        };

        let mut guard = self.map.write();
        Arc::make_mut(&mut guard).insert(symbol.to_string(), sample);
        drop(guard);

        *self.last_write.write() = Some(Instant::now());
    }

    /// Replace the stored 24h volumes and refresh them on existing samples.
    pub fn set_volumes(&self, volumes: HashMap<String, f64>) {
        let mut guard = self.map.write();
        let map = Arc::make_mut(&mut guard);
        for (symbol, sample) in map.iter_mut() {
            if let Some(v) = volumes.get(symbol) {
                sample.volume24h = *v;
            }
        }
        drop(guard);

        *self.volumes.write() = volumes;
    }

    /// Point-in-time snapshot. Cheap: clones a pointer, not the map.
    pub fn snapshot(&self) -> Arc<HashMap<String, PriceSample>> {
        self.map.read().clone()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// True when no price has been written for longer than `ttl_secs`.
    /// A board that never received a write counts as stale.
    pub fn is_stale(&self, ttl_secs: u64) -> bool {
        match *self.last_write.read() {
            Some(at) => at.elapsed().as_secs() >= ttl_secs,
            None => true,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_prices() {
        let board = PriceBoard::new(Venue::Binance);
        assert_eq!(board.venue(), Venue::Binance);
        board.update_price("BTCUSDT", 0.0);
        board.update_price("BTCUSDT", -1.0);
        board.update_price("BTCUSDT", f64::NAN);
        assert!(board.is_empty());

        board.update_price("BTCUSDT", 50_000.0);
        assert_eq!(board.len(), 1);
        assert!(board.snapshot()["BTCUSDT"].observed_at_ms > 0);
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let board = PriceBoard::new(Venue::Bybit);
        board.update_price("ETHUSDT", 3000.0);

        let snap = board.snapshot();
        board.update_price("ETHUSDT", 3100.0);
        board.update_price("SOLUSDT", 150.0);

        // The held snapshot still sees the old world.
        assert_eq!(snap.len(), 1);
        assert!((snap["ETHUSDT"].last_price - 3000.0).abs() < f64::EPSILON);

        let fresh = board.snapshot();
        assert_eq!(fresh.len(), 2);
        assert!((fresh["ETHUSDT"].last_price - 3100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn volumes_merge_into_existing_and_future_samples() {
        let board = PriceBoard::new(Venue::Bybit);
        board.update_price("BTCUSDT", 50_000.0);
        assert!((board.snapshot()["BTCUSDT"].volume24h - 0.0).abs() < f64::EPSILON);

        let mut volumes = HashMap::new();
        volumes.insert("BTCUSDT".to_string(), 9_000_000.0);
        volumes.insert("ETHUSDT".to_string(), 7_000_000.0);
        board.set_volumes(volumes);

        // existing sample refreshed
        assert!((board.snapshot()["BTCUSDT"].volume24h - 9_000_000.0).abs() < f64::EPSILON);

        // future sample picks its volume up at insert
        board.update_price("ETHUSDT", 3000.0);
        assert!((board.snapshot()["ETHUSDT"].volume24h - 7_000_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_tracks_last_write() {
        let board = PriceBoard::new(Venue::Binance);
        assert!(board.is_stale(10));

        board.update_price("BTCUSDT", 50_000.0);
        assert!(!board.is_stale(10));

        tokio::time::advance(std::time::Duration::from_secs(11)).await;
        assert!(board.is_stale(10));
    }
}
