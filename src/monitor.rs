// =============================================================================
// Spread Monitor — nominates qualified symbols to the trading manager
// =============================================================================
//
// Each tick: drop thin symbols (24h venue-B volume floor), keep the top-N by
// volume, qualify symbols whose last `spread_hold_count` samples all share an
// above-threshold sign, rank by mean absolute spread, and propose the top-K.
//
// Admission rejections are routine: the manager is the only authoritative
// capacity check, and the same symbol is proposed every tick until admitted
// or until it stops qualifying.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::aggregator::{SpreadAggregator, SpreadSign};
use crate::config::MonitoringConfig;
use crate::manager::TradingManager;

/// A symbol that passed every filter this tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub symbol: String,
    /// true ⇔ consecutive positive spreads ⇔ short venue A / long venue B.
    pub direction: bool,
    /// Mean absolute spread over the qualifying window; the ranking key.
    pub score: f64,
}

pub struct SpreadMonitor {
    aggregator: Arc<SpreadAggregator>,
    manager: Arc<TradingManager>,
    min_volume_usdt: f64,
    top_volume_num: usize,
    top_symbols: usize,
    hold_count: usize,
    interval: Duration,
}

impl SpreadMonitor {
    pub fn new(
        aggregator: Arc<SpreadAggregator>,
        manager: Arc<TradingManager>,
        cfg: &MonitoringConfig,
        hold_count: usize,
    ) -> Self {
        Self {
            aggregator,
            manager,
            min_volume_usdt: cfg.min_volume_usdt,
            top_volume_num: cfg.top_volume_num.max(1),
            top_symbols: cfg.top_symbols.max(1),
            hold_count: hold_count.max(1),
            interval: Duration::from_secs_f64(cfg.interval.max(0.1)),
        }
    }

    /// Run the periodic selection loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            min_volume_usdt = self.min_volume_usdt,
            top_volume_num = self.top_volume_num,
            top_symbols = self.top_symbols,
            hold_count = self.hold_count,
            "spread monitor started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("spread monitor stopping");
                    return;
                }
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    /// One selection pass: qualify, rank, and propose.
    pub fn tick(&self) {
        let candidates = self.select_candidates();

        let mut admitted = 0usize;
        for candidate in &candidates {
            if self.manager.try_admit(&candidate.symbol, candidate.direction) {
                admitted += 1;
                info!(
                    symbol = %candidate.symbol,
                    direction = candidate.direction,
                    score = format!("{:.3}", candidate.score),
                    "candidate admitted for trading"
                );
            }
        }

        // One status banner per tick.
        info!(
            active = self.manager.active_count(),
            max = self.manager.max_positions(),
            candidates = candidates.len(),
            admitted,
            watched = self.aggregator.symbol_count(),
            "monitor tick"
        );
    }

    /// Pure selection: volume floor → top-by-volume → persistence → rank.
    pub fn select_candidates(&self) -> Vec<Candidate> {
        // Volume floor on the latest venue-B volume.
        let mut by_volume: Vec<_> = self
            .aggregator
            .latest_by_symbol()
            .into_iter()
            .filter(|(_, sample)| sample.bybit_volume >= self.min_volume_usdt)
            .collect();

        // Top-N by venue-B volume.
        by_volume.sort_by(|a, b| {
            b.1.bybit_volume
                .partial_cmp(&a.1.bybit_volume)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        by_volume.truncate(self.top_volume_num);

        // Persistence: the last `hold_count` samples must all share an
        // above-threshold sign.
        let mut qualified = Vec::new();
        for (symbol, _) in by_volume {
            let window = self.aggregator.window(&symbol, self.hold_count);
            if window.len() < self.hold_count {
                continue;
            }

            let all_positive = window.iter().all(|s| s.sign == SpreadSign::Positive);
            let all_negative = window.iter().all(|s| s.sign == SpreadSign::Negative);
            if !all_positive && !all_negative {
                continue;
            }

            let score =
                window.iter().map(|s| s.spread_pct.abs()).sum::<f64>() / window.len() as f64;

            debug!(
                symbol = %symbol,
                direction = all_positive,
                score = format!("{:.3}", score),
                "symbol qualified"
            );

            qualified.push(Candidate {
                symbol,
                direction: all_positive,
                score,
            });
        }

        // Rank by score, keep the best K.
        qualified.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        qualified.truncate(self.top_symbols);
        qualified
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::SpreadAggregator;
    use crate::config::{AggregationConfig, AppConfig};
    use crate::feed::PriceBoard;
    use crate::gateway::sim::SimGateway;
    use crate::journal::TradeJournal;
    use crate::manager::TraderDeps;
    use crate::types::Venue;
    use std::collections::HashMap;

    struct Rig {
        binance: Arc<PriceBoard>,
        bybit: Arc<PriceBoard>,
        aggregator: Arc<SpreadAggregator>,
        manager: Arc<TradingManager>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn rig(threshold: f64, max_positions: usize) -> Rig {
        let binance = Arc::new(PriceBoard::new(Venue::Binance));
        let bybit = Arc::new(PriceBoard::new(Venue::Bybit));
        let aggregator = Arc::new(SpreadAggregator::new(
            binance.clone(),
            bybit.clone(),
            &AggregationConfig::default(),
            threshold,
        ));

        let mut config = AppConfig::default();
        config.trading.max_positions = max_positions;
        config.trading.spread_threshold = threshold;

        let dir = std::env::temp_dir().join(format!("monitor-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let deps = TraderDeps {
            aggregator: aggregator.clone(),
            binance: Arc::new(SimGateway::new(Venue::Binance)),
            bybit: Arc::new(SimGateway::new(Venue::Bybit)),
            config: Arc::new(config),
            journal: Arc::new(TradeJournal::new(dir.join("trades.jsonl"))),
        };

        let (tx, rx) = watch::channel(false);
        Rig {
            binance,
            bybit,
            aggregator,
            manager: TradingManager::new(deps, rx),
            _shutdown_tx: tx,
        }
    }

    fn monitor(rig: &Rig, cfg: MonitoringConfig, hold: usize) -> SpreadMonitor {
        SpreadMonitor::new(rig.aggregator.clone(), rig.manager.clone(), &cfg, hold)
    }

    fn cfg(min_volume: f64, top_volume: usize, top_symbols: usize) -> MonitoringConfig {
        MonitoringConfig {
            fetch_interval: 3600,
            interval: 5.0,
            min_volume_usdt: min_volume,
            top_volume_num: top_volume,
            top_symbols,
        }
    }

    /// Push `n` aggregator samples with a fixed percentage spread.
    fn push_samples(rig: &Rig, symbol: &str, spread_pct: f64, volume: f64, n: usize) {
        let mut volumes = HashMap::new();
        volumes.insert(symbol.to_string(), volume);
        rig.bybit.set_volumes(volumes);

        for _ in 0..n {
            let base = 100.0;
            rig.bybit.update_price(symbol, base);
            rig.binance.update_price(symbol, base * (1.0 + spread_pct / 100.0));
            rig.aggregator.tick();
        }
    }

    #[tokio::test]
    async fn qualifies_with_exactly_hold_count_samples_not_one_less() {
        let rig = rig(0.5, 3);
        let mon = monitor(&rig, cfg(1_000_000.0, 300, 3), 3);

        push_samples(&rig, "AAAUSDT", 0.6, 5_000_000.0, 2);
        assert!(
            mon.select_candidates().is_empty(),
            "hold_count - 1 samples must not qualify"
        );

        push_samples(&rig, "AAAUSDT", 0.6, 5_000_000.0, 1);
        let candidates = mon.select_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].symbol, "AAAUSDT");
        assert!(candidates[0].direction, "positive spreads short venue A");
    }

    #[tokio::test]
    async fn mixed_signs_do_not_qualify() {
        let rig = rig(0.5, 3);
        let mon = monitor(&rig, cfg(1_000_000.0, 300, 3), 3);

        push_samples(&rig, "AAAUSDT", 0.6, 5_000_000.0, 2);
        push_samples(&rig, "AAAUSDT", -0.6, 5_000_000.0, 1);
        assert!(mon.select_candidates().is_empty());
    }

    #[tokio::test]
    async fn negative_runs_qualify_with_mirrored_direction() {
        let rig = rig(0.5, 3);
        let mon = monitor(&rig, cfg(1_000_000.0, 300, 3), 3);

        push_samples(&rig, "AAAUSDT", -0.7, 5_000_000.0, 3);
        let candidates = mon.select_candidates();
        assert_eq!(candidates.len(), 1);
        assert!(!candidates[0].direction, "negative spreads long venue A");
        assert!((candidates[0].score - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn volume_floor_is_inclusive_at_the_boundary() {
        let rig = rig(0.5, 3);
        let mon = monitor(&rig, cfg(5_000_000.0, 300, 3), 3);

        // Exactly at the floor passes.
        push_samples(&rig, "AAAUSDT", 0.6, 5_000_000.0, 3);
        // One unit below fails.
        push_samples(&rig, "BBBUSDT", 0.8, 4_999_999.0, 3);

        let candidates = mon.select_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].symbol, "AAAUSDT");
    }

    #[tokio::test]
    async fn ranks_by_mean_absolute_spread_and_truncates_to_top_k() {
        let rig = rig(0.3, 3);
        let mon = monitor(&rig, cfg(1_000_000.0, 300, 2), 3);

        push_samples(&rig, "LOWUSDT", 0.4, 5_000_000.0, 3);
        push_samples(&rig, "MIDUSDT", 0.6, 5_000_000.0, 3);
        push_samples(&rig, "TOPUSDT", 0.9, 5_000_000.0, 3);

        let candidates = mon.select_candidates();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].symbol, "TOPUSDT");
        assert_eq!(candidates[1].symbol, "MIDUSDT");
    }

    #[tokio::test]
    async fn top_volume_cutoff_drops_thin_symbols_before_qualification() {
        let rig = rig(0.3, 3);
        // Only the single highest-volume symbol is even inspected.
        let mon = monitor(&rig, cfg(1_000_000.0, 1, 3), 3);

        push_samples(&rig, "BIGUSDT", 0.4, 9_000_000.0, 3);
        push_samples(&rig, "SMALLUSDT", 0.9, 2_000_000.0, 3);

        let candidates = mon.select_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].symbol, "BIGUSDT");
    }

    #[tokio::test]
    async fn capacity_rejection_leaves_active_set_unchanged() {
        let rig = rig(0.5, 2);
        let mon = monitor(&rig, cfg(1_000_000.0, 300, 3), 3);

        // Fill both slots with long-running placeholders.
        assert!(rig.manager.admit_task("AAAUSDT", std::future::pending()));
        assert!(rig.manager.admit_task("BBBUSDT", std::future::pending()));

        // A fully qualified third symbol is proposed and rejected.
        push_samples(&rig, "CCCUSDT", 0.8, 9_000_000.0, 3);
        mon.tick();

        assert_eq!(rig.manager.active_count(), 2);
        let mut active = rig.manager.active_symbols();
        active.sort();
        assert_eq!(active, vec!["AAAUSDT", "BBBUSDT"]);
    }

    #[tokio::test]
    async fn empty_aggregator_proposes_nothing() {
        let rig = rig(0.5, 3);
        let mon = monitor(&rig, cfg(1_000_000.0, 300, 3), 3);

        mon.tick();
        assert_eq!(rig.manager.active_count(), 0);
    }
}
