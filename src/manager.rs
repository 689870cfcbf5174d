// =============================================================================
// Trading Manager — capacity-bounded registry of active symbol traders
// =============================================================================
//
// Admission is the single authoritative capacity check in the system: the
// monitor proposes freely, and this registry accepts only while a slot is
// free and the symbol is not already being traded. Check-and-insert happens
// atomically under one mutex; no venue I/O or other long work ever runs
// under that lock.
//
// A trader panic must never take the manager down: the driver task catches
// the unwind, logs it, and reclaims the slot like any normal completion.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::SpreadAggregator;
use crate::config::AppConfig;
use crate::gateway::VenueGateway;
use crate::journal::TradeJournal;
use crate::trader::Trader;

/// Everything a newly admitted trader needs.
pub struct TraderDeps {
    pub aggregator: Arc<SpreadAggregator>,
    pub binance: Arc<dyn VenueGateway>,
    pub bybit: Arc<dyn VenueGateway>,
    pub config: Arc<AppConfig>,
    pub journal: Arc<TradeJournal>,
}

pub struct TradingManager {
    max_positions: usize,
    deps: TraderDeps,
    shutdown: watch::Receiver<bool>,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TradingManager {
    pub fn new(deps: TraderDeps, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let max_positions = deps.config.trading.max_positions.max(1);
        Arc::new(Self {
            max_positions,
            deps,
            shutdown,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Try to start trading `symbol`. Returns false when the registry is at
    /// capacity or the symbol is already active — both are routine outcomes
    /// the monitor retries on later ticks.
    pub fn try_admit(self: &Arc<Self>, symbol: &str, direction: bool) -> bool {
        let trader = Trader::new(
            symbol.to_string(),
            direction,
            self.deps.aggregator.clone(),
            self.deps.binance.clone(),
            self.deps.bybit.clone(),
            self.deps.config.clone(),
            self.deps.journal.clone(),
            self.shutdown.clone(),
        );

        let admitted = self.admit_task(symbol, trader.run());
        if admitted {
            info!(
                symbol,
                direction,
                active = self.active_count(),
                max = self.max_positions,
                "trader admitted"
            );
        }
        admitted
    }

    /// Atomic check-and-insert plus driver spawn. The future is only spawned
    /// when admission succeeds.
    pub(crate) fn admit_task<F>(self: &Arc<Self>, symbol: &str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut active = self.active.lock();
        if active.len() >= self.max_positions || active.contains_key(symbol) {
            return false;
        }

        let manager = self.clone();
        let owned_symbol = symbol.to_string();
        let handle = tokio::spawn(async move {
            // A panicking trader is a bug, but it must not poison the
            // registry: log it and reclaim the slot.
            if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(symbol = %owned_symbol, panic = %msg, "trader panicked");
            }
            manager.release(&owned_symbol);
        });

        let previous = active.insert(symbol.to_string(), handle);
        // The contains_key check above ran under the same lock.
        assert!(previous.is_none(), "duplicate admission for {symbol}");
        true
    }

    fn release(&self, symbol: &str) {
        if self.active.lock().remove(symbol).is_some() {
            info!(
                symbol,
                active = self.active_count(),
                max = self.max_positions,
                "trader slot reclaimed"
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }

    pub fn is_active(&self, symbol: &str) -> bool {
        self.active.lock().contains_key(symbol)
    }

    /// Wait up to `grace` for every trader to finish its shutdown path, then
    /// abort anything still running. The shutdown signal itself is sent by
    /// the caller via the shared watch channel before calling this.
    pub async fn shutdown_and_wait(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;

        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let leftover: Vec<(String, JoinHandle<()>)> = self.active.lock().drain().collect();
        if !leftover.is_empty() {
            warn!(
                count = leftover.len(),
                symbols = ?leftover.iter().map(|(s, _)| s.clone()).collect::<Vec<_>>(),
                "grace period elapsed; aborting remaining traders"
            );
            for (_, handle) in leftover {
                handle.abort();
            }
        } else {
            info!("all traders completed within the grace period");
        }
    }
}

impl std::fmt::Debug for TradingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingManager")
            .field("max_positions", &self.max_positions)
            .field("active", &self.active_symbols())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::SpreadAggregator;
    use crate::config::AggregationConfig;
    use crate::feed::PriceBoard;
    use crate::gateway::sim::SimGateway;
    use crate::types::Venue;

    fn manager(max_positions: usize) -> (Arc<TradingManager>, watch::Sender<bool>) {
        let mut config = AppConfig::default();
        config.trading.max_positions = max_positions;
        let config = Arc::new(config);

        let binance_board = Arc::new(PriceBoard::new(Venue::Binance));
        let bybit_board = Arc::new(PriceBoard::new(Venue::Bybit));
        let aggregator = Arc::new(SpreadAggregator::new(
            binance_board,
            bybit_board,
            &AggregationConfig::default(),
            config.trading.spread_threshold,
        ));

        let dir = std::env::temp_dir().join(format!("manager-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let deps = TraderDeps {
            aggregator,
            binance: Arc::new(SimGateway::new(Venue::Binance)),
            bybit: Arc::new(SimGateway::new(Venue::Bybit)),
            config,
            journal: Arc::new(TradeJournal::new(dir.join("trades.jsonl"))),
        };

        let (tx, rx) = watch::channel(false);
        (TradingManager::new(deps, rx), tx)
    }

    async fn wait_until_empty(mgr: &TradingManager) {
        for _ in 0..100 {
            if mgr.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("manager did not drain in time");
    }

    #[tokio::test]
    async fn admission_respects_capacity() {
        let (mgr, _tx) = manager(2);

        assert!(mgr.admit_task("AAAUSDT", std::future::pending()));
        assert!(mgr.admit_task("BBBUSDT", std::future::pending()));
        // Capacity 2 with A and B active: C is rejected, the set unchanged.
        assert!(!mgr.admit_task("CCCUSDT", std::future::pending()));

        assert_eq!(mgr.active_count(), 2);
        let mut symbols = mgr.active_symbols();
        symbols.sort();
        assert_eq!(symbols, vec!["AAAUSDT", "BBBUSDT"]);
    }

    #[tokio::test]
    async fn duplicate_symbol_is_rejected_while_active() {
        let (mgr, _tx) = manager(3);

        assert!(mgr.admit_task("AAAUSDT", std::future::pending()));
        assert!(!mgr.admit_task("AAAUSDT", std::future::pending()));
        assert_eq!(mgr.active_count(), 1);
        assert!(mgr.is_active("AAAUSDT"));
        assert!(!mgr.is_active("BBBUSDT"));
    }

    #[tokio::test]
    async fn completion_reclaims_the_slot() {
        let (mgr, _tx) = manager(1);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();

        assert!(mgr.admit_task("AAAUSDT", async move {
            let _ = done_rx.await;
        }));
        assert!(!mgr.admit_task("BBBUSDT", std::future::pending()));

        done_tx.send(()).unwrap();
        wait_until_empty(&mgr).await;

        // The freed slot admits the next proposal.
        assert!(mgr.admit_task("BBBUSDT", std::future::pending()));
    }

    #[tokio::test]
    async fn panicking_trader_frees_its_slot() {
        let (mgr, _tx) = manager(1);

        assert!(mgr.admit_task("AAAUSDT", async {
            panic!("boom");
        }));

        wait_until_empty(&mgr).await;
        assert!(mgr.admit_task("BBBUSDT", std::future::pending()));
    }

    #[tokio::test]
    async fn proposals_are_idempotent_across_ticks() {
        let (mgr, _tx) = manager(2);

        // The same symbol proposed every tick until admitted: only the first
        // succeeds, repeats are cheap no-ops.
        assert!(mgr.admit_task("AAAUSDT", std::future::pending()));
        for _ in 0..5 {
            assert!(!mgr.admit_task("AAAUSDT", std::future::pending()));
        }
        assert_eq!(mgr.active_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_aborts_stragglers_after_grace() {
        let (mgr, tx) = manager(2);

        assert!(mgr.admit_task("AAAUSDT", std::future::pending()));
        assert!(mgr.admit_task("BBBUSDT", std::future::pending()));

        tx.send(true).unwrap();
        mgr.shutdown_and_wait(Duration::from_millis(200)).await;
        assert_eq!(mgr.active_count(), 0);
    }
}
