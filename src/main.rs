// =============================================================================
// spreadhawk — cross-venue perpetual-futures spread arbitrage engine
// =============================================================================
//
// Pipeline: venue feeds → spread aggregator → monitor → trading manager →
// per-symbol traders → venue gateways. Each stage samples the one above it
// at its own cadence; the only blocking hand-off is manager admission.
//
// Exit codes: 0 clean shutdown (SIGTERM), 1 fatal init error, 130 SIGINT.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod config;
mod feed;
mod gateway;
mod journal;
mod manager;
mod monitor;
mod trader;
mod types;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::SpreadAggregator;
use crate::config::AppConfig;
use crate::feed::binance::BinanceFeed;
use crate::feed::bybit::BybitFeed;
use crate::feed::PriceBoard;
use crate::gateway::binance::BinanceGateway;
use crate::gateway::bybit::BybitGateway;
use crate::gateway::sim::SimGateway;
use crate::gateway::VenueGateway;
use crate::journal::TradeJournal;
use crate::manager::{TraderDeps, TradingManager};
use crate::monitor::SpreadMonitor;
use crate::types::Venue;

/// Hourly performance summary cadence.
const SUMMARY_INTERVAL_SECS: u64 = 3600;

#[derive(Parser, Debug)]
#[command(
    name = "spreadhawk",
    about = "Delta-neutral spread arbitrage across two perpetual-futures venues"
)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Replace both venue gateways with the in-memory simulation filler.
    #[arg(long)]
    simulation: bool,

    /// Override trading.spread_threshold (percent).
    #[arg(long)]
    spread_threshold: Option<f64>,

    /// Override trading.max_positions.
    #[arg(long)]
    max_positions: Option<usize>,

    /// Override monitoring.fetch_interval (seconds).
    #[arg(long)]
    fetch_interval: Option<u64>,

    /// Log filter (trace, debug, info, warn, error), unless RUST_LOG is set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run() -> anyhow::Result<u8> {
    let cli = Cli::parse();

    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => {
            let default_path = PathBuf::from("config.json");
            if default_path.exists() {
                AppConfig::load(&default_path)?
            } else {
                warn!("no config file found; using built-in defaults");
                AppConfig::default()
            }
        }
    };

    config.apply_env_overrides();
    if cli.simulation {
        config.simulation_mode = true;
    }
    if let Some(threshold) = cli.spread_threshold {
        config.trading.spread_threshold = threshold;
    }
    if let Some(max_positions) = cli.max_positions {
        config.trading.max_positions = max_positions;
    }
    if let Some(fetch_interval) = cli.fetch_interval {
        config.monitoring.fetch_interval = fetch_interval;
    }
    let config = Arc::new(config);

    info!(
        simulation = config.simulation_mode,
        spread_threshold = config.trading.spread_threshold,
        spread_hold_count = config.trading.spread_hold_count,
        max_positions = config.trading.max_positions,
        target_usdt = config.trading.target_usdt,
        min_volume_usdt = config.monitoring.min_volume_usdt,
        result_file = %config.result_file,
        "spreadhawk starting"
    );

    // ── 2. Shared state ──────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let binance_board = Arc::new(PriceBoard::new(Venue::Binance));
    let bybit_board = Arc::new(PriceBoard::new(Venue::Bybit));

    let aggregator = Arc::new(SpreadAggregator::new(
        binance_board.clone(),
        bybit_board.clone(),
        &config.aggregation,
        config.trading.spread_threshold,
    ));

    let journal = Arc::new(TradeJournal::new(&config.result_file));

    // ── 3. Venue gateways ────────────────────────────────────────────────
    let (binance_gw, bybit_gw): (Arc<dyn VenueGateway>, Arc<dyn VenueGateway>) =
        if config.simulation_mode {
            info!("simulation mode: orders settle in-memory at requested prices");
            (
                Arc::new(SimGateway::new(Venue::Binance)),
                Arc::new(SimGateway::new(Venue::Bybit)),
            )
        } else {
            let binance = BinanceGateway::new(&config.venues.binance, &config.quote_currency);
            // Clock skew breaks request signing; measure it up front. A
            // failure is survivable (offset stays 0) and logged.
            if let Err(e) = binance.sync_time().await {
                warn!(error = %e, "binance clock sync failed; proceeding with zero offset");
            }
            let bybit = BybitGateway::new(&config.venues.bybit, &config.quote_currency);
            (Arc::new(binance), Arc::new(bybit))
        };

    if config.venues.binance.fetch_only {
        info!("binance is fetch-only: order entry disabled on venue A");
    }
    if config.venues.bybit.fetch_only {
        info!("bybit is fetch-only: order entry disabled on venue B");
    }

    // ── 4. Trading manager & monitor ─────────────────────────────────────
    let manager = TradingManager::new(
        TraderDeps {
            aggregator: aggregator.clone(),
            binance: binance_gw,
            bybit: bybit_gw,
            config: config.clone(),
            journal: journal.clone(),
        },
        shutdown_rx.clone(),
    );

    let monitor = SpreadMonitor::new(
        aggregator.clone(),
        manager.clone(),
        &config.monitoring,
        config.trading.spread_hold_count,
    );

    // ── 5. Spawn the pipeline ────────────────────────────────────────────
    if config.venues.binance.enabled {
        let feed = Arc::new(BinanceFeed::new(
            binance_board,
            config.quote_currency.clone(),
            config.venues.binance.max_reconnect_attempts,
            config.monitoring.fetch_interval,
        ));
        tokio::spawn(feed.run(shutdown_rx.clone()));
    } else {
        warn!("binance feed disabled by config; no spreads will form");
    }

    if config.venues.bybit.enabled {
        let feed = Arc::new(BybitFeed::new(
            bybit_board,
            config.quote_currency.clone(),
            config.venues.bybit.max_reconnect_attempts,
            config.monitoring.fetch_interval,
        ));
        tokio::spawn(feed.run(shutdown_rx.clone()));
    } else {
        warn!("bybit feed disabled by config; no spreads will form");
    }

    tokio::spawn(aggregator.run(shutdown_rx.clone()));
    tokio::spawn(monitor.run(shutdown_rx.clone()));
    tokio::spawn(
        journal
            .clone()
            .run_summary_loop(SUMMARY_INTERVAL_SECS, shutdown_rx.clone()),
    );

    info!("all subsystems running; send SIGINT or SIGTERM to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    let exit_code = wait_for_stop_signal().await?;
    warn!("shutdown signal received; stopping");

    let _ = shutdown_tx.send(true);
    manager
        .shutdown_and_wait(Duration::from_secs(config.shutdown_grace_secs))
        .await;

    info!(
        trades = journal.trade_count(),
        "spreadhawk shut down complete"
    );
    Ok(exit_code)
}

/// Block until a stop signal arrives. SIGINT maps to exit code 130, a clean
/// SIGTERM to 0.
#[cfg(unix)]
async fn wait_for_stop_signal() -> anyhow::Result<u8> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok(130)
        }
        _ = sigterm.recv() => Ok(0),
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> anyhow::Result<u8> {
    tokio::signal::ctrl_c().await?;
    Ok(130)
}
