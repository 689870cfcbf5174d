// =============================================================================
// Engine Configuration — JSON file + environment overrides
// =============================================================================
//
// Every field carries a serde default so that older config files missing new
// fields still deserialise. API secrets are taken from the environment when
// present (BINANCE_API_KEY / BINANCE_SECRET / BYBIT_API_KEY / BYBIT_SECRET)
// and override whatever the file contains.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::OrderKind;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_quote_currency() -> String {
    "USDT".to_string()
}

fn default_result_file() -> String {
    "trades.jsonl".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_max_positions() -> usize {
    3
}

fn default_target_usdt() -> f64 {
    100.0
}

fn default_spread_threshold() -> f64 {
    0.5
}

fn default_spread_hold_count() -> usize {
    3
}

fn default_exit_percent() -> f64 {
    0.3
}

fn default_aggregation_interval() -> f64 {
    1.0
}

fn default_max_history() -> usize {
    100
}

fn default_stale_feed_ttl_secs() -> u64 {
    10
}

fn default_fetch_interval_secs() -> u64 {
    3600
}

fn default_monitor_interval() -> f64 {
    5.0
}

fn default_min_volume_usdt() -> f64 {
    5_000_000.0
}

fn default_top_volume_num() -> usize {
    300
}

fn default_top_symbols() -> usize {
    3
}

fn default_max_enter_order_time() -> f64 {
    60.0
}

fn default_max_taker_enter_order_time() -> f64 {
    10.0
}

fn default_order_poll_interval() -> f64 {
    0.5
}

fn default_exit_monitor_interval() -> f64 {
    1.0
}

fn default_max_exit_deque_len() -> usize {
    3
}

fn default_enter_buy_price_margin() -> f64 {
    1.001
}

fn default_enter_sell_price_margin() -> f64 {
    0.999
}

fn default_buy_taker_price_margin() -> f64 {
    1.001
}

fn default_sell_taker_price_margin() -> f64 {
    0.999
}

fn default_usdt_required_multiplier() -> f64 {
    1.2
}

fn default_fee_bps() -> f64 {
    5.0
}

fn default_max_loss_percent() -> f64 {
    0.4
}

fn default_position_timeout_seconds() -> u64 {
    3600
}

fn default_order_timeout_seconds() -> u64 {
    60
}

fn default_order_type() -> OrderKind {
    OrderKind::Limit
}

fn default_binance_reconnects() -> u32 {
    10
}

// Matches the alternate venue's observed behavior: retry until told to stop.
fn default_bybit_reconnects() -> u32 {
    0
}

// =============================================================================
// Sections
// =============================================================================

/// Core trading parameters: slot count, notional, signal thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Upper bound on concurrent per-symbol traders.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Per-leg target notional in quote currency.
    #[serde(default = "default_target_usdt")]
    pub target_usdt: f64,

    /// Absolute spread percent a sample must reach to count as signed.
    #[serde(default = "default_spread_threshold")]
    pub spread_threshold: f64,

    /// Consecutive same-sign samples required to qualify a symbol.
    #[serde(default = "default_spread_hold_count")]
    pub spread_hold_count: usize,

    /// Convergence delta (percent) that triggers take-profit.
    #[serde(default = "default_exit_percent")]
    pub exit_percent: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            max_positions: default_max_positions(),
            target_usdt: default_target_usdt(),
            spread_threshold: default_spread_threshold(),
            spread_hold_count: default_spread_hold_count(),
            exit_percent: default_exit_percent(),
        }
    }
}

/// Spread aggregation cadence and history bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Seconds between aggregator ticks.
    #[serde(default = "default_aggregation_interval")]
    pub interval: f64,

    /// Ring-buffer capacity per symbol.
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// A feed that has not written for this long is considered stale and the
    /// whole tick is dropped.
    #[serde(default = "default_stale_feed_ttl_secs")]
    pub stale_feed_ttl_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: default_aggregation_interval(),
            max_history: default_max_history(),
            stale_feed_ttl_secs: default_stale_feed_ttl_secs(),
        }
    }
}

/// Candidate selection cadence and filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Seconds between symbol/volume metadata refreshes on the feeds.
    #[serde(default = "default_fetch_interval_secs")]
    pub fetch_interval: u64,

    /// Seconds between monitor ticks.
    #[serde(default = "default_monitor_interval")]
    pub interval: f64,

    /// Minimum 24h quote volume (venue B) for a symbol to be considered.
    #[serde(default = "default_min_volume_usdt")]
    pub min_volume_usdt: f64,

    /// Only the top-N symbols by venue-B volume are inspected.
    #[serde(default = "default_top_volume_num")]
    pub top_volume_num: usize,

    /// How many qualified candidates are proposed per tick.
    #[serde(default = "default_top_symbols")]
    pub top_symbols: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            fetch_interval: default_fetch_interval_secs(),
            interval: default_monitor_interval(),
            min_volume_usdt: default_min_volume_usdt(),
            top_volume_num: default_top_volume_num(),
            top_symbols: default_top_symbols(),
        }
    }
}

/// Per-trader timing and price-margin parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderConfig {
    /// Seconds the paired entry limits may rest before reconciliation.
    #[serde(default = "default_max_enter_order_time")]
    pub max_enter_order_time: f64,

    /// Seconds a corrective taker-margined limit may rest before the
    /// remainder is converted to a market order.
    #[serde(default = "default_max_taker_enter_order_time")]
    pub max_taker_enter_order_time: f64,

    /// Seconds between order-status polls while waiting for fills.
    #[serde(default = "default_order_poll_interval")]
    pub order_poll_interval: f64,

    /// Seconds between spread samples during exit monitoring.
    #[serde(default = "default_exit_monitor_interval")]
    pub exit_monitor_interval: f64,

    /// Width of the stop-loss / take-profit persistence windows.
    #[serde(default = "default_max_exit_deque_len")]
    pub max_exit_deque_len: usize,

    /// Entry buy limit = cheap-venue price × this margin.
    #[serde(default = "default_enter_buy_price_margin")]
    pub enter_buy_price_margin: f64,

    /// Entry sell limit = rich-venue price × this margin.
    #[serde(default = "default_enter_sell_price_margin")]
    pub enter_sell_price_margin: f64,

    /// Corrective/exit buy limit margin (crosses the book).
    #[serde(default = "default_buy_taker_price_margin")]
    pub buy_taker_price_margin: f64,

    /// Corrective/exit sell limit margin (crosses the book).
    #[serde(default = "default_sell_taker_price_margin")]
    pub sell_taker_price_margin: f64,

    /// Free balance required on each venue, as a multiple of target_usdt.
    #[serde(default = "default_usdt_required_multiplier")]
    pub usdt_required_multiplier: f64,

    /// Assumed fee in basis points, charged per leg on entry and exit
    /// notional when computing realized PnL.
    #[serde(default = "default_fee_bps")]
    pub fee_bps: f64,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            max_enter_order_time: default_max_enter_order_time(),
            max_taker_enter_order_time: default_max_taker_enter_order_time(),
            order_poll_interval: default_order_poll_interval(),
            exit_monitor_interval: default_exit_monitor_interval(),
            max_exit_deque_len: default_max_exit_deque_len(),
            enter_buy_price_margin: default_enter_buy_price_margin(),
            enter_sell_price_margin: default_enter_sell_price_margin(),
            buy_taker_price_margin: default_buy_taker_price_margin(),
            sell_taker_price_margin: default_sell_taker_price_margin(),
            usdt_required_multiplier: default_usdt_required_multiplier(),
            fee_bps: default_fee_bps(),
        }
    }
}

/// Protective thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Stop-loss: spread moving this many percent against the entry baseline
    /// (held across the whole persistence window) closes the position.
    #[serde(default = "default_max_loss_percent")]
    pub max_loss_percent: f64,

    /// Maximum seconds a position may stay open before a time_out exit.
    #[serde(default = "default_position_timeout_seconds")]
    pub position_timeout_seconds: u64,

    /// Maximum seconds an exit order may rest before the remainder goes to
    /// market.
    #[serde(default = "default_order_timeout_seconds")]
    pub order_timeout_seconds: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_loss_percent: default_max_loss_percent(),
            position_timeout_seconds: default_position_timeout_seconds(),
            order_timeout_seconds: default_order_timeout_seconds(),
        }
    }
}

/// Order-entry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrdersConfig {
    /// Default order type for entries (`limit` or `market`).
    #[serde(default = "default_order_type")]
    pub default_type: OrderKind,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            default_type: default_order_type(),
        }
    }
}

/// Per-venue credentials and flags.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VenueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// When set, order entry is disabled on this venue (read-only feed).
    #[serde(default)]
    pub fetch_only: bool,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub secret: String,

    /// Feed reconnect budget. 0 means unbounded.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuesConfig {
    #[serde(default = "default_binance_venue")]
    pub binance: VenueConfig,

    #[serde(default = "default_bybit_venue")]
    pub bybit: VenueConfig,
}

fn default_binance_venue() -> VenueConfig {
    VenueConfig {
        enabled: true,
        fetch_only: false,
        api_key: String::new(),
        secret: String::new(),
        max_reconnect_attempts: default_binance_reconnects(),
    }
}

fn default_bybit_venue() -> VenueConfig {
    VenueConfig {
        enabled: true,
        fetch_only: false,
        api_key: String::new(),
        secret: String::new(),
        max_reconnect_attempts: default_bybit_reconnects(),
    }
}

impl Default for VenuesConfig {
    fn default() -> Self {
        Self {
            binance: default_binance_venue(),
            bybit: default_bybit_venue(),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level configuration. Read-only after startup; changes require a
/// restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Replaces both gateways with an in-memory filler that settles at the
    /// requested price. No request ever reaches a venue.
    #[serde(default)]
    pub simulation_mode: bool,

    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,

    /// Path of the line-delimited JSON trade journal.
    #[serde(default = "default_result_file")]
    pub result_file: String,

    /// Seconds the manager waits for traders to finish on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default)]
    pub trading: TradingConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub trader: TraderConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub orders: OrdersConfig,

    #[serde(default)]
    pub venues: VenuesConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            simulation_mode: false,
            quote_currency: default_quote_currency(),
            result_file: default_result_file(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            trading: TradingConfig::default(),
            aggregation: AggregationConfig::default(),
            monitoring: MonitoringConfig::default(),
            trader: TraderConfig::default(),
            risk: RiskConfig::default(),
            orders: OrdersConfig::default(),
            venues: VenuesConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            max_positions = config.trading.max_positions,
            spread_threshold = config.trading.spread_threshold,
            simulation = config.simulation_mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }

    /// Override API credentials from the environment when set. The env always
    /// wins over the file so secrets never need to live on disk.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BINANCE_API_KEY") {
            self.venues.binance.api_key = v;
        }
        if let Ok(v) = std::env::var("BINANCE_SECRET") {
            self.venues.binance.secret = v;
        }
        if let Ok(v) = std::env::var("BYBIT_API_KEY") {
            self.venues.bybit.api_key = v;
        }
        if let Ok(v) = std::env::var("BYBIT_SECRET") {
            self.venues.bybit.secret = v;
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
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.trading.max_positions, 3);
        assert!((cfg.trading.target_usdt - 100.0).abs() < f64::EPSILON);
        assert!((cfg.trading.spread_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.trading.spread_hold_count, 3);
        assert_eq!(cfg.aggregation.max_history, 100);
        assert_eq!(cfg.monitoring.top_symbols, 3);
        assert_eq!(cfg.orders.default_type, OrderKind::Limit);
        assert_eq!(cfg.quote_currency, "USDT");
        assert!(!cfg.simulation_mode);
        assert!(cfg.venues.binance.enabled);
        assert_eq!(cfg.venues.binance.max_reconnect_attempts, 10);
        assert_eq!(cfg.venues.bybit.max_reconnect_attempts, 0);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading.max_positions, 3);
        assert_eq!(cfg.trader.max_exit_deque_len, 3);
        assert!((cfg.trader.enter_buy_price_margin - 1.001).abs() < f64::EPSILON);
        assert!(cfg.venues.bybit.enabled);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{
            "simulation_mode": true,
            "trading": { "max_positions": 1, "spread_threshold": 0.2 },
            "venues": { "bybit": { "fetch_only": true } }
        }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.simulation_mode);
        assert_eq!(cfg.trading.max_positions, 1);
        assert!((cfg.trading.spread_threshold - 0.2).abs() < f64::EPSILON);
        // untouched fields keep their defaults
        assert_eq!(cfg.trading.spread_hold_count, 3);
        assert!(cfg.venues.bybit.fetch_only);
        assert!(cfg.venues.bybit.enabled);
        assert!(!cfg.venues.binance.fetch_only);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.trading.max_positions, cfg2.trading.max_positions);
        assert_eq!(cfg.monitoring.top_volume_num, cfg2.monitoring.top_volume_num);
        assert_eq!(cfg.result_file, cfg2.result_file);
    }
}
