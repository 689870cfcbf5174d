// =============================================================================
// Trade Journal — append-only line-delimited JSON record of completed trades
// =============================================================================
//
// One line per completed trade, appended as a single write so concurrent
// traders cannot interleave partial lines. The journal also keeps an
// in-memory copy of everything written this run to drive the periodic
// performance summary.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::types::ExitType;

/// The append-only outcome of one completed trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// RFC 3339 wall-clock stamp of when the record was written.
    pub recorded_at: String,
    pub symbol: String,
    /// true ⇔ venue A was richer at entry (short A / long B).
    pub direction: bool,
    pub long_venue: String,
    pub short_venue: String,

    // Signal-time entry intent.
    pub long_signal_entry_price: f64,
    pub long_signal_entry_qty: f64,
    pub short_signal_entry_price: f64,
    pub short_signal_entry_qty: f64,
    pub entry_signal_spread: f64,

    // Realized entry (volume-weighted across all corrective fills).
    pub long_entry_price: f64,
    pub long_entry_qty: f64,
    pub short_entry_price: f64,
    pub short_entry_qty: f64,
    /// Signed realized entry spread; the exit-monitor baseline.
    pub entry_spread: f64,

    // Exit.
    pub long_exit_price: f64,
    pub short_exit_price: f64,
    pub exit_signal_spread: f64,
    /// Signed realized exit spread.
    pub exit_spread: f64,
    pub exit_type: ExitType,

    // PnL net of the configured per-leg fee assumption.
    pub long_profit: f64,
    pub short_profit: f64,
    pub net_profit: f64,
}

/// Aggregate statistics over the records written this run.
#[derive(Debug, Clone, Serialize)]
pub struct JournalSummary {
    pub total_trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub net_profit: f64,
    pub stop_losses: usize,
    pub take_profits: usize,
    pub wrong_entries: usize,
    pub time_outs: usize,
}

pub struct TradeJournal {
    path: PathBuf,
    recent: Mutex<Vec<TradeRecord>>,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            recent: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append one record as a single JSON line.
    pub async fn append(&self, record: TradeRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record).context("failed to serialise trade record")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open journal at {}", self.path.display()))?;

        file.write_all(line.as_bytes())
            .await
            .context("failed to append trade record")?;
        file.flush().await.context("failed to flush journal")?;

        info!(
            symbol = %record.symbol,
            exit_type = %record.exit_type,
            net_profit = record.net_profit,
            "trade record written"
        );

        self.recent.lock().push(record);
        Ok(())
    }

    /// Statistics over everything appended this run.
    pub fn summary(&self) -> JournalSummary {
        let records = self.recent.lock();
        let total = records.len();
        let wins = records.iter().filter(|r| r.net_profit > 0.0).count();
        let net_profit: f64 = records.iter().map(|r| r.net_profit).sum();

        let count = |t: ExitType| records.iter().filter(|r| r.exit_type == t).count();

        JournalSummary {
            total_trades: total,
            wins,
            win_rate: if total > 0 {
                wins as f64 / total as f64
            } else {
                0.0
            },
            net_profit,
            stop_losses: count(ExitType::StopLoss),
            take_profits: count(ExitType::TakeProfit),
            wrong_entries: count(ExitType::WrongEntry),
            time_outs: count(ExitType::TimeOut),
        }
    }

    pub fn trade_count(&self) -> usize {
        self.recent.lock().len()
    }

    /// Copies of every record written this run, in write order.
    pub fn records(&self) -> Vec<TradeRecord> {
        self.recent.lock().clone()
    }

    /// Log a performance summary every `interval_secs` until shutdown.
    pub async fn run_summary_loop(
        self: std::sync::Arc<Self>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(60)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first interval tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let s = self.summary();
                    if s.total_trades == 0 {
                        continue;
                    }
                    info!(
                        trades = s.total_trades,
                        win_rate = format!("{:.1}%", s.win_rate * 100.0),
                        net_profit = format!("{:.4}", s.net_profit),
                        take_profits = s.take_profits,
                        stop_losses = s.stop_losses,
                        time_outs = s.time_outs,
                        wrong_entries = s.wrong_entries,
                        "performance summary"
                    );
                }
            }
        }
    }
}

impl Drop for TradeJournal {
    fn drop(&mut self) {
        let count = self.recent.lock().len();
        if count > 0 {
            warn!(
                trades = count,
                path = %self.path.display(),
                "trade journal closing"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn record(symbol: &str, exit_type: ExitType, net_profit: f64) -> TradeRecord {
        TradeRecord {
            recorded_at: chrono::Utc::now().to_rfc3339(),
            symbol: symbol.to_string(),
            direction: true,
            long_venue: "bybit".into(),
            short_venue: "binance".into(),
            long_signal_entry_price: 100.0,
            long_signal_entry_qty: 1.0,
            short_signal_entry_price: 100.5,
            short_signal_entry_qty: 1.0,
            entry_signal_spread: 0.5,
            long_entry_price: 100.1,
            long_entry_qty: 1.0,
            short_entry_price: 100.4,
            short_entry_qty: 1.0,
            entry_spread: 0.3,
            long_exit_price: 100.2,
            short_exit_price: 100.25,
            exit_signal_spread: 0.05,
            exit_spread: 0.05,
            exit_type,
            long_profit: net_profit / 2.0,
            short_profit: net_profit / 2.0,
            net_profit,
        }
    }

    #[tokio::test]
    async fn appends_one_json_line_per_trade() {
        let dir = std::env::temp_dir().join(format!("journal-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("trades.jsonl");

        let journal = TradeJournal::new(&path);
        assert_eq!(journal.path(), path.as_path());
        journal
            .append(record("BTCUSDT", ExitType::TakeProfit, 0.5))
            .await
            .unwrap();
        journal
            .append(record("ETHUSDT", ExitType::StopLoss, -0.2))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: TradeRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.symbol, "BTCUSDT");
        assert_eq!(first.exit_type, ExitType::TakeProfit);

        let second: TradeRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.symbol, "ETHUSDT");
        assert!(second.net_profit < 0.0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn summary_aggregates_by_exit_type() {
        let dir = std::env::temp_dir().join(format!("journal-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let journal = TradeJournal::new(dir.join("trades.jsonl"));

        journal
            .append(record("A1USDT", ExitType::TakeProfit, 1.0))
            .await
            .unwrap();
        journal
            .append(record("A2USDT", ExitType::TakeProfit, 0.4))
            .await
            .unwrap();
        journal
            .append(record("A3USDT", ExitType::StopLoss, -0.6))
            .await
            .unwrap();
        journal
            .append(record("A4USDT", ExitType::TimeOut, 0.0))
            .await
            .unwrap();

        let s = journal.summary();
        assert_eq!(s.total_trades, 4);
        assert_eq!(s.wins, 2);
        assert!((s.win_rate - 0.5).abs() < f64::EPSILON);
        assert!((s.net_profit - 0.8).abs() < 1e-12);
        assert_eq!(s.take_profits, 2);
        assert_eq!(s.stop_losses, 1);
        assert_eq!(s.time_outs, 1);
        assert_eq!(s.wrong_entries, 0);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn exit_type_serialises_snake_case() {
        let json = serde_json::to_string(&ExitType::TakeProfit).unwrap();
        assert_eq!(json, "\"take_profit\"");
        let back: ExitType = serde_json::from_str("\"stop_loss\"").unwrap();
        assert_eq!(back, ExitType::StopLoss);
    }
}
