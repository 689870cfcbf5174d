// =============================================================================
// Shared types used across the spreadhawk arbitrage engine
// =============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The two venues this engine arbitrages between. Venue A is the high-volume
/// venue (Binance USDT-margined futures), venue B the alternate (Bybit linear
/// perpetuals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Venue {
    Binance,
    Bybit,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Bybit => "bybit",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    Limit,
    Market,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "limit"),
            Self::Market => write!(f, "market"),
        }
    }
}

/// Canonical order status. Venue-native strings are mapped onto this set by
/// the gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal states are stable: once reported, the venue never changes
    /// them again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Partial => write!(f, "partial"),
            Self::Filled => write!(f, "filled"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A venue-level order as seen through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub venue: Venue,
    pub symbol: String,
    pub side: Side,
    pub kind: OrderKind,
    pub requested_qty: Decimal,
    pub requested_price: Option<Decimal>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    /// Quote-currency notional of the filled part.
    pub cumulative_cost: Decimal,
    pub status: OrderStatus,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Order {
    /// Quantity still unfilled.
    pub fn remaining_qty(&self) -> Decimal {
        (self.requested_qty - self.filled_qty).max(Decimal::ZERO)
    }

    /// Fraction of the requested quantity that has filled, in [0, 1].
    pub fn fill_ratio(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        if self.requested_qty.is_zero() {
            return 0.0;
        }
        (self.filled_qty / self.requested_qty).to_f64().unwrap_or(0.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Instrument metadata the trader needs for sizing and price snapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: String,
    pub min_qty: Decimal,
    pub qty_step: Decimal,
    pub tick_size: Decimal,
}

/// A point-in-time ticker as returned by the bulk-ticker endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub volume_24h: f64,
    pub timestamp_ms: i64,
}

/// Why a trade was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitType {
    StopLoss,
    TakeProfit,
    WrongEntry,
    TimeOut,
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "stop_loss"),
            Self::TakeProfit => write!(f, "take_profit"),
            Self::WrongEntry => write!(f, "wrong_entry"),
            Self::TimeOut => write!(f, "time_out"),
        }
    }
}

/// Current UNIX timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Normalize an instrument identifier into the canonical uppercase,
/// separator-free form used throughout the engine (e.g. `"btc/usdt:USDT"` →
/// `"BTCUSDT"`). Idempotent: normalizing an already-canonical symbol returns
/// it unchanged.
pub fn normalize_symbol(raw: &str) -> String {
    let upper = raw.trim().to_uppercase();
    // ccxt-style settle suffix ("BTC/USDT:USDT") is dropped before the
    // separator strip so the quote code is not duplicated.
    let base = upper.split(':').next().unwrap_or(&upper);
    base.replace('/', "")
}

/// True when `symbol` names a perpetual contract in `quote` currency.
///
/// Dated futures carry a `-DDMMMYY` suffix (`BTCUSDT-26DEC25`); perpetuals
/// never contain a dash. The feed and gateway boundaries both apply this rule.
pub fn is_perpetual_quote(symbol: &str, quote: &str) -> bool {
    !symbol.is_empty() && symbol.ends_with(quote) && !symbol.contains('-')
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["btcusdt", "BTC/USDT:USDT", " ethusdt ", "SOLUSDT"] {
            let once = normalize_symbol(raw);
            let twice = normalize_symbol(&once);
            assert_eq!(once, twice, "normalize(normalize({raw}))");
        }
    }

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize_symbol("LEVER/USDT:USDT"), "LEVERUSDT");
        assert_eq!(normalize_symbol("btcusdt"), "BTCUSDT");
    }

    #[test]
    fn dated_contracts_are_not_perpetual() {
        assert!(is_perpetual_quote("BTCUSDT", "USDT"));
        assert!(!is_perpetual_quote("BTCUSDT-26DEC25", "USDT"));
        assert!(!is_perpetual_quote("BTCUSD", "USDT"));
        assert!(!is_perpetual_quote("", "USDT"));
    }

    #[test]
    fn order_status_terminality() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Partial.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
    }

    #[test]
    fn order_remaining_and_ratio() {
        let order = Order {
            id: "1".into(),
            venue: Venue::Binance,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            requested_qty: dec!(100),
            requested_price: Some(dec!(10)),
            filled_qty: dec!(40),
            avg_fill_price: Some(dec!(10)),
            cumulative_cost: dec!(400),
            status: OrderStatus::Partial,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        assert_eq!(order.remaining_qty(), dec!(60));
        assert!((order.fill_ratio() - 0.4).abs() < 1e-12);
    }
}
