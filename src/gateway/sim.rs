// =============================================================================
// Simulation Gateway — in-memory filler for dry runs
// =============================================================================
//
// Replaces a venue when `simulation_mode` is on: every order settles
// instantly and fully at its requested price, no request leaves the process.
// Terminal-state bookkeeping mirrors the live venues closely enough that the
// trader's cancel/fetch paths behave identically, including the
// "too late to cancel" answer for orders that already finished.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

use crate::gateway::{GatewayError, GatewayResult, VenueGateway};
use crate::types::{now_ms, Order, OrderKind, OrderStatus, Side, SymbolMeta, Ticker, Venue};

/// Starting paper balance per venue.
const DEFAULT_BALANCE: f64 = 10_000.0;

pub struct SimGateway {
    venue: Venue,
    orders: Mutex<HashMap<String, Order>>,
    metas: RwLock<HashMap<String, SymbolMeta>>,
    /// Last price seen per symbol; market orders settle here.
    marks: RwLock<HashMap<String, Decimal>>,
    balance: Mutex<f64>,
}

impl SimGateway {
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            orders: Mutex::new(HashMap::new()),
            metas: RwLock::new(HashMap::new()),
            marks: RwLock::new(HashMap::new()),
            balance: Mutex::new(DEFAULT_BALANCE),
        }
    }

    /// Override the metadata for a symbol (defaults are generic otherwise).
    pub fn set_meta(&self, meta: SymbolMeta) {
        self.metas.write().insert(meta.symbol.clone(), meta);
    }

    pub fn set_balance(&self, balance: f64) {
        *self.balance.lock() = balance;
    }

    /// Seed a mark price so market orders have something to settle at.
    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.marks.write().insert(symbol.to_string(), price);
    }

    /// How many orders this venue has accepted so far.
    pub fn order_count(&self) -> usize {
        self.orders.lock().len()
    }

    fn default_meta(symbol: &str) -> SymbolMeta {
        SymbolMeta {
            symbol: symbol.to_string(),
            min_qty: Decimal::new(1, 3),   // 0.001
            qty_step: Decimal::new(1, 3),  // 0.001
            tick_size: Decimal::new(1, 4), // 0.0001
        }
    }

    fn settle(&self, symbol: &str, side: Side, kind: OrderKind, qty: Decimal, price: Decimal) -> Order {
        let now = now_ms();
        let order = Order {
            id: Uuid::new_v4().to_string(),
            venue: self.venue,
            symbol: symbol.to_string(),
            side,
            kind,
            requested_qty: qty,
            requested_price: Some(price),
            filled_qty: qty,
            avg_fill_price: Some(price),
            cumulative_cost: qty * price,
            status: OrderStatus::Filled,
            created_at_ms: now,
            updated_at_ms: now,
        };

        self.marks.write().insert(symbol.to_string(), price);
        self.orders.lock().insert(order.id.clone(), order.clone());

        debug!(
            venue = %self.venue,
            symbol,
            side = %side,
            %qty,
            %price,
            order_id = %order.id,
            "sim order settled instantly"
        );
        order
    }
}

#[async_trait]
impl VenueGateway for SimGateway {
    fn venue(&self) -> Venue {
        self.venue
    }

    fn order_entry_enabled(&self) -> bool {
        true
    }

    async fn fetch_symbols(&self) -> GatewayResult<Vec<SymbolMeta>> {
        Ok(self.metas.read().values().cloned().collect())
    }

    async fn symbol_meta(&self, symbol: &str) -> GatewayResult<SymbolMeta> {
        Ok(self
            .metas
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| Self::default_meta(symbol)))
    }

    async fn fetch_tickers(&self) -> GatewayResult<HashMap<String, Ticker>> {
        use rust_decimal::prelude::ToPrimitive;
        let marks = self.marks.read();
        Ok(marks
            .iter()
            .map(|(symbol, price)| {
                (
                    symbol.clone(),
                    Ticker {
                        symbol: symbol.clone(),
                        last_price: price.to_f64().unwrap_or(0.0),
                        bid: None,
                        ask: None,
                        volume_24h: 0.0,
                        timestamp_ms: now_ms(),
                    },
                )
            })
            .collect())
    }

    async fn fetch_volumes_24h(&self) -> GatewayResult<HashMap<String, f64>> {
        Ok(HashMap::new())
    }

    async fn create_limit_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Decimal,
    ) -> GatewayResult<Order> {
        if qty <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(GatewayError::Domain(format!(
                "invalid sim order: qty={qty} price={price}"
            )));
        }
        Ok(self.settle(symbol, side, OrderKind::Limit, qty, price))
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
    ) -> GatewayResult<Order> {
        if qty <= Decimal::ZERO {
            return Err(GatewayError::Domain(format!("invalid sim order: qty={qty}")));
        }
        let price = self
            .marks
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Domain(format!("no sim mark price for {symbol}")))?;
        Ok(self.settle(symbol, side, OrderKind::Market, qty, price))
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> GatewayResult<Order> {
        let _ = symbol;
        self.orders
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::OrderNotFound(id.to_string()))
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> GatewayResult<Order> {
        let _ = symbol;
        let mut orders = self.orders.lock();
        match orders.get_mut(id) {
            // Mirrors the live venues: a finished order is "too late to
            // cancel" and the caller resolves it through a follow-up fetch.
            Some(order) if order.is_terminal() => {
                Err(GatewayError::OrderNotFound(id.to_string()))
            }
            Some(order) => {
                order.status = OrderStatus::Cancelled;
                order.updated_at_ms = now_ms();
                Ok(order.clone())
            }
            None => Err(GatewayError::OrderNotFound(id.to_string())),
        }
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> GatewayResult<()> {
        Ok(())
    }

    async fn set_isolated_margin(&self, _symbol: &str) -> GatewayResult<()> {
        Ok(())
    }

    async fn fetch_balance(&self, _asset: &str) -> GatewayResult<f64> {
        Ok(*self.balance.lock())
    }
}

impl std::fmt::Debug for SimGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimGateway")
            .field("venue", &self.venue)
            .field("orders", &self.orders.lock().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::cancel_order_safe;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn limit_orders_settle_instantly_at_requested_price() {
        let gw = SimGateway::new(Venue::Binance);
        let order = gw
            .create_limit_order("BTCUSDT", Side::Buy, dec!(0.002), dec!(50000))
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_qty, dec!(0.002));
        assert_eq!(order.avg_fill_price.unwrap(), dec!(50000));
        assert_eq!(order.cumulative_cost, dec!(100.000));

        let fetched = gw.fetch_order(&order.id, "BTCUSDT").await.unwrap();
        assert_eq!(fetched.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn market_orders_settle_at_the_last_seen_price() {
        let gw = SimGateway::new(Venue::Bybit);
        gw.set_mark_price("ETHUSDT", dec!(3000));

        let order = gw
            .create_market_order("ETHUSDT", Side::Sell, dec!(1))
            .await
            .unwrap();
        assert_eq!(order.avg_fill_price.unwrap(), dec!(3000));
        assert_eq!(order.kind, OrderKind::Market);
    }

    #[tokio::test]
    async fn market_order_without_a_price_reference_is_rejected() {
        let gw = SimGateway::new(Venue::Bybit);
        let err = gw
            .create_market_order("NEVERSEEN", Side::Buy, dec!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Domain(_)));
    }

    #[tokio::test]
    async fn repeated_cancels_of_a_settled_order_both_succeed() {
        let gw = SimGateway::new(Venue::Binance);
        let order = gw
            .create_limit_order("BTCUSDT", Side::Buy, dec!(0.002), dec!(50000))
            .await
            .unwrap();

        // Raw cancel answers "too late" for a terminal order...
        let raw = gw.cancel_order(&order.id, "BTCUSDT").await;
        assert!(matches!(raw, Err(GatewayError::OrderNotFound(_))));

        // ...but the safe path resolves both attempts to the terminal state.
        let first = cancel_order_safe(&gw, &order.id, "BTCUSDT").await.unwrap();
        assert_eq!(first.status, OrderStatus::Filled);
        assert_eq!(first.filled_qty, dec!(0.002));

        let second = cancel_order_safe(&gw, &order.id, "BTCUSDT").await.unwrap();
        assert_eq!(second.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn unknown_order_fetch_reports_not_found() {
        let gw = SimGateway::new(Venue::Binance);
        let err = gw.fetch_order("missing", "BTCUSDT").await.unwrap_err();
        assert!(matches!(err, GatewayError::OrderNotFound(_)));
    }

    #[tokio::test]
    async fn meta_defaults_apply_until_overridden() {
        let gw = SimGateway::new(Venue::Bybit);
        let meta = gw.symbol_meta("XRPUSDT").await.unwrap();
        assert_eq!(meta.min_qty, dec!(0.001));

        gw.set_meta(SymbolMeta {
            symbol: "XRPUSDT".into(),
            min_qty: dec!(1),
            qty_step: dec!(1),
            tick_size: dec!(0.0001),
        });
        let meta = gw.symbol_meta("XRPUSDT").await.unwrap();
        assert_eq!(meta.min_qty, dec!(1));
    }
}
