// =============================================================================
// Trader — per-symbol delta-neutral arbitrage state machine
// =============================================================================
//
// Lifecycle:
//
//   Init          load venue metadata, isolated margin + leverage 1
//   EnterOrder    re-validate spread, size both legs, place paired limits
//   EnterMonitor  poll fills; full → ExitMonitor, timeout → reconciliation
//   ExitMonitor   watch the live spread against the realized entry baseline
//   ExitOrder     paired limit closes (taker-margined)
//   ExitOrderMonitor  settle closes, compute PnL, write the trade record
//   End           terminal
//
// One trader owns one symbol's position exclusively; nothing here is shared
// between traders except the (stateless per call) venue gateways. Every
// venue failure degrades: the trader aborts to End or flattens, it never
// propagates upward.
// =============================================================================

pub mod exit;
pub mod reconcile;
pub mod sizing;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregator::{SpreadAggregator, SpreadSample};
use crate::config::AppConfig;
use crate::gateway::{cancel_order_safe, VenueGateway};
use crate::journal::{TradeJournal, TradeRecord};
use crate::trader::exit::{evaluate_sample, wrong_entry, HoldWindow};
use crate::trader::reconcile::{plan_reconciliation, ReconcileAction};
use crate::trader::sizing::{
    quantities_mismatched, size_leg, snap_price, snap_to_step, SnapMode,
};
use crate::types::{normalize_symbol, ExitType, Order, OrderKind, OrderStatus, Side, SymbolMeta, Venue};

/// Which leg of the pair an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Long,
    Short,
}

impl Leg {
    /// Side used to OPEN this leg.
    fn entry_side(self) -> Side {
        match self {
            Leg::Long => Side::Buy,
            Leg::Short => Side::Sell,
        }
    }

    /// Side used to CLOSE this leg.
    fn close_side(self) -> Side {
        self.entry_side().opposite()
    }
}

/// Trader lifecycle states. Each step consumes the current state and returns
/// the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraderState {
    Init,
    EnterOrder,
    EnterMonitor,
    ExitMonitor,
    ExitOrder(ExitType),
    ExitOrderMonitor(ExitType),
    End,
}

impl std::fmt::Display for TraderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::EnterOrder => write!(f, "enter_order"),
            Self::EnterMonitor => write!(f, "enter_monitor"),
            Self::ExitMonitor => write!(f, "exit_monitor"),
            Self::ExitOrder(t) => write!(f, "exit_order({t})"),
            Self::ExitOrderMonitor(t) => write!(f, "exit_order_monitor({t})"),
            Self::End => write!(f, "end"),
        }
    }
}

/// One executed fill (possibly one of several per leg).
#[derive(Debug, Clone, Copy)]
struct Fill {
    qty: Decimal,
    cost: Decimal,
}

impl Fill {
    fn from_order(order: &Order) -> Option<Self> {
        if order.filled_qty <= Decimal::ZERO {
            return None;
        }
        let cost = if !order.cumulative_cost.is_zero() {
            order.cumulative_cost
        } else if let Some(avg) = order.avg_fill_price {
            order.filled_qty * avg
        } else if let Some(price) = order.requested_price {
            order.filled_qty * price
        } else {
            return None;
        };
        Some(Self {
            qty: order.filled_qty,
            cost,
        })
    }
}

fn ledger_totals(fills: &[Fill]) -> (Decimal, Decimal) {
    fills.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(qty, cost), f| (qty + f.qty, cost + f.cost),
    )
}

/// What EnterOrder committed to.
#[derive(Debug, Clone)]
struct EntrySignal {
    long_price: f64,
    short_price: f64,
    long_qty: Decimal,
    short_qty: Decimal,
    long_order_id: String,
    short_order_id: String,
    spread_signed: f64,
}

/// The effective position after entry (and reconciliation).
#[derive(Debug, Clone)]
struct EntryPosition {
    long_qty: Decimal,
    short_qty: Decimal,
    long_vwap: f64,
    short_vwap: f64,
    /// Realized entry spread, signed; the exit baseline.
    spread_signed: f64,
    completed_at: Instant,
}

/// The paired closing orders.
#[derive(Debug, Clone)]
struct ExitLegs {
    long_order: Option<Order>,
    short_order: Option<Order>,
    exit_signal_spread: f64,
}

pub struct Trader {
    symbol: String,
    /// true ⇔ venue A (Binance) richer ⇔ short A, long B.
    direction: bool,
    aggregator: Arc<SpreadAggregator>,
    long_gw: Arc<dyn VenueGateway>,
    short_gw: Arc<dyn VenueGateway>,
    config: Arc<AppConfig>,
    journal: Arc<TradeJournal>,
    shutdown: watch::Receiver<bool>,

    long_meta: Option<SymbolMeta>,
    short_meta: Option<SymbolMeta>,
    signal: Option<EntrySignal>,
    long_fills: Vec<Fill>,
    short_fills: Vec<Fill>,
    entry: Option<EntryPosition>,
    exit_legs: Option<ExitLegs>,
    exit_long_fills: Vec<Fill>,
    exit_short_fills: Vec<Fill>,
}

impl Trader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        direction: bool,
        aggregator: Arc<SpreadAggregator>,
        binance: Arc<dyn VenueGateway>,
        bybit: Arc<dyn VenueGateway>,
        config: Arc<AppConfig>,
        journal: Arc<TradeJournal>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        // direction=true: Binance is richer, so the long leg lives on Bybit
        // and the short leg on Binance; false is the mirror.
        let (long_gw, short_gw) = if direction {
            (bybit, binance)
        } else {
            (binance, bybit)
        };

        Self {
            symbol: normalize_symbol(&symbol),
            direction,
            aggregator,
            long_gw,
            short_gw,
            config,
            journal,
            shutdown,
            long_meta: None,
            short_meta: None,
            signal: None,
            long_fills: Vec::new(),
            short_fills: Vec::new(),
            entry: None,
            exit_legs: None,
            exit_long_fills: Vec::new(),
            exit_short_fills: Vec::new(),
        }
    }

    /// Drive the state machine to completion.
    pub async fn run(mut self) {
        info!(
            symbol = %self.symbol,
            direction = self.direction,
            long_venue = %self.long_gw.venue(),
            short_venue = %self.short_gw.venue(),
            "trader starting"
        );

        let mut state = TraderState::Init;
        loop {
            debug!(symbol = %self.symbol, state = %state, "trader step");
            state = match state {
                TraderState::Init => self.init().await,
                TraderState::EnterOrder => self.enter_order().await,
                TraderState::EnterMonitor => self.enter_monitor().await,
                TraderState::ExitMonitor => self.exit_monitor().await,
                TraderState::ExitOrder(t) => self.exit_order(t).await,
                TraderState::ExitOrderMonitor(t) => self.exit_order_monitor(t).await,
                TraderState::End => break,
            };
        }

        info!(symbol = %self.symbol, "trader finished");
    }

    // -------------------------------------------------------------------------
    // Shared helpers
    // -------------------------------------------------------------------------

    fn leg_gw(&self, leg: Leg) -> &Arc<dyn VenueGateway> {
        match leg {
            Leg::Long => &self.long_gw,
            Leg::Short => &self.short_gw,
        }
    }

    fn leg_meta(&self, leg: Leg) -> SymbolMeta {
        let meta = match leg {
            Leg::Long => &self.long_meta,
            Leg::Short => &self.short_meta,
        };
        meta.clone().expect("leg metadata is set in Init")
    }

    fn latest_spread(&self) -> Option<SpreadSample> {
        self.aggregator.latest(&self.symbol)
    }

    fn venue_price(sample: &SpreadSample, venue: Venue) -> f64 {
        match venue {
            Venue::Binance => sample.binance_price,
            Venue::Bybit => sample.bybit_price,
        }
    }

    /// The admission signal is only actionable while the live spread still
    /// clears the threshold in the declared direction.
    fn spread_still_valid(&self, sample: &SpreadSample) -> bool {
        let threshold = self.config.trading.spread_threshold.abs();
        if sample.spread_pct >= threshold {
            self.direction
        } else if sample.spread_pct <= -threshold {
            !self.direction
        } else {
            false
        }
    }

    fn push_entry_fill(&mut self, leg: Leg, order: &Order) {
        if let Some(fill) = Fill::from_order(order) {
            debug!(
                symbol = %self.symbol,
                leg = ?leg,
                qty = %fill.qty,
                cost = %fill.cost,
                "entry fill recorded"
            );
            match leg {
                Leg::Long => self.long_fills.push(fill),
                Leg::Short => self.short_fills.push(fill),
            }
        }
    }

    fn push_exit_fill(&mut self, leg: Leg, order: &Order) {
        if let Some(fill) = Fill::from_order(order) {
            match leg {
                Leg::Long => self.exit_long_fills.push(fill),
                Leg::Short => self.exit_short_fills.push(fill),
            }
        }
    }

    /// Signed spread implied by a (short VWAP, long VWAP) pair, following the
    /// canonical A-minus-B convention: positive ⇔ Binance richer.
    fn realized_spread_signed(&self, long_vwap: f64, short_vwap: f64) -> f64 {
        let raw = 100.0 * (short_vwap - long_vwap) / long_vwap.min(short_vwap);
        if self.long_gw.venue() == Venue::Binance {
            -raw
        } else {
            raw
        }
    }

    // -------------------------------------------------------------------------
    // Init
    // -------------------------------------------------------------------------

    async fn init(&mut self) -> TraderState {
        let (long_meta, short_meta) = tokio::join!(
            self.long_gw.symbol_meta(&self.symbol),
            self.short_gw.symbol_meta(&self.symbol)
        );

        let long_meta = match long_meta {
            Ok(meta) => meta,
            Err(e) => {
                warn!(symbol = %self.symbol, venue = %self.long_gw.venue(), error = %e,
                      "metadata unavailable on long venue");
                return TraderState::End;
            }
        };
        let short_meta = match short_meta {
            Ok(meta) => meta,
            Err(e) => {
                warn!(symbol = %self.symbol, venue = %self.short_gw.venue(), error = %e,
                      "metadata unavailable on short venue");
                return TraderState::End;
            }
        };

        // Isolated margin and 1x leverage on both legs. Both calls are
        // idempotent on the venues; failures are logged and tolerated since
        // an account typically already carries the right mode.
        let (a, b) = tokio::join!(
            self.long_gw.set_isolated_margin(&self.symbol),
            self.short_gw.set_isolated_margin(&self.symbol)
        );
        if let Err(e) = a {
            warn!(symbol = %self.symbol, venue = %self.long_gw.venue(), error = %e,
                  "isolated margin setup failed");
        }
        if let Err(e) = b {
            warn!(symbol = %self.symbol, venue = %self.short_gw.venue(), error = %e,
                  "isolated margin setup failed");
        }

        let (a, b) = tokio::join!(
            self.long_gw.set_leverage(&self.symbol, 1),
            self.short_gw.set_leverage(&self.symbol, 1)
        );
        if let Err(e) = a {
            warn!(symbol = %self.symbol, venue = %self.long_gw.venue(), error = %e,
                  "leverage setup failed");
        }
        if let Err(e) = b {
            warn!(symbol = %self.symbol, venue = %self.short_gw.venue(), error = %e,
                  "leverage setup failed");
        }

        self.long_meta = Some(long_meta);
        self.short_meta = Some(short_meta);
        TraderState::EnterOrder
    }

    // -------------------------------------------------------------------------
    // EnterOrder
    // -------------------------------------------------------------------------

    async fn enter_order(&mut self) -> TraderState {
        let Some(sample) = self.latest_spread() else {
            info!(symbol = %self.symbol, "no spread data at entry; ending");
            return TraderState::End;
        };

        if !self.spread_still_valid(&sample) {
            info!(
                symbol = %self.symbol,
                spread_pct = sample.spread_pct,
                "spread no longer valid at entry; ending"
            );
            return TraderState::End;
        }

        let long_meta = self.leg_meta(Leg::Long);
        let short_meta = self.leg_meta(Leg::Short);

        let long_price_f = Self::venue_price(&sample, self.long_gw.venue());
        let short_price_f = Self::venue_price(&sample, self.short_gw.venue());

        let (Some(long_price), Some(short_price), Some(target)) = (
            Decimal::from_f64(long_price_f),
            Decimal::from_f64(short_price_f),
            Decimal::from_f64(self.config.trading.target_usdt),
        ) else {
            warn!(symbol = %self.symbol, "non-finite entry inputs; ending");
            return TraderState::End;
        };

        let (Some(long_qty), Some(short_qty)) = (
            size_leg(target, long_price, &long_meta),
            size_leg(target, short_price, &short_meta),
        ) else {
            warn!(symbol = %self.symbol, "leg sizing failed; ending");
            return TraderState::End;
        };

        if quantities_mismatched(long_qty, short_qty, long_price, short_price) {
            info!(
                symbol = %self.symbol,
                %long_qty,
                %short_qty,
                "leg quantities disproportionate to the spread; ending"
            );
            return TraderState::End;
        }

        // Balance gate on both venues.
        let required = self.config.trading.target_usdt * self.config.trader.usdt_required_multiplier;
        let quote = self.config.quote_currency.clone();
        let (long_bal, short_bal) = tokio::join!(
            self.long_gw.fetch_balance(&quote),
            self.short_gw.fetch_balance(&quote)
        );
        match (long_bal, short_bal) {
            (Ok(lb), Ok(sb)) => {
                if lb < required || sb < required {
                    info!(
                        symbol = %self.symbol,
                        required,
                        long_balance = lb,
                        short_balance = sb,
                        "insufficient free balance; ending"
                    );
                    return TraderState::End;
                }
            }
            (l, s) => {
                warn!(
                    symbol = %self.symbol,
                    long_err = ?l.err().map(|e| e.to_string()),
                    short_err = ?s.err().map(|e| e.to_string()),
                    "balance check failed; ending"
                );
                return TraderState::End;
            }
        }

        // Paired limits: buy the cheap venue slightly above, sell the rich
        // venue slightly below, so both legs are marketable immediately.
        let buy_price = snap_price(
            long_price * Decimal::from_f64(self.config.trader.enter_buy_price_margin).unwrap_or(Decimal::ONE),
            &long_meta,
        );
        let sell_price = snap_price(
            short_price * Decimal::from_f64(self.config.trader.enter_sell_price_margin).unwrap_or(Decimal::ONE),
            &short_meta,
        );

        info!(
            symbol = %self.symbol,
            spread_pct = sample.spread_pct,
            long_venue = %self.long_gw.venue(),
            short_venue = %self.short_gw.venue(),
            %long_qty,
            %short_qty,
            %buy_price,
            %sell_price,
            "placing paired entry limits"
        );

        let (long_res, short_res) = if self.config.orders.default_type == OrderKind::Market {
            tokio::join!(
                self.long_gw
                    .create_market_order(&self.symbol, Side::Buy, long_qty),
                self.short_gw
                    .create_market_order(&self.symbol, Side::Sell, short_qty)
            )
        } else {
            tokio::join!(
                self.long_gw
                    .create_limit_order(&self.symbol, Side::Buy, long_qty, buy_price),
                self.short_gw
                    .create_limit_order(&self.symbol, Side::Sell, short_qty, sell_price)
            )
        };

        match (long_res, short_res) {
            (Ok(long_order), Ok(short_order)) => {
                self.signal = Some(EntrySignal {
                    long_price: long_price_f,
                    short_price: short_price_f,
                    long_qty,
                    short_qty,
                    long_order_id: long_order.id,
                    short_order_id: short_order.id,
                    spread_signed: sample.spread_pct,
                });
                TraderState::EnterMonitor
            }
            (Ok(long_order), Err(e)) => {
                error!(symbol = %self.symbol, error = %e, "short entry leg failed; unwinding long");
                self.unwind_stray_leg(Leg::Long, &long_order).await;
                TraderState::End
            }
            (Err(e), Ok(short_order)) => {
                error!(symbol = %self.symbol, error = %e, "long entry leg failed; unwinding short");
                self.unwind_stray_leg(Leg::Short, &short_order).await;
                TraderState::End
            }
            (Err(le), Err(se)) => {
                error!(
                    symbol = %self.symbol,
                    long_error = %le,
                    short_error = %se,
                    "both entry legs failed"
                );
                TraderState::End
            }
        }
    }

    /// One leg placed, the other failed: cancel the stray, and flatten at
    /// market anything that already filled so no naked exposure remains.
    async fn unwind_stray_leg(&mut self, leg: Leg, order: &Order) {
        let meta = self.leg_meta(leg);
        let gw = self.leg_gw(leg).clone();

        match cancel_order_safe(gw.as_ref(), &order.id, &self.symbol).await {
            Ok(final_order) if final_order.filled_qty > Decimal::ZERO => {
                let qty = snap_to_step(final_order.filled_qty, meta.qty_step, SnapMode::Round);
                warn!(
                    symbol = %self.symbol,
                    leg = ?leg,
                    filled = %final_order.filled_qty,
                    "stray entry leg carries fills; flattening at market"
                );
                if qty > Decimal::ZERO {
                    if let Err(e) = gw
                        .create_market_order(&self.symbol, leg.close_side(), qty)
                        .await
                    {
                        error!(
                            symbol = %self.symbol,
                            leg = ?leg,
                            error = %e,
                            "failed to flatten stray leg; manual intervention required"
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(symbol = %self.symbol, leg = ?leg, error = %e, "failed to cancel stray leg");
            }
        }
    }

    // -------------------------------------------------------------------------
    // EnterMonitor
    // -------------------------------------------------------------------------

    async fn enter_monitor(&mut self) -> TraderState {
        let Some(signal) = self.signal.clone() else {
            return TraderState::End;
        };

        let long_min = self.leg_meta(Leg::Long).min_qty;
        let short_min = self.leg_meta(Leg::Short).min_qty;
        let deadline =
            Instant::now() + Duration::from_secs_f64(self.config.trader.max_enter_order_time);
        let poll = Duration::from_secs_f64(self.config.trader.order_poll_interval.max(0.01));
        let started = Instant::now();
        let mut polls = 0u32;

        while Instant::now() < deadline && !*self.shutdown.borrow() {
            let (long_res, short_res) = tokio::join!(
                self.long_gw.fetch_order(&signal.long_order_id, &self.symbol),
                self.short_gw.fetch_order(&signal.short_order_id, &self.symbol)
            );

            if let (Ok(long_order), Ok(short_order)) = (long_res, short_res) {
                polls += 1;
                if polls % 20 == 1 {
                    info!(
                        symbol = %self.symbol,
                        elapsed_secs = started.elapsed().as_secs(),
                        long_filled = %long_order.filled_qty,
                        long_qty = %signal.long_qty,
                        short_filled = %short_order.filled_qty,
                        short_qty = %signal.short_qty,
                        "entry order monitoring"
                    );
                }

                // Full within one venue minimum on both legs: the residual
                // below min-qty is not replaceable anyway.
                if long_order.filled_qty >= signal.long_qty - long_min
                    && short_order.filled_qty >= signal.short_qty - short_min
                {
                    info!(symbol = %self.symbol, "both entry legs filled");
                    let (long_cancel, short_cancel) = tokio::join!(
                        cancel_order_safe(self.long_gw.as_ref(), &signal.long_order_id, &self.symbol),
                        cancel_order_safe(self.short_gw.as_ref(), &signal.short_order_id, &self.symbol)
                    );
                    let long_final = long_cancel.unwrap_or(long_order);
                    let short_final = short_cancel.unwrap_or(short_order);
                    self.push_entry_fill(Leg::Long, &long_final);
                    self.push_entry_fill(Leg::Short, &short_final);
                    return self.finish_entry().await;
                }
            } else {
                warn!(symbol = %self.symbol, "entry order poll failed; retrying");
            }

            tokio::time::sleep(poll).await;
        }

        // Timed out (or shutting down): cancel both legs and reconcile.
        let interrupted = *self.shutdown.borrow();
        info!(
            symbol = %self.symbol,
            elapsed_secs = started.elapsed().as_secs(),
            interrupted,
            "entry window closed; cancelling and reconciling"
        );

        let (long_cancel, short_cancel) = tokio::join!(
            cancel_order_safe(self.long_gw.as_ref(), &signal.long_order_id, &self.symbol),
            cancel_order_safe(self.short_gw.as_ref(), &signal.short_order_id, &self.symbol)
        );

        let long_final = match long_cancel {
            Ok(order) => order,
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "long cancel unresolved; trusting fetch");
                match self.long_gw.fetch_order(&signal.long_order_id, &self.symbol).await {
                    Ok(order) => order,
                    Err(e2) => {
                        error!(symbol = %self.symbol, error = %e2, "long entry order unreachable");
                        return TraderState::End;
                    }
                }
            }
        };
        let short_final = match short_cancel {
            Ok(order) => order,
            Err(e) => {
                error!(symbol = %self.symbol, error = %e, "short cancel unresolved; trusting fetch");
                match self.short_gw.fetch_order(&signal.short_order_id, &self.symbol).await {
                    Ok(order) => order,
                    Err(e2) => {
                        error!(symbol = %self.symbol, error = %e2, "short entry order unreachable");
                        return TraderState::End;
                    }
                }
            }
        };

        // During shutdown no corrective orders are sent; whatever filled is
        // carried into an immediate close.
        if interrupted {
            self.push_entry_fill(Leg::Long, &long_final);
            self.push_entry_fill(Leg::Short, &short_final);
            return self.finish_entry().await;
        }

        let long_meta = self.leg_meta(Leg::Long);
        let short_meta = self.leg_meta(Leg::Short);
        let action = plan_reconciliation(&long_final, &short_final, &long_meta, &short_meta);
        info!(
            symbol = %self.symbol,
            long_filled = %long_final.filled_qty,
            short_filled = %short_final.filled_qty,
            action = ?action,
            "entry reconciliation"
        );

        self.push_entry_fill(Leg::Long, &long_final);
        self.push_entry_fill(Leg::Short, &short_final);

        match action {
            ReconcileAction::Abort => {
                info!(symbol = %self.symbol, "no fills on either venue; ending without position");
                return TraderState::End;
            }
            ReconcileAction::Accept => {}
            ReconcileAction::MinimumBothSides { long_qty, short_qty } => {
                self.taker_then_market(Leg::Short, short_qty, signal.short_price)
                    .await;
                self.taker_then_market(Leg::Long, long_qty, signal.long_price)
                    .await;
            }
            ReconcileAction::TopUpShort { qty } => {
                self.taker_then_market(Leg::Short, qty, signal.short_price).await;
            }
            ReconcileAction::TopUpLong { qty } => {
                self.taker_then_market(Leg::Long, qty, signal.long_price).await;
            }
        }

        self.finish_entry().await
    }

    /// Aggressive taker-margined limit for `qty`, converting any unfilled
    /// remainder to a market order when the taker window lapses.
    async fn taker_then_market(&mut self, leg: Leg, qty: Decimal, ref_price: f64) {
        if qty <= Decimal::ZERO {
            return;
        }

        let meta = self.leg_meta(leg);
        let gw = self.leg_gw(leg).clone();
        let side = leg.entry_side();
        let margin = match side {
            Side::Buy => self.config.trader.buy_taker_price_margin,
            Side::Sell => self.config.trader.sell_taker_price_margin,
        };

        let Some(raw_price) = Decimal::from_f64(ref_price * margin) else {
            warn!(symbol = %self.symbol, leg = ?leg, "non-finite corrective price");
            return;
        };
        let price = snap_price(raw_price, &meta);

        info!(
            symbol = %self.symbol,
            leg = ?leg,
            side = %side,
            %qty,
            %price,
            "placing corrective taker limit"
        );

        let order = match gw.create_limit_order(&self.symbol, side, qty, price).await {
            Ok(order) => order,
            Err(e) => {
                warn!(symbol = %self.symbol, leg = ?leg, error = %e,
                      "corrective limit rejected; going straight to market");
                self.market_fill(leg, qty).await;
                return;
            }
        };

        let deadline = Instant::now()
            + Duration::from_secs_f64(self.config.trader.max_taker_enter_order_time);
        let poll = Duration::from_secs_f64(
            (self.config.trader.order_poll_interval / 2.0).clamp(0.01, 0.5),
        );

        let mut latest = order.clone();
        while latest.status != OrderStatus::Filled && Instant::now() < deadline {
            tokio::time::sleep(poll).await;
            match gw.fetch_order(&order.id, &self.symbol).await {
                Ok(o) => latest = o,
                Err(e) => warn!(symbol = %self.symbol, error = %e, "corrective order poll failed"),
            }
            if latest.is_terminal() {
                break;
            }
        }

        if latest.status == OrderStatus::Filled {
            self.push_entry_fill(leg, &latest);
            return;
        }

        let final_limit = cancel_order_safe(gw.as_ref(), &order.id, &self.symbol)
            .await
            .unwrap_or(latest);
        self.push_entry_fill(leg, &final_limit);

        let remaining = snap_to_step(final_limit.remaining_qty(), meta.qty_step, SnapMode::Round);
        if remaining > Decimal::ZERO {
            info!(
                symbol = %self.symbol,
                leg = ?leg,
                %remaining,
                "taker window lapsed; market order for the remainder"
            );
            self.market_fill(leg, remaining).await;
        }
    }

    /// Market order for `qty` on the entry side of `leg`, recording fills.
    async fn market_fill(&mut self, leg: Leg, qty: Decimal) {
        let gw = self.leg_gw(leg).clone();
        let side = leg.entry_side();

        match gw.create_market_order(&self.symbol, side, qty).await {
            Ok(order) => {
                let final_order = if order.status == OrderStatus::Filled {
                    order
                } else {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    gw.fetch_order(&order.id, &self.symbol).await.unwrap_or(order)
                };
                self.push_entry_fill(leg, &final_order);
            }
            Err(e) => {
                error!(
                    symbol = %self.symbol,
                    leg = ?leg,
                    %qty,
                    error = %e,
                    "market fallback failed; position may stay imbalanced"
                );
            }
        }
    }

    /// Turn the fill ledgers into the effective position, or clean up when
    /// the entry collapsed to one side.
    async fn finish_entry(&mut self) -> TraderState {
        let (long_qty, long_cost) = ledger_totals(&self.long_fills);
        let (short_qty, short_cost) = ledger_totals(&self.short_fills);

        if long_qty.is_zero() && short_qty.is_zero() {
            info!(symbol = %self.symbol, "entry produced no position");
            return TraderState::End;
        }

        if long_qty.is_zero() || short_qty.is_zero() {
            error!(
                symbol = %self.symbol,
                %long_qty,
                %short_qty,
                "entry collapsed to one side; flattening"
            );
            if long_qty > Decimal::ZERO {
                let qty = snap_to_step(long_qty, self.leg_meta(Leg::Long).qty_step, SnapMode::Round);
                self.close_at_market(Leg::Long, qty).await;
            }
            if short_qty > Decimal::ZERO {
                let qty =
                    snap_to_step(short_qty, self.leg_meta(Leg::Short).qty_step, SnapMode::Round);
                self.close_at_market(Leg::Short, qty).await;
            }
            return TraderState::End;
        }

        let long_vwap = (long_cost / long_qty).to_f64().unwrap_or(0.0);
        let short_vwap = (short_cost / short_qty).to_f64().unwrap_or(0.0);
        if long_vwap <= 0.0 || short_vwap <= 0.0 {
            error!(symbol = %self.symbol, "entry bookkeeping produced invalid prices");
            return TraderState::End;
        }

        let spread_signed = self.realized_spread_signed(long_vwap, short_vwap);
        info!(
            symbol = %self.symbol,
            %long_qty,
            %short_qty,
            long_vwap,
            short_vwap,
            realized_entry_spread = spread_signed,
            "entry complete"
        );

        self.entry = Some(EntryPosition {
            long_qty,
            short_qty,
            long_vwap,
            short_vwap,
            spread_signed,
            completed_at: Instant::now(),
        });
        TraderState::ExitMonitor
    }

    /// Close one leg at market (defensive flatten, no record written).
    async fn close_at_market(&self, leg: Leg, qty: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let gw = self.leg_gw(leg).clone();
        if let Err(e) = gw
            .create_market_order(&self.symbol, leg.close_side(), qty)
            .await
        {
            error!(
                symbol = %self.symbol,
                leg = ?leg,
                %qty,
                error = %e,
                "defensive flatten failed; manual intervention required"
            );
        }
    }

    // -------------------------------------------------------------------------
    // ExitMonitor
    // -------------------------------------------------------------------------

    async fn exit_monitor(&mut self) -> TraderState {
        let Some(entry) = self.entry.clone() else {
            return TraderState::End;
        };

        // Defensive: the realized spread should always agree with the
        // declared direction by this point.
        if wrong_entry(self.direction, entry.spread_signed) {
            warn!(
                symbol = %self.symbol,
                realized_entry_spread = entry.spread_signed,
                direction = self.direction,
                "realized entry spread disagrees with direction"
            );
            return TraderState::ExitOrder(ExitType::WrongEntry);
        }

        let sl = self.config.risk.max_loss_percent;
        let tp = self.config.trading.exit_percent;
        let window_len = self.config.trader.max_exit_deque_len;
        let mut sl_window = HoldWindow::new(window_len);
        let mut tp_window = HoldWindow::new(window_len);

        let interval =
            Duration::from_secs_f64(self.config.trader.exit_monitor_interval.max(0.01));
        let deadline = entry.completed_at
            + Duration::from_secs_f64(self.config.risk.position_timeout_seconds as f64);

        info!(
            symbol = %self.symbol,
            entry_spread = entry.spread_signed,
            stop_loss = sl,
            take_profit = tp,
            window = window_len,
            "exit monitoring started"
        );

        let mut ticks = 0u64;
        loop {
            if *self.shutdown.borrow() {
                info!(symbol = %self.symbol, "shutdown during exit monitoring; closing now");
                return TraderState::ExitOrder(ExitType::TimeOut);
            }
            if Instant::now() >= deadline {
                info!(symbol = %self.symbol, "position timeout reached");
                return TraderState::ExitOrder(ExitType::TimeOut);
            }

            if let Some(sample) = self.latest_spread() {
                let current = sample.spread_pct;
                ticks += 1;
                if ticks % 30 == 1 {
                    info!(
                        symbol = %self.symbol,
                        entry_spread = entry.spread_signed,
                        current_spread = current,
                        change = current - entry.spread_signed,
                        "exit monitoring status"
                    );
                }

                if let Some(exit_type) = evaluate_sample(
                    self.direction,
                    entry.spread_signed,
                    current,
                    sl,
                    tp,
                    &mut sl_window,
                    &mut tp_window,
                ) {
                    info!(
                        symbol = %self.symbol,
                        exit_type = %exit_type,
                        entry_spread = entry.spread_signed,
                        current_spread = current,
                        "exit condition held across the window"
                    );
                    return TraderState::ExitOrder(exit_type);
                }
            }

            tokio::time::sleep(interval).await;
        }
    }

    // -------------------------------------------------------------------------
    // ExitOrder
    // -------------------------------------------------------------------------

    async fn exit_order(&mut self, exit_type: ExitType) -> TraderState {
        let Some(entry) = self.entry.clone() else {
            return TraderState::End;
        };

        let long_meta = self.leg_meta(Leg::Long);
        let short_meta = self.leg_meta(Leg::Short);

        // Reference prices from the live feed where available; the entry
        // VWAPs are the degenerate fallback when the feed went dark.
        let (long_ref, short_ref, exit_signal_spread) = match self.latest_spread() {
            Some(sample) => (
                Self::venue_price(&sample, self.long_gw.venue()),
                Self::venue_price(&sample, self.short_gw.venue()),
                sample.spread_pct,
            ),
            None => (entry.long_vwap, entry.short_vwap, entry.spread_signed),
        };

        let sell_margin = self.config.trader.sell_taker_price_margin;
        let buy_margin = self.config.trader.buy_taker_price_margin;

        let (Some(sell_raw), Some(buy_raw)) = (
            Decimal::from_f64(long_ref * sell_margin),
            Decimal::from_f64(short_ref * buy_margin),
        ) else {
            error!(symbol = %self.symbol, "non-finite exit prices");
            return TraderState::End;
        };
        let sell_price = snap_price(sell_raw, &long_meta);
        let buy_price = snap_price(buy_raw, &short_meta);

        let long_close_qty = snap_to_step(entry.long_qty, long_meta.qty_step, SnapMode::Round);
        let short_close_qty = snap_to_step(entry.short_qty, short_meta.qty_step, SnapMode::Round);

        info!(
            symbol = %self.symbol,
            exit_type = %exit_type,
            exit_spread = exit_signal_spread,
            %long_close_qty,
            %short_close_qty,
            %sell_price,
            %buy_price,
            "closing both legs"
        );

        let (long_res, short_res) = tokio::join!(
            self.long_gw
                .create_limit_order(&self.symbol, Side::Sell, long_close_qty, sell_price),
            self.short_gw
                .create_limit_order(&self.symbol, Side::Buy, short_close_qty, buy_price)
        );

        let long_order = match long_res {
            Ok(order) => Some(order),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "long close limit failed; market close");
                self.long_gw
                    .create_market_order(&self.symbol, Side::Sell, long_close_qty)
                    .await
                    .map_err(|e2| {
                        error!(symbol = %self.symbol, error = %e2, "long market close failed");
                    })
                    .ok()
            }
        };
        let short_order = match short_res {
            Ok(order) => Some(order),
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "short close limit failed; market close");
                self.short_gw
                    .create_market_order(&self.symbol, Side::Buy, short_close_qty)
                    .await
                    .map_err(|e2| {
                        error!(symbol = %self.symbol, error = %e2, "short market close failed");
                    })
                    .ok()
            }
        };

        if long_order.is_none() && short_order.is_none() {
            error!(
                symbol = %self.symbol,
                "no close order could be placed on either venue; manual intervention required"
            );
            return TraderState::End;
        }

        self.exit_legs = Some(ExitLegs {
            long_order,
            short_order,
            exit_signal_spread,
        });
        TraderState::ExitOrderMonitor(exit_type)
    }

    // -------------------------------------------------------------------------
    // ExitOrderMonitor
    // -------------------------------------------------------------------------

    async fn exit_order_monitor(&mut self, exit_type: ExitType) -> TraderState {
        let (Some(entry), Some(legs)) = (self.entry.clone(), self.exit_legs.clone()) else {
            return TraderState::End;
        };

        let deadline = Instant::now()
            + Duration::from_secs(self.config.risk.order_timeout_seconds.max(1));

        if let Some(order) = legs.long_order {
            self.settle_exit_leg(Leg::Long, order, deadline).await;
        }
        if let Some(order) = legs.short_order {
            self.settle_exit_leg(Leg::Short, order, deadline).await;
        }

        let (exit_long_qty, exit_long_cost) = ledger_totals(&self.exit_long_fills);
        let (exit_short_qty, exit_short_cost) = ledger_totals(&self.exit_short_fills);

        let long_exit_vwap = if exit_long_qty > Decimal::ZERO {
            (exit_long_cost / exit_long_qty).to_f64().unwrap_or(entry.long_vwap)
        } else {
            error!(symbol = %self.symbol, "no exit fills on long leg; using entry price");
            entry.long_vwap
        };
        let short_exit_vwap = if exit_short_qty > Decimal::ZERO {
            (exit_short_cost / exit_short_qty).to_f64().unwrap_or(entry.short_vwap)
        } else {
            error!(symbol = %self.symbol, "no exit fills on short leg; using entry price");
            entry.short_vwap
        };

        let long_qty = entry.long_qty.to_f64().unwrap_or(0.0);
        let short_qty = entry.short_qty.to_f64().unwrap_or(0.0);
        let fee_rate = self.config.trader.fee_bps / 10_000.0;

        let long_profit = (long_exit_vwap - entry.long_vwap) * long_qty
            - fee_rate * (entry.long_vwap + long_exit_vwap) * long_qty;
        let short_profit = -(short_exit_vwap - entry.short_vwap) * short_qty
            - fee_rate * (entry.short_vwap + short_exit_vwap) * short_qty;
        let net_profit = long_profit + short_profit;

        let exit_spread = self.realized_spread_signed(long_exit_vwap, short_exit_vwap);

        let signal = self.signal.clone();
        let record = TradeRecord {
            recorded_at: chrono::Utc::now().to_rfc3339(),
            symbol: self.symbol.clone(),
            direction: self.direction,
            long_venue: self.long_gw.venue().to_string(),
            short_venue: self.short_gw.venue().to_string(),
            long_signal_entry_price: signal.as_ref().map_or(0.0, |s| s.long_price),
            long_signal_entry_qty: signal
                .as_ref()
                .and_then(|s| s.long_qty.to_f64())
                .unwrap_or(0.0),
            short_signal_entry_price: signal.as_ref().map_or(0.0, |s| s.short_price),
            short_signal_entry_qty: signal
                .as_ref()
                .and_then(|s| s.short_qty.to_f64())
                .unwrap_or(0.0),
            entry_signal_spread: signal.as_ref().map_or(0.0, |s| s.spread_signed),
            long_entry_price: entry.long_vwap,
            long_entry_qty: long_qty,
            short_entry_price: entry.short_vwap,
            short_entry_qty: short_qty,
            entry_spread: entry.spread_signed,
            long_exit_price: long_exit_vwap,
            short_exit_price: short_exit_vwap,
            exit_signal_spread: legs.exit_signal_spread,
            exit_spread,
            exit_type,
            long_profit,
            short_profit,
            net_profit,
        };

        info!(
            symbol = %self.symbol,
            exit_type = %exit_type,
            long_profit,
            short_profit,
            net_profit,
            "trade complete"
        );

        if let Err(e) = self.journal.append(record).await {
            error!(symbol = %self.symbol, error = %e, "failed to write trade record");
        }

        TraderState::End
    }

    /// Poll one close order to a terminal state, market-ordering any
    /// remainder after the exit order timeout.
    async fn settle_exit_leg(&mut self, leg: Leg, order: Order, deadline: Instant) {
        let meta = self.leg_meta(leg);
        let gw = self.leg_gw(leg).clone();
        let poll = Duration::from_secs_f64(self.config.trader.order_poll_interval.max(0.01));

        let mut latest = order.clone();
        while latest.status != OrderStatus::Filled && Instant::now() < deadline {
            if latest.is_terminal() {
                break;
            }
            tokio::time::sleep(poll).await;
            match gw.fetch_order(&order.id, &self.symbol).await {
                Ok(o) => latest = o,
                Err(e) => warn!(symbol = %self.symbol, error = %e, "exit order poll failed"),
            }
        }

        if latest.status == OrderStatus::Filled {
            self.push_exit_fill(leg, &latest);
            return;
        }

        let final_limit = cancel_order_safe(gw.as_ref(), &order.id, &self.symbol)
            .await
            .unwrap_or(latest);
        self.push_exit_fill(leg, &final_limit);

        let remaining = snap_to_step(final_limit.remaining_qty(), meta.qty_step, SnapMode::Round);
        if remaining > Decimal::ZERO {
            warn!(
                symbol = %self.symbol,
                leg = ?leg,
                %remaining,
                "exit limit unfilled within the order timeout; market close"
            );
            match gw
                .create_market_order(&self.symbol, leg.close_side(), remaining)
                .await
            {
                Ok(mo) => {
                    let final_mkt = if mo.status == OrderStatus::Filled {
                        mo
                    } else {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        gw.fetch_order(&mo.id, &self.symbol).await.unwrap_or(mo)
                    };
                    self.push_exit_fill(leg, &final_mkt);
                }
                Err(e) => {
                    error!(
                        symbol = %self.symbol,
                        leg = ?leg,
                        error = %e,
                        "exit market fallback failed; position may remain open"
                    );
                }
            }
        }
    }
}
