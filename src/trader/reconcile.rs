// =============================================================================
// Entry Reconciliation — case analysis after the entry window times out
// =============================================================================
//
// When the paired entry limits do not both fill inside the entry window, the
// trader cancels them and inspects the fills. The decision is pure and
// depends only on the two final order states and the venue minimums:
//
//   1. nothing filled on either side            → abort, no position
//   2. both sides below minimum (fills exist)   → add minimum on both sides
//   3. one side full, the other short           → top up the lagging side
//   4. both sides partial                       → accept a <3pp ratio gap,
//                                                 otherwise top up the
//                                                 lagging side to the
//                                                 leader's fill ratio
//
// Execution of the resulting corrective orders (taker-margined limit, then
// market fallback) lives in the trader itself; this module only plans.
// =============================================================================

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::trader::sizing::{snap_to_step, SnapMode};
use crate::types::{Order, SymbolMeta};

/// Fill-ratio gap (in ratio points, 0.03 = 3pp) below which a two-sided
/// partial is accepted as tolerably balanced.
const FILL_RATIO_TOLERANCE: f64 = 0.03;

/// The corrective action chosen after cancelling both entry legs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Case 1: no fills anywhere; the trader ends without a position.
    Abort,
    /// Case 2: dust on both sides; buy/sell the step-ceiled minimum on both
    /// legs so each side clears its venue minimum.
    MinimumBothSides {
        long_qty: Decimal,
        short_qty: Decimal,
    },
    /// Cases 3/4: the long side lags; buy this much more.
    TopUpLong { qty: Decimal },
    /// Cases 3/4: the short side lags; sell this much more.
    TopUpShort { qty: Decimal },
    /// Case 4 within tolerance (or both legs effectively full).
    Accept,
}

/// Decide the corrective action from the cancelled entry orders.
///
/// `long` and `short` are the final (post-cancel) order states; minimums and
/// steps come from the venue metadata of each leg.
pub fn plan_reconciliation(
    long: &Order,
    short: &Order,
    long_meta: &SymbolMeta,
    short_meta: &SymbolMeta,
) -> ReconcileAction {
    let l_filled = long.filled_qty;
    let s_filled = short.filled_qty;
    let l_min = long_meta.min_qty;
    let s_min = short_meta.min_qty;

    // Case 1: neither side filled.
    if l_filled.is_zero() && s_filled.is_zero() {
        return ReconcileAction::Abort;
    }

    // Case 2: both sides hold dust below the venue minimum. Cancel-and-replace
    // is impossible below the minimum, so both sides add a minimum clip.
    if l_filled < l_min && s_filled < s_min {
        return ReconcileAction::MinimumBothSides {
            long_qty: snap_to_step(l_min, long_meta.qty_step, SnapMode::Ceil),
            short_qty: snap_to_step(s_min, short_meta.qty_step, SnapMode::Ceil),
        };
    }

    // "Full" within one venue minimum of the request.
    let long_full = l_filled >= long.requested_qty - l_min;
    let short_full = s_filled >= short.requested_qty - s_min;

    // Case 3: one side done, the other short.
    if long_full && !short_full {
        let qty = snap_to_step(
            short.requested_qty - s_filled,
            short_meta.qty_step,
            SnapMode::Round,
        );
        return ReconcileAction::TopUpShort { qty };
    }
    if short_full && !long_full {
        let qty = snap_to_step(
            long.requested_qty - l_filled,
            long_meta.qty_step,
            SnapMode::Round,
        );
        return ReconcileAction::TopUpLong { qty };
    }
    if long_full && short_full {
        return ReconcileAction::Accept;
    }

    // Case 4: partial on both sides. A small ratio gap is tolerable residual
    // imbalance; a large one tops the lagging side up to the leader's ratio.
    let l_ratio = long.fill_ratio();
    let s_ratio = short.fill_ratio();

    if (l_ratio - s_ratio).abs() < FILL_RATIO_TOLERANCE {
        return ReconcileAction::Accept;
    }

    if l_ratio > s_ratio {
        let gap = Decimal::from_f64(l_ratio - s_ratio).unwrap_or_default();
        let mut qty = short.requested_qty * gap;
        if qty < s_min {
            qty = s_min;
        }
        ReconcileAction::TopUpShort {
            qty: snap_to_step(qty, short_meta.qty_step, SnapMode::Round),
        }
    } else {
        let gap = Decimal::from_f64(s_ratio - l_ratio).unwrap_or_default();
        let mut qty = long.requested_qty * gap;
        if qty < l_min {
            qty = l_min;
        }
        ReconcileAction::TopUpLong {
            qty: snap_to_step(qty, long_meta.qty_step, SnapMode::Round),
        }
    }
}
