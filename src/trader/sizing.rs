// =============================================================================
// Leg Sizing — decimal quantity/price snapping against venue metadata
// =============================================================================
//
// All quantity and price arithmetic is decimal; floats only enter when
// converting streamed prices. Snapping modes: Round for ordinary sizing,
// Ceil only when raising a quantity to the venue minimum.
// =============================================================================

use rust_decimal::Decimal;

use crate::types::SymbolMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapMode {
    Round,
    Ceil,
}

/// Snap `value` to an integer multiple of `step`.
pub fn snap_to_step(value: Decimal, step: Decimal, mode: SnapMode) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    let units = value / step;
    let snapped = match mode {
        SnapMode::Round => units.round(),
        SnapMode::Ceil => units.ceil(),
    };
    (snapped * step).normalize()
}

/// Quantity for one leg targeting `target_usdt` notional at `price`.
///
/// `target/price` is rounded to the amount step; the venue minimum is ceiled
/// to the step (a minimum must never round down below itself). The larger of
/// the two wins, so a leg is never sized below the venue minimum.
pub fn size_leg(target_usdt: Decimal, price: Decimal, meta: &SymbolMeta) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    let qty = snap_to_step(target_usdt / price, meta.qty_step, SnapMode::Round);
    let min_qty = snap_to_step(meta.min_qty, meta.qty_step, SnapMode::Ceil);
    Some(qty.max(min_qty))
}

/// Snap a price to the venue tick.
pub fn snap_price(price: Decimal, meta: &SymbolMeta) -> Decimal {
    snap_to_step(price, meta.tick_size, SnapMode::Round)
}

/// Delta-neutrality guard: the snapped quantities may differ between venues,
/// but a relative gap more than 5x the price spread ratio would leave the
/// pair meaningfully directional.
pub fn quantities_mismatched(
    qty_a: Decimal,
    qty_b: Decimal,
    price_a: Decimal,
    price_b: Decimal,
) -> bool {
    let min_qty = qty_a.min(qty_b);
    let min_price = price_a.min(price_b);
    if min_qty <= Decimal::ZERO || min_price <= Decimal::ZERO {
        return true;
    }

    let qty_gap = (qty_a - qty_b).abs() / min_qty;
    let price_gap = (price_a - price_b).abs() / min_price;
    qty_gap > price_gap * Decimal::from(5)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn meta(min_qty: Decimal, qty_step: Decimal) -> SymbolMeta {
        SymbolMeta {
            symbol: "TESTUSDT".into(),
            min_qty,
            qty_step,
            tick_size: dec!(0.0001),
        }
    }

    #[test]
    fn round_snaps_to_nearest_step() {
        assert_eq!(snap_to_step(dec!(1.2349), dec!(0.001), SnapMode::Round), dec!(1.235));
        assert_eq!(snap_to_step(dec!(1.2341), dec!(0.001), SnapMode::Round), dec!(1.234));
        assert_eq!(snap_to_step(dec!(7), dec!(1), SnapMode::Round), dec!(7));
    }

    #[test]
    fn ceil_never_rounds_down() {
        assert_eq!(snap_to_step(dec!(1.2341), dec!(0.001), SnapMode::Ceil), dec!(1.235));
        assert_eq!(snap_to_step(dec!(1.234), dec!(0.001), SnapMode::Ceil), dec!(1.234));
        assert_eq!(snap_to_step(dec!(0.0005), dec!(0.001), SnapMode::Ceil), dec!(0.001));
    }

    #[test]
    fn zero_step_passes_value_through() {
        assert_eq!(snap_to_step(dec!(1.2345), Decimal::ZERO, SnapMode::Round), dec!(1.2345));
    }

    #[test]
    fn sizes_to_target_notional() {
        let m = meta(dec!(0.001), dec!(0.001));
        let qty = size_leg(dec!(100), dec!(100.4), &m).unwrap();
        // 100 / 100.4 = 0.99601..., rounded to the 0.001 step
        assert_eq!(qty, dec!(0.996));
    }

    #[test]
    fn minimum_wins_when_target_is_too_small() {
        // 100 USDT at price 5 would be 20 units, but the venue minimum is 25.
        let m = meta(dec!(25), dec!(1));
        let qty = size_leg(dec!(100), dec!(5), &m).unwrap();
        assert_eq!(qty, dec!(25));
    }

    #[test]
    fn minimum_is_ceiled_to_step() {
        // A venue minimum of 0.0015 on a 0.001 step must become 0.002, not
        // 0.001: snapping may never produce a quantity below the minimum.
        let m = meta(dec!(0.0015), dec!(0.001));
        let qty = size_leg(dec!(0.1), dec!(100), &m).unwrap();
        assert_eq!(qty, dec!(0.002));
    }

    #[test]
    fn exact_minimum_after_ceil_is_permitted() {
        let m = meta(dec!(0.002), dec!(0.001));
        // target/price lands exactly on the minimum
        let qty = size_leg(dec!(0.2), dec!(100), &m).unwrap();
        assert_eq!(qty, dec!(0.002));
    }

    #[test]
    fn invalid_price_is_rejected() {
        let m = meta(dec!(0.001), dec!(0.001));
        assert!(size_leg(dec!(100), Decimal::ZERO, &m).is_none());
    }

    #[test]
    fn mismatch_guard_allows_proportionate_gaps() {
        // qty gap 0.4%, price gap 0.4% → 0.4% < 5 * 0.4%: fine
        assert!(!quantities_mismatched(
            dec!(1.000),
            dec!(0.996),
            dec!(100.0),
            dec!(100.4)
        ));
    }

    #[test]
    fn mismatch_guard_rejects_disproportionate_gaps() {
        // qty gap 100% against a 0.4% price gap
        assert!(quantities_mismatched(
            dec!(2),
            dec!(1),
            dec!(100.0),
            dec!(100.4)
        ));
        // degenerate inputs always mismatch
        assert!(quantities_mismatched(dec!(0), dec!(1), dec!(100), dec!(100)));
    }

    #[test]
    fn price_snaps_to_tick() {
        let m = SymbolMeta {
            symbol: "TESTUSDT".into(),
            min_qty: dec!(0.001),
            qty_step: dec!(0.001),
            tick_size: dec!(0.01),
        };
        assert_eq!(snap_price(dec!(100.299), &m), dec!(100.3));
        assert_eq!(snap_price(dec!(100.2949), &m), dec!(100.29));
    }
}
