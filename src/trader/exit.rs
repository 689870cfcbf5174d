// =============================================================================
// Exit Conditions — persistence windows and threshold tests
// =============================================================================
//
// The exit monitor samples the live spread and requires a condition to hold
// across an entire window before acting, so a single noisy tick cannot close
// a position. Windows are fixed-width bitsets: a condition has "held" when
// the window is full and every bit is set.
//
// Baseline note: `entry` below is the REALIZED entry spread (signed, from
// volume-weighted fills), not the signal spread that triggered admission.
// =============================================================================

use crate::types::ExitType;

/// Fixed-width boolean history with popcount-based all-true test.
#[derive(Debug, Clone)]
pub struct HoldWindow {
    bits: u32,
    len: u32,
    cap: u32,
}

impl HoldWindow {
    /// `cap` is clamped to 1..=32.
    pub fn new(cap: usize) -> Self {
        Self {
            bits: 0,
            len: 0,
            cap: cap.clamp(1, 32) as u32,
        }
    }

    pub fn push(&mut self, value: bool) {
        let mask = if self.cap == 32 {
            u32::MAX
        } else {
            (1u32 << self.cap) - 1
        };
        self.bits = ((self.bits << 1) | u32::from(value)) & mask;
        self.len = (self.len + 1).min(self.cap);
    }

    /// True when the window is full and every entry is true.
    pub fn all_true(&self) -> bool {
        self.len == self.cap && self.bits.count_ones() == self.cap
    }

    pub fn reset(&mut self) {
        self.bits = 0;
        self.len = 0;
    }
}

/// Stop-loss test for one sample: the spread has moved `sl` percent further
/// against the position than the entry baseline.
pub fn stop_loss_hit(direction: bool, entry: f64, current: f64, sl: f64) -> bool {
    if direction {
        current - entry > sl
    } else {
        current - entry < -sl
    }
}

/// Take-profit test for one sample: the spread has converged by more than
/// `tp` percent, or has crossed zero entirely.
pub fn take_profit_hit(direction: bool, entry: f64, current: f64, tp: f64) -> bool {
    if direction {
        (entry - current > tp) || current <= 0.0
    } else {
        (current - entry > tp) || current >= 0.0
    }
}

/// Defensive: a realized entry spread whose sign disagrees with the declared
/// direction means the position never matched its signal.
pub fn wrong_entry(direction: bool, entry: f64) -> bool {
    if direction {
        entry <= 0.0
    } else {
        entry >= 0.0
    }
}

/// Evaluate one sample against both windows; returns the triggered exit, if
/// any. Stop-loss wins over take-profit when both windows fill on the same
/// sample.
pub fn evaluate_sample(
    direction: bool,
    entry: f64,
    current: f64,
    sl: f64,
    tp: f64,
    sl_window: &mut HoldWindow,
    tp_window: &mut HoldWindow,
) -> Option<ExitType> {
    sl_window.push(stop_loss_hit(direction, entry, current, sl));
    tp_window.push(take_profit_hit(direction, entry, current, tp));

    if sl_window.all_true() {
        Some(ExitType::StopLoss)
    } else if tp_window.all_true() {
        Some(ExitType::TakeProfit)
    } else {
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_requires_full_history() {
        let mut w = HoldWindow::new(3);
        w.push(true);
        w.push(true);
        assert!(!w.all_true(), "two of three is not enough");
        w.push(true);
        assert!(w.all_true());
    }

    #[test]
    fn one_false_breaks_the_run() {
        let mut w = HoldWindow::new(3);
        w.push(true);
        w.push(false);
        w.push(true);
        assert!(!w.all_true());
        // the false ages out after three more trues
        w.push(true);
        w.push(true);
        assert!(w.all_true());

        w.reset();
        assert!(!w.all_true(), "a reset window has no history");
    }

    #[test]
    fn window_cap_is_clamped() {
        let mut w = HoldWindow::new(0);
        w.push(true);
        assert!(w.all_true(), "cap 0 clamps to 1");

        let mut w = HoldWindow::new(64);
        for _ in 0..32 {
            w.push(true);
        }
        assert!(w.all_true(), "cap clamps to 32");
    }

    #[test]
    fn stop_loss_follows_direction() {
        // positive entry: loss is the spread widening further
        assert!(stop_loss_hit(true, 0.60, 1.10, 0.4));
        assert!(stop_loss_hit(true, 0.60, 1.15, 0.4));
        assert!(stop_loss_hit(true, 0.60, 1.20, 0.4));
        assert!(!stop_loss_hit(true, 0.60, 0.90, 0.4));

        // negative entry: loss is the spread falling further
        assert!(stop_loss_hit(false, -0.60, -1.10, 0.4));
        assert!(!stop_loss_hit(false, -0.60, -0.80, 0.4));
    }

    #[test]
    fn take_profit_is_convergence_or_zero_cross() {
        // positive entry converging down
        assert!(take_profit_hit(true, 0.60, 0.20, 0.3));
        assert!(!take_profit_hit(true, 0.60, 0.40, 0.3));
        // zero-cross always profits
        assert!(take_profit_hit(true, 0.60, -0.05, 0.3));

        // negative entry converging up
        assert!(take_profit_hit(false, -0.60, -0.20, 0.3));
        assert!(!take_profit_hit(false, -0.60, -0.40, 0.3));
        assert!(take_profit_hit(false, -0.60, 0.05, 0.3));
    }

    #[test]
    fn wrong_entry_detects_sign_disagreement() {
        assert!(wrong_entry(true, -0.10));
        assert!(wrong_entry(true, 0.0));
        assert!(!wrong_entry(true, 0.10));
        assert!(wrong_entry(false, 0.10));
        assert!(!wrong_entry(false, -0.10));
    }

    #[test]
    fn persistent_stop_loss_triggers_after_full_window() {
        // Entry at +0.60, spread widening to 1.10 / 1.15 / 1.20 with sl=0.4:
        // every sample breaches, so the third fills the window.
        let mut sl_w = HoldWindow::new(3);
        let mut tp_w = HoldWindow::new(3);

        assert_eq!(
            evaluate_sample(true, 0.60, 1.10, 0.4, 0.3, &mut sl_w, &mut tp_w),
            None
        );
        assert_eq!(
            evaluate_sample(true, 0.60, 1.15, 0.4, 0.3, &mut sl_w, &mut tp_w),
            None
        );
        assert_eq!(
            evaluate_sample(true, 0.60, 1.20, 0.4, 0.3, &mut sl_w, &mut tp_w),
            Some(ExitType::StopLoss)
        );
    }

    #[test]
    fn converging_spread_triggers_take_profit() {
        // Entry at +0.60, converging to 0.25 / 0.15 / 0.05 with tp=0.3.
        let mut sl_w = HoldWindow::new(3);
        let mut tp_w = HoldWindow::new(3);

        assert_eq!(
            evaluate_sample(true, 0.60, 0.25, 0.4, 0.3, &mut sl_w, &mut tp_w),
            None
        );
        assert_eq!(
            evaluate_sample(true, 0.60, 0.15, 0.4, 0.3, &mut sl_w, &mut tp_w),
            None
        );
        assert_eq!(
            evaluate_sample(true, 0.60, 0.05, 0.4, 0.3, &mut sl_w, &mut tp_w),
            Some(ExitType::TakeProfit)
        );
    }

    #[test]
    fn interrupted_run_does_not_trigger() {
        let mut sl_w = HoldWindow::new(3);
        let mut tp_w = HoldWindow::new(3);

        evaluate_sample(true, 0.60, 0.25, 0.4, 0.3, &mut sl_w, &mut tp_w);
        evaluate_sample(true, 0.60, 0.45, 0.4, 0.3, &mut sl_w, &mut tp_w); // bounce
        assert_eq!(
            evaluate_sample(true, 0.60, 0.25, 0.4, 0.3, &mut sl_w, &mut tp_w),
            None,
            "bounce in the middle of the window must reset the run"
        );
    }
}
