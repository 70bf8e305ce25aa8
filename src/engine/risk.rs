//! # engine::risk
//!
//! Multi-layer risk gate, evaluated fresh on every tick.
//!
//! ## Layers (first hit wins, the rest are skipped)
//! 1. **Over-position** — `ratio > max_position_ratio` → `BLOCKED{OverPosition}`.
//!    Buys are refused, sells still go through.
//! 2. **Under-floor**   — `ratio < min_position_ratio` → advisory only.
//!    Trading continues; the overlay is told to favour adding.
//! 3. **Drawdown**      — `(peak - total) / peak > max_drawdown` →
//!    `BLOCKED{Drawdown}`.  Nothing trades.
//!
//! [`RiskGate::assess`] is what the engine acts on: the layers above, except
//! that a drawdown breach still blocks when the position is under the floor,
//! so a floor top-up is never bought into a breached drawdown.
//!
//! The gate never mutates anything.  The caller keeps the peak high-water
//! mark and raises it before calling [`RiskGate::evaluate`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::Side;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_position_ratio: f64,
    pub min_position_ratio: f64,
    /// Positive fraction, e.g. `0.15` for 15%.
    pub max_drawdown:       f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_ratio: 0.9,
            min_position_ratio: 0.1,
            max_drawdown:       0.15,
        }
    }
}

// ─── Verdict ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    OverPosition,
    UnderPosition,
    Drawdown,
}

impl BlockReason {
    pub fn tag(&self) -> &'static str {
        match self {
            BlockReason::OverPosition  => "OVER_POSITION",
            BlockReason::UnderPosition => "UNDER_POSITION",
            BlockReason::Drawdown      => "DRAWDOWN",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskVerdict {
    Ok,
    /// Trading allowed; surfaced so the overlay can react.
    Advisory { reason: BlockReason },
    Blocked { reason: BlockReason },
}

impl RiskVerdict {
    /// Whether an order on `side` may proceed under this verdict.
    pub fn permits(&self, side: Side) -> bool {
        match self {
            RiskVerdict::Ok | RiskVerdict::Advisory { .. } => true,
            RiskVerdict::Blocked { reason: BlockReason::OverPosition }  => side == Side::Sell,
            RiskVerdict::Blocked { reason: BlockReason::UnderPosition } => side == Side::Buy,
            RiskVerdict::Blocked { reason: BlockReason::Drawdown }      => false,
        }
    }

    pub fn is_under_floor(&self) -> bool {
        matches!(self, RiskVerdict::Advisory { reason: BlockReason::UnderPosition })
    }

    pub fn blocked_reason(&self) -> Option<BlockReason> {
        match self {
            RiskVerdict::Blocked { reason } => Some(*reason),
            _ => None,
        }
    }
}

// ─── Gate ─────────────────────────────────────────────────────────────────────

/// Fractional decline of `total` from `peak`; `0.0` when there is no peak yet.
pub fn drawdown(total_assets: f64, peak_assets: f64) -> f64 {
    if peak_assets <= 0.0 {
        return 0.0;
    }
    (peak_assets - total_assets) / peak_assets
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskGate {
    limits: RiskLimits,
}

impl RiskGate {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn evaluate(&self, position_ratio: f64, total_assets: f64, peak_assets: f64) -> RiskVerdict {
        // [1] Over-position
        if position_ratio > self.limits.max_position_ratio {
            debug!(
                position_ratio,
                max = self.limits.max_position_ratio,
                "🛡️ Risk: position above ceiling, buys blocked"
            );
            return RiskVerdict::Blocked { reason: BlockReason::OverPosition };
        }

        // [2] Under-floor (advisory)
        if position_ratio < self.limits.min_position_ratio {
            debug!(
                position_ratio,
                min = self.limits.min_position_ratio,
                "🛡️ Risk: position below floor (advisory)"
            );
            return RiskVerdict::Advisory { reason: BlockReason::UnderPosition };
        }

        // [3] Drawdown from peak
        let dd = drawdown(total_assets, peak_assets);
        if dd > self.limits.max_drawdown {
            debug!(
                drawdown = dd,
                max = self.limits.max_drawdown,
                total_assets,
                peak_assets,
                "⛔ Risk: drawdown limit breached, all trading blocked"
            );
            return RiskVerdict::Blocked { reason: BlockReason::Drawdown };
        }

        RiskVerdict::Ok
    }

    pub fn drawdown_breached(&self, total_assets: f64, peak_assets: f64) -> bool {
        drawdown(total_assets, peak_assets) > self.limits.max_drawdown
    }

    /// [`evaluate`](Self::evaluate) with the drawdown stop overriding the
    /// under-floor advisory.
    pub fn assess(&self, position_ratio: f64, total_assets: f64, peak_assets: f64) -> RiskVerdict {
        let verdict = self.evaluate(position_ratio, total_assets, peak_assets);
        if verdict.is_under_floor() && self.drawdown_breached(total_assets, peak_assets) {
            debug!(
                position_ratio,
                total_assets,
                peak_assets,
                "⛔ Risk: under floor but drawdown breached, all trading blocked"
            );
            return RiskVerdict::Blocked { reason: BlockReason::Drawdown };
        }
        verdict
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> RiskGate {
        RiskGate::new(RiskLimits::default())
    }

    #[test]
    fn test_drawdown_threshold() {
        assert_eq!(
            gate().evaluate(0.5, 840.0, 1000.0),
            RiskVerdict::Blocked { reason: BlockReason::Drawdown }
        );
        assert_eq!(gate().evaluate(0.5, 860.0, 1000.0), RiskVerdict::Ok);
        // exactly at the limit is not a breach
        assert_eq!(gate().evaluate(0.5, 850.0, 1000.0), RiskVerdict::Ok);
    }

    #[test]
    fn test_over_position_blocks_buys_only() {
        let v = gate().evaluate(0.95, 1000.0, 1000.0);
        assert_eq!(v, RiskVerdict::Blocked { reason: BlockReason::OverPosition });
        assert!(!v.permits(Side::Buy));
        assert!(v.permits(Side::Sell));
    }

    #[test]
    fn test_under_floor_is_advisory() {
        let v = gate().evaluate(0.05, 1000.0, 1000.0);
        assert!(v.is_under_floor());
        assert!(v.permits(Side::Buy));
        assert!(v.permits(Side::Sell));
        assert_eq!(v.blocked_reason(), None);
    }

    #[test]
    fn test_drawdown_blocks_everything() {
        let v = gate().evaluate(0.5, 100.0, 1000.0);
        assert!(!v.permits(Side::Buy));
        assert!(!v.permits(Side::Sell));
    }

    #[test]
    fn test_first_layer_short_circuits() {
        // Over-position wins over a simultaneous drawdown breach
        assert_eq!(
            gate().evaluate(0.95, 100.0, 1000.0).blocked_reason(),
            Some(BlockReason::OverPosition)
        );
    }

    #[test]
    fn test_assess_drawdown_overrides_floor_advisory() {
        // evaluate alone stops at the advisory
        assert!(gate().evaluate(0.05, 700.0, 1000.0).is_under_floor());

        let v = gate().assess(0.05, 700.0, 1000.0);
        assert_eq!(v, RiskVerdict::Blocked { reason: BlockReason::Drawdown });
        assert!(!v.permits(Side::Buy));
        assert!(!v.is_under_floor());

        // no breach: the advisory stands
        assert!(gate().assess(0.05, 900.0, 1000.0).is_under_floor());
        // over-position still wins
        assert_eq!(
            gate().assess(0.95, 700.0, 1000.0).blocked_reason(),
            Some(BlockReason::OverPosition)
        );
    }

    #[test]
    fn test_no_peak_means_no_drawdown() {
        assert_eq!(drawdown(500.0, 0.0), 0.0);
        assert_eq!(gate().evaluate(0.5, 500.0, 0.0), RiskVerdict::Ok);
    }
}
