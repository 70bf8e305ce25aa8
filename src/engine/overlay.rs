//! # engine::overlay
//!
//! **S1 position overlay** — slow rebalancing that runs next to the grid.
//!
//! Tracks the day's high/low.  Where the price sits inside that range sets a
//! target holding: near the low hold more, near the high hold less.
//!
//! ```text
//! position_in_range = (price - low) / (high - low)
//! target_ratio      = 1 - position_in_range
//!
//! actual > target + band  → Reduce
//! actual < target - band  → Add
//! otherwise               → Hold
//! ```
//!
//! The range resets whenever the clock reports a new day.  Until the day has
//! produced two distinct prices (`high > low`) the overlay reports
//! `InsufficientData` and the orchestrator skips it.

use serde::Serialize;
use tracing::debug;

use crate::error::EngineError;
use crate::models::Side;

/// Read-only view of holdings for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub position_ratio: f64,
    pub daily_high:     Option<f64>,
    pub daily_low:      Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverlayAction {
    Hold,
    Reduce { target_ratio: f64 },
    Add { target_ratio: f64 },
}

impl OverlayAction {
    pub fn side(&self) -> Option<Side> {
        match self {
            OverlayAction::Hold          => None,
            OverlayAction::Reduce { .. } => Some(Side::Sell),
            OverlayAction::Add { .. }    => Some(Side::Buy),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionOverlay {
    dead_band:  f64,
    daily_high: Option<f64>,
    daily_low:  Option<f64>,
}

impl PositionOverlay {
    pub fn new(dead_band: f64) -> Self {
        Self {
            dead_band,
            daily_high: None,
            daily_low:  None,
        }
    }

    pub fn set_dead_band(&mut self, dead_band: f64) {
        self.dead_band = dead_band;
    }

    /// Fold one price into the rolling range, resetting it on a day boundary.
    pub fn observe(&mut self, price: f64, is_new_day: bool) {
        if is_new_day || self.daily_high.is_none() || self.daily_low.is_none() {
            if is_new_day {
                debug!(price, "S1: new day, range reset");
            }
            self.daily_high = Some(price);
            self.daily_low  = Some(price);
            return;
        }
        self.daily_high = self.daily_high.map(|h| h.max(price));
        self.daily_low  = self.daily_low.map(|l| l.min(price));
    }

    pub fn snapshot(&self, position_ratio: f64) -> PositionSnapshot {
        PositionSnapshot {
            position_ratio,
            daily_high: self.daily_high,
            daily_low:  self.daily_low,
        }
    }

    pub fn position_in_range(&self, price: f64) -> Result<f64, EngineError> {
        match (self.daily_high, self.daily_low) {
            (Some(high), Some(low)) if high > low => {
                Ok(((price - low) / (high - low)).clamp(0.0, 1.0))
            }
            _ => Err(EngineError::InsufficientData("S1 daily range not established")),
        }
    }

    pub fn evaluate(&self, price: f64, position_ratio: f64) -> Result<OverlayAction, EngineError> {
        let target_ratio = 1.0 - self.position_in_range(price)?;

        let action = if position_ratio > target_ratio + self.dead_band {
            OverlayAction::Reduce { target_ratio }
        } else if position_ratio < target_ratio - self.dead_band {
            OverlayAction::Add { target_ratio }
        } else {
            OverlayAction::Hold
        };

        debug!(price, position_ratio, target_ratio, ?action, "S1 evaluated");
        Ok(action)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
