//! # engine::volatility
//!
//! Rolling-window volatility of bar-over-bar simple returns.
//!
//! Uses the **population** standard deviation (divide by `n`, not `n - 1`).
//! With two closes there is a single return and the result is `0.0`.

use serde::Serialize;

use crate::error::EngineError;

/// One volatility measurement.  Recomputed every tick from its input window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolatilityReading {
    /// Number of closes that went into the reading.
    pub window: usize,
    /// Population std-dev of simple returns.
    pub value: f64,
    /// `value * sqrt(bars_per_year)` — the scale the grid bucket table uses.
    pub annualized: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct VolatilityEstimator {
    window:        usize,
    bars_per_year: f64,
}

impl VolatilityEstimator {
    pub fn new(window: usize, bars_per_year: f64) -> Self {
        Self { window, bars_per_year }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Estimate from the trailing `window` closes (oldest first).  Extra
    /// leading closes are ignored.
    pub fn estimate(&self, closes: &[f64]) -> Result<VolatilityReading, EngineError> {
        let start = closes.len().saturating_sub(self.window);
        let closes = &closes[start..];

        let value = std_of_returns(closes)?;
        Ok(VolatilityReading {
            window: closes.len(),
            value,
            annualized: value * self.bars_per_year.sqrt(),
        })
    }
}

/// Population std-dev of `r_i = (c_i - c_{i-1}) / c_{i-1}`.
pub fn std_of_returns(closes: &[f64]) -> Result<f64, EngineError> {
    if closes.len() < 2 {
        return Err(EngineError::InsufficientData("volatility needs at least 2 closes"));
    }
    if closes.iter().any(|c| !c.is_finite() || *c <= 0.0) {
        return Err(EngineError::InsufficientData("volatility window contains a non-positive close"));
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();

    let n    = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var  = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;

    Ok(var.sqrt())
}

// ─── Tests ────────────────────────────────────────────────────────────────────
