//! # engine::grid
//!
//! The mean-reversion grid:
//!
//! ```text
//!  volatility ──▶ GridSizer ──▶ grid_size_pct ─┐
//!                                              ├─▶ detect() ──▶ Signal
//!  price, base_price ──────────────────────────┘
//! ```
//!
//! * [`GridSizer`] — ordered half-open buckets `[lo, hi) → width`, first match
//!   wins, result clamped to `[grid_min, grid_max]`.
//! * [`detect`] — `SELL` when `deviation >= grid/100`, `BUY` when
//!   `deviation <= -grid/100`.  Both bounds are **inclusive**: a price sitting
//!   exactly on the threshold triggers.
//! * [`GridState`] — base price, current width, cooldown bookkeeping.  Owned
//!   by the orchestrator; the base price only moves on a confirmed fill.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::models::{Candle, ReasonTag, Side};

// ─── Buckets ──────────────────────────────────────────────────────────────────

/// One row of the volatility → width table.  `hi: None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridBucket {
    pub lo:    f64,
    #[serde(default)]
    pub hi:    Option<f64>,
    /// Grid width in percent.
    pub width: f64,
}

impl GridBucket {
    pub const fn new(lo: f64, hi: Option<f64>, width: f64) -> Self {
        Self { lo, hi, width }
    }

    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        v >= self.lo && self.hi.map_or(true, |hi| v < hi)
    }
}

/// Annualised-volatility table the bot has always shipped with.
pub fn default_buckets() -> Vec<GridBucket> {
    vec![
        GridBucket::new(0.00, Some(0.20), 1.0),
        GridBucket::new(0.20, Some(0.40), 1.5),
        GridBucket::new(0.40, Some(0.60), 2.0),
        GridBucket::new(0.60, Some(0.80), 2.5),
        GridBucket::new(0.80, Some(1.00), 3.0),
        GridBucket::new(1.00, Some(1.20), 3.5),
        GridBucket::new(1.20, None,       4.0),
    ]
}

// ─── GridSizer ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GridSizer {
    buckets:       Vec<GridBucket>,
    default_width: f64,
    grid_min:      f64,
    grid_max:      f64,
}

impl GridSizer {
    /// Build a sizer, rejecting any table that does not tile `[0, ∞)`.
    pub fn new(
        buckets: Vec<GridBucket>,
        default_width: f64,
        grid_min: f64,
        grid_max: f64,
    ) -> Result<Self, EngineError> {
        if !(grid_min.is_finite() && grid_max.is_finite()) || grid_min <= 0.0 {
            return Err(EngineError::ConfigInvalid(format!(
                "grid bounds must be positive and finite (min={grid_min}, max={grid_max})"
            )));
        }
        if grid_min > grid_max {
            return Err(EngineError::ConfigInvalid(format!(
                "grid bounds inverted: min {grid_min} > max {grid_max}"
            )));
        }
        if !(default_width.is_finite() && default_width > 0.0) {
            return Err(EngineError::ConfigInvalid(format!(
                "default grid width must be positive, got {default_width}"
            )));
        }
        validate_buckets(&buckets)?;

        Ok(Self { buckets, default_width, grid_min, grid_max })
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.grid_min, self.grid_max)
    }

    pub fn buckets(&self) -> &[GridBucket] {
        &self.buckets
    }

    /// Pure lookup: same volatility, same width.
    pub fn width_for(&self, volatility: f64) -> f64 {
        let raw = self
            .buckets
            .iter()
            .find(|b| b.contains(volatility))
            .map(|b| b.width)
            .unwrap_or(self.default_width);
        self.clamp(raw)
    }

    #[inline]
    pub fn clamp(&self, width: f64) -> f64 {
        width.clamp(self.grid_min, self.grid_max)
    }
}

fn validate_buckets(buckets: &[GridBucket]) -> Result<(), EngineError> {
    let first = buckets
        .first()
        .ok_or_else(|| EngineError::ConfigInvalid("grid bucket table is empty".into()))?;
    if first.lo != 0.0 {
        return Err(EngineError::ConfigInvalid(format!(
            "grid buckets must start at 0, first starts at {}",
            first.lo
        )));
    }

    for (i, b) in buckets.iter().enumerate() {
        if !(b.width.is_finite() && b.width > 0.0) {
            return Err(EngineError::ConfigInvalid(format!(
                "bucket {i} has non-positive width {}",
                b.width
            )));
        }
        let is_last = i + 1 == buckets.len();
        match (b.hi, is_last) {
            (None, true) => {}
            (None, false) => {
                return Err(EngineError::ConfigInvalid(format!(
                    "bucket {i} is unbounded but is not the last bucket"
                )))
            }
            (Some(hi), true) if hi.is_infinite() && hi > 0.0 => {}
            (Some(hi), true) => {
                return Err(EngineError::ConfigInvalid(format!(
                    "last bucket ends at {hi}; the table must cover [0, ∞)"
                )))
            }
            (Some(hi), false) => {
                if !(hi > b.lo) {
                    return Err(EngineError::ConfigInvalid(format!(
                        "bucket {i} is empty or inverted: [{}, {hi})",
                        b.lo
                    )));
                }
                let next_lo = buckets[i + 1].lo;
                if next_lo != hi {
                    return Err(EngineError::ConfigInvalid(format!(
                        "buckets {i} and {} do not meet: {hi} vs {next_lo}",
                        i + 1
                    )));
                }
            }
        }
    }
    Ok(())
}

// ─── Signal ───────────────────────────────────────────────────────────────────

/// At most one per tick.  `deviation = (price - base) / base`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    None,
    Buy { deviation: f64 },
    Sell { deviation: f64 },
}

impl Signal {
    pub fn side(&self) -> Option<Side> {
        match self {
            Signal::None          => None,
            Signal::Buy { .. }    => Some(Side::Buy),
            Signal::Sell { .. }   => Some(Side::Sell),
        }
    }
}

/// Grid trigger check.  An uninitialised base (`<= 0`) never signals.
pub fn detect(price: f64, base_price: f64, grid_size_pct: f64) -> Signal {
    if base_price <= 0.0 {
        return Signal::None;
    }

    let deviation = (price - base_price) / base_price;
    let threshold = grid_size_pct / 100.0;

    if deviation >= threshold {
        Signal::Sell { deviation }
    } else if deviation <= -threshold {
        Signal::Buy { deviation }
    } else {
        Signal::None
    }
}

/// Inputs a signal source sees on every tick.
#[derive(Debug, Clone, Copy)]
pub struct SignalContext<'a> {
    pub price:         f64,
    pub base_price:    f64,
    pub grid_size_pct: f64,
    /// Recent bars, oldest first.  At most `max(vol_window, lookback())`
    /// long; empty when the feed failed this tick.
    pub candles:       &'a [Candle],
}

/// A strategy that can turn a tick into a [`Signal`].  The orchestrator only
/// depends on this, so live and replay runs share one implementation.
///
/// Sources may keep state across ticks, so `detect_signal` is called exactly
/// once per tick.
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect_signal(&mut self, ctx: &SignalContext<'_>) -> Signal;

    /// Bars this source wants in [`SignalContext::candles`].
    fn lookback(&self) -> usize {
        0
    }

    /// Tag recorded on trades this source triggers.
    fn reason(&self) -> ReasonTag {
        ReasonTag::Grid
    }
}

/// The grid detector as a [`SignalSource`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GridSignalDetector;

impl SignalSource for GridSignalDetector {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn detect_signal(&mut self, ctx: &SignalContext<'_>) -> Signal {
        detect(ctx.price, ctx.base_price, ctx.grid_size_pct)
    }
}

// ─── GridState ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridState {
    /// `0.0` until seeded; afterwards only moved by fills.
    pub base_price:       f64,
    pub grid_size_pct:    f64,
    pub last_trade_time:  Option<DateTime<Utc>>,
    pub cooldown_seconds: u64,
}

impl GridState {
    pub fn new(base_price: f64, initial_grid_pct: f64, cooldown_seconds: u64, sizer: &GridSizer) -> Self {
        Self {
            base_price: base_price.max(0.0),
            grid_size_pct: sizer.clamp(initial_grid_pct),
            last_trade_time: None,
            cooldown_seconds,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.base_price > 0.0
    }

    /// `true` while fewer than `cooldown_seconds` have passed since the last fill.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_trade_time {
            Some(last) => (now - last).num_seconds() < self.cooldown_seconds as i64,
            None => false,
        }
    }

    /// One-shot seeding before the first tick.  No-op once initialised.
    pub(crate) fn seed(&mut self, price: f64) -> bool {
        if self.is_initialized() || !(price.is_finite() && price > 0.0) {
            return false;
        }
        self.base_price = price;
        info!(base_price = price, "📍 Grid base price seeded");
        true
    }

    /// Called exactly once per confirmed fill.
    pub(crate) fn record_fill(&mut self, fill_price: f64, at: DateTime<Utc>) {
        let previous = self.base_price;
        self.base_price = fill_price;
        self.last_trade_time = Some(at);
        info!(previous, base_price = fill_price, "📍 Grid base price moved");
    }

    /// Apply a freshly sized width.  Returns the previous width when it changed.
    pub(crate) fn resize(&mut self, width: f64) -> Option<f64> {
        if width == self.grid_size_pct {
            return None;
        }
        let previous = self.grid_size_pct;
        self.grid_size_pct = width;
        Some(previous)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
