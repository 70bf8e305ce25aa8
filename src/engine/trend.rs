//! # engine::trend
//!
//! **Six-line trend detector**: the alternative to the grid, selected with
//! `STRATEGY_MODE=trend`.
//!
//! ```text
//!  candles ──▶ MA20/60/120 + EMA20/60/120 ──▶ squeeze?  alignment?
//!                                                │          │
//!                                                ▼          ▼
//!                               IDLE · SQUEEZE · TREND_LONG · TREND_SHORT
//! ```
//!
//! Two entries, checked in order:
//!
//! * **Breakout**: within `squeeze_memory` bars of a squeeze, a trend that
//!   closes beyond the squeeze range (±0.1%) fires in the trend direction.
//! * **MA20 pullback**: inside a trend, a bar that touches MA20 and closes
//!   back on the trend side of it fires in the trend direction.
//!
//! On a spot account a short signal means "sell holdings", so both map onto
//! [`Signal::Buy`] / [`Signal::Sell`] and go through the same risk and sizing
//! path as the grid.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::grid::{Signal, SignalContext, SignalSource};
use crate::error::EngineError;
use crate::models::{Candle, ReasonTag, Side};

/// Short, medium and long averaging periods.
pub const TREND_PERIODS: [usize; 3] = [20, 60, 120];

/// Extra bars fetched beyond the longest period so the EMAs warm up.
const EMA_WARMUP: usize = 50;

const BREAKOUT_MARGIN: f64 = 0.001;

// ─── Indicators ───────────────────────────────────────────────────────────────

/// Simple mean of the trailing `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Recursive EMA seeded with the first value, `alpha = 2 / (period + 1)`.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut iter = values.iter();
    let first = *iter.next()?;
    Some(iter.fold(first, |acc, v| alpha * v + (1.0 - alpha) * acc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Alignment {
    Long,
    Short,
    None,
}

/// The six averages plus the latest bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendLines {
    pub ma:   [f64; 3],
    pub ema:  [f64; 3],
    pub last: Candle,
}

impl TrendLines {
    pub fn from_candles(candles: &[Candle]) -> Result<Self, EngineError> {
        let last = *candles
            .last()
            .ok_or(EngineError::InsufficientData("trend lines need candles"))?;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let mut ma = [0.0; 3];
        let mut ema_v = [0.0; 3];
        for (i, period) in TREND_PERIODS.iter().enumerate() {
            ma[i] = sma(&closes, *period)
                .ok_or(EngineError::InsufficientData("not enough bars for the long average"))?;
            ema_v[i] = ema(&closes, *period)
                .ok_or(EngineError::InsufficientData("not enough bars for the long average"))?;
        }
        Ok(Self { ma, ema: ema_v, last })
    }

    fn all(&self) -> [f64; 6] {
        [self.ma[0], self.ma[1], self.ma[2], self.ema[0], self.ema[1], self.ema[2]]
    }

    /// Coefficient of variation of the six lines under `threshold`.
    pub fn is_squeeze(&self, threshold: f64) -> bool {
        let values = self.all();
        let mean = values.iter().sum::<f64>() / 6.0;
        if mean <= 0.0 {
            return false;
        }
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 6.0;
        var.sqrt() / mean < threshold
    }

    /// Long when either family is stacked short > medium > long.
    pub fn alignment(&self) -> Alignment {
        let stacked_up = |l: &[f64; 3]| l[0] > l[1] && l[1] > l[2];
        let stacked_down = |l: &[f64; 3]| l[0] < l[1] && l[1] < l[2];

        if stacked_up(&self.ema) || stacked_up(&self.ma) {
            Alignment::Long
        } else if stacked_down(&self.ema) || stacked_down(&self.ma) {
            Alignment::Short
        } else {
            Alignment::None
        }
    }

    pub fn range(&self) -> (f64, f64) {
        let values = self.all();
        let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (lo, hi)
    }
}

// ─── Detector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketState {
    Idle,
    Squeeze,
    TrendLong,
    TrendShort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendSignalDetector {
    squeeze_threshold: f64,
    squeeze_memory:    u32,
    state:             MarketState,
    squeeze_low:       f64,
    squeeze_high:      f64,
    /// Bars left in which a breakout from the last squeeze still counts.
    squeeze_left:      u32,
}

impl TrendSignalDetector {
    pub fn new(squeeze_threshold: f64, squeeze_memory: u32) -> Self {
        Self {
            squeeze_threshold,
            squeeze_memory,
            state:        MarketState::Idle,
            squeeze_low:  0.0,
            squeeze_high: 0.0,
            squeeze_left: 0,
        }
    }

    pub fn state(&self) -> MarketState {
        self.state
    }

    fn update_state(&mut self, lines: &TrendLines) {
        let previous = self.state;

        if lines.is_squeeze(self.squeeze_threshold) {
            self.state = MarketState::Squeeze;
            let (lo, hi) = lines.range();
            self.squeeze_low = lo;
            self.squeeze_high = hi;
            self.squeeze_left = self.squeeze_memory;
        } else {
            self.state = match lines.alignment() {
                Alignment::Long  => MarketState::TrendLong,
                Alignment::Short => MarketState::TrendShort,
                Alignment::None  => MarketState::Idle,
            };
            self.squeeze_left = self.squeeze_left.saturating_sub(1);
        }

        if previous != self.state {
            info!(from = ?previous, to = ?self.state, close = lines.last.close, "📈 Trend state changed");
        }
    }

    /// Feed one set of lines and decide.  Call exactly once per tick.
    pub fn evaluate(&mut self, lines: &TrendLines) -> Option<Side> {
        self.update_state(lines);
        let close = lines.last.close;

        // ── Breakout from a recent squeeze ──────────────────────────────────
        if self.squeeze_left > 0 {
            match self.state {
                MarketState::TrendLong if close > self.squeeze_high * (1.0 + BREAKOUT_MARGIN) => {
                    debug!(close, range_high = self.squeeze_high, "Squeeze breakout up");
                    return Some(Side::Buy);
                }
                MarketState::TrendShort if close < self.squeeze_low * (1.0 - BREAKOUT_MARGIN) => {
                    debug!(close, range_low = self.squeeze_low, "Squeeze breakout down");
                    return Some(Side::Sell);
                }
                _ => {}
            }
        }

        // ── MA20 pullback ───────────────────────────────────────────────────
        let ma20 = lines.ma[0];
        match self.state {
            MarketState::TrendLong if lines.last.low <= ma20 && close >= ma20 => {
                debug!(close, ma20, "Pullback to MA20 held");
                Some(Side::Buy)
            }
            MarketState::TrendShort if lines.last.high >= ma20 && close <= ma20 => {
                debug!(close, ma20, "Rally to MA20 rejected");
                Some(Side::Sell)
            }
            _ => None,
        }
    }
}

impl SignalSource for TrendSignalDetector {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn reason(&self) -> ReasonTag {
        ReasonTag::Trend
    }

    fn lookback(&self) -> usize {
        TREND_PERIODS[2] + EMA_WARMUP
    }

    fn detect_signal(&mut self, ctx: &SignalContext<'_>) -> Signal {
        let lines = match TrendLines::from_candles(ctx.candles) {
            Ok(lines) => lines,
            Err(e) => {
                debug!(error = %e, bars = ctx.candles.len(), "Trend lines unavailable");
                return Signal::None;
            }
        };

        let deviation = if ctx.base_price > 0.0 {
            (ctx.price - ctx.base_price) / ctx.base_price
        } else {
            0.0
        };
        match self.evaluate(&lines) {
            Some(Side::Buy)  => Signal::Buy { deviation },
            Some(Side::Sell) => Signal::Sell { deviation },
            None => Signal::None,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
