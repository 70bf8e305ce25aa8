//! # models::trade
//!
//! Order side, the reason a trade was requested, exchange fills, and the
//! append-only [`TradeRecord`] journal entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Side ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy  => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── ReasonTag ────────────────────────────────────────────────────────────────

/// Which part of the engine asked for the trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonTag {
    /// Price crossed the grid band around the base price.
    Grid,
    /// Squeeze breakout or MA20 pullback in trend mode.
    Trend,
    /// S1 overlay: position drifted outside the dead-band around its target.
    Rebalance,
    /// Position ratio below the risk floor; the overlay tops it up.
    FloorTopUp,
}

// ─── Fill ─────────────────────────────────────────────────────────────────────

/// What the exchange reports back for a confirmed order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_price:  f64,
    pub fill_amount: f64,
}

// ─── TradeRecord ──────────────────────────────────────────────────────────────

/// One executed order.  Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Sequence number within the run, starting at 1.
    pub seq:          u64,
    pub timestamp:    DateTime<Utc>,
    pub side:         Side,
    pub price:        f64,
    /// Base-asset quantity.
    pub amount:       f64,
    /// Sells book `(fill - previous base) * amount`; buys book zero.
    pub realized_pnl: f64,
    pub reason:       ReasonTag,
}

impl TradeRecord {
    pub fn notional(&self) -> f64 {
        self.price * self.amount
    }

    pub fn is_win(&self) -> bool {
        self.realized_pnl > 0.0
    }
}
