//! # engine::backtest
//!
//! **Backtest Simulator** — drives the live [`Engine`] over historical bars.
//!
//! Nothing here re-implements a decision.  The simulator only swaps the
//! collaborators:
//!
//! * [`Replay`] is the price feed and the clock.  Each `advance()` moves one
//!   bar forward; the engine sees that bar's close and timestamp.
//! * [`SimLedger`] is the exchange and the balance source.  Orders fill at the
//!   requested price, synchronously, with an optional proportional fee.
//!
//! `SimLedger` is also what paper trading uses in live mode.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{ConfigStore, EngineConfig};
use crate::engine::gateway::{BalanceProvider, Clock, Collaborators, DayTracker, MarketFeed, OrderGateway};
use crate::engine::orchestrator::{Engine, EngineHandle, TickOutcome};
use crate::engine::risk::BlockReason;
use crate::error::EngineError;
use crate::events::NullNotifier;
use crate::models::{Candle, Fill, Side, TradeRecord};

/// Slack for float dust when selling the whole position.
const QTY_EPSILON: f64 = 1e-9;

// ─── Ledger ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BacktestLedger {
    pub cash:         f64,
    pub position_qty: f64,
    pub peak_equity:  f64,
}

impl BacktestLedger {
    pub fn new(cash: f64, position_qty: f64) -> Self {
        Self { cash, position_qty, peak_equity: 0.0 }
    }

    /// Split `equity` between cash and the asset at `price`.
    pub fn with_position_share(equity: f64, share: f64, price: f64) -> Self {
        let held = equity * share;
        Self::new(equity - held, held / price)
    }

    pub fn equity(&self, price: f64) -> f64 {
        self.cash + self.position_qty * price
    }

    /// Mark to `price`, raising the high-water mark if needed.
    pub fn mark(&mut self, price: f64) -> f64 {
        let equity = self.equity(price);
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        equity
    }

    pub fn position_ratio(&self, price: f64) -> f64 {
        let equity = self.equity(price);
        if equity <= 0.0 {
            return 0.0;
        }
        self.position_qty * price / equity
    }

    pub fn can_fill(&self, side: Side, amount: f64, price: f64, fee_rate: f64) -> bool {
        match side {
            Side::Buy  => amount * price * (1.0 + fee_rate) <= self.cash,
            Side::Sell => amount <= self.position_qty + QTY_EPSILON,
        }
    }

    pub fn fill(&mut self, side: Side, amount: f64, price: f64, fee_rate: f64) -> Result<Fill, EngineError> {
        if !(amount > 0.0 && price > 0.0) {
            return Err(EngineError::ExchangeCallFailed(format!(
                "rejected order: amount {amount} @ {price}"
            )));
        }
        if !self.can_fill(side, amount, price, fee_rate) {
            return Err(EngineError::InsufficientBalance { side: side.to_string(), amount, price });
        }

        let value = amount * price;
        let fee = value * fee_rate;
        match side {
            Side::Buy => {
                self.cash -= value + fee;
                self.position_qty += amount;
            }
            Side::Sell => {
                self.cash += value - fee;
                self.position_qty = (self.position_qty - amount).max(0.0);
            }
        }
        Ok(Fill { fill_price: price, fill_amount: amount })
    }
}

/// In-memory exchange + balance collaborator around a [`BacktestLedger`].
#[derive(Debug)]
pub struct SimLedger {
    ledger:   Mutex<BacktestLedger>,
    fee_rate: f64,
}

impl SimLedger {
    pub fn new(ledger: BacktestLedger, fee_rate: f64) -> Self {
        Self { ledger: Mutex::new(ledger), fee_rate }
    }

    pub async fn snapshot(&self) -> BacktestLedger {
        *self.ledger.lock().await
    }

    pub async fn mark(&self, price: f64) -> f64 {
        self.ledger.lock().await.mark(price)
    }
}

#[async_trait]
impl OrderGateway for SimLedger {
    async fn submit_order(&self, side: Side, amount: f64, price: f64) -> Result<Fill, EngineError> {
        self.ledger.lock().await.fill(side, amount, price, self.fee_rate)
    }
}

#[async_trait]
impl BalanceProvider for SimLedger {
    async fn total_assets(&self, price: f64) -> Result<f64, EngineError> {
        Ok(self.ledger.lock().await.equity(price))
    }

    async fn position_ratio(&self, price: f64) -> Result<f64, EngineError> {
        Ok(self.ledger.lock().await.position_ratio(price))
    }

    async fn check_balance(&self, side: Side, amount: f64, price: f64) -> Result<bool, EngineError> {
        Ok(self.ledger.lock().await.can_fill(side, amount, price, self.fee_rate))
    }
}

// ─── Replay ───────────────────────────────────────────────────────────────────

/// A finite bar sequence exposed as both feed and clock.
#[derive(Debug)]
pub struct Replay {
    bars:   Vec<Candle>,
    /// Bars released so far; the current bar is `bars[released - 1]`.
    released: AtomicUsize,
    days:   DayTracker,
}

impl Replay {
    pub fn new(bars: Vec<Candle>) -> Self {
        Self { bars, released: AtomicUsize::new(0), days: DayTracker::new() }
    }

    /// Release the next bar.  `None` once the sequence is exhausted.
    pub fn advance(&self) -> Option<Candle> {
        let next = self.released.load(Ordering::Acquire);
        let bar = self.bars.get(next).copied()?;
        self.released.store(next + 1, Ordering::Release);
        Some(bar)
    }

    pub fn current(&self) -> Option<Candle> {
        let released = self.released.load(Ordering::Acquire);
        released.checked_sub(1).and_then(|i| self.bars.get(i).copied())
    }
}

#[async_trait]
impl MarketFeed for Replay {
    async fn last_price(&self) -> Result<f64, EngineError> {
        self.current()
            .map(|bar| bar.close)
            .ok_or_else(|| EngineError::ExchangeCallFailed("replay has not started".into()))
    }

    async fn candles(&self, _period: &str, count: usize) -> Result<Vec<Candle>, EngineError> {
        let released = self.released.load(Ordering::Acquire).min(self.bars.len());
        let start = released.saturating_sub(count);
        Ok(self.bars[start..released].to_vec())
    }
}

impl Clock for Replay {
    fn now(&self) -> DateTime<Utc> {
        self.current().map(|bar| bar.timestamp).unwrap_or_default()
    }

    fn is_new_day(&self) -> bool {
        self.days.roll(self.now())
    }
}

// ─── Run ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_cash:         f64,
    /// Share of `initial_cash` converted to the asset at the first close.
    pub initial_position_pct: f64,
    pub fee_rate:             f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_cash:         10_000.0,
            initial_position_pct: 0.5,
            fee_rate:             0.0,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.initial_cash > 0.0) {
            return Err(EngineError::ConfigInvalid("initial_cash must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.initial_position_pct) {
            return Err(EngineError::ConfigInvalid("initial_position_pct must be in [0, 1]".into()));
        }
        if !(0.0..0.1).contains(&self.fee_rate) {
            return Err(EngineError::ConfigInvalid("fee_rate must be in [0, 0.1)".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub price:     f64,
    pub equity:    f64,
}

/// Attempts that did not become trades, by cause.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipBreakdown {
    pub over_position:        usize,
    pub drawdown:             usize,
    pub cooldown:             usize,
    pub throttled:            usize,
    pub insufficient_balance: usize,
    pub failed:               usize,
}

impl SkipBreakdown {
    fn tally(&mut self, outcome: &TickOutcome) {
        match outcome {
            TickOutcome::Skipped { reason, .. } => match reason {
                EngineError::RiskBlocked { reason: BlockReason::Drawdown } => self.drawdown += 1,
                EngineError::RiskBlocked { .. }           => self.over_position += 1,
                EngineError::ThrottleExceeded { .. }      => self.throttled += 1,
                EngineError::InsufficientBalance { .. }   => self.insufficient_balance += 1,
                _                                         => self.failed += 1,
            },
            TickOutcome::Cooldown { .. } => self.cooldown += 1,
            TickOutcome::Failed(_)       => self.failed += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestReport {
    pub bars:                usize,
    pub total_trades:        usize,
    /// Fraction of trades with positive realised PnL.
    pub win_rate:            f64,
    /// Gross profit over gross loss; `None` when nothing lost.
    pub profit_factor:       Option<f64>,
    pub total_return_pct:    f64,
    /// Largest `(peak - equity) / peak` seen on the equity curve.
    pub max_drawdown:        f64,
    pub initial_equity:      f64,
    pub final_equity:        f64,
    pub final_base_price:    f64,
    pub final_grid_size_pct: f64,
    pub final_ledger:        BacktestLedger,
    pub skipped:             SkipBreakdown,
    pub trades:              Vec<TradeRecord>,
    pub equity_curve:        Vec<EquityPoint>,
}

/// Replay `bars` (oldest first) through a fresh engine.  Deterministic: the
/// same bars, config and options always give the same report.
pub async fn run_backtest(
    bars: &[Candle],
    config: &EngineConfig,
    opts: BacktestConfig,
) -> Result<BacktestReport, EngineError> {
    opts.validate()?;
    let first = bars
        .first()
        .ok_or(EngineError::InsufficientData("backtest needs at least one bar"))?;
    if !(first.close > 0.0) {
        return Err(EngineError::InsufficientData("first bar has a non-positive close"));
    }

    // ── 1. Isolated collaborators ────────────────────────────────────────────
    let ledger = BacktestLedger::with_position_share(opts.initial_cash, opts.initial_position_pct, first.close);
    let sim = Arc::new(SimLedger::new(ledger, opts.fee_rate));
    let replay = Arc::new(Replay::new(bars.to_vec()));
    let handle = EngineHandle::new(ConfigStore::new(config.clone())?, Arc::new(NullNotifier));
    let deps = Collaborators {
        feed:    replay.clone(),
        orders:  sim.clone(),
        balance: sim.clone(),
        clock:   replay.clone(),
    };
    let mut engine = Engine::new(handle.clone(), deps).await;

    info!(
        bars = bars.len(),
        initial_cash = opts.initial_cash,
        fee_rate = opts.fee_rate,
        "📊 Backtest started"
    );

    // ── 2. Bar loop ──────────────────────────────────────────────────────────
    let mut skipped = SkipBreakdown::default();
    let mut equity_curve = Vec::with_capacity(bars.len());
    let mut max_drawdown = 0.0_f64;
    let mut peak = 0.0_f64;

    while let Some(bar) = replay.advance() {
        if equity_curve.is_empty() {
            engine.initialize().await?;
        }

        let outcome = engine.tick().await;
        skipped.tally(&outcome);

        let equity = sim.mark(bar.close).await;
        peak = peak.max(equity);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - equity) / peak);
        }
        equity_curve.push(EquityPoint { timestamp: bar.timestamp, price: bar.close, equity });
    }

    // ── 3. Metrics ───────────────────────────────────────────────────────────
    let trades = handle.trades().await;
    let final_ledger = sim.snapshot().await;
    let initial_equity = opts.initial_cash;
    let final_equity = equity_curve.last().map(|p| p.equity).unwrap_or(initial_equity);

    let total_trades = trades.len();
    let wins = trades.iter().filter(|t| t.is_win()).count();
    let win_rate = if total_trades > 0 { wins as f64 / total_trades as f64 } else { 0.0 };

    let gross_profit: f64 = trades.iter().filter(|t| t.realized_pnl > 0.0).map(|t| t.realized_pnl).sum();
    let gross_loss: f64 = trades.iter().filter(|t| t.realized_pnl < 0.0).map(|t| -t.realized_pnl).sum();
    let profit_factor = (gross_loss > 0.0).then(|| gross_profit / gross_loss);

    let report = BacktestReport {
        bars: bars.len(),
        total_trades,
        win_rate,
        profit_factor,
        total_return_pct: (final_equity - initial_equity) / initial_equity * 100.0,
        max_drawdown,
        initial_equity,
        final_equity,
        final_base_price: engine.grid().base_price,
        final_grid_size_pct: engine.grid().grid_size_pct,
        final_ledger,
        skipped,
        trades,
        equity_curve,
    };

    info!(
        total_trades = report.total_trades,
        total_return_pct = report.total_return_pct,
        win_rate = report.win_rate,
        max_drawdown = report.max_drawdown,
        "📊 Backtest finished"
    );
    Ok(report)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
