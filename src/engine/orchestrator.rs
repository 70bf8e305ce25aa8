//! # engine::orchestrator
//!
//! The **Execution Orchestrator** — one [`Engine::tick`] is one pass of:
//!
//! ```text
//!  1. refresh    price · candles → volatility · total assets · position ratio
//!  2. decide     signal source ─┐ (signal wins when both fire)
//!                S1 overlay    ─┴─▶ at most one Intent
//!  3. risk gate  Blocked for this side?          → skip
//!     cooldown   last fill too recent?           → skip
//!  5. size       max(MIN_TRADE_AMOUNT, total × TRADE_FRACTION) / price
//!     balance    collaborator says insufficient? → skip
//!     stop?      operator halted mid-tick?       → nothing submitted
//!  4. throttle   window full?                    → skip (slot kept)
//!     submit     fill → journal, base_price = fill_price, notify
//!  6. regrid     new width from volatility for the next tick
//! ```
//!
//! The throttle runs after the balance check so an order that would be refused
//! anyway never spends a slot.  Every skipped or failed attempt is logged once
//! at `warn` and sent once to the notifier.
//!
//! [`Engine`] is owned by a single task and needs no locks of its own.  The
//! web layer only talks to the cloneable [`EngineHandle`]: control flags, the
//! config store, the published status and the trade journal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ConfigPatch, ConfigSnapshot, ConfigStore};
use crate::engine::gateway::{bounded, Collaborators, Notifier};
use crate::engine::grid::{GridState, SignalContext, SignalSource};
use crate::engine::overlay::{OverlayAction, PositionOverlay, PositionSnapshot};
use crate::engine::risk::{RiskGate, RiskVerdict};
use crate::engine::throttle::OrderThrottler;
use crate::engine::volatility::VolatilityReading;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::models::{candle, Candle, Fill, ReasonTag, Side, TradeRecord};

// ─── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

/// Read-only view published at the end of every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub run_state:       RunState,
    pub symbol:          String,
    pub config_version:  u64,
    pub base_price:      f64,
    pub grid_size_pct:   f64,
    pub last_price:      Option<f64>,
    pub volatility:      Option<VolatilityReading>,
    pub position:        Option<PositionSnapshot>,
    pub total_assets:    Option<f64>,
    pub peak_assets:     f64,
    pub risk_verdict:    Option<RiskVerdict>,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub tick_count:      u64,
    pub trade_count:     u64,
}

impl EngineStatus {
    fn blank() -> Self {
        Self {
            run_state:       RunState::Running,
            symbol:          String::new(),
            config_version:  0,
            base_price:      0.0,
            grid_size_pct:   0.0,
            last_price:      None,
            volatility:      None,
            position:        None,
            total_assets:    None,
            peak_assets:     0.0,
            risk_verdict:    None,
            last_trade_time: None,
            tick_count:      0,
            trade_count:     0,
        }
    }
}

/// What a single tick ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Stopped,
    Paused,
    /// No signal and nothing for the overlay to do.
    Idle,
    Executed(TradeRecord),
    /// Refused before reaching the exchange (risk, throttle, balance).
    Skipped { side: Side, reason: EngineError },
    /// Still inside the post-fill cooldown.
    Cooldown { side: Side },
    /// A collaborator call failed or timed out.  Retried next tick.
    Failed(EngineError),
}

// ─── EngineHandle ─────────────────────────────────────────────────────────────

struct HandleInner {
    config:         ConfigStore,
    notifier:       Arc<dyn Notifier>,
    paused:         AtomicBool,
    stop_requested: AtomicBool,
    stop_signal:    Notify,
    status:         RwLock<EngineStatus>,
    journal:        RwLock<Vec<TradeRecord>>,
    tick_count:     AtomicU64,
    trade_count:    AtomicU64,
}

/// Cheap-to-clone control surface shared between the tick task and the web
/// handlers.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<HandleInner>,
}

impl EngineHandle {
    pub fn new(config: ConfigStore, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                config,
                notifier,
                paused:         AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                stop_signal:    Notify::new(),
                status:         RwLock::new(EngineStatus::blank()),
                journal:        RwLock::new(Vec::new()),
                tick_count:     AtomicU64::new(0),
                trade_count:    AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ConfigStore {
        &self.inner.config
    }

    pub fn notify(&self, event: &EngineEvent) {
        self.inner.notifier.notify(event);
    }

    // ── Control flags ─────────────────────────────────────────────────────────

    /// Returns `true` if this call changed the state.
    pub fn pause(&self) -> bool {
        if self.is_stop_requested() || self.inner.paused.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("⏸️ Engine paused");
        self.notify(&EngineEvent::Paused);
        true
    }

    /// Returns `true` if this call changed the state.  A stopped engine
    /// cannot be resumed.
    pub fn resume(&self) -> bool {
        if self.is_stop_requested() || !self.inner.paused.swap(false, Ordering::SeqCst) {
            return false;
        }
        info!("▶️ Engine resumed");
        self.notify(&EngineEvent::Resumed);
        true
    }

    /// Terminal.  The current tick finishes, but no order is submitted after
    /// this point.
    pub fn stop(&self) -> bool {
        if self.inner.stop_requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("🛑 Engine stop requested");
        self.notify(&EngineEvent::Stopped);
        self.inner.stop_signal.notify_waiters();
        true
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        loop {
            let signal = self.inner.stop_signal.notified();
            if self.is_stop_requested() {
                return;
            }
            signal.await;
        }
    }

    pub fn run_state(&self) -> RunState {
        if self.is_stop_requested() {
            RunState::Stopped
        } else if self.is_paused() {
            RunState::Paused
        } else {
            RunState::Running
        }
    }

    // ── Read side ─────────────────────────────────────────────────────────────

    /// Snapshot of the last published tick.  Never advances the engine.
    pub async fn get_state(&self) -> EngineStatus {
        let mut status = self.inner.status.read().await.clone();
        status.run_state   = self.run_state();
        status.tick_count  = self.tick_count();
        status.trade_count = self.trade_count();
        status
    }

    pub async fn trades(&self) -> Vec<TradeRecord> {
        self.inner.journal.read().await.clone()
    }

    pub fn tick_count(&self) -> u64 {
        self.inner.tick_count.load(Ordering::Relaxed)
    }

    pub fn trade_count(&self) -> u64 {
        self.inner.trade_count.load(Ordering::Relaxed)
    }

    // ── Live config ───────────────────────────────────────────────────────────

    /// Validate and swap in a new config snapshot; the engine picks it up at
    /// the start of its next tick.
    pub async fn update_config(&self, patch: &ConfigPatch) -> Result<Arc<ConfigSnapshot>, EngineError> {
        let snapshot = self.inner.config.update(patch).await?;
        self.notify(&EngineEvent::ConfigUpdated { version: snapshot.version });
        Ok(snapshot)
    }

    // ── Engine-side writers ───────────────────────────────────────────────────

    async fn publish(&self, status: EngineStatus) {
        *self.inner.status.write().await = status;
    }

    async fn append_trade(&self, record: TradeRecord) {
        self.inner.journal.write().await.push(record);
        self.inner.trade_count.fetch_add(1, Ordering::Relaxed);
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Intent {
    side:   Side,
    reason: ReasonTag,
}

/// What the last tick saw, kept only for publishing.
#[derive(Debug, Clone, Default)]
struct Observed {
    last_price:   Option<f64>,
    volatility:   Option<VolatilityReading>,
    position:     Option<PositionSnapshot>,
    total_assets: Option<f64>,
    verdict:      Option<RiskVerdict>,
}

pub struct Engine {
    handle:      EngineHandle,
    deps:        Collaborators,
    signals:     Box<dyn SignalSource>,
    snapshot:    Arc<ConfigSnapshot>,
    grid:        GridState,
    overlay:     PositionOverlay,
    throttler:   OrderThrottler,
    peak_assets: f64,
    next_seq:    u64,
    observed:    Observed,
}

impl Engine {
    pub async fn new(handle: EngineHandle, deps: Collaborators) -> Self {
        let snapshot = handle.config().current().await;
        let cfg = &snapshot.config;
        let grid = GridState::new(
            cfg.initial_base_price,
            cfg.initial_grid,
            cfg.cooldown_secs,
            &snapshot.sizer,
        );
        let overlay = PositionOverlay::new(cfg.overlay_dead_band);
        let signals = cfg.signal_source();

        let engine = Self {
            handle,
            deps,
            signals,
            snapshot,
            grid,
            overlay,
            throttler: OrderThrottler::new(),
            peak_assets: 0.0,
            next_seq: 1,
            observed: Observed::default(),
        };
        engine.publish().await;
        engine
    }

    /// Swap the signal strategy chosen by `strategy_mode`.
    pub fn with_signal_source(mut self, signals: Box<dyn SignalSource>) -> Self {
        self.signals = signals;
        self
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    pub fn grid(&self) -> &GridState {
        &self.grid
    }

    pub fn peak_assets(&self) -> f64 {
        self.peak_assets
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot.config.call_timeout_secs)
    }

    /// Seed the base price before the first tick: the configured value if
    /// set, otherwise the feed's current price.
    pub async fn initialize(&mut self) -> Result<f64, EngineError> {
        if !self.grid.is_initialized() {
            let price = bounded(self.call_timeout(), "price feed", self.deps.feed.last_price()).await?;
            if !self.grid.seed(price) {
                return Err(EngineError::InsufficientData("first observed price is not positive"));
            }
        }

        let base_price = self.grid.base_price;
        info!(
            symbol = %self.snapshot.config.symbol,
            base_price,
            grid_size_pct = self.grid.grid_size_pct,
            "🚀 Engine initialised"
        );
        self.handle.notify(&EngineEvent::Initialized {
            symbol: self.snapshot.config.symbol.clone(),
            base_price,
        });
        self.publish().await;
        Ok(base_price)
    }

    /// Advance one step.  Per-tick errors are contained here and reported
    /// through the returned [`TickOutcome`]; nothing propagates.
    pub async fn tick(&mut self) -> TickOutcome {
        if self.handle.is_stop_requested() {
            return TickOutcome::Stopped;
        }
        if self.handle.is_paused() {
            return TickOutcome::Paused;
        }

        self.handle.inner.tick_count.fetch_add(1, Ordering::Relaxed);
        self.refresh_snapshot().await;

        let outcome = self.run_pipeline().await;
        self.publish().await;
        outcome
    }

    /// Pick up a config edit made since the last tick.
    async fn refresh_snapshot(&mut self) {
        let latest = self.handle.config().current().await;
        if latest.version == self.snapshot.version {
            return;
        }

        let cfg = &latest.config;
        self.grid.cooldown_seconds = cfg.cooldown_secs;
        self.overlay.set_dead_band(cfg.overlay_dead_band);
        // New bounds apply to the width already in force
        self.grid.resize(latest.sizer.clamp(self.grid.grid_size_pct));

        debug!(from = self.snapshot.version, to = latest.version, "Engine switched config snapshot");
        self.snapshot = latest;
    }

    async fn run_pipeline(&mut self) -> TickOutcome {
        let snap = self.snapshot.clone();
        let timeout = self.call_timeout();
        let now = self.deps.clock.now();

        // ── 1. Refresh market and account view ──────────────────────────────
        let price = match bounded(timeout, "price feed", self.deps.feed.last_price()).await {
            Ok(p) if p.is_finite() && p > 0.0 => p,
            Ok(p) => {
                return self.fail(None, EngineError::ExchangeCallFailed(format!("feed returned price {p}")))
            }
            Err(e) => return self.fail(None, e),
        };
        self.observed.last_price = Some(price);
        let candles = self.read_candles(&snap, timeout).await;
        self.observed.volatility = self.read_volatility(&snap, &candles);

        let (total_assets, position_ratio) = match self.read_account(price, timeout).await {
            Ok(v) => v,
            Err(e) => return self.fail(None, e),
        };
        self.overlay.observe(price, self.deps.clock.is_new_day());
        if total_assets > self.peak_assets {
            self.peak_assets = total_assets;
        }
        self.observed.total_assets = Some(total_assets);
        self.observed.position = Some(self.overlay.snapshot(position_ratio));

        // ── 2. Decide, 3. Risk ───────────────────────────────────────────────
        let limits = snap.config.risk_limits();
        let verdict = RiskGate::new(limits).assess(position_ratio, total_assets, self.peak_assets);
        // Still a top-up under a drawdown stop, so the block is reported
        let under_floor = position_ratio < limits.min_position_ratio;
        self.observed.verdict = Some(verdict);

        let outcome = if !self.grid.is_initialized() {
            debug!(price, "Base price not seeded yet, no trading until initialise succeeds");
            TickOutcome::Idle
        } else {
            match self.decide(price, position_ratio, under_floor, &candles) {
                Some(intent) => self.attempt(intent, price, total_assets, verdict, now, &snap).await,
                None => TickOutcome::Idle,
            }
        };

        // ── 6. Regrid for the next tick ──────────────────────────────────────
        self.regrid(&snap);
        outcome
    }

    /// One fetch per tick serves both the volatility window and the signal
    /// source's lookback.  Empty on failure.
    async fn read_candles(&self, snap: &ConfigSnapshot, timeout: Duration) -> Vec<Candle> {
        let count = snap.estimator.window().max(self.signals.lookback());
        let fetched = bounded(
            timeout,
            "candle feed",
            self.deps.feed.candles(&snap.config.candle_period, count),
        )
        .await;

        match fetched {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, reason = e.tag(), "⚠️ Candle fetch failed, keeping current grid");
                Vec::new()
            }
        }
    }

    fn read_volatility(&self, snap: &ConfigSnapshot, candles: &[Candle]) -> Option<VolatilityReading> {
        if candles.is_empty() {
            return None;
        }
        match snap.estimator.estimate(&candle::closes(candles)) {
            Ok(reading) => Some(reading),
            Err(e) => {
                debug!(error = %e, "Volatility unavailable");
                None
            }
        }
    }

    async fn read_account(&self, price: f64, timeout: Duration) -> Result<(f64, f64), EngineError> {
        let total = bounded(timeout, "balance", self.deps.balance.total_assets(price)).await?;
        let ratio = bounded(timeout, "balance", self.deps.balance.position_ratio(price)).await?;
        Ok((total, ratio.clamp(0.0, 1.0)))
    }

    /// Signal source first; the overlay only acts when it is quiet.  Under
    /// the risk floor the overlay never reduces and tops up instead.
    fn decide(
        &mut self,
        price: f64,
        position_ratio: f64,
        under_floor: bool,
        candles: &[Candle],
    ) -> Option<Intent> {
        let ctx = SignalContext {
            price,
            base_price:    self.grid.base_price,
            grid_size_pct: self.grid.grid_size_pct,
            candles,
        };
        let signal = self.signals.detect_signal(&ctx);
        if let Some(side) = signal.side() {
            debug!(?signal, source = self.signals.name(), "Signal fired");
            return Some(Intent { side, reason: self.signals.reason() });
        }

        let action = match self.overlay.evaluate(price, position_ratio) {
            Ok(action) => Some(action),
            Err(e) => {
                debug!(error = %e, "S1 skipped");
                None
            }
        };

        match action {
            Some(OverlayAction::Add { .. }) => Some(Intent {
                side:   Side::Buy,
                reason: if under_floor { ReasonTag::FloorTopUp } else { ReasonTag::Rebalance },
            }),
            Some(OverlayAction::Reduce { .. }) if !under_floor => Some(Intent {
                side:   Side::Sell,
                reason: ReasonTag::Rebalance,
            }),
            _ if under_floor => Some(Intent { side: Side::Buy, reason: ReasonTag::FloorTopUp }),
            _ => None,
        }
    }

    async fn attempt(
        &mut self,
        intent: Intent,
        price: f64,
        total_assets: f64,
        verdict: RiskVerdict,
        now: DateTime<Utc>,
        snap: &ConfigSnapshot,
    ) -> TickOutcome {
        let cfg = &snap.config;
        let side = intent.side;

        // ── Risk gate ─────────────────────────────────────────────────────────
        if !verdict.permits(side) {
            if let Some(reason) = verdict.blocked_reason() {
                return self.skip(side, EngineError::RiskBlocked { reason });
            }
        }

        // ── Cooldown ──────────────────────────────────────────────────────────
        if self.grid.in_cooldown(now) {
            warn!(
                side = %side,
                reason = "COOLDOWN",
                cooldown_secs = self.grid.cooldown_seconds,
                "⏳ Trade skipped: still cooling down from the last fill"
            );
            self.handle.notify(&EngineEvent::TradeSkipped {
                side,
                reason: "COOLDOWN",
                detail: format!("cooldown of {}s not elapsed", self.grid.cooldown_seconds),
            });
            return TickOutcome::Cooldown { side };
        }

        // ── 5a. Size ──────────────────────────────────────────────────────────
        let notional = cfg.min_trade_amount.max(total_assets * cfg.trade_fraction);
        let amount = notional / price;

        // ── 5b. Balance ───────────────────────────────────────────────────────
        let timeout = self.call_timeout();
        match bounded(timeout, "balance check", self.deps.balance.check_balance(side, amount, price)).await {
            Ok(true) => {}
            Ok(false) => {
                return self.skip(
                    side,
                    EngineError::InsufficientBalance { side: side.to_string(), amount, price },
                )
            }
            Err(e) => return self.fail(Some(side), e),
        }

        // ── Operator halted while this tick was in flight ─────────────────────
        if self.handle.is_stop_requested() {
            info!(side = %side, "🛑 Stop requested mid-tick, order not submitted");
            return TickOutcome::Stopped;
        }

        // ── 4. Throttle ───────────────────────────────────────────────────────
        if let Err(e) = self.throttler.try_acquire(now, cfg.throttle_limit, cfg.throttle_interval_secs) {
            return self.skip(side, e);
        }

        // ── 5c. Submit ────────────────────────────────────────────────────────
        info!(side = %side, amount, price, reason = ?intent.reason, "📤 Submitting order");
        match bounded(timeout, "order submission", self.deps.orders.submit_order(side, amount, price)).await {
            Ok(fill) => TickOutcome::Executed(self.record_fill(intent, fill, now).await),
            Err(e) => self.fail(Some(side), e),
        }
    }

    async fn record_fill(&mut self, intent: Intent, fill: Fill, now: DateTime<Utc>) -> TradeRecord {
        let base_before = self.grid.base_price;
        let realized_pnl = match intent.side {
            Side::Sell => (fill.fill_price - base_before) * fill.fill_amount,
            Side::Buy  => 0.0,
        };

        let record = TradeRecord {
            seq:          self.next_seq,
            timestamp:    now,
            side:         intent.side,
            price:        fill.fill_price,
            amount:       fill.fill_amount,
            realized_pnl,
            reason:       intent.reason,
        };
        self.next_seq += 1;
        self.grid.record_fill(fill.fill_price, now);

        info!(
            seq = record.seq,
            side = %record.side,
            price = record.price,
            amount = record.amount,
            realized_pnl,
            reason = ?record.reason,
            "✅ Trade executed"
        );
        self.handle.append_trade(record.clone()).await;
        self.handle.notify(&EngineEvent::TradeExecuted { record: Box::new(record.clone()) });
        record
    }

    fn regrid(&mut self, snap: &ConfigSnapshot) {
        let Some(reading) = self.observed.volatility else {
            debug!(grid_size_pct = self.grid.grid_size_pct, "No volatility reading, grid unchanged");
            return;
        };

        let width = snap.sizer.width_for(reading.annualized);
        if let Some(from) = self.grid.resize(width) {
            info!(from, to = width, volatility = reading.annualized, "📐 Grid resized");
            self.handle.notify(&EngineEvent::GridResized {
                from,
                to: width,
                volatility: reading.annualized,
            });
        }
    }

    fn skip(&self, side: Side, reason: EngineError) -> TickOutcome {
        warn!(side = %side, reason = reason.tag(), error = %reason, "🚫 Trade skipped");
        self.handle.notify(&EngineEvent::TradeSkipped {
            side,
            reason: reason.tag(),
            detail: reason.to_string(),
        });
        TickOutcome::Skipped { side, reason }
    }

    fn fail(&self, side: Option<Side>, error: EngineError) -> TickOutcome {
        warn!(
            side = ?side,
            reason = error.tag(),
            error = %error,
            "⚠️ Collaborator call failed, retrying next tick"
        );
        self.handle.notify(&EngineEvent::TradeFailed {
            side,
            reason: error.tag(),
            detail: error.to_string(),
        });
        TickOutcome::Failed(error)
    }

    async fn publish(&self) {
        let status = EngineStatus {
            run_state:       self.handle.run_state(),
            symbol:          self.snapshot.config.symbol.clone(),
            config_version:  self.snapshot.version,
            base_price:      self.grid.base_price,
            grid_size_pct:   self.grid.grid_size_pct,
            last_price:      self.observed.last_price,
            volatility:      self.observed.volatility,
            position:        self.observed.position,
            total_assets:    self.observed.total_assets,
            peak_assets:     self.peak_assets,
            risk_verdict:    self.observed.verdict,
            last_trade_time: self.grid.last_trade_time,
            tick_count:      self.handle.tick_count(),
            trade_count:     self.handle.trade_count(),
        };
        self.handle.publish(status).await;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::config::EngineConfig;
    use crate::engine::gateway::{BalanceProvider, Clock, DayTracker, MarketFeed, OrderGateway};
    use crate::engine::risk::BlockReason;
    use crate::events::MemoryNotifier;
    use crate::models::Candle;

    // ── Fakes ─────────────────────────────────────────────────────────────────

    /// Price tape + clock.  The test pushes a price, then ticks.
    struct Tape {
        prices: Mutex<Vec<f64>>,
        now:    Mutex<DateTime<Utc>>,
        days:   DayTracker,
    }

    impl Tape {
        fn new() -> Self {
            Self {
                prices: Mutex::new(Vec::new()),
                now:    Mutex::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
                days:   DayTracker::new(),
            }
        }

        /// Append a price and move the clock forward one hour.
        fn push(&self, price: f64) {
            self.prices.lock().unwrap().push(price);
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::hours(1);
        }

        fn advance_secs(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }
    }

    #[async_trait]
    impl MarketFeed for Tape {
        async fn last_price(&self) -> Result<f64, EngineError> {
            self.prices
                .lock()
                .unwrap()
                .last()
                .copied()
                .ok_or_else(|| EngineError::ExchangeCallFailed("no price yet".into()))
        }

        async fn candles(&self, _period: &str, count: usize) -> Result<Vec<Candle>, EngineError> {
            let prices = self.prices.lock().unwrap();
            let now = *self.now.lock().unwrap();
            let start = prices.len().saturating_sub(count);
            Ok(prices[start..].iter().map(|p| Candle::flat(now, *p)).collect())
        }
    }

    impl Clock for Tape {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        fn is_new_day(&self) -> bool {
            self.days.roll(self.now())
        }
    }

    /// Account with scripted totals; fills every order at the asked price.
    struct FakeExchange {
        total:       Mutex<f64>,
        ratio:       Mutex<f64>,
        sufficient:  Mutex<bool>,
        fail_orders: Mutex<bool>,
        submitted:   Mutex<Vec<(Side, f64, f64)>>,
        stop_on_balance_check: Mutex<Option<EngineHandle>>,
        order_delay: Mutex<Option<Duration>>,
    }

    impl FakeExchange {
        fn new() -> Self {
            Self {
                total:       Mutex::new(10_000.0),
                ratio:       Mutex::new(0.5),
                sufficient:  Mutex::new(true),
                fail_orders: Mutex::new(false),
                submitted:   Mutex::new(Vec::new()),
                stop_on_balance_check: Mutex::new(None),
                order_delay: Mutex::new(None),
            }
        }

        fn submitted(&self) -> Vec<(Side, f64, f64)> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderGateway for FakeExchange {
        async fn submit_order(&self, side: Side, amount: f64, price: f64) -> Result<Fill, EngineError> {
            let delay = *self.order_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.submitted.lock().unwrap().push((side, amount, price));
            if *self.fail_orders.lock().unwrap() {
                return Err(EngineError::ExchangeCallFailed("exchange down".into()));
            }
            Ok(Fill { fill_price: price, fill_amount: amount })
        }
    }

    #[async_trait]
    impl BalanceProvider for FakeExchange {
        async fn total_assets(&self, _price: f64) -> Result<f64, EngineError> {
            Ok(*self.total.lock().unwrap())
        }

        async fn position_ratio(&self, _price: f64) -> Result<f64, EngineError> {
            Ok(*self.ratio.lock().unwrap())
        }

        async fn check_balance(&self, _side: Side, _amount: f64, _price: f64) -> Result<bool, EngineError> {
            if let Some(handle) = self.stop_on_balance_check.lock().unwrap().as_ref() {
                handle.stop();
            }
            Ok(*self.sufficient.lock().unwrap())
        }
    }

    struct Harness {
        engine:   Engine,
        tape:     Arc<Tape>,
        exchange: Arc<FakeExchange>,
        notes:    Arc<MemoryNotifier>,
    }

    fn fixed_grid_config() -> EngineConfig {
        EngineConfig {
            initial_base_price: 100.0,
            initial_grid:       2.0,
            grid_min:           2.0,
            grid_max:           2.0,
            cooldown_secs:      0,
            ..Default::default()
        }
    }

    async fn harness(cfg: EngineConfig) -> Harness {
        let tape = Arc::new(Tape::new());
        let exchange = Arc::new(FakeExchange::new());
        let notes = Arc::new(MemoryNotifier::default());
        let handle = EngineHandle::new(ConfigStore::new(cfg).unwrap(), notes.clone());
        let deps = Collaborators {
            feed:    tape.clone(),
            orders:  exchange.clone(),
            balance: exchange.clone(),
            clock:   tape.clone(),
        };
        let engine = Engine::new(handle, deps).await;
        Harness { engine, tape, exchange, notes }
    }

    fn skipped_events(notes: &MemoryNotifier) -> Vec<EngineEvent> {
        notes
            .events()
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::TradeSkipped { .. }))
            .collect()
    }

    // ── Grid path ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_grid_buy_moves_base_price() {
        let mut h = harness(fixed_grid_config()).await;
        h.tape.push(98.0);

        let TickOutcome::Executed(record) = h.engine.tick().await else {
            panic!("expected a fill");
        };
        assert_eq!(record.side, Side::Buy);
        assert_eq!(record.reason, ReasonTag::Grid);
        assert_eq!(record.seq, 1);
        assert_eq!(record.realized_pnl, 0.0);
        // max(20, 10_000 × 0.05) / 98
        assert!((record.amount - 500.0 / 98.0).abs() < 1e-12);

        assert_eq!(h.engine.grid().base_price, 98.0);
        assert_eq!(h.engine.handle().trades().await, vec![record]);
        assert!(h
            .notes
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::TradeExecuted { .. })));
    }

    #[tokio::test]
    async fn test_sell_books_pnl_against_previous_base() {
        let mut h = harness(fixed_grid_config()).await;
        h.tape.push(103.0);

        let TickOutcome::Executed(record) = h.engine.tick().await else {
            panic!("expected a fill");
        };
        assert_eq!(record.side, Side::Sell);
        assert!((record.realized_pnl - 3.0 * record.amount).abs() < 1e-9);
        assert_eq!(h.engine.grid().base_price, 103.0);
    }

    #[tokio::test]
    async fn test_quiet_tick_is_idle() {
        let mut h = harness(fixed_grid_config()).await;
        h.tape.push(100.5);
        assert_eq!(h.engine.tick().await, TickOutcome::Idle);
        assert!(h.exchange.submitted().is_empty());
        assert_eq!(h.engine.handle().tick_count(), 1);
    }

    // ── Risk gate ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_over_position_blocks_buy_with_one_event() {
        let mut h = harness(fixed_grid_config()).await;
        *h.exchange.ratio.lock().unwrap() = 0.95;
        h.tape.push(97.0);

        assert_eq!(
            h.engine.tick().await,
            TickOutcome::Skipped {
                side:   Side::Buy,
                reason: EngineError::RiskBlocked { reason: BlockReason::OverPosition },
            }
        );
        assert!(h.exchange.submitted().is_empty());
        assert_eq!(h.engine.grid().base_price, 100.0);
        assert_eq!(skipped_events(&h.notes).len(), 1);
    }

    #[tokio::test]
    async fn test_over_position_still_sells() {
        let mut h = harness(fixed_grid_config()).await;
        *h.exchange.ratio.lock().unwrap() = 0.95;
        h.tape.push(103.0);
        assert!(matches!(h.engine.tick().await, TickOutcome::Executed(r) if r.side == Side::Sell));
    }

    #[tokio::test]
    async fn test_drawdown_blocks_everything() {
        let mut h = harness(fixed_grid_config()).await;
        h.tape.push(100.0);
        assert_eq!(h.engine.tick().await, TickOutcome::Idle);
        assert_eq!(h.engine.peak_assets(), 10_000.0);

        *h.exchange.total.lock().unwrap() = 8_000.0;
        h.tape.push(105.0);
        assert_eq!(
            h.engine.tick().await,
            TickOutcome::Skipped {
                side:   Side::Sell,
                reason: EngineError::RiskBlocked { reason: BlockReason::Drawdown },
            }
        );
        // Peak never moves down
        assert_eq!(h.engine.peak_assets(), 10_000.0);
    }

    #[tokio::test]
    async fn test_under_floor_tops_up() {
        let mut h = harness(fixed_grid_config()).await;
        *h.exchange.ratio.lock().unwrap() = 0.05;
        // Inside the grid band, no S1 range yet
        h.tape.push(100.5);

        let TickOutcome::Executed(record) = h.engine.tick().await else {
            panic!("expected a top-up");
        };
        assert_eq!(record.side, Side::Buy);
        assert_eq!(record.reason, ReasonTag::FloorTopUp);
    }

    // ── Overlay ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_overlay_rebalances_when_grid_is_quiet() {
        let mut h = harness(EngineConfig { grid_min: 4.0, grid_max: 4.0, initial_grid: 4.0, ..fixed_grid_config() }).await;
        h.tape.push(99.0);
        assert_eq!(h.engine.tick().await, TickOutcome::Idle);

        // Range 99..101, price at the top → target 0, holding 0.5 → reduce
        h.tape.push(101.0);
        let TickOutcome::Executed(record) = h.engine.tick().await else {
            panic!("expected a rebalance");
        };
        assert_eq!(record.side, Side::Sell);
        assert_eq!(record.reason, ReasonTag::Rebalance);
        // Every fill moves the base
        assert_eq!(h.engine.grid().base_price, 101.0);
    }

    // ── Throttle / balance / cooldown ─────────────────────────────────────────

    #[tokio::test]
    async fn test_insufficient_balance_does_not_spend_throttle() {
        let mut h = harness(EngineConfig { throttle_limit: 1, ..fixed_grid_config() }).await;
        *h.exchange.sufficient.lock().unwrap() = false;
        h.tape.push(97.0);
        assert!(matches!(
            h.engine.tick().await,
            TickOutcome::Skipped { reason: EngineError::InsufficientBalance { .. }, .. }
        ));

        *h.exchange.sufficient.lock().unwrap() = true;
        assert!(matches!(h.engine.tick().await, TickOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_failed_order_keeps_throttle_slot() {
        let mut h = harness(EngineConfig { throttle_limit: 1, ..fixed_grid_config() }).await;
        *h.exchange.fail_orders.lock().unwrap() = true;
        h.tape.push(97.0);
        assert!(matches!(h.engine.tick().await, TickOutcome::Failed(EngineError::ExchangeCallFailed(_))));
        assert_eq!(h.engine.grid().base_price, 100.0);
        assert!(h.engine.handle().trades().await.is_empty());

        // Retry ten seconds later: the failed attempt still holds the slot
        *h.exchange.fail_orders.lock().unwrap() = false;
        h.tape.advance_secs(10);
        assert_eq!(
            h.engine.tick().await,
            TickOutcome::Skipped {
                side:   Side::Buy,
                reason: EngineError::ThrottleExceeded { limit: 1, interval_secs: 60 },
            }
        );
        assert_eq!(h.exchange.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_next_trade() {
        let mut h = harness(EngineConfig { cooldown_secs: 60, ..fixed_grid_config() }).await;
        h.tape.push(98.0);
        assert!(matches!(h.engine.tick().await, TickOutcome::Executed(_)));

        h.tape.advance_secs(30);
        h.tape.prices.lock().unwrap().push(95.0);
        assert_eq!(h.engine.tick().await, TickOutcome::Cooldown { side: Side::Buy });

        h.tape.advance_secs(30);
        assert!(matches!(h.engine.tick().await, TickOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_slow_exchange_times_out() {
        let mut h = harness(EngineConfig { call_timeout_secs: 1, ..fixed_grid_config() }).await;
        *h.exchange.order_delay.lock().unwrap() = Some(Duration::from_secs(3));
        h.tape.push(97.0);
        assert_eq!(
            h.engine.tick().await,
            TickOutcome::Failed(EngineError::Timeout("order submission"))
        );
        assert_eq!(h.engine.grid().base_price, 100.0);
    }

    // ── Control flags ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pause_and_resume() {
        let mut h = harness(fixed_grid_config()).await;
        h.tape.push(97.0);
        let handle = h.engine.handle().clone();

        assert!(handle.pause());
        assert!(!handle.pause());
        assert_eq!(h.engine.tick().await, TickOutcome::Paused);
        assert_eq!(handle.tick_count(), 0);
        assert_eq!(handle.get_state().await.run_state, RunState::Paused);

        assert!(handle.resume());
        assert!(matches!(h.engine.tick().await, TickOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_stop_mid_tick_submits_nothing() {
        let mut h = harness(fixed_grid_config()).await;
        *h.exchange.stop_on_balance_check.lock().unwrap() = Some(h.engine.handle().clone());
        h.tape.push(97.0);

        assert_eq!(h.engine.tick().await, TickOutcome::Stopped);
        assert!(h.exchange.submitted().is_empty());
        assert_eq!(h.engine.tick().await, TickOutcome::Stopped);
        assert!(!h.engine.handle().resume());
        assert_eq!(h.engine.handle().run_state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_get_state_is_idempotent() {
        let mut h = harness(fixed_grid_config()).await;
        h.tape.push(98.0);
        h.engine.tick().await;

        let a = h.engine.handle().get_state().await;
        let b = h.engine.handle().get_state().await;
        assert_eq!(a, b);
        assert_eq!(a.base_price, 98.0);
        assert_eq!(a.grid_size_pct, 2.0);
        assert_eq!(a.risk_verdict, Some(RiskVerdict::Ok));
        assert_eq!(a.position.map(|p| p.position_ratio), Some(0.5));
        assert_eq!(a.trade_count, 1);
    }

    // ── Seeding / regrid / live config ────────────────────────────────────────

    #[tokio::test]
    async fn test_initialize_seeds_from_feed() {
        let mut h = harness(EngineConfig { initial_base_price: 0.0, ..fixed_grid_config() }).await;
        h.tape.push(250.0);
        assert_eq!(h.engine.initialize().await, Ok(250.0));
        assert_eq!(h.engine.grid().base_price, 250.0);

        // Already seeded: a second call does not move it
        h.tape.push(260.0);
        assert_eq!(h.engine.initialize().await, Ok(250.0));
    }

    #[tokio::test]
    async fn test_unseeded_grid_never_trades() {
        let mut h = harness(EngineConfig { initial_base_price: 0.0, ..fixed_grid_config() }).await;
        // Under the floor: a seeded engine would top up here
        *h.exchange.ratio.lock().unwrap() = 0.05;
        for p in [50.0, 40.0, 60.0] {
            h.tape.push(p);
            assert_eq!(h.engine.tick().await, TickOutcome::Idle);
        }
        assert_eq!(h.engine.grid().base_price, 0.0);
        assert!(h.exchange.submitted().is_empty());

        h.tape.push(50.0);
        assert_eq!(h.engine.initialize().await, Ok(50.0));
    }

    #[tokio::test]
    async fn test_regrid_from_volatility() {
        let mut h = harness(EngineConfig {
            initial_base_price: 0.0,
            cooldown_secs: 0,
            ..Default::default()
        })
        .await;
        // Flat tape → zero volatility → lowest bucket, 1%
        for _ in 0..5 {
            h.tape.push(100.0);
            h.engine.tick().await;
        }
        assert_eq!(h.engine.grid().grid_size_pct, 1.0);

        // Large alternating moves → top bucket, clamped to 4%
        for p in [100.0, 110.0, 100.0, 110.0] {
            h.tape.push(p);
            h.engine.tick().await;
        }
        assert_eq!(h.engine.grid().grid_size_pct, 4.0);
        assert!(h
            .notes
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::GridResized { to, .. } if *to == 4.0)));
    }

    #[tokio::test]
    async fn test_config_edit_applies_next_tick() {
        let mut h = harness(fixed_grid_config()).await;
        *h.exchange.ratio.lock().unwrap() = 0.7;

        let patch = ConfigPatch { max_position_ratio: Some(0.6), ..Default::default() };
        h.engine.handle().update_config(&patch).await.unwrap();

        h.tape.push(97.0);
        assert_eq!(
            h.engine.tick().await,
            TickOutcome::Skipped {
                side:   Side::Buy,
                reason: EngineError::RiskBlocked { reason: BlockReason::OverPosition },
            }
        );
        assert_eq!(h.engine.handle().get_state().await.config_version, 2);
    }

    #[tokio::test]
    async fn test_drawdown_blocks_floor_top_up() {
        let mut h = harness(fixed_grid_config()).await;
        *h.exchange.ratio.lock().unwrap() = 0.05;

        // Quiet grid, at peak: the floor top-up goes through
        h.tape.push(100.0);
        assert!(matches!(
            h.engine.tick().await,
            TickOutcome::Executed(TradeRecord { reason: ReasonTag::FloorTopUp, .. })
        ));

        // 30% below peak and still under the floor
        *h.exchange.total.lock().unwrap() = 7_000.0;
        h.tape.push(100.0);
        assert_eq!(
            h.engine.tick().await,
            TickOutcome::Skipped {
                side:   Side::Buy,
                reason: EngineError::RiskBlocked { reason: BlockReason::Drawdown },
            }
        );
        assert_eq!(h.exchange.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_feed_failure_is_contained() {
        let mut h = harness(fixed_grid_config()).await;
        // Empty tape → feed error
        assert!(matches!(h.engine.tick().await, TickOutcome::Failed(EngineError::ExchangeCallFailed(_))));
        h.tape.push(97.0);
        assert!(matches!(h.engine.tick().await, TickOutcome::Executed(_)));
    }

    #[tokio::test]
    async fn test_signal_source_is_pluggable() {
        struct Quiet;
        impl SignalSource for Quiet {
            fn name(&self) -> &'static str {
                "quiet"
            }
            fn detect_signal(&mut self, _ctx: &SignalContext<'_>) -> crate::engine::grid::Signal {
                crate::engine::grid::Signal::None
            }
        }

        let h = harness(fixed_grid_config()).await;
        let mut engine = h.engine.with_signal_source(Box::new(Quiet));
        // Would be a grid BUY with the default detector
        h.tape.push(97.0);
        assert_eq!(engine.tick().await, TickOutcome::Idle);
        assert!(h.exchange.submitted().is_empty());
    }
}
