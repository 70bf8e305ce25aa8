//! # config
//!
//! Engine configuration: environment loading, validation, and the versioned
//! snapshot the tick loop reads.
//!
//! ```text
//!  .env / env vars ──▶ EngineConfig::from_env ──▶ validate ──▶ ConfigSnapshot v1
//!                                                                    │
//!  PUT /api/engine/config ──▶ ConfigPatch ──▶ apply + validate ──▶ v2, v3 …
//!                                                                    │
//!                              Engine::tick reads one snapshot ◀─────┘
//! ```
//!
//! A snapshot is immutable.  Edits build a new one and swap the pointer, so a
//! tick that already holds `v1` finishes on `v1` and the next tick sees `v2`.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::engine::grid::{default_buckets, GridBucket, GridSignalDetector, GridSizer, SignalSource};
use crate::engine::risk::RiskLimits;
use crate::engine::throttle::MAX_INTERVAL_SECS;
use crate::engine::trend::TrendSignalDetector;
use crate::engine::volatility::VolatilityEstimator;
use crate::error::EngineError;

// ─── StrategyMode ─────────────────────────────────────────────────────────────

/// Which [`SignalSource`] drives entries.  Fixed for the life of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyMode {
    #[default]
    Grid,
    /// Six-line MA/EMA squeeze and trend detector.
    Trend,
}

impl FromStr for StrategyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grid" => Ok(StrategyMode::Grid),
            "trend" | "ma" => Ok(StrategyMode::Trend),
            other => Err(format!("unknown strategy mode {other:?}")),
        }
    }
}

impl std::fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyMode::Grid  => f.write_str("grid"),
            StrategyMode::Trend => f.write_str("trend"),
        }
    }
}

// ─── EngineConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    // ── Market ────────────────────────────────────────────────────────────────
    pub symbol:                   String,
    pub candle_period:            String,

    // ── Grid ──────────────────────────────────────────────────────────────────
    /// `0` ⇒ seed from the first observed price.
    pub initial_base_price:       f64,
    /// Starting width (%); also the fallback width when no bucket matches.
    pub initial_grid:             f64,
    pub grid_min:                 f64,
    pub grid_max:                 f64,
    pub grid_buckets:             Vec<GridBucket>,
    pub volatility_window:        usize,
    pub volatility_bars_per_year: f64,
    pub cooldown_secs:            u64,

    // ── Strategy ──────────────────────────────────────────────────────────────
    pub strategy_mode:            StrategyMode,
    /// Six-line dispersion (std / mean) below which the market is squeezed.
    pub trend_squeeze_threshold:  f64,
    /// Bars after a squeeze in which a breakout still counts.
    pub trend_squeeze_memory:     u32,

    // ── Sizing ────────────────────────────────────────────────────────────────
    pub min_trade_amount:         f64,
    pub trade_fraction:           f64,

    // ── Risk ──────────────────────────────────────────────────────────────────
    pub max_position_ratio:       f64,
    pub min_position_ratio:       f64,
    pub max_drawdown:             f64,
    pub overlay_dead_band:        f64,

    // ── Throttle ──────────────────────────────────────────────────────────────
    pub throttle_limit:           usize,
    pub throttle_interval_secs:   u64,

    // ── Collaborators ─────────────────────────────────────────────────────────
    pub safety_margin:            f64,
    pub call_timeout_secs:        u64,
    pub tick_interval_secs:       u64,
    pub bridge_base_url:          String,
    pub paper_trading:            bool,
    pub paper_initial_cash:       f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol:                   "OKB-USDT".into(),
            candle_period:            "1H".into(),
            initial_base_price:       0.0,
            initial_grid:             0.5,
            grid_min:                 1.0,
            grid_max:                 4.0,
            grid_buckets:             default_buckets(),
            volatility_window:        24,
            volatility_bars_per_year: 8760.0,
            cooldown_secs:            60,
            strategy_mode:            StrategyMode::Grid,
            trend_squeeze_threshold:  0.02,
            trend_squeeze_memory:     20,
            min_trade_amount:         20.0,
            trade_fraction:           0.05,
            max_position_ratio:       0.9,
            min_position_ratio:       0.1,
            max_drawdown:             0.15,
            overlay_dead_band:        0.1,
            throttle_limit:           10,
            throttle_interval_secs:   60,
            safety_margin:            0.95,
            call_timeout_secs:        10,
            tick_interval_secs:       5,
            bridge_base_url:          "http://localhost:8081".into(),
            paper_trading:            false,
            paper_initial_cash:       10_000.0,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by whatever is set in the environment.  A variable
    /// that is present but unparsable is a `ConfigInvalid`, not a silent
    /// fallback.
    pub fn from_env() -> Result<Self, EngineError> {
        let d = Self::default();

        let grid_buckets = match std::env::var("GRID_BUCKETS") {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                EngineError::ConfigInvalid(format!("GRID_BUCKETS is not a valid bucket table: {e}"))
            })?,
            Err(_) => d.grid_buckets,
        };

        let cfg = Self {
            symbol:                   env_string("SYMBOL", d.symbol),
            candle_period:            env_string("CANDLE_PERIOD", d.candle_period),
            initial_base_price:       env_parse("INITIAL_BASE_PRICE", d.initial_base_price)?,
            initial_grid:             env_parse("INITIAL_GRID", d.initial_grid)?,
            grid_min:                 env_parse("GRID_MIN", d.grid_min)?,
            grid_max:                 env_parse("GRID_MAX", d.grid_max)?,
            grid_buckets,
            volatility_window:        env_parse("VOLATILITY_WINDOW", d.volatility_window)?,
            volatility_bars_per_year: env_parse("VOLATILITY_BARS_PER_YEAR", d.volatility_bars_per_year)?,
            cooldown_secs:            env_parse("COOLDOWN_SECS", d.cooldown_secs)?,
            strategy_mode:            env_parse("STRATEGY_MODE", d.strategy_mode)?,
            trend_squeeze_threshold:  env_parse("TREND_SQUEEZE_THRESHOLD", d.trend_squeeze_threshold)?,
            trend_squeeze_memory:     env_parse("TREND_SQUEEZE_MEMORY", d.trend_squeeze_memory)?,
            min_trade_amount:         env_parse("MIN_TRADE_AMOUNT", d.min_trade_amount)?,
            trade_fraction:           env_parse("TRADE_FRACTION", d.trade_fraction)?,
            max_position_ratio:       env_parse("MAX_POSITION_RATIO", d.max_position_ratio)?,
            min_position_ratio:       env_parse("MIN_POSITION_RATIO", d.min_position_ratio)?,
            max_drawdown:             env_parse("MAX_DRAWDOWN", d.max_drawdown)?,
            overlay_dead_band:        env_parse("OVERLAY_DEAD_BAND", d.overlay_dead_band)?,
            throttle_limit:           env_parse("THROTTLE_LIMIT", d.throttle_limit)?,
            throttle_interval_secs:   env_parse("THROTTLE_INTERVAL_SECS", d.throttle_interval_secs)?,
            safety_margin:            env_parse("SAFETY_MARGIN", d.safety_margin)?,
            call_timeout_secs:        env_parse("CALL_TIMEOUT_SECS", d.call_timeout_secs)?,
            tick_interval_secs:       env_parse("TICK_INTERVAL_SECS", d.tick_interval_secs)?,
            bridge_base_url:          env_string("BRIDGE_BASE_URL", d.bridge_base_url),
            paper_trading:            env_parse("PAPER_TRADING", d.paper_trading)?,
            paper_initial_cash:       env_parse("PAPER_INITIAL_CASH", d.paper_initial_cash)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        // Bucket coverage and grid bounds are owned by the sizer.
        self.sizer()?;

        if !(0.0..=1.0).contains(&self.min_position_ratio)
            || !(0.0..=1.0).contains(&self.max_position_ratio)
            || self.min_position_ratio >= self.max_position_ratio
        {
            return Err(invalid(format!(
                "position bounds must satisfy 0 <= min < max <= 1 (min={}, max={})",
                self.min_position_ratio, self.max_position_ratio
            )));
        }
        if !(self.max_drawdown > 0.0 && self.max_drawdown < 1.0) {
            return Err(invalid(format!("max_drawdown must be in (0, 1), got {}", self.max_drawdown)));
        }
        if !(self.trade_fraction > 0.0 && self.trade_fraction <= 1.0) {
            return Err(invalid(format!("trade_fraction must be in (0, 1], got {}", self.trade_fraction)));
        }
        if !(self.min_trade_amount.is_finite() && self.min_trade_amount >= 0.0) {
            return Err(invalid(format!("min_trade_amount must be >= 0, got {}", self.min_trade_amount)));
        }
        if !(0.0..0.5).contains(&self.overlay_dead_band) {
            return Err(invalid(format!(
                "overlay_dead_band must be in [0, 0.5), got {}",
                self.overlay_dead_band
            )));
        }
        if self.throttle_limit == 0 || self.throttle_interval_secs == 0 {
            return Err(invalid("throttle limit and interval must both be positive".into()));
        }
        if self.throttle_interval_secs > MAX_INTERVAL_SECS {
            return Err(invalid(format!(
                "throttle_interval_secs must be at most {MAX_INTERVAL_SECS}, got {}",
                self.throttle_interval_secs
            )));
        }
        if !(0.0..1.0).contains(&self.trend_squeeze_threshold) {
            return Err(invalid(format!(
                "trend_squeeze_threshold must be in [0, 1), got {}",
                self.trend_squeeze_threshold
            )));
        }
        if self.volatility_window < 2 {
            return Err(invalid(format!(
                "volatility_window needs at least 2 bars, got {}",
                self.volatility_window
            )));
        }
        if !(self.volatility_bars_per_year > 0.0) {
            return Err(invalid("volatility_bars_per_year must be positive".into()));
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(invalid(format!("safety_margin must be in (0, 1], got {}", self.safety_margin)));
        }
        if self.call_timeout_secs == 0 || self.tick_interval_secs == 0 {
            return Err(invalid("call timeout and tick interval must be positive".into()));
        }
        if !(self.initial_base_price.is_finite() && self.initial_base_price >= 0.0) {
            return Err(invalid(format!(
                "initial_base_price must be >= 0, got {}",
                self.initial_base_price
            )));
        }
        if self.paper_trading && !(self.paper_initial_cash > 0.0) {
            return Err(invalid("paper_initial_cash must be positive when paper trading".into()));
        }
        Ok(())
    }

    pub fn sizer(&self) -> Result<GridSizer, EngineError> {
        GridSizer::new(self.grid_buckets.clone(), self.initial_grid, self.grid_min, self.grid_max)
    }

    pub fn signal_source(&self) -> Box<dyn SignalSource> {
        match self.strategy_mode {
            StrategyMode::Grid  => Box::new(GridSignalDetector),
            StrategyMode::Trend => Box::new(TrendSignalDetector::new(
                self.trend_squeeze_threshold,
                self.trend_squeeze_memory,
            )),
        }
    }

    pub fn estimator(&self) -> VolatilityEstimator {
        VolatilityEstimator::new(self.volatility_window, self.volatility_bars_per_year)
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_position_ratio: self.max_position_ratio,
            min_position_ratio: self.min_position_ratio,
            max_drawdown:       self.max_drawdown,
        }
    }
}

fn invalid(msg: String) -> EngineError {
    EngineError::ConfigInvalid(msg)
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, EngineError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(format!("{key}={raw:?} could not be parsed"))),
        Err(_) => Ok(default),
    }
}

// ─── ConfigPatch ──────────────────────────────────────────────────────────────

/// A live edit from the control surface.  Only tuning knobs are editable;
/// identity and wiring (symbol, bridge URL, paper mode) need a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    pub grid_min:               Option<f64>,
    pub grid_max:               Option<f64>,
    pub grid_buckets:           Option<Vec<GridBucket>>,
    pub volatility_window:      Option<usize>,
    pub cooldown_secs:          Option<u64>,
    pub min_trade_amount:       Option<f64>,
    pub trade_fraction:         Option<f64>,
    pub max_position_ratio:     Option<f64>,
    pub min_position_ratio:     Option<f64>,
    pub max_drawdown:           Option<f64>,
    pub overlay_dead_band:      Option<f64>,
    pub throttle_limit:         Option<usize>,
    pub throttle_interval_secs: Option<u64>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Returns an edited copy; `base` is left untouched.
    pub fn apply(&self, base: &EngineConfig) -> EngineConfig {
        let mut cfg = base.clone();
        if let Some(v) = self.grid_min               { cfg.grid_min = v; }
        if let Some(v) = self.grid_max               { cfg.grid_max = v; }
        if let Some(v) = &self.grid_buckets          { cfg.grid_buckets = v.clone(); }
        if let Some(v) = self.volatility_window      { cfg.volatility_window = v; }
        if let Some(v) = self.cooldown_secs          { cfg.cooldown_secs = v; }
        if let Some(v) = self.min_trade_amount       { cfg.min_trade_amount = v; }
        if let Some(v) = self.trade_fraction         { cfg.trade_fraction = v; }
        if let Some(v) = self.max_position_ratio     { cfg.max_position_ratio = v; }
        if let Some(v) = self.min_position_ratio     { cfg.min_position_ratio = v; }
        if let Some(v) = self.max_drawdown           { cfg.max_drawdown = v; }
        if let Some(v) = self.overlay_dead_band      { cfg.overlay_dead_band = v; }
        if let Some(v) = self.throttle_limit         { cfg.throttle_limit = v; }
        if let Some(v) = self.throttle_interval_secs { cfg.throttle_interval_secs = v; }
        cfg
    }
}

// ─── ConfigSnapshot ───────────────────────────────────────────────────────────

/// An immutable, validated config plus the components derived from it.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version:   u64,
    pub config:    EngineConfig,
    pub sizer:     GridSizer,
    pub estimator: VolatilityEstimator,
}

impl ConfigSnapshot {
    pub fn new(version: u64, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            version,
            sizer: config.sizer()?,
            estimator: config.estimator(),
            config,
        })
    }
}

// ─── ConfigStore ──────────────────────────────────────────────────────────────

/// Holder of the current snapshot, shared by the tick loop and the web layer.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    current: Arc<RwLock<Arc<ConfigSnapshot>>>,
}

impl ConfigStore {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let snapshot = ConfigSnapshot::new(1, config)?;
        Ok(Self { current: Arc::new(RwLock::new(Arc::new(snapshot))) })
    }

    pub async fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.read().await.clone()
    }

    /// Validate the patched config and swap it in as the next version.
    /// An invalid patch leaves the current snapshot in place.
    pub async fn update(&self, patch: &ConfigPatch) -> Result<Arc<ConfigSnapshot>, EngineError> {
        let mut guard = self.current.write().await;
        let next = ConfigSnapshot::new(guard.version + 1, patch.apply(&guard.config))?;
        let next = Arc::new(next);
        *guard = next.clone();
        info!(version = next.version, "⚙️ Config snapshot swapped");
        Ok(next)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
