//! # engine::gateway
//!
//! The capability boundary between the engine and the outside world.
//!
//! | Trait              | Live                         | Backtest / paper           |
//! |--------------------|------------------------------|----------------------------|
//! | [`MarketFeed`]     | `bridge::BridgeClient`       | `backtest::Replay`         |
//! | [`OrderGateway`]   | `bridge::BridgeClient`       | `backtest::SimLedger`      |
//! | [`BalanceProvider`]| `bridge::BridgeClient`       | `backtest::SimLedger`      |
//! | [`Clock`]          | [`SystemClock`]              | `backtest::Replay`         |
//! | [`Notifier`]       | `events::BroadcastNotifier`  | `events::NullNotifier`     |
//!
//! The orchestrator only sees these traits, which is what lets a replay drive
//! exactly the same decision code as the live loop.

use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};

use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::models::{Candle, Fill, Side};

// ─── Capabilities ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn last_price(&self) -> Result<f64, EngineError>;

    /// Most recent `count` bars, oldest first.
    async fn candles(&self, period: &str, count: usize) -> Result<Vec<Candle>, EngineError>;
}

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit_order(&self, side: Side, amount: f64, price: f64) -> Result<Fill, EngineError>;
}

#[async_trait]
pub trait BalanceProvider: Send + Sync {
    /// Quote value of everything held, marked at `price`.
    async fn total_assets(&self, price: f64) -> Result<f64, EngineError>;

    /// Held-asset value over total assets, in `[0, 1]`.
    async fn position_ratio(&self, price: f64) -> Result<f64, EngineError>;

    async fn check_balance(&self, side: Side, amount: f64, price: f64) -> Result<bool, EngineError>;
}

/// Fire-and-forget.  Implementations must not block and cannot fail the tick.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &EngineEvent);
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// `true` on the first call of each UTC day (including the very first call).
    fn is_new_day(&self) -> bool;
}

/// The market-facing collaborators one engine instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub feed:    Arc<dyn MarketFeed>,
    pub orders:  Arc<dyn OrderGateway>,
    pub balance: Arc<dyn BalanceProvider>,
    pub clock:   Arc<dyn Clock>,
}

// ─── Day tracking ─────────────────────────────────────────────────────────────

/// Remembers the last day it was shown and reports when that changes.
#[derive(Debug)]
pub struct DayTracker {
    last_day: AtomicI32,
}

impl DayTracker {
    pub fn new() -> Self {
        Self { last_day: AtomicI32::new(i32::MIN) }
    }

    pub fn roll(&self, at: DateTime<Utc>) -> bool {
        let today = at.date_naive().num_days_from_ce();
        self.last_day.swap(today, Ordering::AcqRel) != today
    }
}

impl Default for DayTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock UTC.
#[derive(Debug, Default)]
pub struct SystemClock {
    days: DayTracker,
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn is_new_day(&self) -> bool {
        self.days.roll(Utc::now())
    }
}

// ─── Call bounding ────────────────────────────────────────────────────────────

/// Run a collaborator call under `limit`.  Overrunning is a recoverable
/// [`EngineError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, what: &'static str, call: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(what)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    #[test]
    fn test_day_tracker_rolls_once_per_day() {
        let days = DayTracker::new();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap();
        assert!(days.roll(t0));
        assert!(!days.roll(t0 + ChronoDuration::minutes(30)));
        assert!(days.roll(t0 + ChronoDuration::hours(1)));
        assert!(!days.roll(t0 + ChronoDuration::hours(2)));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, EngineError>(1.0)
        };
        assert_eq!(
            bounded(Duration::from_millis(10), "price feed", slow).await,
            Err(EngineError::Timeout("price feed"))
        );

        let fast = async { Ok::<_, EngineError>(2.0) };
        assert_eq!(bounded(Duration::from_secs(1), "price feed", fast).await, Ok(2.0));
    }
}
