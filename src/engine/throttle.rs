//! # engine::throttle
//!
//! Sliding-window order rate limiter.  A slot is consumed when an order is
//! about to be submitted and is never refunded, even if the exchange call
//! then fails.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::error::EngineError;

/// Longest accepted window.  Config validation rejects anything above it.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Default)]
pub struct OrderThrottler {
    /// Accepted attempts inside the trailing window, oldest first.
    window: VecDeque<DateTime<Utc>>,
}

impl OrderThrottler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop timestamps older than `interval_secs`, then admit if fewer than
    /// `limit` remain.  Limits are passed per call so live config edits apply
    /// without losing the window.
    pub fn try_acquire(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
        interval_secs: u64,
    ) -> Result<(), EngineError> {
        let interval = chrono::Duration::seconds(interval_secs.min(MAX_INTERVAL_SECS) as i64);
        while let Some(&oldest) = self.window.front() {
            if now - oldest >= interval {
                self.window.pop_front();
            } else {
                break;
            }
        }

        if self.window.len() >= limit {
            return Err(EngineError::ThrottleExceeded { limit, interval_secs });
        }

        self.window.push_back(now);
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.window.len()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_rejects_limit_plus_one() {
        let mut th = OrderThrottler::new();
        for i in 0..3 {
            assert!(th.try_acquire(t0() + Duration::seconds(i), 3, 60).is_ok());
        }
        assert_eq!(
            th.try_acquire(t0() + Duration::seconds(10), 3, 60),
            Err(EngineError::ThrottleExceeded { limit: 3, interval_secs: 60 })
        );
        // A rejection does not occupy a slot
        assert_eq!(th.in_flight(), 3);
    }

    #[test]
    fn test_window_slides() {
        let mut th = OrderThrottler::new();
        for _ in 0..2 {
            th.try_acquire(t0(), 2, 60).unwrap();
        }
        assert!(th.try_acquire(t0() + Duration::seconds(59), 2, 60).is_err());
        assert!(th.try_acquire(t0() + Duration::seconds(60), 2, 60).is_ok());
        assert_eq!(th.in_flight(), 1);
    }

    #[test]
    fn test_limit_change_keeps_window() {
        let mut th = OrderThrottler::new();
        th.try_acquire(t0(), 5, 60).unwrap();
        th.try_acquire(t0(), 5, 60).unwrap();
        // Tightened live to 2 per minute
        assert!(th.try_acquire(t0() + Duration::seconds(1), 2, 60).is_err());
    }

    #[test]
    fn test_oversized_interval_is_capped() {
        let mut th = OrderThrottler::new();
        assert!(th.try_acquire(t0(), 1, u64::MAX).is_ok());
        assert!(th.try_acquire(t0() + Duration::hours(1), 1, u64::MAX).is_err());
        // Past the cap the window has slid
        assert!(th.try_acquire(t0() + Duration::seconds(MAX_INTERVAL_SECS as i64), 1, u64::MAX).is_ok());
    }
}
