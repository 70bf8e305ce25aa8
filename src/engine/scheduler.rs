//! # engine::scheduler
//!
//! Drives one [`Engine`] on a fixed polling interval.  Ticks never overlap: the
//! next one starts only after the previous one returned, and a late tick is
//! delayed rather than bunched.
//!
//! Tests that need exact tick boundaries call [`Scheduler::step`] directly
//! instead of [`Scheduler::run`].

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::orchestrator::{Engine, TickOutcome};

pub struct Scheduler {
    engine:   Engine,
    interval: Duration,
}

impl Scheduler {
    pub fn new(engine: Engine, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Exactly one tick.
    pub async fn step(&mut self) -> TickOutcome {
        self.engine.tick().await
    }

    /// Seed the engine, then tick until a stop is requested.  A failed seed is
    /// retried on the next interval.  Returns the engine so the caller can
    /// inspect its final state.
    pub async fn run(mut self) -> Engine {
        let handle = self.engine.handle().clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "⏱️ Scheduler started");

        // ── 1. Seed ───────────────────────────────────────────────────────────
        loop {
            tokio::select! {
                _ = handle.stopped() => {
                    info!("⏱️ Scheduler stopped before initialisation");
                    return self.engine;
                }
                _ = ticker.tick() => {}
            }
            match self.engine.initialize().await {
                Ok(_) => break,
                Err(e) => warn!(error = %e, reason = e.tag(), "Initialisation failed, retrying"),
            }
        }

        // ── 2. Tick loop ──────────────────────────────────────────────────────
        loop {
            tokio::select! {
                _ = handle.stopped() => break,
                _ = ticker.tick() => {
                    match self.step().await {
                        TickOutcome::Stopped => break,
                        outcome => debug!(?outcome, "Tick finished"),
                    }
                }
            }
        }

        info!(
            ticks  = handle.tick_count(),
            trades = handle.trade_count(),
            "⏱️ Scheduler exited"
        );
        self.engine
    }
}
