//! # events
//!
//! [`EngineEvent`] — everything the engine reports to the outside world.
//!
//! Events reach the monitor WebSocket through a
//! `tokio::sync::broadcast::Sender<String>` carrying pre-serialized JSON,
//! which keeps the channel free of `Clone` bounds on the payload.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engine::gateway::Notifier;
use crate::models::{Side, TradeRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    /// Base price seeded before the first tick.
    Initialized {
        symbol:     String,
        base_price: f64,
    },

    /// Order filled and journalled.
    TradeExecuted {
        record: Box<TradeRecord>,
    },

    /// The attempt was refused before reaching the exchange
    /// (risk, cooldown, throttle, balance).
    TradeSkipped {
        side:   Side,
        reason: &'static str,
        detail: String,
    },

    /// The attempt reached a collaborator and failed or timed out.
    TradeFailed {
        side:   Option<Side>,
        reason: &'static str,
        detail: String,
    },

    GridResized {
        from:       f64,
        to:         f64,
        volatility: f64,
    },

    Paused,
    Resumed,
    Stopped,

    ConfigUpdated {
        version: u64,
    },

    /// Counter snapshot, broadcast whenever `GET /api/monitor/stats` is polled.
    EngineStats {
        tick_count:  u64,
        trade_count: u64,
        paused:      bool,
    },
}

impl EngineEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

// ─── Notifiers ────────────────────────────────────────────────────────────────

/// Publishes every event onto the monitor broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<String>,
}

impl BroadcastNotifier {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: &EngineEvent) {
        // Err only means nobody is listening right now
        let _ = self.tx.send(event.to_json());
    }
}

/// Drops everything.  Backtests run with this.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _event: &EngineEvent) {}
}

/// Keeps every event in memory so tests can assert on them.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: std::sync::Mutex<Vec<EngineEvent>>,
}

#[cfg(test)]
impl MemoryNotifier {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl Notifier for MemoryNotifier {
    fn notify(&self, event: &EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
