//! # state
//!
//! AppState — what every Axum handler sees: the engine's control handle and
//! the broadcast channel feeding the monitor WebSocket.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::engine::orchestrator::EngineHandle;
use crate::events::EngineEvent;

/// Capacity of the monitor channel.  Slow WebSocket clients lag past this.
pub const BROADCAST_CAPACITY: usize = 256;

// ─── AppState ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    // ── Engine ────────────────────────────────────────────────────────────────
    /// Control flags, config store, published status and trade journal.
    /// The engine itself lives on the scheduler task.
    pub engine: EngineHandle,

    // ── Monitor / WebSocket ───────────────────────────────────────────────────
    /// Pre-serialized JSON, shared with the engine's `BroadcastNotifier`.
    pub broadcast_tx: broadcast::Sender<String>,

    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: EngineHandle, broadcast_tx: broadcast::Sender<String>) -> Self {
        Self { engine, broadcast_tx, started_at: Utc::now() }
    }

    /// Broadcast to every connected WebSocket client.  Having no listeners is
    /// fine (headless mode).
    pub fn broadcast(&self, event: &EngineEvent) {
        let _ = self.broadcast_tx.send(event.to_json());
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}

pub type SharedState = Arc<AppState>;

pub fn build_state(engine: EngineHandle, broadcast_tx: broadcast::Sender<String>) -> SharedState {
    Arc::new(AppState::new(engine, broadcast_tx))
}
