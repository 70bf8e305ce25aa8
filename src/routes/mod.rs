//! HTTP control and monitor surface.

pub mod backtest;
pub mod control;
pub mod monitor;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::SharedState;

/// Every route, with state attached.  Middleware is layered on in `main`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        // ── Control ───────────────────────────────────────────────────────────
        .route("/api/engine/pause",   post(control::pause))
        .route("/api/engine/resume",  post(control::resume))
        .route("/api/engine/stop",    post(control::stop))
        .route("/api/engine/state",   get(control::get_state))
        .route("/api/engine/config",  get(control::get_config).put(control::update_config))
        // ── Monitor ───────────────────────────────────────────────────────────
        .route("/ws/monitor",         get(monitor::ws_monitor))
        .route("/api/monitor/history", get(monitor::get_history))
        .route("/api/monitor/stats",  get(monitor::get_stats))
        // ── Backtesting ───────────────────────────────────────────────────────
        .route("/api/backtest",       post(backtest::run))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use axum::{body::to_bytes, response::Response};
    use serde_json::Value;
    use tokio::sync::broadcast;

    use crate::config::{ConfigStore, EngineConfig};
    use crate::engine::orchestrator::EngineHandle;
    use crate::events::BroadcastNotifier;
    use crate::state::{build_state, SharedState, BROADCAST_CAPACITY};

    /// Fresh state around an engine handle that nothing ticks.
    pub fn test_state() -> SharedState {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let handle = EngineHandle::new(
            ConfigStore::new(EngineConfig::default()).unwrap(),
            Arc::new(BroadcastNotifier::new(tx.clone())),
        );
        build_state(handle, tx)
    }

    pub async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    }
}
