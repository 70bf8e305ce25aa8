//! # routes::monitor
//!
//! **Monitor** — live event stream and read-only views for dashboards.
//!
//! ## Endpoints
//!
//! | Method    | Path                    | Description                              |
//! |-----------|-------------------------|------------------------------------------|
//! | GET (WS)  | `/ws/monitor`           | WebSocket stream of `EngineEvent`s       |
//! | GET       | `/api/monitor/history`  | Trade journal                            |
//! | GET       | `/api/monitor/stats`    | tick_count, trade_count, uptime          |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info};

use crate::{engine::orchestrator::RunState, events::EngineEvent, state::SharedState};

// ─── WebSocket Handler ────────────────────────────────────────────────────────

/// Upgrade to a WebSocket and forward every broadcast event as a JSON text
/// frame.  The first frame is a `SNAPSHOT` of the engine status.
pub async fn ws_monitor(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let mut rx = state.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    // ── Snapshot on connect ───────────────────────────────────────────────────
    let snapshot = json!({
        "event":  "SNAPSHOT",
        "status": state.engine.get_state().await,
    })
    .to_string();

    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    // ── Event Loop ────────────────────────────────────────────────────────────
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(json_str) => {
                        if sender.send(Message::Text(json_str)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(_) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

// ─── REST Monitoring Endpoints ────────────────────────────────────────────────

/// GET /api/monitor/history
pub async fn get_history(State(state): State<SharedState>) -> impl IntoResponse {
    let history = state.engine.trades().await;
    Json(json!({
        "ok":      true,
        "count":   history.len(),
        "records": history,
    }))
}

/// GET /api/monitor/stats — also broadcast as `ENGINE_STATS` so connected
/// dashboards refresh together.
pub async fn get_stats(State(state): State<SharedState>) -> impl IntoResponse {
    let tick_count  = state.engine.tick_count();
    let trade_count = state.engine.trade_count();
    let run_state   = state.engine.run_state();

    state.broadcast(&EngineEvent::EngineStats {
        tick_count,
        trade_count,
        paused: run_state == RunState::Paused,
    });

    Json(json!({
        "ok":          true,
        "tick_count":  tick_count,
        "trade_count": trade_count,
        "run_state":   run_state,
        "uptime_secs": state.uptime_secs(),
    }))
}
