//! # routes::control
//!
//! Operator control over the running engine.
//!
//! | Method | Path                   | Description                                |
//! |--------|------------------------|--------------------------------------------|
//! | POST   | `/api/engine/pause`    | Skip ticks until resumed                   |
//! | POST   | `/api/engine/resume`   | Resume a paused engine                     |
//! | POST   | `/api/engine/stop`     | Terminal stop (finishes the current tick)  |
//! | GET    | `/api/engine/state`    | Last published status; never advances      |
//! | GET    | `/api/engine/config`   | Current config snapshot                    |
//! | PUT    | `/api/engine/config`   | Validate and swap in a `ConfigPatch`       |

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use tracing::info;

use crate::{
    config::ConfigPatch,
    engine::orchestrator::RunState,
    error::AppError,
    state::SharedState,
};

/// POST /api/engine/pause
pub async fn pause(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    if state.engine.run_state() == RunState::Stopped {
        return Err(AppError::BadRequest("engine is stopped".into()));
    }
    let changed = state.engine.pause();
    Ok(Json(json!({
        "ok":        true,
        "changed":   changed,
        "run_state": state.engine.run_state(),
    })))
}

/// POST /api/engine/resume
pub async fn resume(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    if state.engine.run_state() == RunState::Stopped {
        return Err(AppError::BadRequest("a stopped engine cannot be resumed".into()));
    }
    let changed = state.engine.resume();
    Ok(Json(json!({
        "ok":        true,
        "changed":   changed,
        "run_state": state.engine.run_state(),
    })))
}

/// POST /api/engine/stop
pub async fn stop(State(state): State<SharedState>) -> impl IntoResponse {
    let changed = state.engine.stop();
    if changed {
        info!("🛑 Stop requested via API");
    }
    Json(json!({
        "ok":        true,
        "changed":   changed,
        "run_state": state.engine.run_state(),
    }))
}

/// GET /api/engine/state
pub async fn get_state(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.engine.get_state().await;
    Json(json!({
        "ok":    true,
        "state": status,
    }))
}

/// GET /api/engine/config
pub async fn get_config(State(state): State<SharedState>) -> impl IntoResponse {
    let snapshot = state.engine.config().current().await;
    Json(json!({
        "ok":      true,
        "version": snapshot.version,
        "config":  snapshot.config,
    }))
}

/// PUT /api/engine/config — applied at the start of the next tick.
pub async fn update_config(
    State(state): State<SharedState>,
    Json(patch): Json<ConfigPatch>,
) -> Result<impl IntoResponse, AppError> {
    if patch.is_empty() {
        return Err(AppError::BadRequest("config patch has no fields".into()));
    }

    let snapshot = state.engine.update_config(&patch).await?;
    info!(version = snapshot.version, "⚙️ Config updated via API");

    Ok(Json(json!({
        "ok":      true,
        "version": snapshot.version,
        "config":  snapshot.config,
    })))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::routes::{router, testing::{body_json, test_state}};

    async fn call(state: &crate::state::SharedState, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(b) => {
                req = req.header("content-type", "application/json");
                Body::from(b.to_string())
            }
            None => Body::empty(),
        };
        let resp = router(state.clone()).oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        (status, body_json(resp).await)
    }

    #[tokio::test]
    async fn test_pause_resume_stop_cycle() {
        let state = test_state();

        let (status, body) = call(&state, Method::POST, "/api/engine/pause", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], true);
        assert_eq!(body["run_state"], "PAUSED");

        // Second pause is a no-op
        let (_, body) = call(&state, Method::POST, "/api/engine/pause", None).await;
        assert_eq!(body["changed"], false);

        let (_, body) = call(&state, Method::POST, "/api/engine/resume", None).await;
        assert_eq!(body["run_state"], "RUNNING");

        let (_, body) = call(&state, Method::POST, "/api/engine/stop", None).await;
        assert_eq!(body["run_state"], "STOPPED");

        let (status, body) = call(&state, Method::POST, "/api/engine/resume", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_state_reports_without_ticking() {
        let state = test_state();
        let (status, body) = call(&state, Method::GET, "/api/engine/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["tick_count"], 0);
        assert_eq!(state.engine.tick_count(), 0);
    }

    #[tokio::test]
    async fn test_config_update_is_versioned() {
        let state = test_state();
        let (_, body) = call(&state, Method::GET, "/api/engine/config", None).await;
        assert_eq!(body["version"], 1);

        let (status, body) = call(
            &state,
            Method::PUT,
            "/api/engine/config",
            Some(r#"{"cooldown_secs": 120, "max_drawdown": 0.2}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 2);
        assert_eq!(body["config"]["cooldown_secs"], 120);
    }

    #[tokio::test]
    async fn test_config_update_rejects_bad_patches() {
        let state = test_state();

        let (status, _) = call(&state, Method::PUT, "/api/engine/config", Some("{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Inverted bounds
        let (status, body) = call(
            &state,
            Method::PUT,
            "/api/engine/config",
            Some(r#"{"grid_min": 5.0, "grid_max": 1.0}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["ok"], false);
        assert_eq!(state.engine.config().current().await.version, 1);

        // Identity fields are not live-editable
        let (status, _) = call(&state, Method::PUT, "/api/engine/config", Some(r#"{"symbol": "BTC-USDT"}"#)).await;
        assert!(status.is_client_error());
    }
}
