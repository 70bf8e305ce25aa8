//! # routes::backtest
//!
//! POST /api/backtest — replay a bar series through the same tick pipeline as
//! the live engine, on an isolated ledger.
//!
//! The run starts from the live config snapshot with the optional `config`
//! patch applied on top; the live engine is never touched.

use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    config::ConfigPatch,
    engine::backtest::{run_backtest, BacktestConfig},
    error::{AppError, EngineError},
    models::Candle,
    state::SharedState,
};

// ─── Request ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BacktestRequest {
    /// Historical bars, oldest first.
    pub bars:    Vec<Candle>,
    /// Tuning overrides on top of the live config.
    pub config:  Option<ConfigPatch>,
    #[serde(default)]
    pub options: BacktestConfig,
}

/// POST /api/backtest
pub async fn run(
    State(state): State<SharedState>,
    Json(req): Json<BacktestRequest>,
) -> Result<impl IntoResponse, AppError> {
    let live = state.engine.config().current().await;
    let config = match &req.config {
        Some(patch) => patch.apply(&live.config),
        None => live.config.clone(),
    };

    info!(bars = req.bars.len(), "📊 Backtest requested");

    let report = run_backtest(&req.bars, &config, req.options)
        .await
        .map_err(|e| match e {
            EngineError::InsufficientData(msg) => AppError::BadRequest(msg.to_string()),
            other => AppError::Engine(other),
        })?;

    Ok(Json(json!({
        "ok":     true,
        "report": report,
    })))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::routes::{router, testing::{body_json, test_state}};

    fn bars(closes: &[f64]) -> Value {
        let bars: Vec<Value> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                json!({
                    "timestamp": format!("2024-01-01T{:02}:00:00Z", i),
                    "open": c, "high": c, "low": c, "close": c
                })
            })
            .collect();
        Value::Array(bars)
    }

    async fn post(body: Value) -> (StatusCode, Value) {
        let resp = router(test_state())
            .oneshot(
                Request::post("/api/backtest")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        (status, body_json(resp).await)
    }

    #[tokio::test]
    async fn test_backtest_with_fixed_grid() {
        let (status, body) = post(json!({
            "bars": bars(&[100.0, 98.0, 96.0, 98.0, 102.0]),
            "config": {
                "grid_min": 2.0, "grid_max": 2.0, "cooldown_secs": 0,
                "grid_buckets": [{ "lo": 0.0, "hi": null, "width": 2.0 }]
            }
        }))
        .await;

        assert_eq!(status, StatusCode::OK);
        let report = &body["report"];
        assert_eq!(report["bars"], 5);
        assert_eq!(report["total_trades"], 4);
        assert_eq!(report["final_base_price"], 102.0);
    }

    #[tokio::test]
    async fn test_backtest_rejects_empty_and_invalid_input() {
        let (status, body) = post(json!({ "bars": [] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);

        let (status, _) = post(json!({
            "bars": bars(&[100.0]),
            "options": { "initial_cash": -1.0 }
        }))
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
