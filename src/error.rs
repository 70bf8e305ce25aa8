//! # error
//!
//! Centralised error types.
//!
//! * [`EngineError`] — the per-tick taxonomy.  Everything except
//!   `ConfigInvalid` is contained inside a single tick: the attempt is
//!   aborted, logged once, and the loop carries on.
//! * [`AppError`] — what the HTTP control surface returns.  Axum's
//!   `IntoResponse` impl renders it as a JSON error body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::engine::risk::BlockReason;

// ─── Engine Errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Not enough history for volatility or the S1 range; that check is skipped.
    #[error("Insufficient data: {0}")]
    InsufficientData(&'static str),

    /// The balance collaborator says the account cannot cover the order.
    #[error("Insufficient balance for {side} {amount} @ {price}")]
    InsufficientBalance { side: String, amount: f64, price: f64 },

    /// The order-rate window is full.
    #[error("Order throttle exceeded: {limit} orders per {interval_secs}s")]
    ThrottleExceeded { limit: usize, interval_secs: u64 },

    /// The risk gate refused this side.
    #[error("Risk blocked: {reason}")]
    RiskBlocked { reason: BlockReason },

    /// Exchange / feed / balance call failed.  Recoverable.
    #[error("Exchange call failed: {0}")]
    ExchangeCallFailed(String),

    /// A collaborator call exceeded the configured timeout.  Recoverable.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Fatal at startup; rejected (not applied) when it comes from a live edit.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl EngineError {
    /// Short machine-readable tag carried by log lines and notifications.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineError::InsufficientData(_)      => "INSUFFICIENT_DATA",
            EngineError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            EngineError::ThrottleExceeded { .. }  => "THROTTLE_EXCEEDED",
            EngineError::RiskBlocked { reason }   => reason.tag(),
            EngineError::ExchangeCallFailed(_)    => "EXCHANGE_CALL_FAILED",
            EngineError::Timeout(_)               => "TIMEOUT",
            EngineError::ConfigInvalid(_)         => "CONFIG_INVALID",
        }
    }
}

// ─── HTTP Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The requested resource does not exist yet.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An engine operation failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg)   => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Engine(err @ EngineError::ConfigInvalid(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            AppError::Engine(err @ EngineError::ExchangeCallFailed(_))
            | AppError::Engine(err @ EngineError::Timeout(_)) => {
                (StatusCode::BAD_GATEWAY, err.to_string())
            }
            AppError::Engine(err) => (StatusCode::CONFLICT, err.to_string()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}
