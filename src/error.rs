//! HTTP-facing error taxonomy (spec §7).

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("invalid or inactive API token")]
    InvalidToken,

    #[error("insufficient deposit balance")]
    InsufficientBalance,

    #[error("upstream API key not configured: {0}")]
    MissingUpstreamKey(&'static str),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    #[error("malformed request body: {0}")]
    BadRequest(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or inactive API token".to_string()),
            AppError::InsufficientBalance => (StatusCode::PAYMENT_REQUIRED, "Insufficient Deposit Balance".to_string()),
            AppError::MissingUpstreamKey(which) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Upstream API key not configured: {which}"),
            ),
            AppError::UpstreamError(e) => (StatusCode::BAD_GATEWAY, format!("Upstream error: {e}")),
            AppError::Ledger(e) => {
                tracing::error!(error = %e, "ledger I/O failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal ledger error".to_string())
            }
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e.clone()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
