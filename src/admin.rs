//! Registration, pricing, and admin-stats endpoints (spec §4.6).

use axum::Json;
use axum::extract::{Path, State};
use serde_json::json;

use crate::app::AppState;
use crate::error::AppResult;
use crate::pricing::pricing_snapshot;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "arena_ready", "agent": "Level5" }))
}

pub async fn register(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let (api_token, deposit_code) = state.ledger.create_api_token().await?;
    Ok(Json(json!({
        "api_token": api_token,
        "deposit_code": deposit_code,
        "base_url": state.config.base_url(),
        "status": "pending_deposit",
        "instructions": format!(
            "Send SOL or USDC to the deposit address derived from code {deposit_code}, then call /proxy/{api_token}/v1/chat/completions"
        ),
    })))
}

/// Supplemental status check so a caller can poll activation instead of
/// relying on the mirror's own cadence (spec §4.4 step 3 observer view).
pub async fn registration_status(
    State(state): State<AppState>,
    Path(deposit_code): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    match state.ledger.token_row_by_deposit_code(&deposit_code).await? {
        Some(row) => Ok(Json(json!({ "activated": row.pubkey.is_some(), "row": row }))),
        None => Ok(Json(json!({ "activated": false, "pubkey": null, "error": "unknown deposit code" }))),
    }
}

pub async fn pricing(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let token_config = state.ledger.pricing_table().await?;
    Ok(Json(json!({
        "models": pricing_snapshot(),
        "currencies": token_config,
    })))
}

pub async fn stats(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let stats = state.ledger.admin_stats().await?;
    Ok(Json(json!(stats)))
}
