//! HTTP handlers for the three public proxy surfaces (spec §4.5).

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::json;

use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::pricing;

use super::auth::{admit, resolve_token};
use super::upstream::{
    self, Dialect, ProxyRequest, anthropic_headers, extract_usage, mock_body, mock_sse_body, mock_stream_with_debit,
    openai_headers, usage_snapshot,
};

pub async fn chat_completions(
    State(state): State<AppState>,
    Path(api_token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    handle(state, api_token, Dialect::OpenAi, headers, body).await
}

pub async fn messages(
    State(state): State<AppState>,
    Path(api_token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    handle(state, api_token, Dialect::Anthropic, headers, body).await
}

async fn handle(
    state: AppState,
    api_token: String,
    dialect: Dialect,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    // Ordering contract (spec §5): auth -> admission -> upstream I/O -> usage parse -> debit.
    let pubkey = resolve_token(&state.ledger, &api_token).await?;
    admit(&state.ledger, &pubkey).await?;

    let request = ProxyRequest::parse(body, &headers)?;

    if request.is_streaming {
        return stream_response(state, pubkey, dialect, request, headers).await;
    }

    if request.is_mock {
        let body = mock_body(dialect, &request.model);
        let usage = extract_usage(dialect, &body);
        let cost = pricing::cost_usdc(usage, &request.model);
        debit_or_402(&state, &pubkey, cost, usage_snapshot(usage, &request.model)).await?;
        return Ok(Json(body).into_response());
    }

    let upstream_headers = match dialect {
        Dialect::OpenAi => openai_headers(&state.config)?,
        Dialect::Anthropic => anthropic_headers(&state.config, &headers)?,
    };
    let upstream_resp = upstream::call_upstream(&state.http, dialect, upstream_headers, request.raw_body).await?;
    let parsed_body: serde_json::Value = serde_json::from_slice(&upstream_resp.body).unwrap_or(json!({}));
    let usage = extract_usage(dialect, &parsed_body);
    let cost = pricing::cost_usdc(usage, &request.model);
    debit_or_402(&state, &pubkey, cost, usage_snapshot(usage, &request.model)).await?;

    let mut response = Response::builder().status(upstream_resp.status);
    for (name, value) in upstream_resp.headers.iter() {
        response = response.header(name, value);
    }
    Ok(response.body(axum::body::Body::from(upstream_resp.body)).expect("valid upstream response"))
}

async fn stream_response(
    state: AppState,
    pubkey: String,
    dialect: Dialect,
    request: ProxyRequest,
    headers: HeaderMap,
) -> AppResult<Response> {
    let body = if request.is_mock {
        let sse = mock_sse_body(dialect, &request.model);
        mock_stream_with_debit(sse, state.ledger.clone(), pubkey, state.config.usdc_mint.clone(), request.model.clone())
    } else {
        let upstream_headers = match dialect {
            Dialect::OpenAi => openai_headers(&state.config)?,
            Dialect::Anthropic => anthropic_headers(&state.config, &headers)?,
        };
        upstream::stream_upstream_and_debit(
            &state.http,
            dialect,
            upstream_headers,
            request.raw_body,
            state.ledger.clone(),
            pubkey,
            state.config.usdc_mint.clone(),
            request.model.clone(),
        )
        .await?
    };

    Ok(Response::builder()
        .status(axum::http::StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .body(body)
        .expect("valid streaming response"))
}

/// Debits via the USDC-first / SOL-fallback policy (§4.2); insufficient
/// funds surfaces as 402 even after the upstream call has already been
/// made (spec: "Debit failure ... is logged but the client's stream is
/// not retroactively failed" applies only to streaming - for the
/// non-streaming path a failed debit still yields 402 to the caller).
async fn debit_or_402(state: &AppState, pubkey: &str, cost: u64, usage_json: String) -> AppResult<()> {
    pricing::debit_agent(&state.ledger, pubkey, &state.config.usdc_mint, cost, &usage_json)
        .await
        .map(|_| ())
        .map_err(|_| AppError::InsufficientBalance)
}

pub async fn balance(State(state): State<AppState>, Path(api_token): Path<String>) -> AppResult<Json<serde_json::Value>> {
    let pubkey = resolve_token(&state.ledger, &api_token).await?;
    let balances = state.ledger.get_all_balances(&pubkey).await?;
    Ok(Json(json!({ "pubkey": pubkey, "balances": balances })))
}
