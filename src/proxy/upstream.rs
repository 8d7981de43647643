//! Upstream dispatch (spec §4.5): header construction per dialect, the
//! mock-upstream testing path, and the real non-streaming call. Streaming
//! is handled by [`super::sse`] plus [`stream_with_usage_debit`] below.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use serde_json::{Value, json};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::ledger::Ledger;
use crate::pricing::{self, Usage};

use super::sse::{LineSplitter, UsageAggregator, parse_data_line};

pub const OPENAI_BASE: &str = "https://api.openai.com";
pub const ANTHROPIC_BASE: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

pub const MOCK_USAGE: Usage = Usage { input_tokens: 15, output_tokens: 25 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

/// A decoded and classified inbound proxy request.
pub struct ProxyRequest {
    pub model: String,
    pub is_mock: bool,
    pub is_streaming: bool,
    pub raw_body: Bytes,
    pub body_json: Value,
}

impl ProxyRequest {
    pub fn parse(raw_body: Bytes, headers: &HeaderMap) -> AppResult<Self> {
        let body_json: Value = serde_json::from_slice(&raw_body)
            .map_err(|e| AppError::BadRequest(format!("invalid JSON body: {e}")))?;
        let model = body_json.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
        let is_mock = headers
            .get("x-mock-upstream")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let is_streaming = body_json.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
        Ok(Self { model, is_mock, is_streaming, raw_body, body_json })
    }
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub fn openai_headers(config: &Config) -> AppResult<HeaderMap> {
    let key = config.openai_api_key.as_deref().ok_or(AppError::MissingUpstreamKey("OPENAI_API_KEY"))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {key}")).map_err(|e| AppError::UpstreamError(e.to_string()))?,
    );
    headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

/// Builds Anthropic request headers: `x-api-key`, a default
/// `anthropic-version` (overridable), and verbatim pass-through of every
/// client header whose name begins with `anthropic-`.
pub fn anthropic_headers(config: &Config, client_headers: &HeaderMap) -> AppResult<HeaderMap> {
    let key = config.anthropic_api_key.as_deref().ok_or(AppError::MissingUpstreamKey("ANTHROPIC_API_KEY"))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-api-key"),
        HeaderValue::from_str(key).map_err(|e| AppError::UpstreamError(e.to_string()))?,
    );
    headers.insert(
        HeaderName::from_static("anthropic-version"),
        HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
    );
    headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

    for (name, value) in client_headers.iter() {
        if name.as_str().starts_with("anthropic-") {
            headers.insert(name.clone(), value.clone());
        }
    }
    Ok(headers)
}

/// Canned, non-streaming mock response body for a dialect, with fixed
/// usage `{15, 25}` (spec §4.5 mock path).
pub fn mock_body(dialect: Dialect, model: &str) -> Value {
    match dialect {
        Dialect::OpenAi => json!({
            "id": "mock-chatcmpl",
            "object": "chat.completion",
            "model": model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "mock response"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": MOCK_USAGE.input_tokens, "completion_tokens": MOCK_USAGE.output_tokens},
        }),
        Dialect::Anthropic => json!({
            "id": "mock-msg",
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [{"type": "text", "text": "mock response"}],
            "usage": {"input_tokens": MOCK_USAGE.input_tokens, "output_tokens": MOCK_USAGE.output_tokens},
        }),
    }
}

/// Canned SSE body for the streaming mock path, matching each dialect's
/// wire shape closely enough for a client-side SSE parser to exercise the
/// real code paths.
pub fn mock_sse_body(dialect: Dialect, model: &str) -> String {
    match dialect {
        Dialect::Anthropic => format!(
            "event: message_start\ndata: {}\n\nevent: content_block_delta\ndata: {}\n\nevent: message_delta\ndata: {}\n\n",
            json!({"type": "message_start", "message": {"id": "mock-msg", "model": model, "usage": {"input_tokens": MOCK_USAGE.input_tokens}}}),
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "mock"}}),
            json!({"type": "message_delta", "usage": {"output_tokens": MOCK_USAGE.output_tokens}}),
        ),
        Dialect::OpenAi => format!(
            "data: {}\n\ndata: [DONE]\n\n",
            json!({
                "id": "mock-chatcmpl",
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{"index": 0, "delta": {"content": "mock"}, "finish_reason": null}],
                "usage": {"prompt_tokens": MOCK_USAGE.input_tokens, "completion_tokens": MOCK_USAGE.output_tokens},
            }),
        ),
    }
}

/// Non-streaming real upstream call: relay status/body/headers verbatim
/// to the caller, who extracts usage and debits.
pub async fn call_upstream(
    http: &reqwest::Client,
    dialect: Dialect,
    headers: HeaderMap,
    raw_body: Bytes,
) -> AppResult<UpstreamResponse> {
    let url = match dialect {
        Dialect::OpenAi => format!("{OPENAI_BASE}/v1/chat/completions"),
        Dialect::Anthropic => format!("{ANTHROPIC_BASE}/v1/messages"),
    };

    let mut req = http.post(&url).body(raw_body);
    for (name, value) in headers.iter() {
        req = req.header(name, value);
    }

    let resp = req.send().await.map_err(|e| AppError::UpstreamError(e.to_string()))?;
    let status = resp.status();
    let resp_headers = resp.headers().clone();
    let body = resp.bytes().await.map_err(|e| AppError::UpstreamError(e.to_string()))?;
    Ok(UpstreamResponse { status, headers: resp_headers, body })
}

/// Extracts and normalizes usage from a non-streaming upstream response
/// body, defaulting missing fields to 0 (spec §4.5).
pub fn extract_usage(dialect: Dialect, body: &Value) -> Usage {
    let Some(usage) = body.get("usage") else { return Usage::default() };
    match dialect {
        Dialect::Anthropic => Usage {
            input_tokens: usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        },
        Dialect::OpenAi => Usage {
            input_tokens: usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        },
    }
}

pub fn usage_snapshot(usage: Usage, model: &str) -> String {
    json!({"input_tokens": usage.input_tokens, "output_tokens": usage.output_tokens, "model": model}).to_string()
}

/// Opens a streamed POST to the upstream, sets `Accept-Encoding: identity`
/// (spec §4.5: avoids compressed-SSE decoding problems), and returns an
/// axum response body that tees raw bytes to the client while accumulating
/// usage in the background; the debit fires once the upstream closes.
pub async fn stream_upstream_and_debit(
    http: &reqwest::Client,
    dialect: Dialect,
    mut headers: HeaderMap,
    raw_body: Bytes,
    ledger: Arc<Ledger>,
    pubkey: String,
    usdc_mint: String,
    model: String,
) -> AppResult<axum::body::Body> {
    headers.insert(axum::http::header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    let url = match dialect {
        Dialect::OpenAi => format!("{OPENAI_BASE}/v1/chat/completions"),
        Dialect::Anthropic => format!("{ANTHROPIC_BASE}/v1/messages"),
    };

    let mut req = http.post(&url).body(raw_body);
    for (name, value) in headers.iter() {
        req = req.header(name, value);
    }
    let resp = req.send().await.map_err(|e| AppError::UpstreamError(e.to_string()))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.bytes().await.unwrap_or_default();
        return Err(AppError::UpstreamError(format!("{status}: {}", String::from_utf8_lossy(&body))));
    }

    Ok(tee_stream_with_debit(resp, ledger, pubkey, usdc_mint, model))
}

/// Wraps a mock SSE body in the same tee-and-debit shape the real
/// streaming path uses, so mock and real requests debit identically.
pub fn mock_stream_with_debit(
    sse_body: String,
    ledger: Arc<Ledger>,
    pubkey: String,
    usdc_mint: String,
    model: String,
) -> axum::body::Body {
    use futures_util::stream;

    let chunk = Bytes::from(sse_body.into_bytes());
    let mut splitter = LineSplitter::new();
    let mut agg = UsageAggregator::new();
    for line in splitter.feed(&chunk) {
        if let Some(event) = parse_data_line(&line) {
            agg.observe(&event);
        }
    }
    let usage = agg.finish();

    let body_stream = stream::once(async move { Ok::<_, std::io::Error>(chunk) }).chain(stream::once(async move {
        let cost = pricing::cost_usdc(usage, &model);
        if let Err(e) = pricing::debit_agent(&ledger, &pubkey, &usdc_mint, cost, &usage_snapshot(usage, &model)).await {
            tracing::warn!(error = %e, "post-stream mock debit failed");
        }
        Ok::<_, std::io::Error>(Bytes::new())
    }));
    axum::body::Body::from_stream(body_stream)
}

fn tee_stream_with_debit(
    upstream: reqwest::Response,
    ledger: Arc<Ledger>,
    pubkey: String,
    usdc_mint: String,
    model: String,
) -> axum::body::Body {
    use futures_util::StreamExt;
    use futures_util::stream::unfold;

    struct State {
        stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<Bytes>> + Send>>,
        splitter: LineSplitter,
        agg: UsageAggregator,
    }

    let state = State { stream: Box::pin(upstream.bytes_stream()), splitter: LineSplitter::new(), agg: UsageAggregator::new() };

    let body_stream = unfold(Some(state), move |state| {
        let ledger = ledger.clone();
        let pubkey = pubkey.clone();
        let usdc_mint = usdc_mint.clone();
        let model = model.clone();
        async move {
            let mut state = state?;
            match state.stream.next().await {
                Some(Ok(chunk)) => {
                    for line in state.splitter.feed(&chunk) {
                        if let Some(event) = parse_data_line(&line) {
                            state.agg.observe(&event);
                        }
                    }
                    Some((Ok::<_, std::io::Error>(chunk), Some(state)))
                }
                Some(Err(e)) => Some((Err(std::io::Error::new(std::io::ErrorKind::Other, e)), None)),
                None => {
                    let usage = state.agg.finish();
                    let cost = pricing::cost_usdc(usage, &model);
                    if let Err(e) = pricing::debit_agent(&ledger, &pubkey, &usdc_mint, cost, &usage_snapshot(usage, &model)).await
                    {
                        tracing::warn!(error = %e, "post-stream debit failed");
                    }
                    None
                }
            }
        }
    });

    axum::body::Body::from_stream(body_stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_usage_defaults_missing_fields_to_zero() {
        let body = json!({});
        let usage = extract_usage(Dialect::OpenAi, &body);
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
    }

    #[test]
    fn extract_usage_normalizes_openai_field_names() {
        let body = json!({"usage": {"prompt_tokens": 10, "completion_tokens": 20}});
        let usage = extract_usage(Dialect::OpenAi, &body);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
    }

    #[test]
    fn mock_sse_body_contains_expected_event_names() {
        let body = mock_sse_body(Dialect::Anthropic, "claude-sonnet-4-5-20250929");
        assert!(body.contains("event: message_start"));
        assert!(body.contains("event: message_delta"));
    }
}
