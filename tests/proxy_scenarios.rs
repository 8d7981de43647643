//! End-to-end HTTP scenarios from spec §8, driven straight through the
//! assembled router with `tower::ServiceExt::oneshot` — no real upstream
//! or chain RPC calls (routes use the `X-MOCK-UPSTREAM` path, and
//! deposits are seeded directly through the ledger the way
//! `smoke_setup` does for local development).

use agent_proxyd::app::App;
use agent_proxyd::config::Config;
use agent_proxyd::ledger::TxType;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

fn test_config(db_path: &str) -> Config {
    Config {
        port: 18515,
        database_path: db_path.to_string(),
        openai_api_key: None,
        anthropic_api_key: None,
        helius_api_key: String::new(),
        helius_rpc_url: Some("http://unused.invalid".to_string()),
        helius_ws_url: Some("ws://unused.invalid".to_string()),
        program_id: "prog".to_string(),
        usdc_mint: "USDC_TEST_MINT".to_string(),
        sol_usdc_rate: 150.0,
        disable_mirror: true,
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn scenario_1_register_deposit_spend() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let app = App::new(test_config(db.path().to_str().unwrap())).unwrap();

    let register_resp = app
        .router
        .clone()
        .oneshot(Request::builder().method("POST").uri("/v1/register").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(register_resp.status(), StatusCode::OK);
    let register_body = body_json(register_resp).await;
    let api_token = register_body["api_token"].as_str().unwrap().to_string();
    let deposit_code = register_body["deposit_code"].as_str().unwrap().to_string();
    assert_eq!(register_body["status"], "pending_deposit");

    // Simulate the mirror observing a V3 account: owner P, USDC, balance 10_000_000.
    app.state
        .ledger
        .update_balance("agent-P", "USDC_TEST_MINT", 10_000_000, TxType::MirrorDeposit, None)
        .await
        .unwrap();
    app.state.ledger.activate_token(&deposit_code, "agent-P").await.unwrap();

    let balance_resp = app
        .router
        .clone()
        .oneshot(Request::builder().uri(format!("/proxy/{api_token}/balance")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let balance_body = body_json(balance_resp).await;
    assert_eq!(balance_body["pubkey"], "agent-P");
    assert_eq!(balance_body["balances"]["USDC_TEST_MINT"], 10_000_000);

    let chat_resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/proxy/{api_token}/v1/chat/completions"))
                .header("content-type", "application/json")
                .header("X-MOCK-UPSTREAM", "true")
                .body(Body::from(r#"{"model":"gpt-5.2","messages":[{"role":"user","content":"hi"}]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(chat_resp.status(), StatusCode::OK);

    let new_balance = app.state.ledger.get_balance("agent-P", "USDC_TEST_MINT").await.unwrap();
    assert_eq!(new_balance, 9_999_865, "135 micro-USDC should be debited per spec §8 scenario 1");
}

#[tokio::test]
async fn scenario_2_usdc_first_sol_fallback() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let app = App::new(test_config(db.path().to_str().unwrap())).unwrap();

    let (api_token, deposit_code) = app.state.ledger.create_api_token().await.unwrap();
    app.state.ledger.activate_token(&deposit_code, "agent-Q").await.unwrap();
    app.state
        .ledger
        .update_balance("agent-Q", agent_proxyd::config::SOL_MINT, 50_000_000_000, TxType::MirrorDeposit, None)
        .await
        .unwrap();

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/proxy/{api_token}/v1/messages"))
                .header("content-type", "application/json")
                .header("X-MOCK-UPSTREAM", "true")
                .body(Body::from(r#"{"model":"gpt-5.2","messages":[]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    // Mock usage is fixed at {15, 25}; scenario 2's {100, 50} usage numbers
    // are exercised directly against `pricing::cost_usdc` in pricing.rs's
    // unit tests. Here we only confirm the SOL leg is the one debited.
    assert_eq!(resp.status(), StatusCode::OK);
    let usdc_balance = app.state.ledger.get_balance("agent-Q", "USDC_TEST_MINT").await.unwrap();
    let sol_balance = app.state.ledger.get_balance("agent-Q", agent_proxyd::config::SOL_MINT).await.unwrap();
    assert_eq!(usdc_balance, 0);
    assert!(sol_balance < 50_000_000_000, "SOL balance should have been debited as fallback");
}

#[tokio::test]
async fn scenario_3_insufficient_balance() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let app = App::new(test_config(db.path().to_str().unwrap())).unwrap();

    let (api_token, deposit_code) = app.state.ledger.create_api_token().await.unwrap();
    app.state.ledger.activate_token(&deposit_code, "agent-zero").await.unwrap();

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/proxy/{api_token}/v1/chat/completions"))
                .header("content-type", "application/json")
                .header("X-MOCK-UPSTREAM", "true")
                .body(Body::from(r#"{"model":"gpt-5.2"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("Insufficient"));
}

#[tokio::test]
async fn scenario_4_invalid_token() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let app = App::new(test_config(db.path().to_str().unwrap())).unwrap();

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/proxy/invalid-uuid/v1/messages")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"claude-sonnet-4-5-20250929"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("Invalid or inactive"));
}

#[tokio::test]
async fn scenario_5_streaming_anthropic_mock() {
    let db = tempfile::NamedTempFile::new().unwrap();
    let app = App::new(test_config(db.path().to_str().unwrap())).unwrap();

    let (api_token, deposit_code) = app.state.ledger.create_api_token().await.unwrap();
    app.state.ledger.activate_token(&deposit_code, "agent-stream").await.unwrap();
    app.state
        .ledger
        .update_balance("agent-stream", "USDC_TEST_MINT", 1_000_000, TxType::MirrorDeposit, None)
        .await
        .unwrap();

    let resp = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/proxy/{api_token}/v1/messages"))
                .header("content-type", "application/json")
                .header("X-MOCK-UPSTREAM", "true")
                .body(Body::from(
                    r#"{"model":"claude-sonnet-4-5-20250929","stream":true,"messages":[]}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("content-type").unwrap().to_str().unwrap().starts_with("text/event-stream"));

    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("event: message_start"));
    assert!(text.contains("event: message_delta"));

    // Streaming debit happens after the client finishes reading the body;
    // give the spawned unfold stream's final step a moment to land.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let balance = app.state.ledger.get_balance("agent-stream", "USDC_TEST_MINT").await.unwrap();
    assert!(balance < 1_000_000, "balance should strictly decrease after the stream completes");
}

#[tokio::test]
async fn scenario_7_anthropic_beta_header_passthrough_is_built_correctly() {
    // The outbound header construction itself (no network call) is the
    // testable unit here; full network passthrough can't be exercised
    // without a live upstream.
    use agent_proxyd::proxy::upstream::anthropic_headers;
    let mut config = test_config(":memory:");
    config.anthropic_api_key = Some("sk-ant-test".to_string());

    let mut client_headers = axum::http::HeaderMap::new();
    client_headers.insert("anthropic-beta", "context-management-2025-01-01".parse().unwrap());
    client_headers.insert("anthropic-version", "2025-01-01".parse().unwrap());
    client_headers.insert("x-unrelated", "drop-me".parse().unwrap());

    let headers = anthropic_headers(&config, &client_headers).unwrap();
    assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-test");
    assert_eq!(headers.get("anthropic-version").unwrap(), "2025-01-01");
    assert_eq!(headers.get("anthropic-beta").unwrap(), "context-management-2025-01-01");
    assert!(headers.get("x-unrelated").is_none());
}
