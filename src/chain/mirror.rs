//! Liquid Mirror (spec §4.4): discovery + polling + WebSocket subscription
//! workers that keep the ledger's deposit balances in sync with on-chain
//! accounts owned by the sovereign program, and perform first-deposit
//! token activation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::chain::account::parse_deposit_account;
use crate::ledger::{Ledger, TxType};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const DISCOVERY_EVERY_N_POLLS: u32 = 6;
const WS_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const GET_ACCOUNT_INFO_TIMEOUT: Duration = Duration::from_secs(10);
const GET_PROGRAM_ACCOUNTS_TIMEOUT: Duration = Duration::from_secs(30);

pub struct LiquidMirror {
    rpc_url: String,
    ws_url: String,
    program_id: String,
    ledger: Arc<Ledger>,
    http: reqwest::Client,
    watched: Mutex<HashMap<String, String>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct MirrorHandles {
    pub poll: JoinHandle<()>,
    pub ws: JoinHandle<()>,
}

impl LiquidMirror {
    pub fn new(rpc_url: String, ws_url: String, program_id: String, ledger: Arc<Ledger>) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            rpc_url,
            ws_url,
            program_id,
            ledger,
            http: reqwest::Client::new(),
            watched: Mutex::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Runs discovery once, then spawns the poll and WebSocket loops.
    pub async fn start(self: &Arc<Self>) -> MirrorHandles {
        self.discover_accounts().await;

        let poll_mirror = Arc::clone(self);
        let poll = tokio::spawn(async move { poll_mirror.poll_loop().await });

        let ws_mirror = Arc::clone(self);
        let ws = tokio::spawn(async move { ws_mirror.ws_loop().await });

        MirrorHandles { poll, ws }
    }

    /// Signals both loops to stop at their next suspension point. Callers
    /// should `.await` the `MirrorHandles` afterwards for a clean shutdown.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub async fn register_account(&self, account_addr: &str, owner: &str) {
        self.watched
            .lock()
            .await
            .insert(account_addr.to_string(), owner.to_string());
    }

    async fn rpc_call(&self, method: &str, params: Value, timeout: Duration) -> anyhow::Result<Value> {
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let resp = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<Value>().await?)
    }

    /// Issues `getProgramAccounts` for the sovereign program, records each
    /// returned account in the watch set, and reconciles it immediately.
    pub async fn discover_accounts(&self) {
        let result = self
            .rpc_call(
                "getProgramAccounts",
                json!([self.program_id, { "encoding": "base64", "commitment": "confirmed" }]),
                GET_PROGRAM_ACCOUNTS_TIMEOUT,
            )
            .await;

        let accounts = match result {
            Ok(value) => value
                .get("result")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "discover_accounts: RPC call failed");
                return;
            }
        };

        let mut discovered = 0usize;
        for account in &accounts {
            let Some(pubkey) = account.get("pubkey").and_then(|v| v.as_str()) else { continue };
            let Some(data_field) = account.pointer("/account/data/0").and_then(|v| v.as_str()) else { continue };
            let Ok(raw) = BASE64.decode(data_field) else { continue };
            let Some(parsed) = parse_deposit_account(&raw) else { continue };

            self.watched.lock().await.insert(pubkey.to_string(), parsed.owner.clone());
            discovered += 1;
            self.sync_balance(&parsed.owner, &parsed.mint, parsed.balance, &parsed.deposit_code)
                .await;
        }
        tracing::info!(count = discovered, "discovered deposit accounts");
    }

    async fn poll_loop(&self) {
        let mut backoff = POLL_INTERVAL;
        let mut poll_count: u32 = 0;
        let mut shutdown = self.shutdown_rx.clone();

        while !self.is_shutting_down() {
            poll_count += 1;
            let outcome: anyhow::Result<()> = async {
                if poll_count % DISCOVERY_EVERY_N_POLLS == 0 {
                    self.discover_accounts().await;
                }
                self.poll_all_accounts().await
            }
            .await;

            backoff = match outcome {
                Ok(()) => POLL_INTERVAL,
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "poll error, backing off");
                    (backoff * 2).min(MAX_BACKOFF)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn poll_all_accounts(&self) -> anyhow::Result<()> {
        let watched = self.watched.lock().await.clone();
        for (account_addr, _owner) in watched {
            let result = self
                .rpc_call(
                    "getAccountInfo",
                    json!([account_addr, { "encoding": "base64", "commitment": "confirmed" }]),
                    GET_ACCOUNT_INFO_TIMEOUT,
                )
                .await?;

            let Some(data_field) = result.pointer("/result/value/data/0").and_then(|v| v.as_str()) else {
                continue;
            };
            let Ok(raw) = BASE64.decode(data_field) else { continue };
            let Some(parsed) = parse_deposit_account(&raw) else { continue };
            self.sync_balance(&parsed.owner, &parsed.mint, parsed.balance, &parsed.deposit_code)
                .await;
        }
        Ok(())
    }

    async fn ws_loop(&self) {
        let mut backoff = Duration::from_secs(1);
        let mut shutdown = self.shutdown_rx.clone();

        while !self.is_shutting_down() {
            match self.ws_subscribe_and_listen().await {
                Ok(()) => backoff = Duration::from_secs(1),
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs = backoff.as_secs(), "websocket error, reconnecting");
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }

            if self.is_shutting_down() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn ws_subscribe_and_listen(&self) -> anyhow::Result<()> {
        let watched = self.watched.lock().await.clone();
        if watched.is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
            return Ok(());
        }

        let (mut ws, _resp) = tokio_tungstenite::connect_async(self.ws_url.as_str()).await?;
        tracing::info!("websocket connected");

        let mut sub_ids: HashMap<u64, String> = HashMap::new();
        for (idx, account_addr) in watched.keys().enumerate() {
            let req = json!({
                "jsonrpc": "2.0",
                "id": idx + 1,
                "method": "accountSubscribe",
                "params": [account_addr, { "encoding": "base64", "commitment": "confirmed" }],
            });
            ws.send(Message::Text(req.to_string().into())).await?;
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let confirm: Value = serde_json::from_str(text.as_str())?;
                if let Some(sub_id) = confirm.get("result").and_then(|v| v.as_u64()) {
                    sub_ids.insert(sub_id, account_addr.clone());
                }
            }
        }

        let mut shutdown = self.shutdown_rx.clone();
        loop {
            let next = tokio::select! {
                msg = tokio::time::timeout(WS_IDLE_TIMEOUT, ws.next()) => msg,
                _ = shutdown.changed() => return Ok(()),
            };

            let msg = match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(anyhow::anyhow!("websocket closed")),
                Err(_elapsed) => {
                    // Idle for WS_IDLE_TIMEOUT: ping to keep the connection alive.
                    ws.send(Message::Ping(Vec::new().into())).await?;
                    continue;
                }
            };

            let Message::Text(text) = msg else { continue };
            let Ok(notification) = serde_json::from_str::<Value>(text.as_str()) else { continue };
            if notification.get("method").and_then(|v| v.as_str()) != Some("accountNotification") {
                continue;
            }
            let Some(sub_id) = notification.pointer("/params/subscription").and_then(|v| v.as_u64()) else { continue };
            let Some(account_addr) = sub_ids.get(&sub_id) else { continue };
            let Some(data_field) = notification
                .pointer("/params/result/value/data/0")
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let Ok(raw) = BASE64.decode(data_field) else { continue };
            let Some(parsed) = parse_deposit_account(&raw) else { continue };
            tracing::info!(account = %account_addr, balance = parsed.balance, "websocket update");
            self.sync_balance(&parsed.owner, &parsed.mint, parsed.balance, &parsed.deposit_code)
                .await;
        }
    }

    /// The reconciliation kernel (spec §4.4): compares on-chain balance to
    /// the ledger's view, activates a pending token on first deposit, and
    /// appends an idempotent correction/deposit transaction when they
    /// differ.
    pub async fn sync_balance(&self, owner: &str, mint: &str, on_chain_balance: u64, deposit_code: &str) {
        let current = match self.ledger.get_balance(owner, mint).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "sync_balance: failed to read local balance");
                return;
            }
        };
        let delta = on_chain_balance as i64 - current;

        if delta > 0 && current == 0 && !deposit_code.is_empty() {
            match self.ledger.activate_token(deposit_code, owner).await {
                Ok(Some(api_token)) => {
                    tracing::info!(deposit_code, owner, api_token = &api_token[..8], "auto-activated token on first deposit");
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "activation failed"),
            }
        }

        if delta != 0 {
            let tx_type = if delta > 0 { TxType::MirrorDeposit } else { TxType::MirrorCorrection };
            let usage_json = json!({
                "on_chain_balance": on_chain_balance,
                "local_balance_before": current,
                "synced_at": chrono::Utc::now().to_rfc3339(),
            })
            .to_string();
            if let Err(e) = self
                .ledger
                .update_balance(owner, mint, delta, tx_type, Some(&usage_json))
                .await
            {
                tracing::warn!(error = %e, "sync_balance: failed to record transaction");
                return;
            }
            tracing::info!(owner, mint, current, on_chain_balance, delta, "balance synced");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use tempfile::NamedTempFile;

    fn test_ledger() -> (Arc<Ledger>, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        let ledger = Ledger::open(file.path().to_str().unwrap(), "USDC_TEST_MINT", 150.0).unwrap();
        (Arc::new(ledger), file)
    }

    #[tokio::test]
    async fn sync_balance_records_mirror_deposit_on_first_observation() {
        let (ledger, _f) = test_ledger();
        let mirror = LiquidMirror::new("http://test".into(), "ws://test".into(), "prog".into(), ledger.clone());

        mirror.sync_balance("owner-1", "USDC_TEST_MINT", 1_000_000, "").await;

        assert_eq!(ledger.get_balance("owner-1", "USDC_TEST_MINT").await.unwrap(), 1_000_000);
        let history = ledger.get_transaction_history("owner-1", None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, "MIRROR_DEPOSIT");
    }

    #[tokio::test]
    async fn sync_balance_records_correction_on_decrease() {
        let (ledger, _f) = test_ledger();
        let mirror = LiquidMirror::new("http://test".into(), "ws://test".into(), "prog".into(), ledger.clone());

        ledger
            .update_balance("owner-2", "USDC_TEST_MINT", 2_000_000, TxType::ManualSeed, None)
            .await
            .unwrap();
        mirror.sync_balance("owner-2", "USDC_TEST_MINT", 1_500_000, "").await;

        assert_eq!(ledger.get_balance("owner-2", "USDC_TEST_MINT").await.unwrap(), 1_500_000);
        let history = ledger.get_transaction_history("owner-2", None).await.unwrap();
        assert_eq!(history[0].kind, "MIRROR_CORRECTION");
        assert_eq!(history[0].amount, -500_000);
    }

    #[tokio::test]
    async fn sync_balance_is_idempotent_when_unchanged() {
        let (ledger, _f) = test_ledger();
        let mirror = LiquidMirror::new("http://test".into(), "ws://test".into(), "prog".into(), ledger.clone());

        mirror.sync_balance("owner-3", "USDC_TEST_MINT", 1_000_000, "").await;
        mirror.sync_balance("owner-3", "USDC_TEST_MINT", 1_000_000, "").await;

        let history = ledger.get_transaction_history("owner-3", None).await.unwrap();
        assert_eq!(history.len(), 1, "second identical sync should be a no-op");
    }

    #[tokio::test]
    async fn sync_balance_activates_pending_token_on_first_deposit() {
        let (ledger, _f) = test_ledger();
        let mirror = LiquidMirror::new("http://test".into(), "ws://test".into(), "prog".into(), ledger.clone());

        let (api_token, deposit_code) = ledger.create_api_token().await.unwrap();
        mirror.sync_balance("owner-4", "USDC_TEST_MINT", 5_000_000, &deposit_code).await;

        let resolved = ledger.get_pubkey_from_token(&api_token).await.unwrap();
        assert_eq!(resolved.as_deref(), Some("owner-4"));
    }

    #[tokio::test]
    async fn sync_balance_with_unknown_deposit_code_is_a_silent_no_op() {
        let (ledger, _f) = test_ledger();
        let mirror = LiquidMirror::new("http://test".into(), "ws://test".into(), "prog".into(), ledger.clone());

        mirror.sync_balance("owner-5", "USDC_TEST_MINT", 5_000_000, "NOSUCHCODE").await;
        assert_eq!(ledger.get_balance("owner-5", "USDC_TEST_MINT").await.unwrap(), 5_000_000);
    }

    #[tokio::test]
    async fn register_account_populates_watch_set() {
        let (ledger, _f) = test_ledger();
        let mirror = LiquidMirror::new("http://test".into(), "ws://test".into(), "prog".into(), ledger);
        mirror.register_account("acct1", "owner1").await;
        assert_eq!(mirror.watched.lock().await.get("acct1").map(String::as_str), Some("owner1"));
    }
}
