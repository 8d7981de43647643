//! The balance ledger (spec §4.1): durable, atomic, auditable.
//!
//! Single writer, guarded by a `tokio::sync::Mutex` around one
//! `rusqlite::Connection` opened in WAL mode, mirroring
//! `database.py`'s `get_db_connection()` / `update_balance()` shape,
//! but folding the overdraft check into the debit's own conditional
//! `UPDATE` per §9's recommended tightening.

pub mod models;

use std::collections::HashMap;

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{DEFAULT_USDC_MINT, SOL_MINT};
pub use models::{ApiTokenRow, BalanceRow, TokenConfigRow, TransactionRow, TxType};

pub struct Ledger {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminStats {
    pub total_deposits: i64,
    pub total_debits: i64,
    pub net_revenue: i64,
    pub active_agents: i64,
    pub registered_tokens: i64,
}

impl Ledger {
    /// Opens (creating if absent) the sqlite file at `path`, enables WAL,
    /// and ensures the four tables + seeded token config exist. Idempotent
    /// across restarts, matching `database.py::init_db`.
    pub fn open(path: &str, usdc_mint: &str, sol_usdc_rate: f64) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init_schema(&conn, usdc_mint, sol_usdc_rate)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection, usdc_mint: &str, sol_usdc_rate: f64) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                pubkey TEXT NOT NULL,
                token_mint TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (pubkey, token_mint)
            );
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_pubkey TEXT NOT NULL,
                token_mint TEXT NOT NULL,
                type TEXT NOT NULL,
                amount INTEGER NOT NULL,
                usage_json TEXT,
                timestamp TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS token_config (
                token_mint TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                decimals INTEGER NOT NULL,
                usd_rate REAL NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS api_tokens (
                api_token TEXT PRIMARY KEY,
                deposit_code TEXT UNIQUE NOT NULL,
                pubkey TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                activated_at TEXT
            );",
        )?;

        conn.execute(
            "INSERT OR IGNORE INTO token_config (token_mint, symbol, decimals, usd_rate) VALUES (?1, 'SOL', 9, ?2)",
            rusqlite::params![SOL_MINT, sol_usdc_rate],
        )?;
        let _ = DEFAULT_USDC_MINT; // default kept for reference; actual mint is configurable
        conn.execute(
            "INSERT OR IGNORE INTO token_config (token_mint, symbol, decimals, usd_rate) VALUES (?1, 'USDC', 6, 1.0)",
            rusqlite::params![usdc_mint],
        )?;
        Ok(())
    }

    pub async fn get_balance(&self, pubkey: &str, mint: &str) -> rusqlite::Result<i64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT balance FROM agents WHERE pubkey = ?1 AND token_mint = ?2",
            rusqlite::params![pubkey, mint],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(0),
            other => Err(other),
        })
    }

    /// All `(pubkey, mint)` balance rows for an agent, in full row form.
    pub async fn get_balance_rows(&self, pubkey: &str) -> rusqlite::Result<Vec<BalanceRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT pubkey, token_mint, balance, updated_at FROM agents WHERE pubkey = ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![pubkey], |row| {
            Ok(BalanceRow {
                pubkey: row.get(0)?,
                token_mint: row.get(1)?,
                balance: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mint-keyed balance map for an agent, the shape the `/balance` HTTP
    /// endpoint serializes. Built from [`Ledger::get_balance_rows`].
    pub async fn get_all_balances(&self, pubkey: &str) -> rusqlite::Result<HashMap<String, i64>> {
        let rows = self.get_balance_rows(pubkey).await?;
        Ok(rows.into_iter().map(|row| (row.token_mint, row.balance)).collect())
    }

    /// Applies an unconditional `balance += delta`, used for credits
    /// (deposits, mirror sync, manual seeds, resets). Inserts the row if
    /// absent and appends a transaction, all inside one write transaction.
    pub async fn update_balance(
        &self,
        pubkey: &str,
        mint: &str,
        delta: i64,
        tx_type: TxType,
        usage_json: Option<&str>,
    ) -> rusqlite::Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO agents (pubkey, token_mint, balance) VALUES (?1, ?2, 0)",
            rusqlite::params![pubkey, mint],
        )?;
        tx.execute(
            "UPDATE agents SET balance = balance + ?1, updated_at = CURRENT_TIMESTAMP
             WHERE pubkey = ?2 AND token_mint = ?3",
            rusqlite::params![delta, pubkey, mint],
        )?;
        tx.execute(
            "INSERT INTO transactions (agent_pubkey, token_mint, type, amount, usage_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![pubkey, mint, tx_type.as_str(), delta, usage_json],
        )?;
        tx.commit()
    }

    /// Conditional debit: `balance -= amount` only if `balance >= amount`,
    /// checked and applied inside a single transaction so a concurrent
    /// debit for the same pubkey cannot drive the balance negative (§9's
    /// recommended tightening of the overdraft race). Returns `true` if
    /// the debit was applied.
    pub async fn debit_balance(
        &self,
        pubkey: &str,
        mint: &str,
        amount: i64,
        usage_json: Option<&str>,
    ) -> rusqlite::Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO agents (pubkey, token_mint, balance) VALUES (?1, ?2, 0)",
            rusqlite::params![pubkey, mint],
        )?;
        let affected = tx.execute(
            "UPDATE agents SET balance = balance - ?1, updated_at = CURRENT_TIMESTAMP
             WHERE pubkey = ?2 AND token_mint = ?3 AND balance >= ?1",
            rusqlite::params![amount, pubkey, mint],
        )?;
        if affected == 0 {
            tx.rollback()?;
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO transactions (agent_pubkey, token_mint, type, amount, usage_json)
             VALUES (?1, ?2, 'DEBIT', ?3, ?4)",
            rusqlite::params![pubkey, mint, -amount, usage_json],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Credits a balance outside the normal deposit/debit flow, for local
    /// developer setup (`smoke-setup`) and manual test fixtures. A thin,
    /// explicitly-named wrapper over `update_balance` so the `MANUAL_SEED`
    /// transaction type always has its own call site.
    pub async fn manual_seed(&self, pubkey: &str, mint: &str, amount: i64) -> rusqlite::Result<()> {
        self.update_balance(pubkey, mint, amount, TxType::ManualSeed, None).await
    }

    /// Resets a `(pubkey, mint)` balance to zero, recording the delta as a
    /// `RESET` transaction. Used by admin tooling to clear a test agent's
    /// balance without deleting its row or history.
    pub async fn reset_balance(&self, pubkey: &str, mint: &str) -> rusqlite::Result<()> {
        let current = self.get_balance(pubkey, mint).await?;
        if current == 0 {
            return Ok(());
        }
        self.update_balance(pubkey, mint, -current, TxType::Reset, None).await
    }

    pub async fn get_transaction_history(
        &self,
        pubkey: &str,
        mint: Option<&str>,
    ) -> rusqlite::Result<Vec<TransactionRow>> {
        let conn = self.conn.lock().await;
        let mut rows_out = Vec::new();
        if let Some(mint) = mint {
            let mut stmt = conn.prepare(
                "SELECT id, agent_pubkey, token_mint, type, amount, usage_json, timestamp
                 FROM transactions WHERE agent_pubkey = ?1 AND token_mint = ?2 ORDER BY timestamp DESC, id DESC",
            )?;
            let rows = stmt.query_map(rusqlite::params![pubkey, mint], row_to_transaction)?;
            for row in rows {
                rows_out.push(row?);
            }
        } else {
            let mut stmt = conn.prepare(
                "SELECT id, agent_pubkey, token_mint, type, amount, usage_json, timestamp
                 FROM transactions WHERE agent_pubkey = ?1 ORDER BY timestamp DESC, id DESC",
            )?;
            let rows = stmt.query_map(rusqlite::params![pubkey], row_to_transaction)?;
            for row in rows {
                rows_out.push(row?);
            }
        }
        Ok(rows_out)
    }

    pub async fn get_exchange_rate(&self, mint: &str) -> rusqlite::Result<f64> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT usd_rate FROM token_config WHERE token_mint = ?1",
            rusqlite::params![mint],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(0.0),
            other => Err(other),
        })
    }

    pub async fn set_exchange_rate(&self, mint: &str, rate: f64) -> rusqlite::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE token_config SET usd_rate = ?1, updated_at = CURRENT_TIMESTAMP WHERE token_mint = ?2",
            rusqlite::params![rate, mint],
        )?;
        Ok(())
    }

    pub async fn pricing_table(&self) -> rusqlite::Result<Vec<TokenConfigRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT token_mint, symbol, decimals, usd_rate FROM token_config")?;
        let rows = stmt.query_map([], |row| {
            Ok(TokenConfigRow {
                token_mint: row.get(0)?,
                symbol: row.get(1)?,
                decimals: row.get(2)?,
                usd_rate: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mints a fresh `(api_token, deposit_code)` pair and inserts a pending
    /// row. `api_token` is a UUIDv4; `deposit_code` is an 8-character
    /// uppercase hex code, matching `database.py::create_api_token`.
    pub async fn create_api_token(&self) -> rusqlite::Result<(String, String)> {
        let api_token = Uuid::new_v4().to_string();
        let deposit_code = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO api_tokens (api_token, deposit_code) VALUES (?1, ?2)",
            rusqlite::params![api_token, deposit_code],
        )?;
        Ok((api_token, deposit_code))
    }

    /// Binds a pending deposit code to `pubkey`. Returns the API token on
    /// success, `None` if no row has that code (activation is a silent
    /// no-op per spec §4.4 step 3 / §7).
    pub async fn activate_token(&self, deposit_code: &str, pubkey: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().await;
        let api_token: Option<String> = conn
            .query_row(
                "SELECT api_token FROM api_tokens WHERE deposit_code = ?1",
                rusqlite::params![deposit_code],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(api_token) = api_token else {
            return Ok(None);
        };
        conn.execute(
            "UPDATE api_tokens SET pubkey = ?1, activated_at = CURRENT_TIMESTAMP WHERE deposit_code = ?2",
            rusqlite::params![pubkey, deposit_code],
        )?;
        Ok(Some(api_token))
    }

    /// Returns the token for `deposit_code` iff it is still pending
    /// (`pubkey IS NULL`) - an activated code is not findable here.
    pub async fn find_token_by_deposit_code(&self, deposit_code: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT api_token FROM api_tokens WHERE deposit_code = ?1 AND pubkey IS NULL",
            rusqlite::params![deposit_code],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
    }

    pub async fn get_pubkey_from_token(&self, api_token: &str) -> rusqlite::Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT pubkey FROM api_tokens WHERE api_token = ?1 AND pubkey IS NOT NULL",
            rusqlite::params![api_token],
            |row| row.get(0),
        )
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
    }

    /// The full api-token row for a deposit code, backing the supplemental
    /// `/v1/register/{deposit_code}/status` endpoint.
    pub async fn token_row_by_deposit_code(&self, deposit_code: &str) -> rusqlite::Result<Option<ApiTokenRow>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT api_token, deposit_code, pubkey, created_at, activated_at FROM api_tokens WHERE deposit_code = ?1",
            rusqlite::params![deposit_code],
            |row| {
                Ok(ApiTokenRow {
                    api_token: row.get(0)?,
                    deposit_code: row.get(1)?,
                    pubkey: row.get(2)?,
                    created_at: row.get(3)?,
                    activated_at: row.get(4)?,
                })
            },
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })
    }

    pub async fn admin_stats(&self) -> rusqlite::Result<AdminStats> {
        let conn = self.conn.lock().await;
        let total_deposits: i64 = conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM transactions WHERE type = 'MIRROR_DEPOSIT' AND amount > 0",
            [],
            |row| row.get(0),
        )?;
        let total_debits: i64 = conn.query_row(
            "SELECT COALESCE(SUM(-amount), 0) FROM transactions WHERE type = 'DEBIT'",
            [],
            |row| row.get(0),
        )?;
        let active_agents: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT pubkey) FROM agents WHERE balance > 0",
            [],
            |row| row.get(0),
        )?;
        let registered_tokens: i64 =
            conn.query_row("SELECT COUNT(*) FROM api_tokens", [], |row| row.get(0))?;
        Ok(AdminStats {
            total_deposits,
            total_debits,
            net_revenue: total_debits,
            active_agents,
            registered_tokens,
        })
    }
}

fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<TransactionRow> {
    Ok(TransactionRow {
        id: row.get(0)?,
        agent_pubkey: row.get(1)?,
        token_mint: row.get(2)?,
        kind: row.get(3)?,
        amount: row.get(4)?,
        usage_json: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Ledger {
        Ledger::open(":memory:", "USDC_TEST_MINT", 150.0).unwrap()
    }

    #[tokio::test]
    async fn balance_equals_sum_of_transactions() {
        let ledger = open();
        ledger.update_balance("p1", "USDC_TEST_MINT", 1_000, TxType::Deposit, None).await.unwrap();
        ledger.debit_balance("p1", "USDC_TEST_MINT", 300, None).await.unwrap();
        ledger.update_balance("p1", "USDC_TEST_MINT", 50, TxType::MirrorCorrection, None).await.unwrap();

        let balance = ledger.get_balance("p1", "USDC_TEST_MINT").await.unwrap();
        let history = ledger.get_transaction_history("p1", Some("USDC_TEST_MINT")).await.unwrap();
        let sum: i64 = history.iter().map(|t| t.amount).sum();
        assert_eq!(balance, sum);
        assert_eq!(balance, 750);
    }

    #[tokio::test]
    async fn debit_balance_refuses_to_overdraw() {
        let ledger = open();
        ledger.update_balance("p2", "USDC_TEST_MINT", 100, TxType::Deposit, None).await.unwrap();
        assert!(!ledger.debit_balance("p2", "USDC_TEST_MINT", 200, None).await.unwrap());
        assert_eq!(ledger.get_balance("p2", "USDC_TEST_MINT").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn debit_balance_at_exact_balance_succeeds_and_zeroes_out() {
        let ledger = open();
        ledger.update_balance("p3", "USDC_TEST_MINT", 500, TxType::Deposit, None).await.unwrap();
        assert!(ledger.debit_balance("p3", "USDC_TEST_MINT", 500, None).await.unwrap());
        assert_eq!(ledger.get_balance("p3", "USDC_TEST_MINT").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_balance_rows_reports_pubkey_and_updated_at() {
        let ledger = open();
        ledger.update_balance("p3b", "USDC_TEST_MINT", 42, TxType::Deposit, None).await.unwrap();

        let rows = ledger.get_balance_rows("p3b").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pubkey, "p3b");
        assert_eq!(rows[0].token_mint, "USDC_TEST_MINT");
        assert_eq!(rows[0].balance, 42);
        assert!(!rows[0].updated_at.is_empty());
    }

    #[tokio::test]
    async fn token_row_by_deposit_code_reflects_activation() {
        let ledger = open();
        let (api_token, deposit_code) = ledger.create_api_token().await.unwrap();

        let row = ledger.token_row_by_deposit_code(&deposit_code).await.unwrap().unwrap();
        assert_eq!(row.api_token, api_token);
        assert_eq!(row.pubkey, None);
        assert_eq!(row.activated_at, None);

        ledger.activate_token(&deposit_code, "p4b").await.unwrap();
        let row = ledger.token_row_by_deposit_code(&deposit_code).await.unwrap().unwrap();
        assert_eq!(row.pubkey.as_deref(), Some("p4b"));
        assert!(row.activated_at.is_some());

        assert!(ledger.token_row_by_deposit_code("NOSUCHCODE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn activation_is_one_way_and_binds_exactly_one_token() {
        let ledger = open();
        let (api_token, deposit_code) = ledger.create_api_token().await.unwrap();

        assert_eq!(ledger.find_token_by_deposit_code(&deposit_code).await.unwrap().as_deref(), Some(api_token.as_str()));
        assert_eq!(ledger.get_pubkey_from_token(&api_token).await.unwrap(), None);

        let activated = ledger.activate_token(&deposit_code, "p4").await.unwrap();
        assert_eq!(activated.as_deref(), Some(api_token.as_str()));

        // Once activated, the code is no longer "pending".
        assert_eq!(ledger.find_token_by_deposit_code(&deposit_code).await.unwrap(), None);
        assert_eq!(ledger.get_pubkey_from_token(&api_token).await.unwrap().as_deref(), Some("p4"));
    }

    #[tokio::test]
    async fn activate_token_with_unknown_code_is_a_silent_no_op() {
        let ledger = open();
        assert_eq!(ledger.activate_token("NOSUCHCODE", "p5").await.unwrap(), None);
    }

    #[tokio::test]
    async fn manual_seed_and_reset_round_trip() {
        let ledger = open();
        ledger.manual_seed("p6", "USDC_TEST_MINT", 10_000_000).await.unwrap();
        assert_eq!(ledger.get_balance("p6", "USDC_TEST_MINT").await.unwrap(), 10_000_000);

        ledger.reset_balance("p6", "USDC_TEST_MINT").await.unwrap();
        assert_eq!(ledger.get_balance("p6", "USDC_TEST_MINT").await.unwrap(), 0);

        let history = ledger.get_transaction_history("p6", Some("USDC_TEST_MINT")).await.unwrap();
        assert_eq!(history[0].kind, "RESET");
        assert_eq!(history[0].amount, -10_000_000);
    }

    #[tokio::test]
    async fn exchange_rate_defaults_seeded_at_open() {
        let ledger = open();
        assert_eq!(ledger.get_exchange_rate(SOL_MINT).await.unwrap(), 150.0);
        assert_eq!(ledger.get_exchange_rate("USDC_TEST_MINT").await.unwrap(), 1.0);
        ledger.set_exchange_rate(SOL_MINT, 200.0).await.unwrap();
        assert_eq!(ledger.get_exchange_rate(SOL_MINT).await.unwrap(), 200.0);
    }

    #[tokio::test]
    async fn admin_stats_aggregate_correctly() {
        let ledger = open();
        ledger.update_balance("p7", "USDC_TEST_MINT", 5_000_000, TxType::MirrorDeposit, None).await.unwrap();
        ledger.debit_balance("p7", "USDC_TEST_MINT", 1_000, None).await.unwrap();
        ledger.create_api_token().await.unwrap();

        let stats = ledger.admin_stats().await.unwrap();
        assert_eq!(stats.total_deposits, 5_000_000);
        assert_eq!(stats.total_debits, 1_000);
        assert_eq!(stats.net_revenue, 1_000);
        assert_eq!(stats.active_agents, 1);
        assert_eq!(stats.registered_tokens, 1);
    }
}
