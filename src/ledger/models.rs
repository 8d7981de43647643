//! Row types for the four ledger tables (spec §3).

use serde::Serialize;

/// One `(pubkey, token_mint)` balance row.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceRow {
    pub pubkey: String,
    pub token_mint: String,
    pub balance: i64,
    pub updated_at: String,
}

/// An append-only ledger entry.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRow {
    pub id: i64,
    pub agent_pubkey: String,
    pub token_mint: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: i64,
    pub usage_json: Option<String>,
    pub timestamp: String,
}

/// Per-mint pricing/decimals metadata.
#[derive(Debug, Clone, Serialize)]
pub struct TokenConfigRow {
    pub token_mint: String,
    pub symbol: String,
    pub decimals: i64,
    pub usd_rate: f64,
}

/// An API-token / deposit-code pair.
#[derive(Debug, Clone, Serialize)]
pub struct ApiTokenRow {
    pub api_token: String,
    pub deposit_code: String,
    pub pubkey: Option<String>,
    pub created_at: String,
    pub activated_at: Option<String>,
}

/// The transaction `type` enum named in spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Deposit,
    Debit,
    MirrorDeposit,
    MirrorCorrection,
    ManualSeed,
    Reset,
}

impl TxType {
    pub fn as_str(self) -> &'static str {
        match self {
            TxType::Deposit => "DEPOSIT",
            TxType::Debit => "DEBIT",
            TxType::MirrorDeposit => "MIRROR_DEPOSIT",
            TxType::MirrorCorrection => "MIRROR_CORRECTION",
            TxType::ManualSeed => "MANUAL_SEED",
            TxType::Reset => "RESET",
        }
    }
}

impl std::fmt::Display for TxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
