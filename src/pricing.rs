//! Pricing & Cost Engine (spec §4.2): model → USDC-micro-unit rates,
//! and the USDC-first / SOL-fallback debit policy.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;

use crate::ledger::{Ledger, TxType};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelRate {
    pub input_micro_usdc_per_1k: u64,
    pub output_micro_usdc_per_1k: u64,
}

pub const DEFAULT_RATE: ModelRate = ModelRate {
    input_micro_usdc_per_1k: 5000,
    output_micro_usdc_per_1k: 15000,
};

/// Exact-match and prefix-match entries. Prefixes (`claude-sonnet-4-5-`,
/// `claude-opus-`, `claude-haiku-`) cover dated model-version suffixes the
/// way upstream vendors mint them (e.g. `claude-sonnet-4-5-20250929`).
static PRICING_TABLE: Lazy<HashMap<&'static str, ModelRate>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4o", ModelRate { input_micro_usdc_per_1k: 2500, output_micro_usdc_per_1k: 10000 }),
        ("gpt-5.2", ModelRate { input_micro_usdc_per_1k: 1500, output_micro_usdc_per_1k: 4500 }),
    ])
});

const PREFIX_RATES: &[(&str, ModelRate)] = &[
    ("claude-sonnet-4-5-", ModelRate { input_micro_usdc_per_1k: 3000, output_micro_usdc_per_1k: 15000 }),
    ("claude-opus-", ModelRate { input_micro_usdc_per_1k: 15000, output_micro_usdc_per_1k: 75000 }),
    ("claude-haiku-", ModelRate { input_micro_usdc_per_1k: 800, output_micro_usdc_per_1k: 4000 }),
];

pub fn rate_for_model(model: &str) -> ModelRate {
    if let Some(rate) = PRICING_TABLE.get(model) {
        return *rate;
    }
    for (prefix, rate) in PREFIX_RATES {
        if model.starts_with(prefix) {
            return *rate;
        }
    }
    DEFAULT_RATE
}

pub fn pricing_snapshot() -> HashMap<&'static str, ModelRate> {
    let mut out: HashMap<&'static str, ModelRate> = PRICING_TABLE.clone();
    for (prefix, rate) in PREFIX_RATES {
        out.insert(prefix, *rate);
    }
    out
}

/// Real (or mocked) upstream token usage, normalized across dialects.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// `cost_usdc(usage, model)`, floor(in*rate_in/1000 + out*rate_out/1000)
/// in USDC smallest units (spec §4.2).
pub fn cost_usdc(usage: Usage, model: &str) -> u64 {
    let rate = rate_for_model(model);
    let input_cost = usage.input_tokens * rate.input_micro_usdc_per_1k;
    let output_cost = usage.output_tokens * rate.output_micro_usdc_per_1k;
    (input_cost + output_cost) / 1000
}

#[derive(Debug, thiserror::Error)]
pub enum DebitError {
    #[error("insufficient deposit balance")]
    InsufficientBalance,
    #[error(transparent)]
    Ledger(#[from] rusqlite::Error),
}

/// USDC-first / SOL-fallback debit (spec §4.2). Returns the mint that was
/// actually debited.
pub async fn debit_agent(
    ledger: &Ledger,
    pubkey: &str,
    usdc_mint: &str,
    cost: u64,
    usage_json: &str,
) -> Result<String, DebitError> {
    if cost == 0 {
        // Nothing owed; still record zero-cost requests against USDC so the
        // transaction log reflects the call.
        return debit_mint(ledger, pubkey, usdc_mint, 0, usage_json).await;
    }

    let usdc_balance = ledger.get_balance(pubkey, usdc_mint).await?;
    if usdc_balance >= cost as i64 {
        return debit_mint(ledger, pubkey, usdc_mint, cost, usage_json).await;
    }

    let sol_rate = ledger.get_exchange_rate(crate::config::SOL_MINT).await?;
    if sol_rate > 0.0 {
        // cost_usdc is in USDC-micro (10^-6 USDC); SOL lamports are 10^-9 SOL.
        // cost_sol_lamports = ceil(cost_usdc * 10^3 / sol_rate).
        let cost_sol = ((cost as f64) * 1000.0 / sol_rate).ceil() as i64;
        let sol_balance = ledger.get_balance(pubkey, crate::config::SOL_MINT).await?;
        if sol_balance >= cost_sol {
            return debit_mint(ledger, pubkey, crate::config::SOL_MINT, cost_sol as u64, usage_json).await;
        }
    }

    Err(DebitError::InsufficientBalance)
}

async fn debit_mint(
    ledger: &Ledger,
    pubkey: &str,
    mint: &str,
    amount: u64,
    usage_json: &str,
) -> Result<String, DebitError> {
    let applied = ledger
        .debit_balance(pubkey, mint, amount as i64, Some(usage_json))
        .await?;
    if applied {
        Ok(mint.to_string())
    } else {
        Err(DebitError::InsufficientBalance)
    }
}

/// Convenience wrapper for non-debit credits (deposits, seeds, resets) that
/// go through the pricing module's `Usage`/JSON conventions.
pub async fn credit(
    ledger: &Ledger,
    pubkey: &str,
    mint: &str,
    amount: i64,
    tx_type: TxType,
    usage_json: Option<&str>,
) -> rusqlite::Result<()> {
    ledger.update_balance(pubkey, mint, amount, tx_type, usage_json).await
}
