//! URL-embedded token auth and balance admission (spec §4.5).

use crate::error::{AppError, AppResult};
use crate::ledger::Ledger;

/// Resolves `api_token` to a pubkey. A null resolution is the only
/// "invalid token" signal the ledger gives us, no signature, no
/// expiry, the URL token is the capability.
pub async fn resolve_token(ledger: &Ledger, api_token: &str) -> AppResult<String> {
    ledger
        .get_pubkey_from_token(api_token)
        .await?
        .ok_or(AppError::InvalidToken)
}

/// Admits the request iff the sum of all mint balances for `pubkey` is
/// strictly positive.
pub async fn admit(ledger: &Ledger, pubkey: &str) -> AppResult<()> {
    let balances = ledger.get_all_balances(pubkey).await?;
    let total: i64 = balances.values().sum();
    if total <= 0 {
        return Err(AppError::InsufficientBalance);
    }
    Ok(())
}
