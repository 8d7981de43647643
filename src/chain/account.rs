//! On-chain deposit-account parser (spec §4.3): disambiguates three
//! fixed-layout versions by total byte length, after verifying the shared
//! 8-byte discriminator.
//!
//! Pure, no I/O: callers feed it raw account bytes (already base64
//! decoded) from either the discovery RPC call or a WebSocket
//! notification.

use borsh::BorshDeserialize;
use solana_pubkey::Pubkey;

pub const DISCRIMINATOR: [u8; 8] = [0xD8, 0x92, 0x6F, 0x2A, 0x5C, 0x08, 0x4A, 0x3E];

const LEGACY_LEN: usize = 48;
const V2_LEN: usize = 80;
const V3_LEN: usize = 88;

/// A parsed deposit account, normalized to the fields the liquid mirror
/// needs regardless of which on-chain layout produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositAccount {
    pub owner: String,
    pub mint: String,
    pub deposit_code: String,
    pub balance: u64,
}

#[derive(BorshDeserialize)]
struct LegacyLayout {
    discriminator: [u8; 8],
    owner: [u8; 32],
    balance: u64,
}

#[derive(BorshDeserialize)]
struct V2Layout {
    discriminator: [u8; 8],
    owner: [u8; 32],
    mint: [u8; 32],
    balance: u64,
}

#[derive(BorshDeserialize)]
struct V3Layout {
    discriminator: [u8; 8],
    owner: [u8; 32],
    mint: [u8; 32],
    deposit_code: [u8; 8],
    balance: u64,
}

fn sol_mint() -> String {
    crate::config::SOL_MINT.to_string()
}

/// Parses raw deposit-account bytes. Returns `None` for anything shorter
/// than the legacy layout, a bad discriminator, or a balance exceeding
/// `i64::MAX` (the ledger's signed 64-bit column).
pub fn parse_deposit_account(data: &[u8]) -> Option<DepositAccount> {
    if data.len() < LEGACY_LEN || data[..8] != DISCRIMINATOR {
        return None;
    }

    let parsed = if data.len() >= V3_LEN {
        let layout = V3Layout::try_from_slice(&data[..V3_LEN]).ok()?;
        DepositAccount {
            owner: Pubkey::from(layout.owner).to_string(),
            mint: Pubkey::from(layout.mint).to_string(),
            deposit_code: decode_deposit_code(&layout.deposit_code),
            balance: layout.balance,
        }
    } else if data.len() >= V2_LEN {
        let layout = V2Layout::try_from_slice(&data[..V2_LEN]).ok()?;
        DepositAccount {
            owner: Pubkey::from(layout.owner).to_string(),
            mint: Pubkey::from(layout.mint).to_string(),
            deposit_code: String::new(),
            balance: layout.balance,
        }
    } else {
        let layout = LegacyLayout::try_from_slice(&data[..LEGACY_LEN]).ok()?;
        DepositAccount {
            owner: Pubkey::from(layout.owner).to_string(),
            mint: sol_mint(),
            deposit_code: String::new(),
            balance: layout.balance,
        }
    };

    if parsed.balance > i64::MAX as u64 {
        return None;
    }
    Some(parsed)
}

fn decode_deposit_code(raw: &[u8; 8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
