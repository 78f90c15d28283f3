// src/models.rs
use std::fmt;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// Log index reserved for native-coin transfers. Token logs use 0..N, so a native
/// transfer and a token log from the same transaction never share a key.
pub const NATIVE_LOG_INDEX: i64 = -1;

/// An asset from the registry. `contract_address == None` is the chain's native coin.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub id: i64,
    pub chain: String,
    pub symbol: String,
    pub decimals: u32,
    pub contract_address: Option<Address>,
    pub enabled: bool,
}

impl Asset {
    pub fn is_native(&self) -> bool {
        self.contract_address.is_none()
    }
}

/// The owner of an active deposit address. Looked up by address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositAddress {
    pub user_id: i64,
}

/// A matched transfer ready to be credited.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateDeposit {
    pub chain: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: u64,
    pub from_address: Address,
    pub to_address: Address,
    pub user_id: i64,
    pub asset_id: i64,
    pub amount: Decimal,
    /// Credit provisionally behind a hold instead of confirming immediately.
    pub pending: bool,
}

impl CandidateDeposit {
    /// `tx_hash:log_index`, the identity used by reorg re-verification.
    pub fn key(&self) -> String {
        event_key(&self.tx_hash, self.log_index)
    }
}

pub fn event_key(tx_hash: &str, log_index: i64) -> String {
    format!("{}:{}", tx_hash.to_lowercase(), log_index)
}

/// Lowercase `0x`-prefixed hex, the form addresses are stored in.
pub fn address_hex(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_slice()))
}

/// What a crediting call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Credited { event_id: i64, journal_entry_id: i64 },
    /// The event already carries a journal entry (or vanished mid-transaction).
    Duplicate,
    /// The event was reverted by a reorg earlier and is never credited again.
    AlreadyReverted,
}

/// Lifecycle of a deposit event.
///
/// ```text
/// Seen ──► Pending(hold) ──► Confirmed
///   │           │                │
///   └───────────┴───► Reverted ◄─┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepositStatus {
    Seen,
    Pending { hold_id: i64 },
    Confirmed,
    Reverted { reason: String },
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Seen => "seen",
            DepositStatus::Pending { .. } => "pending",
            DepositStatus::Confirmed => "confirmed",
            DepositStatus::Reverted { .. } => "reverted",
        }
    }

    /// Rebuild the status from its stored columns.
    pub fn from_row(status: &str, hold_id: Option<i64>, reason: Option<String>) -> EngineResult<Self> {
        match (status, hold_id) {
            ("seen", _) => Ok(DepositStatus::Seen),
            ("pending", Some(hold_id)) => Ok(DepositStatus::Pending { hold_id }),
            ("pending", None) => Err(EngineError::InvariantViolation(
                "pending deposit event without a hold".to_string(),
            )),
            ("confirmed", _) => Ok(DepositStatus::Confirmed),
            ("reverted", _) => Ok(DepositStatus::Reverted {
                reason: reason.unwrap_or_default(),
            }),
            (other, _) => Err(EngineError::InvariantViolation(format!(
                "unknown deposit status '{}'",
                other
            ))),
        }
    }

    pub fn is_reverted(&self) -> bool {
        matches!(self, DepositStatus::Reverted { .. })
    }

    pub fn hold_id(&self) -> Option<i64> {
        match self {
            DepositStatus::Pending { hold_id } => Some(*hold_id),
            _ => None,
        }
    }

    /// The single place a status changes. Anything not listed is illegal.
    pub fn transition(&self, next: DepositStatus) -> EngineResult<DepositStatus> {
        use DepositStatus::*;

        let legal = matches!(
            (self, &next),
            (Seen, Pending { .. })
                | (Seen, Confirmed)
                | (Seen, Reverted { .. })
                | (Pending { .. }, Confirmed)
                | (Pending { .. }, Reverted { .. })
                | (Confirmed, Reverted { .. })
        );

        if legal {
            Ok(next)
        } else {
            Err(EngineError::IllegalTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored deposit event.
#[derive(Debug, Clone, PartialEq)]
pub struct DepositEvent {
    pub id: i64,
    pub chain: String,
    pub tx_hash: String,
    pub log_index: i64,
    pub block_number: u64,
    pub from_address: String,
    pub to_address: String,
    pub user_id: i64,
    pub asset_id: i64,
    pub amount: Decimal,
    pub status: DepositStatus,
    pub journal_entry_id: Option<i64>,
    pub credited_at: Option<String>,
    pub confirmed_at: Option<String>,
}

impl DepositEvent {
    pub fn key(&self) -> String {
        event_key(&self.tx_hash, self.log_index)
    }
}

/// Per-run counters reported by the orchestrator.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub from_block: u64,
    pub to_block: u64,
    pub cursor: u64,
    pub batches: u32,
    pub credited: u32,
    pub duplicates: u32,
    pub seen: u32,
    pub finalized: u32,
    pub reverted: u32,
    /// Last block credited provisionally above the safe tip, in pending mode.
    pub provisional_to: Option<u64>,
    pub budget_exhausted: bool,
}
