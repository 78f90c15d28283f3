//! The atomic units that move money: crediting a deposit and reversing one.

use rusqlite::{Connection, TransactionBehavior};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::directory;
use crate::error::{EngineError, EngineResult};
use crate::events;
use crate::ledger;
use crate::models::{CandidateDeposit, CreditOutcome, DepositStatus};
use crate::notify;

pub const DEPOSIT_CREDIT: &str = "deposit_credit";
pub const DEPOSIT_REVERSAL: &str = "deposit_reversal";

fn validate(conn: &Connection, caps: &Capabilities, c: &CandidateDeposit) -> EngineResult<()> {
    if c.amount <= Decimal::ZERO {
        return Err(EngineError::InvalidAmount(format!(
            "{} for {}:{}",
            c.amount, c.tx_hash, c.log_index
        )));
    }
    if c.pending && !caps.pending_credits {
        return Err(EngineError::Config(
            "pending credit requested but the schema has no hold support".to_string(),
        ));
    }
    match directory::enabled_asset(conn, c.asset_id)? {
        Some(asset) if asset.chain == c.chain => Ok(()),
        _ => Err(EngineError::UnknownAsset(c.asset_id)),
    }
}

/// Credit a matched transfer exactly once.
///
/// The event row's `journal_entry_id` is the only idempotency guard: once set,
/// every later delivery of the same `(chain, tx_hash, log_index)` is a no-op.
pub fn credit_deposit(conn: &mut Connection, caps: &Capabilities, c: &CandidateDeposit) -> EngineResult<CreditOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    validate(&tx, caps, c)?;

    events::insert_seen(&tx, c)?;
    let Some(event) = events::find(&tx, &c.chain, &c.tx_hash, c.log_index)? else {
        debug!("event {} vanished mid-transaction, treating as duplicate", c.key());
        return Ok(CreditOutcome::Duplicate);
    };
    if event.journal_entry_id.is_some() {
        debug!("event {} already credited", c.key());
        return Ok(CreditOutcome::Duplicate);
    }
    if event.status.is_reverted() {
        warn!("event {} was reverted earlier, not crediting again", c.key());
        return Ok(CreditOutcome::AlreadyReverted);
    }

    events::refresh_attribution(&tx, event.id, c)?;

    let user_account = ledger::user_account(&tx, c.user_id, c.asset_id)?;
    let system_account = ledger::system_account(&tx, c.asset_id)?;
    let entry_id = ledger::post_entry(
        &tx,
        DEPOSIT_CREDIT,
        &format!("deposit:{}", event.id),
        &json!({
            "deposit_event_id": event.id,
            "chain": c.chain,
            "tx_hash": c.tx_hash.to_lowercase(),
            "log_index": c.log_index,
            "block_number": c.block_number,
        }),
        &ledger::credit_lines(user_account, system_account, c.asset_id, c.amount),
    )?;

    let next = if c.pending {
        let hold_id = ledger::create_hold(
            &tx,
            user_account,
            c.asset_id,
            c.amount,
            &format!("pending deposit {}", event.id),
        )?;
        DepositStatus::Pending { hold_id }
    } else {
        DepositStatus::Confirmed
    };
    let next = event.status.transition(next)?;
    events::store_status(&tx, event.id, &next)?;
    events::link_journal_entry(&tx, event.id, entry_id)?;

    notify::enqueue(
        &tx,
        caps,
        c.user_id,
        notify::DEPOSIT_CREDITED,
        &json!({
            "deposit_event_id": event.id,
            "asset_id": c.asset_id,
            "amount": c.amount.to_string(),
            "tx_hash": c.tx_hash.to_lowercase(),
            "status": next.as_str(),
        }),
    )?;

    tx.commit()?;

    info!(
        "💰 Credited {} (asset {}) to user {} from {} [{}]",
        c.amount,
        c.asset_id,
        c.user_id,
        c.key(),
        next
    );

    Ok(CreditOutcome::Credited {
        event_id: event.id,
        journal_entry_id: entry_id,
    })
}

/// Record an unconfirmed transfer without crediting it. Returns whether a row was added.
pub fn record_seen(conn: &mut Connection, caps: &Capabilities, c: &CandidateDeposit) -> EngineResult<bool> {
    let seen = CandidateDeposit {
        pending: false,
        ..c.clone()
    };
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    validate(&tx, caps, &seen)?;
    let inserted = events::insert_seen(&tx, &seen)?;
    tx.commit()?;
    Ok(inserted)
}

/// Undo a deposit whose transfer is no longer on chain.
///
/// Returns `false` when the event is missing or already reverted. A journaled
/// event gets a compensating entry even if that drives the user negative; the
/// notification says so.
pub fn reverse_deposit(conn: &mut Connection, caps: &Capabilities, event_id: i64, reason: &str) -> EngineResult<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(event) = events::get(&tx, event_id)? else {
        return Ok(false);
    };
    if event.status.is_reverted() {
        return Ok(false);
    }

    let next = event.status.transition(DepositStatus::Reverted {
        reason: reason.to_string(),
    })?;

    if let Some(hold_id) = event.status.hold_id() {
        if !ledger::release_hold(&tx, hold_id)? {
            return Err(EngineError::InvariantViolation(format!(
                "hold {} of pending event {} is not active",
                hold_id, event.id
            )));
        }
    }

    if let Some(original_entry) = event.journal_entry_id {
        let user_account = ledger::user_account(&tx, event.user_id, event.asset_id)?;
        let system_account = ledger::system_account(&tx, event.asset_id)?;
        let reversal_entry = ledger::post_entry(
            &tx,
            DEPOSIT_REVERSAL,
            &format!("reversal:{}", event.id),
            &json!({
                "deposit_event_id": event.id,
                "reverses_entry_id": original_entry,
                "reason": reason,
            }),
            &ledger::debit_lines(user_account, system_account, event.asset_id, event.amount),
        )?;

        let balance_after = ledger::posted_balance(&tx, user_account)?;
        let negative = balance_after < Decimal::ZERO;
        if negative {
            warn!(
                "⚠️ Reversal of event {} leaves user {} at {} (asset {})",
                event.id, event.user_id, balance_after, event.asset_id
            );
        }

        notify::enqueue(
            &tx,
            caps,
            event.user_id,
            notify::DEPOSIT_REVERTED,
            &json!({
                "deposit_event_id": event.id,
                "asset_id": event.asset_id,
                "amount": event.amount.to_string(),
                "tx_hash": event.tx_hash,
                "reason": reason,
                "reversal_entry_id": reversal_entry,
                "balance_after": balance_after.to_string(),
                "negative_balance": negative,
            }),
        )?;
    }

    events::store_status(&tx, event.id, &next)?;
    tx.commit()?;

    warn!("↩️ Reverted deposit event {} ({}): {}", event.id, event.key(), reason);
    Ok(true)
}

/// Release the hold of a pending event and confirm it. Returns `false` if it is no longer pending.
pub fn finalize_deposit(conn: &mut Connection, caps: &Capabilities, event_id: i64) -> EngineResult<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let Some(event) = events::get(&tx, event_id)? else {
        return Ok(false);
    };
    let Some(hold_id) = event.status.hold_id() else {
        return Ok(false);
    };

    if !ledger::release_hold(&tx, hold_id)? {
        return Err(EngineError::InvariantViolation(format!(
            "hold {} of pending event {} is not active",
            hold_id, event.id
        )));
    }
    let next = event.status.transition(DepositStatus::Confirmed)?;
    events::store_status(&tx, event.id, &next)?;

    notify::enqueue(
        &tx,
        caps,
        event.user_id,
        notify::DEPOSIT_CONFIRMED,
        &json!({
            "deposit_event_id": event.id,
            "asset_id": event.asset_id,
            "amount": event.amount.to_string(),
            "tx_hash": event.tx_hash,
        }),
    )?;

    tx.commit()?;
    Ok(true)
}
