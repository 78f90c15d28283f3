//! Double-entry ledger primitives.
//!
//! Every posting goes through [`post_entry`], which refuses entries whose lines
//! do not sum to exactly zero or that have fewer than two lines.

use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::db::parse_amount;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq)]
pub struct JournalLine {
    pub account_id: i64,
    pub asset_id: i64,
    pub amount: Decimal,
}

impl JournalLine {
    pub fn new(account_id: i64, asset_id: i64, amount: Decimal) -> Self {
        Self {
            account_id,
            asset_id,
            amount,
        }
    }
}

/// Balanced user/omnibus pair: the user receives `amount`, the omnibus gives it.
pub fn credit_lines(user_account: i64, system_account: i64, asset_id: i64, amount: Decimal) -> [JournalLine; 2] {
    [
        JournalLine::new(user_account, asset_id, amount),
        JournalLine::new(system_account, asset_id, -amount),
    ]
}

/// The mirror image of [`credit_lines`].
pub fn debit_lines(user_account: i64, system_account: i64, asset_id: i64, amount: Decimal) -> [JournalLine; 2] {
    [
        JournalLine::new(user_account, asset_id, -amount),
        JournalLine::new(system_account, asset_id, amount),
    ]
}

/// The user's account for `asset_id`, created on first use.
pub fn user_account(conn: &Connection, user_id: i64, asset_id: i64) -> EngineResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO ledger_accounts (user_id, asset_id, is_system) VALUES (?1, ?2, 0)",
        params![user_id, asset_id],
    )?;
    let id = conn.query_row(
        "SELECT id FROM ledger_accounts WHERE user_id = ?1 AND asset_id = ?2 AND is_system = 0",
        params![user_id, asset_id],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// The omnibus account for `asset_id`, created on first use.
pub fn system_account(conn: &Connection, asset_id: i64) -> EngineResult<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO ledger_accounts (user_id, asset_id, is_system) VALUES (NULL, ?1, 1)",
        [asset_id],
    )?;
    let id = conn.query_row(
        "SELECT id FROM ledger_accounts WHERE asset_id = ?1 AND is_system = 1",
        [asset_id],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Write a journal entry and its lines. Must run inside the caller's transaction.
pub fn post_entry(
    conn: &Connection,
    entry_type: &str,
    reference: &str,
    metadata: &Value,
    lines: &[JournalLine],
) -> EngineResult<i64> {
    if lines.len() < 2 {
        return Err(EngineError::InvariantViolation(format!(
            "journal entry {} has {} line(s), need at least 2",
            reference,
            lines.len()
        )));
    }
    let total: Decimal = lines.iter().map(|l| l.amount).sum();
    if !total.is_zero() {
        return Err(EngineError::InvariantViolation(format!(
            "journal entry {} is unbalanced by {}",
            reference, total
        )));
    }

    let entry_id: i64 = conn.query_row(
        "INSERT INTO journal_entries (entry_type, reference, metadata) VALUES (?1, ?2, ?3) RETURNING id",
        params![entry_type, reference, metadata.to_string()],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO journal_lines (entry_id, account_id, asset_id, amount) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for line in lines {
        stmt.execute(params![entry_id, line.account_id, line.asset_id, line.amount.to_string()])?;
    }

    Ok(entry_id)
}

pub fn entry_lines(conn: &Connection, entry_id: i64) -> EngineResult<Vec<JournalLine>> {
    let mut stmt = conn.prepare(
        "SELECT account_id, asset_id, amount FROM journal_lines WHERE entry_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([entry_id], |r| {
        Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (account_id, asset_id, amount) = row?;
        out.push(JournalLine::new(account_id, asset_id, parse_amount(&amount)?));
    }
    Ok(out)
}

/// Sum of posted lines. SQL sums over TEXT would go through floats, so add in Rust.
pub fn posted_balance(conn: &Connection, account_id: i64) -> EngineResult<Decimal> {
    let mut stmt = conn.prepare_cached("SELECT amount FROM journal_lines WHERE account_id = ?1")?;
    let rows = stmt.query_map([account_id], |r| r.get::<_, String>(0))?;
    let mut total = Decimal::ZERO;
    for row in rows {
        total += parse_amount(&row?)?;
    }
    Ok(total)
}

/// Posted balance minus what active holds still reserve.
pub fn available_balance(conn: &Connection, account_id: i64) -> EngineResult<Decimal> {
    let mut stmt = conn.prepare_cached(
        "SELECT remaining_amount FROM holds WHERE account_id = ?1 AND status = 'active'",
    )?;
    let rows = stmt.query_map([account_id], |r| r.get::<_, String>(0))?;
    let mut held = Decimal::ZERO;
    for row in rows {
        held += parse_amount(&row?)?;
    }
    Ok(posted_balance(conn, account_id)? - held)
}

pub fn create_hold(conn: &Connection, account_id: i64, asset_id: i64, amount: Decimal, reason: &str) -> EngineResult<i64> {
    if amount <= Decimal::ZERO {
        return Err(EngineError::InvariantViolation(format!(
            "hold amount must be positive, got {}",
            amount
        )));
    }
    let id = conn.query_row(
        "INSERT INTO holds (account_id, asset_id, amount, remaining_amount, status, reason)
         VALUES (?1, ?2, ?3, ?3, 'active', ?4) RETURNING id",
        params![account_id, asset_id, amount.to_string(), reason],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Release an active hold. Returns `false` if it was not active.
pub fn release_hold(conn: &Connection, hold_id: i64) -> EngineResult<bool> {
    let changed = conn.execute(
        "UPDATE holds
         SET status = 'released', remaining_amount = '0', released_at = datetime('now')
         WHERE id = ?1 AND status = 'active'",
        [hold_id],
    )?;
    Ok(changed == 1)
}

#[cfg(test)]
pub(crate) fn hold_status(conn: &Connection, hold_id: i64) -> EngineResult<Option<String>> {
    use rusqlite::OptionalExtension;

    Ok(conn
        .query_row("SELECT status FROM holds WHERE id = ?1", [hold_id], |r| r.get(0))
        .optional()?)
}
