//! Append-only deposit event store keyed by `(chain, tx_hash, log_index)`.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{block_from_sql, block_to_sql, parse_amount};
use crate::error::EngineResult;
use crate::models::{address_hex, CandidateDeposit, DepositEvent, DepositStatus};

const EVENT_COLUMNS: &str = "id, chain, tx_hash, log_index, block_number, from_address, to_address, \
     user_id, asset_id, amount, status, journal_entry_id, hold_id, revert_reason, credited_at, confirmed_at";

struct RawEvent {
    id: i64,
    chain: String,
    tx_hash: String,
    log_index: i64,
    block_number: i64,
    from_address: String,
    to_address: String,
    user_id: i64,
    asset_id: i64,
    amount: String,
    status: String,
    journal_entry_id: Option<i64>,
    hold_id: Option<i64>,
    revert_reason: Option<String>,
    credited_at: Option<String>,
    confirmed_at: Option<String>,
}

fn raw_event(r: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: r.get(0)?,
        chain: r.get(1)?,
        tx_hash: r.get(2)?,
        log_index: r.get(3)?,
        block_number: r.get(4)?,
        from_address: r.get(5)?,
        to_address: r.get(6)?,
        user_id: r.get(7)?,
        asset_id: r.get(8)?,
        amount: r.get(9)?,
        status: r.get(10)?,
        journal_entry_id: r.get(11)?,
        hold_id: r.get(12)?,
        revert_reason: r.get(13)?,
        credited_at: r.get(14)?,
        confirmed_at: r.get(15)?,
    })
}

impl RawEvent {
    fn into_event(self) -> EngineResult<DepositEvent> {
        Ok(DepositEvent {
            id: self.id,
            chain: self.chain,
            tx_hash: self.tx_hash,
            log_index: self.log_index,
            block_number: block_from_sql(self.block_number),
            from_address: self.from_address,
            to_address: self.to_address,
            user_id: self.user_id,
            asset_id: self.asset_id,
            amount: parse_amount(&self.amount)?,
            status: DepositStatus::from_row(&self.status, self.hold_id, self.revert_reason)?,
            journal_entry_id: self.journal_entry_id,
            credited_at: self.credited_at,
            confirmed_at: self.confirmed_at,
        })
    }
}

fn query_events<P: rusqlite::Params>(conn: &Connection, where_clause: &str, params: P) -> EngineResult<Vec<DepositEvent>> {
    let sql = format!("SELECT {} FROM deposit_events WHERE {}", EVENT_COLUMNS, where_clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, raw_event)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_event()?);
    }
    Ok(out)
}

/// Insert a `seen` row unless the key already exists. Returns whether a row was added.
pub fn insert_seen(conn: &Connection, c: &CandidateDeposit) -> EngineResult<bool> {
    let inserted = conn.execute(
        "INSERT INTO deposit_events (
            chain, tx_hash, log_index, block_number,
            from_address, to_address, user_id, asset_id,
            amount, status
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'seen')
         ON CONFLICT(chain, tx_hash, log_index) DO NOTHING",
        params![
            c.chain,
            c.tx_hash.to_lowercase(),
            c.log_index,
            block_to_sql(c.block_number),
            address_hex(&c.from_address),
            address_hex(&c.to_address),
            c.user_id,
            c.asset_id,
            c.amount.to_string(),
        ],
    )?;
    Ok(inserted == 1)
}

pub fn find(conn: &Connection, chain: &str, tx_hash: &str, log_index: i64) -> EngineResult<Option<DepositEvent>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM deposit_events WHERE chain = ?1 AND tx_hash = ?2 AND log_index = ?3",
                EVENT_COLUMNS
            ),
            params![chain, tx_hash.to_lowercase(), log_index],
            raw_event,
        )
        .optional()?;
    raw.map(RawEvent::into_event).transpose()
}

pub fn get(conn: &Connection, id: i64) -> EngineResult<Option<DepositEvent>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM deposit_events WHERE id = ?1", EVENT_COLUMNS),
            [id],
            raw_event,
        )
        .optional()?;
    raw.map(RawEvent::into_event).transpose()
}

/// Overwrite the attribution of a not-yet-credited row with what the scan just saw.
pub fn refresh_attribution(conn: &Connection, id: i64, c: &CandidateDeposit) -> EngineResult<()> {
    conn.execute(
        "UPDATE deposit_events
         SET block_number = ?2, from_address = ?3, to_address = ?4,
             user_id = ?5, asset_id = ?6, amount = ?7
         WHERE id = ?1 AND journal_entry_id IS NULL",
        params![
            id,
            block_to_sql(c.block_number),
            address_hex(&c.from_address),
            address_hex(&c.to_address),
            c.user_id,
            c.asset_id,
            c.amount.to_string(),
        ],
    )?;
    Ok(())
}

/// Persist a status produced by [`DepositStatus::transition`].
pub fn store_status(conn: &Connection, id: i64, status: &DepositStatus) -> EngineResult<()> {
    match status {
        DepositStatus::Seen => {
            conn.execute("UPDATE deposit_events SET status = 'seen' WHERE id = ?1", [id])?;
        }
        DepositStatus::Pending { hold_id } => {
            conn.execute(
                "UPDATE deposit_events SET status = 'pending', hold_id = ?2 WHERE id = ?1",
                params![id, hold_id],
            )?;
        }
        DepositStatus::Confirmed => {
            conn.execute(
                "UPDATE deposit_events SET status = 'confirmed', confirmed_at = datetime('now') WHERE id = ?1",
                [id],
            )?;
        }
        DepositStatus::Reverted { reason } => {
            conn.execute(
                "UPDATE deposit_events SET status = 'reverted', revert_reason = ?2 WHERE id = ?1",
                params![id, reason],
            )?;
        }
    }
    Ok(())
}

pub fn link_journal_entry(conn: &Connection, id: i64, entry_id: i64) -> EngineResult<()> {
    conn.execute(
        "UPDATE deposit_events SET journal_entry_id = ?2, credited_at = datetime('now') WHERE id = ?1",
        params![id, entry_id],
    )?;
    Ok(())
}

/// Pending events old enough to finalise.
pub fn pending_at_or_below(conn: &Connection, chain: &str, safe_tip: u64) -> EngineResult<Vec<DepositEvent>> {
    query_events(
        conn,
        "chain = ?1 AND status = 'pending' AND block_number <= ?2 ORDER BY block_number, id",
        params![chain, block_to_sql(safe_tip)],
    )
}

/// Non-reverted token events (native rows excluded) in `[from, to]`.
pub fn live_token_events_in_range(conn: &Connection, chain: &str, from: u64, to: u64) -> EngineResult<Vec<DepositEvent>> {
    query_events(
        conn,
        "chain = ?1 AND status != 'reverted' AND log_index >= 0
         AND block_number BETWEEN ?2 AND ?3 ORDER BY block_number, id",
        params![chain, block_to_sql(from), block_to_sql(to)],
    )
}

/// `(status, count)` pairs for dashboards.
pub fn status_counts(conn: &Connection, chain: &str) -> EngineResult<Vec<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM deposit_events WHERE chain = ?1 GROUP BY status ORDER BY status",
    )?;
    let rows = stmt.query_map([chain], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
