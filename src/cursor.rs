//! Per-chain "last fully processed block" watermark.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::{block_from_sql, block_to_sql};
use crate::error::EngineResult;

pub fn load(conn: &Connection, chain: &str) -> EngineResult<Option<u64>> {
    let block: Option<i64> = conn
        .query_row(
            "SELECT last_scanned_block FROM chain_cursors WHERE chain = ?1",
            [chain],
            |r| r.get(0),
        )
        .optional()?;
    Ok(block.map(block_from_sql))
}

/// Read the cursor, creating it at `initial` if the chain has none yet.
pub fn load_or_init(conn: &Connection, chain: &str, initial: u64) -> EngineResult<u64> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO chain_cursors (chain, last_scanned_block) VALUES (?1, ?2)",
        params![chain, block_to_sql(initial)],
    )?;
    if inserted == 1 {
        info!("Initialised {} cursor at block {}", chain, initial);
    }
    let block: i64 = conn.query_row(
        "SELECT last_scanned_block FROM chain_cursors WHERE chain = ?1",
        [chain],
        |r| r.get(0),
    )?;
    Ok(block_from_sql(block))
}

/// Move the cursor forward to `block`. Never moves it backwards; returns the stored value.
pub fn advance(conn: &Connection, chain: &str, block: u64) -> EngineResult<u64> {
    let stored: i64 = conn.query_row(
        "INSERT INTO chain_cursors (chain, last_scanned_block, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(chain) DO UPDATE SET
             last_scanned_block = MAX(chain_cursors.last_scanned_block, excluded.last_scanned_block),
             updated_at = excluded.updated_at
         RETURNING last_scanned_block",
        params![chain, block_to_sql(block)],
        |r| r.get(0),
    )?;
    Ok(block_from_sql(stored))
}
