use rusqlite::Connection;
use tracing::info;

use crate::error::EngineResult;

/// Optional parts of the schema the engine adapts to.
///
/// Detected once per engine instance and kept until the process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `holds` table and `deposit_events.hold_id` exist.
    pub pending_credits: bool,
    /// `notifications` table exists.
    pub notifications: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            pending_credits: true,
            notifications: true,
        }
    }

    pub fn detect(conn: &Connection) -> EngineResult<Self> {
        let caps = Self {
            pending_credits: table_exists(conn, "holds")? && column_exists(conn, "deposit_events", "hold_id")?,
            notifications: table_exists(conn, "notifications")?,
        };
        info!("Detected schema capabilities: {:?}", caps);
        Ok(caps)
    }
}

fn table_exists(conn: &Connection, table: &str) -> EngineResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> EngineResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        [table, column],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}
