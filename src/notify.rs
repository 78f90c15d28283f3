use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::debug;

use crate::capabilities::Capabilities;
use crate::error::EngineResult;

pub const DEPOSIT_CREDITED: &str = "deposit_credited";
pub const DEPOSIT_CONFIRMED: &str = "deposit_confirmed";
pub const DEPOSIT_REVERTED: &str = "deposit_reverted";

/// Queue a notification for delivery by the notification pipeline.
///
/// Runs inside the caller's transaction so it commits or rolls back with the ledger change.
pub fn enqueue(conn: &Connection, caps: &Capabilities, user_id: i64, kind: &str, payload: &Value) -> EngineResult<()> {
    if !caps.notifications {
        debug!("notifications table missing, dropping {} for user {}", kind, user_id);
        return Ok(());
    }
    conn.execute(
        "INSERT INTO notifications (user_id, kind, payload) VALUES (?1, ?2, ?3)",
        params![user_id, kind, payload.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn count_for_user(conn: &Connection, user_id: i64, kind: &str) -> EngineResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ?1 AND kind = ?2",
        params![user_id, kind],
        |r| r.get(0),
    )?)
}
