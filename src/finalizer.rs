use rusqlite::Connection;
use tracing::info;

use crate::capabilities::Capabilities;
use crate::crediting;
use crate::error::EngineResult;
use crate::events;

/// Confirm every pending deposit at or below `safe_tip`. Returns how many were finalised.
pub fn finalize_pending(conn: &mut Connection, caps: &Capabilities, chain: &str, safe_tip: u64) -> EngineResult<u32> {
    if !caps.pending_credits {
        return Ok(0);
    }

    let mut finalized = 0;
    for event in events::pending_at_or_below(conn, chain, safe_tip)? {
        if crediting::finalize_deposit(conn, caps, event.id)? {
            finalized += 1;
        }
    }
    if finalized > 0 {
        info!("✅ Finalised {} pending deposits up to block {}", finalized, safe_tip);
    }
    Ok(finalized)
}
