//! At-most-one runner per chain, enforced with a leased row in `scan_locks`.
//!
//! A holder that crashes simply stops renewing; once `expires_at` passes any
//! worker may take the lease over.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, EngineResult};

pub fn lock_name(chain: &str) -> String {
    format!("deposit-scan:{}", chain)
}

/// One worker's claim on a chain's runner lock.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub ttl: Duration,
}

impl Lease {
    pub fn for_chain(chain: &str, holder: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: lock_name(chain),
            holder: holder.into(),
            ttl,
        }
    }

    /// Take the lease, or push its expiry out when already held.
    pub fn acquire(&self, conn: &Connection) -> EngineResult<bool> {
        try_acquire(conn, &self.name, &self.holder, self.ttl)
    }

    /// Extend a lease held for a long run. Fails once someone else owns it.
    pub fn renew(&self, conn: &Connection) -> EngineResult<()> {
        if self.acquire(conn)? {
            Ok(())
        } else {
            Err(EngineError::LeaseLost(self.name.clone()))
        }
    }

    pub fn release(&self, conn: &Connection) -> EngineResult<()> {
        release(conn, &self.name, &self.holder)
    }
}

/// Take or renew the lease. Returns `false` while another live holder owns it.
pub fn try_acquire(conn: &Connection, name: &str, holder: &str, ttl: Duration) -> EngineResult<bool> {
    try_acquire_at(conn, name, holder, ttl, Utc::now().timestamp())
}

pub fn try_acquire_at(conn: &Connection, name: &str, holder: &str, ttl: Duration, now: i64) -> EngineResult<bool> {
    let expires_at = now.saturating_add(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
    let changed = conn.execute(
        "INSERT INTO scan_locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET
             holder = excluded.holder,
             expires_at = excluded.expires_at
         WHERE scan_locks.expires_at <= ?4 OR scan_locks.holder = excluded.holder",
        params![name, holder, expires_at, now],
    )?;
    Ok(changed == 1)
}

/// Drop the lease if `holder` still owns it.
pub fn release(conn: &Connection, name: &str, holder: &str) -> EngineResult<()> {
    conn.execute(
        "DELETE FROM scan_locks WHERE name = ?1 AND holder = ?2",
        params![name, holder],
    )?;
    Ok(())
}

pub fn current_holder(conn: &Connection, name: &str) -> EngineResult<Option<(String, i64)>> {
    Ok(conn
        .query_row(
            "SELECT holder, expires_at FROM scan_locks WHERE name = ?1",
            [name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?)
}
