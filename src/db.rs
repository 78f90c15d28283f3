use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use eyre::Result;
use rusqlite::Connection;
use rust_decimal::Decimal;

use crate::error::{EngineError, EngineResult};

pub type SharedConn = Arc<Mutex<Connection>>;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS assets (
  id               INTEGER PRIMARY KEY AUTOINCREMENT,
  chain            TEXT NOT NULL,
  symbol           TEXT NOT NULL,
  decimals         INTEGER NOT NULL,
  contract_address TEXT,            -- NULL = native coin
  enabled          INTEGER NOT NULL DEFAULT 1,
  UNIQUE(chain, symbol)
);

CREATE TABLE IF NOT EXISTS deposit_addresses (
  id       INTEGER PRIMARY KEY AUTOINCREMENT,
  chain    TEXT NOT NULL,
  address  TEXT NOT NULL,           -- lowercase 0x hex
  user_id  INTEGER NOT NULL,
  status   TEXT NOT NULL DEFAULT 'active',
  UNIQUE(chain, address)
);

CREATE TABLE IF NOT EXISTS chain_cursors (
  chain              TEXT PRIMARY KEY,
  last_scanned_block INTEGER NOT NULL,
  updated_at         TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS scan_locks (
  name       TEXT PRIMARY KEY,
  holder     TEXT NOT NULL,
  expires_at INTEGER NOT NULL       -- unix seconds
);

CREATE TABLE IF NOT EXISTS ledger_accounts (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id    INTEGER,               -- NULL for the omnibus account
  asset_id   INTEGER NOT NULL REFERENCES assets(id),
  is_system  INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE UNIQUE INDEX IF NOT EXISTS ledger_accounts_user_asset
  ON ledger_accounts(user_id, asset_id) WHERE is_system = 0;
CREATE UNIQUE INDEX IF NOT EXISTS ledger_accounts_system_asset
  ON ledger_accounts(asset_id) WHERE is_system = 1;

CREATE TABLE IF NOT EXISTS journal_entries (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_type TEXT NOT NULL,
  reference  TEXT NOT NULL UNIQUE,
  metadata   TEXT NOT NULL,         -- JSON
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS journal_lines (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id   INTEGER NOT NULL REFERENCES journal_entries(id),
  account_id INTEGER NOT NULL REFERENCES ledger_accounts(id),
  asset_id   INTEGER NOT NULL REFERENCES assets(id),
  amount     TEXT NOT NULL          -- signed Decimal stored as string
);
CREATE INDEX IF NOT EXISTS journal_lines_account ON journal_lines(account_id);

CREATE TABLE IF NOT EXISTS holds (
  id               INTEGER PRIMARY KEY AUTOINCREMENT,
  account_id       INTEGER NOT NULL REFERENCES ledger_accounts(id),
  asset_id         INTEGER NOT NULL REFERENCES assets(id),
  amount           TEXT NOT NULL,
  remaining_amount TEXT NOT NULL,
  status           TEXT NOT NULL CHECK (status IN ('active','released','consumed')),
  reason           TEXT NOT NULL,
  created_at       TEXT NOT NULL DEFAULT (datetime('now')),
  released_at      TEXT
);

CREATE TABLE IF NOT EXISTS deposit_events (
  id               INTEGER PRIMARY KEY AUTOINCREMENT,
  chain            TEXT NOT NULL,
  tx_hash          TEXT NOT NULL,
  log_index        INTEGER NOT NULL,  -- -1 = native transfer
  block_number     INTEGER NOT NULL,
  from_address     TEXT NOT NULL,
  to_address       TEXT NOT NULL,
  user_id          INTEGER NOT NULL,
  asset_id         INTEGER NOT NULL REFERENCES assets(id),
  amount           TEXT NOT NULL,
  status           TEXT NOT NULL CHECK (status IN ('seen','pending','confirmed','reverted')),
  journal_entry_id INTEGER REFERENCES journal_entries(id),
  hold_id          INTEGER REFERENCES holds(id),
  revert_reason    TEXT,
  credited_at      TEXT,
  confirmed_at     TEXT,
  UNIQUE(chain, tx_hash, log_index)
);
CREATE INDEX IF NOT EXISTS deposit_events_chain_block ON deposit_events(chain, block_number);
CREATE INDEX IF NOT EXISTS deposit_events_status ON deposit_events(chain, status);

CREATE TABLE IF NOT EXISTS notifications (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id    INTEGER NOT NULL,
  kind       TEXT NOT NULL,
  payload    TEXT NOT NULL,         -- JSON
  created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // Overlapping runners wait for the write lock instead of failing.
    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

/// Lock the shared connection without panicking on poison.
pub fn lock(conn: &SharedConn) -> EngineResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| EngineError::LockPoisoned)
}

/// Parse a Decimal stored as TEXT.
pub fn parse_amount(raw: &str) -> EngineResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| EngineError::InvariantViolation(format!("stored amount '{}' is not a decimal: {}", raw, e)))
}

/// Integer block numbers are stored as SQLite INTEGER (i64).
pub fn block_to_sql(block: u64) -> i64 {
    i64::try_from(block).unwrap_or(i64::MAX)
}

pub fn block_from_sql(block: i64) -> u64 {
    u64::try_from(block).unwrap_or(0)
}
