//! Read side of the asset registry and the deposit-address directory.
//!
//! Both tables are owned by other services; the upserts here exist for operators
//! seeding a fresh database and for tests.

use std::collections::{BTreeSet, HashMap};

use alloy::primitives::Address;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{EngineError, EngineResult};
use crate::models::{address_hex, Asset, DepositAddress};

type AssetRow = (i64, String, String, u32, Option<String>, bool);

fn asset_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssetRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get::<_, i64>(5)? != 0,
    ))
}

fn build_asset(raw: AssetRow) -> EngineResult<Asset> {
    let (id, chain, symbol, decimals, contract, enabled) = raw;
    let contract_address = match contract {
        Some(c) => Some(c.parse::<Address>().map_err(|e| {
            EngineError::Config(format!("asset {} has malformed contract '{}': {}", symbol, c, e))
        })?),
        None => None,
    };
    Ok(Asset {
        id,
        chain,
        symbol,
        decimals,
        contract_address,
        enabled,
    })
}

/// Enabled assets on `chain`.
pub fn enabled_assets(conn: &Connection, chain: &str) -> EngineResult<Vec<Asset>> {
    let mut stmt = conn.prepare(
        "SELECT id, chain, symbol, decimals, contract_address, enabled
         FROM assets WHERE chain = ?1 AND enabled = 1 ORDER BY id",
    )?;
    let rows = stmt.query_map([chain], asset_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(build_asset(row?)?);
    }
    Ok(out)
}

/// Look up an asset only if it is enabled.
pub fn enabled_asset(conn: &Connection, asset_id: i64) -> EngineResult<Option<Asset>> {
    let raw = conn
        .query_row(
            "SELECT id, chain, symbol, decimals, contract_address, enabled
             FROM assets WHERE id = ?1 AND enabled = 1",
            [asset_id],
            asset_from_row,
        )
        .optional()?;
    raw.map(build_asset).transpose()
}

/// The assets a run watches: enabled assets, narrowed by the token allowlist.
///
/// Fails when the allowlist names a symbol this chain does not have enabled.
/// The native coin is never subject to the allowlist.
pub fn watched_assets(conn: &Connection, chain: &str, allowlist: &BTreeSet<String>) -> EngineResult<Vec<Asset>> {
    let assets = enabled_assets(conn, chain)?;
    if allowlist.is_empty() {
        return Ok(assets);
    }

    let known: BTreeSet<String> = assets
        .iter()
        .filter(|a| !a.is_native())
        .map(|a| a.symbol.to_uppercase())
        .collect();
    let unknown: Vec<&String> = allowlist.difference(&known).collect();
    if !unknown.is_empty() {
        return Err(EngineError::Config(format!(
            "token symbols not enabled on {}: {:?}",
            chain, unknown
        )));
    }

    Ok(assets
        .into_iter()
        .filter(|a| a.is_native() || allowlist.contains(&a.symbol.to_uppercase()))
        .collect())
}

/// Active deposit addresses on `chain`, keyed by address.
pub fn active_addresses(conn: &Connection, chain: &str) -> EngineResult<HashMap<Address, DepositAddress>> {
    let mut stmt = conn.prepare(
        "SELECT address, user_id FROM deposit_addresses WHERE chain = ?1 AND status = 'active'",
    )?;
    let rows = stmt.query_map([chain], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;

    let mut out = HashMap::new();
    for row in rows {
        let (raw, user_id) = row?;
        // Rows that do not parse as EVM addresses cannot receive transfers here.
        if let Ok(address) = raw.parse::<Address>() {
            out.insert(address, DepositAddress { user_id });
        }
    }
    Ok(out)
}

pub fn upsert_asset(
    conn: &Connection,
    chain: &str,
    symbol: &str,
    decimals: u32,
    contract_address: Option<&Address>,
    enabled: bool,
) -> EngineResult<i64> {
    let id = conn.query_row(
        "INSERT INTO assets (chain, symbol, decimals, contract_address, enabled)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(chain, symbol) DO UPDATE SET
             decimals = excluded.decimals,
             contract_address = excluded.contract_address,
             enabled = excluded.enabled
         RETURNING id",
        params![chain, symbol, decimals, contract_address.map(address_hex), enabled as i64],
        |r| r.get(0),
    )?;
    Ok(id)
}

pub fn upsert_deposit_address(conn: &Connection, chain: &str, address: &Address, user_id: i64, active: bool) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO deposit_addresses (chain, address, user_id, status)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(chain, address) DO UPDATE SET
             user_id = excluded.user_id,
             status = excluded.status",
        params![chain, address_hex(address), user_id, if active { "active" } else { "disabled" }],
    )?;
    Ok(())
}
