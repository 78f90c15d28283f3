//! Re-verification of recently credited token deposits.
//!
//! Each run re-reads the logs of a trailing window and reverses every recorded
//! token event whose `tx_hash:log_index` is no longer returned by the node.
//! Native deposits have no log to re-read and are not re-verified here.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use alloy::primitives::Address;
use tracing::{debug, info};

use crate::capabilities::Capabilities;
use crate::crediting;
use crate::db::{self, SharedConn};
use crate::error::EngineResult;
use crate::events;
use crate::models::{event_key, Asset, DepositAddress, DepositEvent};
use crate::parser::decode_transfer;
use crate::rpc::LogQuery;
use crate::scanner::LogScanner;

/// Extra blocks re-checked beyond lookback + confirmations.
pub const WINDOW_MARGIN: u64 = 10;
/// Hard cap on the re-checked span.
pub const MAX_WINDOW: u64 = 500;

/// The inclusive block range to re-verify, or `None` when nothing has been scanned there yet.
/// `scanned_to` is the highest block credited so far, provisional blocks included.
pub fn window(head: u64, confirmations: u64, lookback: u64, scanned_to: u64) -> Option<(u64, u64)> {
    let span = lookback
        .saturating_add(confirmations)
        .saturating_add(WINDOW_MARGIN)
        .min(MAX_WINDOW);
    let from = head.saturating_sub(span);
    let to = head.min(scanned_to);
    (from <= to).then_some((from, to))
}

/// Reverse recorded deposits in `[from, to]` that the chain no longer contains.
///
/// Only events for watched tokens sent to active deposit addresses are checked.
/// A gateway failure aborts the check before anything is reversed.
#[allow(clippy::too_many_arguments)]
pub async fn verify_window(
    scanner: &LogScanner,
    conn: &SharedConn,
    caps: &Capabilities,
    chain: &str,
    tokens: &[Asset],
    addresses: &HashMap<Address, DepositAddress>,
    from: u64,
    to: u64,
) -> EngineResult<u32> {
    let contracts: HashMap<i64, Address> = tokens
        .iter()
        .filter_map(|a| a.contract_address.map(|c| (a.id, c)))
        .collect();

    let recorded = {
        let guard = db::lock(conn)?;
        events::live_token_events_in_range(&guard, chain, from, to)?
    };
    let checked: Vec<(DepositEvent, Address, Address)> = recorded
        .into_iter()
        .filter_map(|event| {
            let contract = *contracts.get(&event.asset_id)?;
            let recipient = event.to_address.parse::<Address>().ok()?;
            addresses.contains_key(&recipient).then_some((event, contract, recipient))
        })
        .collect();
    if checked.is_empty() {
        return Ok(0);
    }

    let mut pairs: BTreeMap<Address, BTreeSet<Address>> = BTreeMap::new();
    for (_, contract, recipient) in &checked {
        pairs.entry(*contract).or_default().insert(*recipient);
    }

    let mut fresh: HashSet<String> = HashSet::new();
    for (contract, recipients) in pairs {
        for recipient in recipients {
            let query = LogQuery::transfers_to(vec![contract], &[recipient], from, to);
            for log in scanner.fetch_logs(query).await? {
                if let Some(t) = decode_transfer(&log) {
                    fresh.insert(event_key(&t.tx_hash, t.log_index));
                }
            }
        }
    }
    debug!(
        "reorg check {}..{}: {} recorded, {} still on chain",
        from,
        to,
        checked.len(),
        fresh.len()
    );

    let mut reverted = 0;
    for (event, _, _) in checked {
        let key = event.key();
        if fresh.contains(&key) {
            continue;
        }
        let reason = format!("reorg: {} missing from blocks {}..{}", key, from, to);
        let mut guard = db::lock(conn)?;
        if crediting::reverse_deposit(&mut guard, caps, event.id, &reason)? {
            reverted += 1;
        }
    }
    if reverted > 0 {
        info!("Reorg check reverted {} deposits in blocks {}..{}", reverted, from, to);
    }
    Ok(reverted)
}
