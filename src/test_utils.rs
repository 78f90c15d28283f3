//! Shared fixtures for unit and scenario tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy::primitives::Address;
use async_trait::async_trait;
use rusqlite::Connection;

use crate::db::{self, SharedConn};
use crate::directory::{upsert_asset, upsert_deposit_address};
use crate::error::RpcError;
use crate::models::address_hex;
use crate::rpc::{address_topic, Block, ChainRpc, Log, LogQuery, Receipt, Transaction, TRANSFER_TOPIC};

pub const CHAIN: &str = "polygon";

pub fn memory_db() -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory sqlite");
    conn.pragma_update(None, "foreign_keys", "ON").expect("foreign keys");
    db::run_migrations(&conn).expect("migrations");
    conn
}

pub fn shared_memory_db() -> SharedConn {
    Arc::new(Mutex::new(memory_db()))
}

/// A chain with one native coin, one 6-decimal token and one user deposit address.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub native_id: i64,
    pub token_id: i64,
    pub token_contract: Address,
    pub user_id: i64,
    pub user_address: Address,
    pub sender: Address,
}

pub fn seed(conn: &Connection) -> Fixture {
    let token_contract = Address::from([0xC0; 20]);
    let user_address = Address::from([0xD1; 20]);
    let native_id = upsert_asset(conn, CHAIN, "POL", 18, None, true).unwrap();
    let token_id = upsert_asset(conn, CHAIN, "USDC", 6, Some(&token_contract), true).unwrap();
    upsert_deposit_address(conn, CHAIN, &user_address, 42, true).unwrap();
    Fixture {
        native_id,
        token_id,
        token_contract,
        user_id: 42,
        user_address,
        sender: Address::from([0x5E; 20]),
    }
}

#[derive(Debug, Default)]
pub struct MockState {
    pub head: u64,
    pub logs: Vec<Log>,
    pub blocks: HashMap<u64, Block>,
    pub receipts: HashMap<String, Receipt>,
    pub reject_address_arrays: bool,
    pub reject_multi_topics: bool,
    pub max_range: Option<u64>,
    /// The next N `eth_getLogs` calls answer with a rate-limit error.
    pub rate_limit_next: u32,
    pub fail_get_logs: bool,
    pub get_logs_calls: u32,
    pub queries: Vec<LogQuery>,
}

/// In-memory chain gateway with switchable provider quirks.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.with(|s| s.head = head);
        chain
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn token_transfer(
        &self,
        contract: Address,
        from: Address,
        to: Address,
        value: u128,
        block: u64,
        tx_hash: &str,
        log_index: u64,
    ) {
        self.with(|s| {
            s.logs.push(Log {
                address: address_hex(&contract),
                topics: vec![TRANSFER_TOPIC.to_string(), address_topic(&from), address_topic(&to)],
                data: format!("0x{:064x}", value),
                block_number_hex: format!("0x{:x}", block),
                tx_hash: tx_hash.to_string(),
                log_index_hex: format!("0x{:x}", log_index),
                removed: false,
            })
        });
    }

    pub fn native_transfer(&self, from: Address, to: Address, value: u128, block: u64, tx_hash: &str, success: bool) {
        self.with(|s| {
            s.blocks
                .entry(block)
                .or_insert_with(|| Block {
                    number_hex: format!("0x{:x}", block),
                    transactions: Vec::new(),
                })
                .transactions
                .push(Transaction {
                    hash: tx_hash.to_string(),
                    from: address_hex(&from),
                    to: Some(address_hex(&to)),
                    value_hex: format!("0x{:x}", value),
                });
            s.receipts.insert(
                tx_hash.to_string(),
                Receipt {
                    tx_hash: tx_hash.to_string(),
                    status: Some(if success { "0x1" } else { "0x0" }.to_string()),
                },
            );
        });
    }

    /// Drop every log of `tx_hash`, as a reorg would.
    pub fn orphan(&self, tx_hash: &str) {
        self.with(|s| s.logs.retain(|l| !l.tx_hash.eq_ignore_ascii_case(tx_hash)));
    }

    pub fn get_logs_calls(&self) -> u32 {
        self.with(|s| s.get_logs_calls)
    }
}

#[async_trait]
impl ChainRpc for MockChain {
    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.with(|s| s.head))
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, RpcError> {
        self.with(|s| {
            s.get_logs_calls += 1;
            s.queries.push(query.clone());

            if s.rate_limit_next > 0 {
                s.rate_limit_next -= 1;
                return Err(RpcError::RateLimited("Too Many Requests".to_string()));
            }
            if s.fail_get_logs {
                return Err(RpcError::Node {
                    code: -32000,
                    message: "internal error".to_string(),
                });
            }
            if s.reject_address_arrays && query.addresses.len() > 1 {
                return Err(RpcError::AddressFilterUnsupported("address array".to_string()));
            }
            if s.reject_multi_topics && query.has_multi_value_topic() {
                return Err(RpcError::TopicFilterUnsupported("topic arrays".to_string()));
            }
            if let Some(max) = s.max_range {
                if query.to_block - query.from_block + 1 > max {
                    return Err(RpcError::RangeTooLarge(format!("max {} blocks", max)));
                }
            }
            Ok(s.logs.iter().filter(|l| query.matches(l)).cloned().collect())
        })
    }

    async fn get_block_with_transactions(&self, number: u64) -> Result<Option<Block>, RpcError> {
        Ok(self.with(|s| {
            if number > s.head {
                return None;
            }
            Some(s.blocks.get(&number).cloned().unwrap_or_else(|| Block {
                number_hex: format!("0x{:x}", number),
                transactions: Vec::new(),
            }))
        }))
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, RpcError> {
        Ok(self.with(|s| s.receipts.get(tx_hash).cloned()))
    }
}
