// src/parser.rs
use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;

use crate::rpc::{parse_hex_u64, Log, Transaction};

/// A decoded ERC20 Transfer
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub contract: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256, // raw token units
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: i64,
}

/// A native-coin value transfer taken from a block body
#[derive(Debug, Clone, PartialEq)]
pub struct NativeTransfer {
    pub from: Address,
    pub to: Address,
    pub value: U256, // wei
    pub block_number: u64,
    pub tx_hash: String,
}

fn topic_to_address(topic: &str) -> Option<Address> {
    // topics[1] and topics[2] are 32-byte (padded) hex strings; address is the last 20 bytes
    let s = topic.trim_start_matches("0x");
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let addr_bytes: [u8; 20] = bytes[12..32].try_into().ok()?;
    Some(Address::from(addr_bytes))
}

/// Parse a hex quantity or 32-byte word. `None` if it is not hex or wider than 256 bits.
pub fn parse_hex_u256(raw: &str) -> Option<U256> {
    let digits = raw.trim_start_matches("0x").trim_start_matches('0');
    if digits.is_empty() {
        return Some(U256::ZERO);
    }
    U256::from_str_radix(digits, 16).ok()
}

/// Decode a single log into `Transfer`
pub fn decode_transfer(log: &Log) -> Option<Transfer> {
    if log.topics.len() < 3 || log.removed {
        return None;
    }

    let contract = log.address.parse::<Address>().ok()?;
    let from = topic_to_address(&log.topics[1])?;
    let to = topic_to_address(&log.topics[2])?;
    let value = parse_hex_u256(&log.data)?;
    let block_number = parse_hex_u64(&log.block_number_hex).ok()?;
    let log_index = i64::try_from(parse_hex_u64(&log.log_index_hex).ok()?).ok()?;

    Some(Transfer {
        contract,
        from,
        to,
        value,
        block_number,
        tx_hash: log.tx_hash.to_lowercase(),
        log_index,
    })
}

/// Decode a plain value transfer. Contract creations (no `to`) yield `None`.
pub fn decode_native(tx: &Transaction, block_number: u64) -> Option<NativeTransfer> {
    let to = tx.to.as_deref()?.parse::<Address>().ok()?;
    let from = tx.from.parse::<Address>().ok()?;
    let value = parse_hex_u256(&tx.value_hex)?;

    Some(NativeTransfer {
        from,
        to,
        value,
        block_number,
        tx_hash: tx.hash.to_lowercase(),
    })
}

/// Scale raw integer units by `decimals`. `None` when the value exceeds Decimal's range.
pub fn to_decimal(raw: U256, decimals: u32) -> Option<Decimal> {
    let raw = i128::try_from(raw).ok()?;
    Decimal::try_from_i128_with_scale(raw, decimals)
        .ok()
        .map(|d| d.normalize())
}
