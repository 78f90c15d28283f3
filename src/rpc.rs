// src/rpc.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::RpcError;
use crate::models::address_hex;

/// ERC20 Transfer event topic keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,

    #[serde(rename = "blockNumber")]
    pub block_number_hex: String,

    #[serde(rename = "transactionHash")]
    pub tx_hash: String,

    #[serde(rename = "logIndex")]
    pub log_index_hex: String,

    /// Set by some providers when the log was dropped by a reorg.
    #[serde(default)]
    pub removed: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Block {
    #[serde(rename = "number")]
    pub number_hex: String,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    #[serde(rename = "value")]
    pub value_hex: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Receipt {
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    /// `0x1` success, `0x0` reverted. Absent on pre-Byzantium chains.
    pub status: Option<String>,
}

impl Receipt {
    pub fn succeeded(&self) -> bool {
        self.status.as_deref().map_or(true, |s| s != "0x0")
    }
}

/// One position of an `eth_getLogs` topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    Any,
    OneOf(Vec<String>),
}

impl TopicFilter {
    pub fn exact(topic: impl Into<String>) -> Self {
        TopicFilter::OneOf(vec![topic.into()])
    }

    fn matches(&self, topic: Option<&String>) -> bool {
        match self {
            TopicFilter::Any => true,
            TopicFilter::OneOf(wanted) => topic
                .map(|t| wanted.iter().any(|w| w.eq_ignore_ascii_case(t)))
                .unwrap_or(false),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            TopicFilter::Any => Value::Null,
            TopicFilter::OneOf(v) if v.len() == 1 => json!(v[0]),
            TopicFilter::OneOf(v) => json!(v),
        }
    }
}

/// Left-pad an address into a 32-byte topic.
pub fn address_topic(address: &Address) -> String {
    format!("0x{:0>64}", hex::encode(address.as_slice()))
}

/// A bounded `eth_getLogs` request.
#[derive(Debug, Clone, PartialEq)]
pub struct LogQuery {
    pub addresses: Vec<Address>,
    pub from_block: u64,
    pub to_block: u64,
    pub topics: Vec<TopicFilter>,
}

impl LogQuery {
    /// Transfer logs from `contracts` whose recipient is one of `recipients`.
    pub fn transfers_to(contracts: Vec<Address>, recipients: &[Address], from_block: u64, to_block: u64) -> Self {
        Self {
            addresses: contracts,
            from_block,
            to_block,
            topics: vec![
                TopicFilter::exact(TRANSFER_TOPIC),
                TopicFilter::Any,
                TopicFilter::OneOf(recipients.iter().map(address_topic).collect()),
            ],
        }
    }

    /// Nothing can match: no contracts, or a topic position with no allowed values.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
            || self.topics.is_empty()
            || self
                .topics
                .iter()
                .any(|t| matches!(t, TopicFilter::OneOf(v) if v.is_empty()))
    }

    pub fn has_multi_value_topic(&self) -> bool {
        self.topics
            .iter()
            .any(|t| matches!(t, TopicFilter::OneOf(v) if v.len() > 1))
    }

    pub fn with_range(&self, from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            ..self.clone()
        }
    }

    pub fn with_address(&self, address: Address) -> Self {
        Self {
            addresses: vec![address],
            ..self.clone()
        }
    }

    /// Keep only the event-signature topic; the rest is filtered client side.
    pub fn first_topic_only(&self) -> Self {
        Self {
            topics: self.topics.iter().take(1).cloned().collect(),
            ..self.clone()
        }
    }

    /// Client-side re-check of address, range and topics.
    pub fn matches(&self, log: &Log) -> bool {
        if log.removed {
            return false;
        }
        let address_ok = self
            .addresses
            .iter()
            .any(|a| address_hex(a).eq_ignore_ascii_case(&log.address));
        let block_ok = parse_hex_u64(&log.block_number_hex)
            .map(|b| b >= self.from_block && b <= self.to_block)
            .unwrap_or(false);
        let topics_ok = self
            .topics
            .iter()
            .enumerate()
            .all(|(i, f)| f.matches(log.topics.get(i)));
        address_ok && block_ok && topics_ok
    }

    pub fn to_params(&self) -> Value {
        let address = if self.addresses.len() == 1 {
            json!(address_hex(&self.addresses[0]))
        } else {
            json!(self.addresses.iter().map(address_hex).collect::<Vec<_>>())
        };
        json!([{
            "fromBlock": format!("0x{:x}", self.from_block),
            "toBlock": format!("0x{:x}", self.to_block),
            "address": address,
            "topics": self.topics.iter().map(TopicFilter::to_json).collect::<Vec<_>>(),
        }])
    }
}

pub fn parse_hex_u64(raw: &str) -> Result<u64, RpcError> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| RpcError::Decode(format!("bad hex quantity '{}': {}", raw, e)))
}

/// The chain RPC gateway the engine consumes.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64, RpcError>;

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, RpcError>;

    async fn get_block_with_transactions(&self, number: u64) -> Result<Option<Block>, RpcError>;

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, RpcError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcResponse<T> {
    // Error first: an Option<T> result would otherwise swallow error bodies.
    Error { error: RpcErrorBody },
    Success { result: T },
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC over HTTP.
pub struct HttpRpc {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl HttpRpc {
    pub fn new(url: impl Into<String>) -> Result<Self, RpcError> {
        let client = Client::builder().timeout(Duration::from_secs(20)).build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        debug!("📡 Sending {} → {}", method, self.url);

        let resp = self.client.post(&self.url).json(&payload).send().await?;
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcError::RateLimited(format!("HTTP {}", status)));
        }

        let text = resp.text().await?;
        if !status.is_success() {
            return Err(RpcError::classify(i64::from(status.as_u16()), &text));
        }

        match serde_json::from_str::<RpcResponse<T>>(&text) {
            Ok(RpcResponse::Success { result }) => Ok(result),
            Ok(RpcResponse::Error { error }) => Err(RpcError::classify(error.code, &error.message)),
            Err(e) => Err(RpcError::Decode(format!("{} response: {}", method, e))),
        }
    }
}

#[async_trait]
impl ChainRpc for HttpRpc {
    async fn block_number(&self) -> Result<u64, RpcError> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex)
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, RpcError> {
        self.call("eth_getLogs", query.to_params()).await
    }

    async fn get_block_with_transactions(&self, number: u64) -> Result<Option<Block>, RpcError> {
        self.call("eth_getBlockByNumber", json!([format!("0x{:x}", number), true]))
            .await
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, RpcError> {
        self.call("eth_getTransactionReceipt", json!([tx_hash])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::keccak256;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    #[test]
    fn transfer_topic_is_the_event_hash() {
        let hash = keccak256("Transfer(address,address,uint256)");
        assert_eq!(format!("0x{}", hex::encode(hash.as_slice())), TRANSFER_TOPIC);
    }

    #[test]
    fn params_use_scalar_forms_for_single_values() {
        let q = LogQuery::transfers_to(vec![addr(1)], &[addr(2)], 16, 31);
        let params = q.to_params();
        assert_eq!(params[0]["fromBlock"], "0x10");
        assert_eq!(params[0]["toBlock"], "0x1f");
        assert!(params[0]["address"].is_string());
        assert!(params[0]["topics"][1].is_null());
        assert!(params[0]["topics"][2].is_string());

        let multi = LogQuery::transfers_to(vec![addr(1), addr(3)], &[addr(2), addr(4)], 1, 2);
        let params = multi.to_params();
        assert_eq!(params[0]["address"].as_array().unwrap().len(), 2);
        assert_eq!(params[0]["topics"][2].as_array().unwrap().len(), 2);
        assert!(multi.has_multi_value_topic());
    }

    #[test]
    fn empty_queries_are_detected() {
        assert!(LogQuery::transfers_to(vec![], &[addr(2)], 1, 2).is_empty());
        assert!(LogQuery::transfers_to(vec![addr(1)], &[], 1, 2).is_empty());
        assert!(!LogQuery::transfers_to(vec![addr(1)], &[addr(2)], 1, 2).is_empty());
    }

    #[test]
    fn client_side_match_checks_recipient() {
        let q = LogQuery::transfers_to(vec![addr(1)], &[addr(2)], 1, 10);
        let mut log = Log {
            address: address_hex(&addr(1)),
            topics: vec![TRANSFER_TOPIC.to_string(), address_topic(&addr(9)), address_topic(&addr(2))],
            data: "0x01".to_string(),
            block_number_hex: "0x5".to_string(),
            tx_hash: "0xaa".to_string(),
            log_index_hex: "0x0".to_string(),
            removed: false,
        };
        assert!(q.matches(&log));

        log.topics[2] = address_topic(&addr(3));
        assert!(!q.matches(&log));

        log.topics[2] = address_topic(&addr(2));
        log.block_number_hex = "0xb".to_string();
        assert!(!q.matches(&log));
    }

    #[test]
    fn error_bodies_win_over_null_results() {
        let body = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"rate limit"}}"#;
        let parsed: RpcResponse<Option<Block>> = serde_json::from_str(body).unwrap();
        assert!(matches!(parsed, RpcResponse::Error { .. }));

        let body = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        let parsed: RpcResponse<Option<Block>> = serde_json::from_str(body).unwrap();
        assert!(matches!(parsed, RpcResponse::Success { result: None }));
    }
}
