//! Deposit ingestion for EVM chains: scan for transfers to user deposit
//! addresses and credit each one exactly once into a double-entry ledger.

pub mod api;
pub mod capabilities;
pub mod config;
pub mod crediting;
pub mod cursor;
pub mod db;
pub mod directory;
pub mod engine;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod ledger;
pub mod lock;
pub mod models;
pub mod notify;
pub mod parser;
pub mod reorg;
pub mod rpc;
pub mod scanner;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;
