//! Log fetching that survives provider quirks.
//!
//! A failed `eth_getLogs` call is matched against an ordered list of
//! `(detector, recovery)` pairs. The first detector that accepts the error and the
//! query picks the recovery; if none does, the error goes back to the caller.
//!
//! | detector                         | recovery                                   |
//! |----------------------------------|--------------------------------------------|
//! | rate limited                     | jittered exponential backoff, same query   |
//! | address array rejected, >1 addr  | one query per contract, concatenated       |
//! | topic array rejected, multi-topic| event topic only, filter the rest locally  |
//! | range too large, >1 block        | bisect the range, concatenated             |

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::RpcPolicy;
use crate::error::RpcError;
use crate::rpc::{Block, ChainRpc, Log, LogQuery, Receipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Backoff,
    SplitByContract,
    SingleTopic,
    Bisect,
}

type Detector = fn(&RpcError, &LogQuery) -> bool;

fn rate_limited(err: &RpcError, _: &LogQuery) -> bool {
    err.is_rate_limited()
}

fn address_array_rejected(err: &RpcError, query: &LogQuery) -> bool {
    err.is_address_filter_rejected() && query.addresses.len() > 1
}

fn topic_array_rejected(err: &RpcError, query: &LogQuery) -> bool {
    err.is_topic_filter_rejected() && query.has_multi_value_topic()
}

fn range_too_large(err: &RpcError, query: &LogQuery) -> bool {
    err.is_range_too_large() && query.from_block < query.to_block
}

const STRATEGIES: &[(Detector, Recovery)] = &[
    (rate_limited, Recovery::Backoff),
    (address_array_rejected, Recovery::SplitByContract),
    (topic_array_rejected, Recovery::SingleTopic),
    (range_too_large, Recovery::Bisect),
];

fn recovery_for(err: &RpcError, query: &LogQuery) -> Option<Recovery> {
    STRATEGIES
        .iter()
        .find(|(detect, _)| detect(err, query))
        .map(|(_, recovery)| *recovery)
}

/// Delay before retry `attempt` (0-based): `base * 2^attempt`, capped, plus up to 50% jitter.
pub fn backoff_delay(policy: &RpcPolicy, attempt: u32) -> Duration {
    let exp = policy
        .backoff_base
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(policy.backoff_max);
    let jitter_ms = exp.as_millis() as u64 / 2;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    exp + Duration::from_millis(jitter)
}

/// Gateway wrapper applying the throttle, backoff and fallback strategies.
#[derive(Clone)]
pub struct LogScanner {
    rpc: Arc<dyn ChainRpc>,
    policy: RpcPolicy,
}

impl LogScanner {
    pub fn new(rpc: Arc<dyn ChainRpc>, policy: RpcPolicy) -> Self {
        Self { rpc, policy }
    }

    pub fn rpc(&self) -> &Arc<dyn ChainRpc> {
        &self.rpc
    }

    async fn throttle(&self) {
        if !self.policy.throttle.is_zero() {
            sleep(self.policy.throttle).await;
        }
    }

    /// Retry a non-log call on rate limits only.
    async fn with_backoff<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RpcError>>,
    {
        let mut attempt = 0;
        loop {
            self.throttle().await;
            match call().await {
                Err(err) if err.is_rate_limited() && attempt < self.policy.max_retries => {
                    let delay = backoff_delay(&self.policy, attempt);
                    warn!("{} rate limited, retrying in {:?} (attempt {})", what, delay, attempt + 1);
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.with_backoff("eth_blockNumber", || self.rpc.block_number()).await
    }

    pub async fn block_with_transactions(&self, number: u64) -> Result<Option<Block>, RpcError> {
        self.with_backoff("eth_getBlockByNumber", || self.rpc.get_block_with_transactions(number))
            .await
    }

    pub async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, RpcError> {
        self.with_backoff("eth_getTransactionReceipt", || self.rpc.get_transaction_receipt(tx_hash))
            .await
    }

    /// Fetch every log matching `query`, falling back as needed.
    ///
    /// Results are always re-filtered against `query` locally, so a downgraded
    /// request never leaks logs the caller did not ask for.
    pub fn fetch_logs(&self, query: LogQuery) -> BoxFuture<'_, Result<Vec<Log>, RpcError>> {
        async move {
            if query.is_empty() || query.from_block > query.to_block {
                return Ok(Vec::new());
            }

            let mut attempt = 0;
            loop {
                self.throttle().await;
                let err = match self.rpc.get_logs(&query).await {
                    Ok(logs) => return Ok(logs.into_iter().filter(|l| query.matches(l)).collect()),
                    Err(err) => err,
                };

                match recovery_for(&err, &query) {
                    Some(Recovery::Backoff) if attempt < self.policy.max_retries => {
                        let delay = backoff_delay(&self.policy, attempt);
                        warn!(
                            "eth_getLogs {}..{} rate limited, retrying in {:?} (attempt {})",
                            query.from_block,
                            query.to_block,
                            delay,
                            attempt + 1
                        );
                        sleep(delay).await;
                        attempt += 1;
                    }
                    Some(Recovery::SplitByContract) => {
                        debug!("address arrays rejected, querying {} contracts one by one", query.addresses.len());
                        return self.split_by_contract(&query).await;
                    }
                    Some(Recovery::SingleTopic) => {
                        debug!("multi-value topics rejected, retrying with the event topic only");
                        let narrowed = query.first_topic_only();
                        let logs = self.fetch_logs(narrowed).await?;
                        return Ok(logs.into_iter().filter(|l| query.matches(l)).collect());
                    }
                    Some(Recovery::Bisect) => return self.bisect(&query).await,
                    _ => return Err(err),
                }
            }
        }
        .boxed()
    }

    async fn split_by_contract(&self, query: &LogQuery) -> Result<Vec<Log>, RpcError> {
        let mut out = Vec::new();
        for address in &query.addresses {
            out.extend(self.fetch_logs(query.with_address(*address)).await?);
        }
        Ok(out)
    }

    async fn bisect(&self, query: &LogQuery) -> Result<Vec<Log>, RpcError> {
        let mid = query.from_block + (query.to_block - query.from_block) / 2;
        debug!(
            "range {}..{} too large, bisecting at {}",
            query.from_block, query.to_block, mid
        );
        let mut out = self.fetch_logs(query.with_range(query.from_block, mid)).await?;
        out.extend(self.fetch_logs(query.with_range(mid + 1, query.to_block)).await?);
        Ok(out)
    }
}
