// src/error.rs
use thiserror::Error;

/// Failures reported by the chain RPC gateway, classified so the log scanner
/// can pick a recovery strategy.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("block range too large: {0}")]
    RangeTooLarge(String),

    #[error("address array filter rejected: {0}")]
    AddressFilterUnsupported(String),

    #[error("topic filter shape rejected: {0}")]
    TopicFilterUnsupported(String),

    #[error("rpc error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),

    /// The node does not (yet) serve data the scan depends on.
    #[error("not available from node: {0}")]
    Unavailable(String),
}

impl RpcError {
    /// Map a JSON-RPC error object onto a classified error.
    ///
    /// Providers disagree on codes, so the message text decides most cases.
    pub fn classify(code: i64, message: &str) -> Self {
        let msg = message.to_lowercase();

        if msg.contains("block range")
            || msg.contains("range too large")
            || msg.contains("range is too large")
            || msg.contains("query returned more than")
            || msg.contains("too many results")
            || msg.contains("response size exceeded")
        {
            return RpcError::RangeTooLarge(message.to_string());
        }

        if code == 429
            || code == -32005
            || msg.contains("rate limit")
            || msg.contains("too many requests")
            || (msg.contains("exceeded") && msg.contains("capacity"))
        {
            return RpcError::RateLimited(message.to_string());
        }

        if msg.contains("address") && (msg.contains("array") || msg.contains("cannot unmarshal")) {
            return RpcError::AddressFilterUnsupported(message.to_string());
        }

        if msg.contains("topic") {
            return RpcError::TopicFilterUnsupported(message.to_string());
        }

        RpcError::Node {
            code,
            message: message.to_string(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RpcError::RateLimited(_))
    }

    pub fn is_range_too_large(&self) -> bool {
        matches!(self, RpcError::RangeTooLarge(_))
    }

    pub fn is_address_filter_rejected(&self) -> bool {
        matches!(self, RpcError::AddressFilterUnsupported(_))
    }

    pub fn is_topic_filter_rejected(&self) -> bool {
        matches!(self, RpcError::TopicFilterUnsupported(_))
    }
}

/// Errors raised by the crediting engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown or disabled asset {0}")]
    UnknownAsset(i64),

    #[error("invalid deposit amount: {0}")]
    InvalidAmount(String),

    /// A matched transfer whose raw value cannot be represented as a ledger amount.
    #[error("transfer value out of range: {0}")]
    AmountOutOfRange(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("illegal deposit status transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Ledger bookkeeping broke one of its invariants. Never recovered from.
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("runner lease {0} was taken over mid-run")]
    LeaseLost(String),

    #[error("database connection lock poisoned")]
    LockPoisoned,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
