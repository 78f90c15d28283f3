use std::{collections::BTreeSet, env, str::FromStr, time::Duration};

use dotenvy::dotenv;
use eyre::{eyre, Result};
use tracing::info;

/// Runtime configuration for one chain worker.
#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_http_url: String,
    pub db_path: String,
    pub chain: String,
    pub port: u16,
    pub run_migrations: bool,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub lock_ttl: Duration,
    pub engine: EngineConfig,
}

/// Knobs the engine itself reads on every run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub confirmations: u64,
    pub max_blocks_per_run: u64,
    pub blocks_per_batch: u64,
    pub time_budget: Duration,
    pub pending_credits: bool,
    /// Token symbols to watch. Empty means every enabled token on the chain.
    pub token_symbols: BTreeSet<String>,
    pub reorg_lookback: u64,
    pub scan_native: bool,
    pub scan_tokens: bool,
    pub seen_prescan: bool,
    pub start_block: Option<u64>,
    pub rpc: RpcPolicy,
}

/// Retry and pacing policy for gateway calls.
#[derive(Debug, Clone)]
pub struct RpcPolicy {
    pub throttle: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RpcPolicy {
    fn default() -> Self {
        Self {
            throttle: Duration::ZERO,
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(8_000),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirmations: 12,
            max_blocks_per_run: 2_000,
            blocks_per_batch: 100,
            time_budget: Duration::from_secs(50),
            pending_credits: false,
            token_symbols: BTreeSet::new(),
            reorg_lookback: 64,
            scan_native: true,
            scan_tokens: true,
            seen_prescan: false,
            start_block: None,
            rpc: RpcPolicy::default(),
        }
    }
}

/// Read `key`, falling back to `default` when unset. A set but unparsable value is an error.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| eyre!("invalid value for {}: '{}'", key, raw)),
        _ => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(eyre!("invalid boolean for {}: '{}'", key, raw)),
        },
        Err(_) => Ok(default),
    }
}

/// Split a comma list into trimmed, uppercased symbols.
pub fn parse_symbols(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn load() -> Result<Config> {
    dotenv().ok(); // Load from .env file

    // Prefer RPC_HTTP_URL, accept the older alias
    let rpc_http_url = env::var("RPC_HTTP_URL")
        .or_else(|_| env::var("POLYGON_RPC"))
        .unwrap_or_else(|_| "https://polygon-rpc.com".to_string());

    let db_path = env::var("DATABASE_URL").unwrap_or_else(|_| "deposits.db".to_string());
    let chain = env::var("CHAIN").unwrap_or_else(|_| "polygon".to_string());

    let defaults = EngineConfig::default();
    let rpc_defaults = RpcPolicy::default();

    let start_block = match env::var("START_BLOCK") {
        Ok(raw) if !raw.trim().is_empty() => Some(
            raw.trim()
                .parse()
                .map_err(|_| eyre!("invalid value for START_BLOCK: '{}'", raw))?,
        ),
        _ => None,
    };

    let engine = EngineConfig {
        confirmations: env_or("CONFIRMATIONS", defaults.confirmations)?,
        max_blocks_per_run: env_or("MAX_BLOCKS_PER_RUN", defaults.max_blocks_per_run)?,
        blocks_per_batch: env_or("BLOCKS_PER_BATCH", defaults.blocks_per_batch)?,
        time_budget: Duration::from_secs(env_or("TIME_BUDGET_SECS", defaults.time_budget.as_secs())?),
        pending_credits: env_bool("PENDING_CREDITS", defaults.pending_credits)?,
        token_symbols: parse_symbols(&env::var("TOKEN_SYMBOLS").unwrap_or_default()),
        reorg_lookback: env_or("REORG_LOOKBACK", defaults.reorg_lookback)?,
        scan_native: env_bool("SCAN_NATIVE", defaults.scan_native)?,
        scan_tokens: env_bool("SCAN_TOKENS", defaults.scan_tokens)?,
        seen_prescan: env_bool("SEEN_PRESCAN", defaults.seen_prescan)?,
        start_block,
        rpc: RpcPolicy {
            throttle: Duration::from_millis(env_or("RPC_THROTTLE_MS", 0u64)?),
            max_retries: env_or("RPC_MAX_RETRIES", rpc_defaults.max_retries)?,
            backoff_base: Duration::from_millis(env_or(
                "RPC_BACKOFF_BASE_MS",
                rpc_defaults.backoff_base.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(env_or(
                "RPC_BACKOFF_MAX_MS",
                rpc_defaults.backoff_max.as_millis() as u64,
            )?),
        },
    };

    if engine.blocks_per_batch == 0 || engine.max_blocks_per_run == 0 {
        return Err(eyre!("BLOCKS_PER_BATCH and MAX_BLOCKS_PER_RUN must be positive"));
    }

    let worker_id = env::var("WORKER_ID").unwrap_or_else(|_| {
        let host = env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        format!("{}-{}", host, std::process::id())
    });

    let cfg = Config {
        rpc_http_url,
        db_path,
        chain,
        port: env_or("PORT", 8080)?,
        run_migrations: env_bool("RUN_MIGRATIONS", true)?,
        worker_id,
        poll_interval: Duration::from_secs(env_or("POLL_INTERVAL_SECS", 15u64)?),
        lock_ttl: Duration::from_secs(env_or("LOCK_TTL_SECS", 120u64)?),
        engine,
    };

    info!("Loaded config: {:?}", cfg);

    Ok(cfg)
}
