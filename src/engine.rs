//! One ingestion run for one chain.
//!
//! A run validates its configuration, walks `[cursor + 1, safe tip]` in sub-batches
//! (crediting every match and advancing the cursor after each), re-verifies the
//! trailing reorg window and finally confirms pending deposits that reached the
//! safe tip. The cursor only ever moves after a sub-batch has been fully credited,
//! and never past the safe tip.
//!
//! In pending mode a caught-up run also credits `(safe tip, head]` provisionally.
//! Those blocks stay above the cursor, so they are scanned again once confirmed
//! and a transfer re-mined under a new log index after a reorg is still found.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::config::EngineConfig;
use crate::crediting;
use crate::cursor;
use crate::db::{self, SharedConn};
use crate::directory;
use crate::error::{EngineError, EngineResult, RpcError};
use crate::finalizer;
use crate::lock::Lease;
use crate::models::{event_key, Asset, CandidateDeposit, CreditOutcome, DepositAddress, ScanReport, NATIVE_LOG_INDEX};
use crate::parser::{decode_native, decode_transfer, to_decimal};
use crate::reorg;
use crate::rpc::{ChainRpc, LogQuery};
use crate::scanner::LogScanner;

/// What a run watches, resolved once before anything is written.
struct RunContext {
    caps: Capabilities,
    native: Option<Asset>,
    tokens: Vec<Asset>,
    addresses: HashMap<Address, DepositAddress>,
    safe_tip: u64,
}

pub struct Engine {
    chain: String,
    cfg: EngineConfig,
    conn: SharedConn,
    scanner: LogScanner,
    capabilities: OnceLock<Capabilities>,
}

impl Engine {
    pub fn new(chain: impl Into<String>, cfg: EngineConfig, conn: SharedConn, rpc: Arc<dyn ChainRpc>) -> Self {
        let scanner = LogScanner::new(rpc, cfg.rpc.clone());
        Self {
            chain: chain.into(),
            cfg,
            conn,
            scanner,
            capabilities: OnceLock::new(),
        }
    }

    /// Skip schema detection and use `caps` instead.
    pub fn with_capabilities(self, caps: Capabilities) -> Self {
        Self {
            capabilities: OnceLock::from(caps),
            ..self
        }
    }

    pub fn capabilities(&self) -> EngineResult<Capabilities> {
        if let Some(caps) = self.capabilities.get() {
            return Ok(*caps);
        }
        let detected = {
            let conn = db::lock(&self.conn)?;
            Capabilities::detect(&conn)?
        };
        Ok(*self.capabilities.get_or_init(|| detected))
    }

    fn prepare(&self) -> EngineResult<RunContext> {
        if self.cfg.blocks_per_batch == 0 || self.cfg.max_blocks_per_run == 0 {
            return Err(EngineError::Config(
                "blocks per batch and max blocks per run must be positive".to_string(),
            ));
        }
        let caps = self.capabilities()?;
        if self.cfg.pending_credits && !caps.pending_credits {
            return Err(EngineError::Config(
                "pending credits enabled but the schema has no hold support".to_string(),
            ));
        }

        let conn = db::lock(&self.conn)?;
        let assets = directory::watched_assets(&conn, &self.chain, &self.cfg.token_symbols)?;
        let addresses = directory::active_addresses(&conn, &self.chain)?;
        let (native, tokens): (Vec<Asset>, Vec<Asset>) = assets.into_iter().partition(Asset::is_native);

        Ok(RunContext {
            caps,
            native: native.into_iter().next(),
            tokens,
            addresses,
            safe_tip: 0,
        })
    }

    /// Run one full cycle and report what it did.
    pub async fn run_once(&self) -> EngineResult<ScanReport> {
        self.run(None).await
    }

    /// Like [`Engine::run_once`], renewing `lease` after every sub-batch so a
    /// long run keeps its claim on the chain.
    pub async fn run_leased(&self, lease: &Lease) -> EngineResult<ScanReport> {
        self.run(Some(lease)).await
    }

    async fn run(&self, lease: Option<&Lease>) -> EngineResult<ScanReport> {
        let started = Instant::now();
        let mut ctx = self.prepare()?;

        let head = self.scanner.block_number().await?;
        ctx.safe_tip = head.saturating_sub(self.cfg.confirmations);

        let initial = self
            .cfg
            .start_block
            .map_or(ctx.safe_tip, |b| b.saturating_sub(1));
        let start_cursor = {
            let conn = db::lock(&self.conn)?;
            cursor::load_or_init(&conn, &self.chain, initial)?
        };
        let end = start_cursor
            .saturating_add(self.cfg.max_blocks_per_run)
            .min(ctx.safe_tip);

        let mut report = ScanReport {
            from_block: start_cursor + 1,
            to_block: end,
            cursor: start_cursor,
            ..Default::default()
        };

        if end > start_cursor {
            info!(
                "🔎 {}: scanning {} → {} (head {}, safe tip {})",
                self.chain, report.from_block, end, head, ctx.safe_tip
            );
        } else {
            debug!("{} caught up at block {} (safe tip {})", self.chain, start_cursor, ctx.safe_tip);
        }

        let mut from = start_cursor + 1;
        while from <= end {
            if report.batches > 0 && started.elapsed() >= self.cfg.time_budget {
                warn!(
                    "Time budget of {:?} spent, stopping at block {}",
                    self.cfg.time_budget, report.cursor
                );
                report.budget_exhausted = true;
                break;
            }

            let to = from.saturating_add(self.cfg.blocks_per_batch - 1).min(end);
            self.scan_range(&ctx, from, to, &mut report).await?;
            {
                let conn = db::lock(&self.conn)?;
                report.cursor = cursor::advance(&conn, &self.chain, to)?;
                if let Some(lease) = lease {
                    lease.renew(&conn)?;
                }
            }
            report.batches += 1;
            from = to + 1;
        }

        // Blocks the reorg check may look at: everything credited so far.
        let mut verified_to = report.cursor;
        if self.cfg.pending_credits && !report.budget_exhausted && report.cursor >= ctx.safe_tip && head > ctx.safe_tip {
            let mut from = ctx.safe_tip + 1;
            while from <= head {
                let to = from.saturating_add(self.cfg.blocks_per_batch - 1).min(head);
                self.scan_range(&ctx, from, to, &mut report).await?;
                from = to + 1;
            }
            debug!("{}: provisional pass {} → {}", self.chain, ctx.safe_tip + 1, head);
            report.provisional_to = Some(head);
            verified_to = head;
        }

        if self.cfg.seen_prescan && !self.cfg.pending_credits && self.cfg.scan_tokens {
            let from = report.cursor.max(ctx.safe_tip) + 1;
            let to = head.min(from.saturating_add(self.cfg.max_blocks_per_run - 1));
            if from <= to {
                match self.prescan(&ctx, from, to).await {
                    Ok(seen) => report.seen = seen,
                    Err(e) => warn!("Unconfirmed pre-scan {}..{} failed: {}", from, to, e),
                }
            }
        }

        if let Some((from, to)) = reorg::window(head, self.cfg.confirmations, self.cfg.reorg_lookback, verified_to) {
            report.reverted = reorg::verify_window(
                &self.scanner,
                &self.conn,
                &ctx.caps,
                &self.chain,
                &ctx.tokens,
                &ctx.addresses,
                from,
                to,
            )
            .await?;
        }

        report.finalized = {
            let mut conn = db::lock(&self.conn)?;
            finalizer::finalize_pending(&mut conn, &ctx.caps, &self.chain, ctx.safe_tip)?
        };

        info!(
            "{}: cursor {} | {} batches, {} credited, {} duplicates, {} seen, {} finalised, {} reverted",
            self.chain,
            report.cursor,
            report.batches,
            report.credited,
            report.duplicates,
            report.seen,
            report.finalized,
            report.reverted
        );
        Ok(report)
    }

    /// Credit every match in `[from, to]`. Does not touch the cursor.
    async fn scan_range(&self, ctx: &RunContext, from: u64, to: u64, report: &mut ScanReport) -> EngineResult<()> {
        let mut candidates = Vec::new();
        if self.cfg.scan_native {
            if let Some(native) = &ctx.native {
                candidates.extend(self.native_candidates(ctx, native, from, to).await?);
            }
        }
        if self.cfg.scan_tokens {
            candidates.extend(self.token_candidates(ctx, from, to).await?);
        }
        candidates.sort_by_key(|c| (c.block_number, c.log_index));

        let (mut credited, mut skipped) = (0u32, 0u32);
        for c in &candidates {
            let outcome = {
                let mut conn = db::lock(&self.conn)?;
                crediting::credit_deposit(&mut conn, &ctx.caps, c)?
            };
            match outcome {
                CreditOutcome::Credited { .. } => credited += 1,
                CreditOutcome::Duplicate | CreditOutcome::AlreadyReverted => skipped += 1,
            }
        }
        report.credited += credited;
        report.duplicates += skipped;

        debug!(
            "batch {}..{}: {} matches, {} credited, {} skipped",
            from,
            to,
            candidates.len(),
            credited,
            skipped
        );
        Ok(())
    }

    fn is_pending(&self, ctx: &RunContext, block: u64) -> bool {
        self.cfg.pending_credits && block > ctx.safe_tip
    }

    async fn native_candidates(
        &self,
        ctx: &RunContext,
        native: &Asset,
        from: u64,
        to: u64,
    ) -> EngineResult<Vec<CandidateDeposit>> {
        let mut out = Vec::new();
        for number in from..=to {
            let Some(block) = self.scanner.block_with_transactions(number).await? else {
                return Err(RpcError::Unavailable(format!("block {}", number)).into());
            };

            for tx in &block.transactions {
                let Some(t) = decode_native(tx, number) else {
                    continue;
                };
                if t.value.is_zero() {
                    continue;
                }
                let Some(owner) = ctx.addresses.get(&t.to) else {
                    continue;
                };

                match self.scanner.receipt(&t.tx_hash).await? {
                    Some(receipt) if receipt.succeeded() => {}
                    Some(_) => {
                        debug!("skipping failed native transfer {}", t.tx_hash);
                        continue;
                    }
                    None => return Err(RpcError::Unavailable(format!("receipt of {}", t.tx_hash)).into()),
                }

                let amount = scaled_amount(t.value, native.decimals, &t.tx_hash, NATIVE_LOG_INDEX)?;
                out.push(CandidateDeposit {
                    chain: self.chain.clone(),
                    tx_hash: t.tx_hash,
                    log_index: NATIVE_LOG_INDEX,
                    block_number: number,
                    from_address: t.from,
                    to_address: t.to,
                    user_id: owner.user_id,
                    asset_id: native.id,
                    amount,
                    pending: self.is_pending(ctx, number),
                });
            }
        }
        Ok(out)
    }

    async fn token_candidates(&self, ctx: &RunContext, from: u64, to: u64) -> EngineResult<Vec<CandidateDeposit>> {
        let contracts: Vec<(Address, &Asset)> = ctx
            .tokens
            .iter()
            .filter_map(|a| a.contract_address.map(|c| (c, a)))
            .collect();
        let recipients: Vec<Address> = ctx.addresses.keys().copied().collect();
        let query = LogQuery::transfers_to(contracts.iter().map(|(c, _)| *c).collect(), &recipients, from, to);

        let logs = self.scanner.fetch_logs(query).await?;

        let mut out = Vec::new();
        for log in &logs {
            let Some(t) = decode_transfer(log) else {
                debug!("undecodable transfer log in {}", log.tx_hash);
                continue;
            };
            if t.value.is_zero() {
                debug!("ignoring zero-value transfer {}:{}", t.tx_hash, t.log_index);
                continue;
            }
            let Some((_, asset)) = contracts.iter().find(|(c, _)| *c == t.contract) else {
                continue;
            };
            let Some(owner) = ctx.addresses.get(&t.to) else {
                continue;
            };
            let amount = scaled_amount(t.value, asset.decimals, &t.tx_hash, t.log_index)?;
            out.push(CandidateDeposit {
                chain: self.chain.clone(),
                tx_hash: t.tx_hash,
                log_index: t.log_index,
                block_number: t.block_number,
                from_address: t.from,
                to_address: t.to,
                user_id: owner.user_id,
                asset_id: asset.id,
                amount,
                pending: self.is_pending(ctx, t.block_number),
            });
        }
        Ok(out)
    }

    /// Record token transfers above the safe tip as `seen` rows. Nothing is credited.
    async fn prescan(&self, ctx: &RunContext, from: u64, to: u64) -> EngineResult<u32> {
        let candidates = self.token_candidates(ctx, from, to).await?;
        let mut seen = 0;
        for c in &candidates {
            let mut conn = db::lock(&self.conn)?;
            if crediting::record_seen(&mut conn, &ctx.caps, c)? {
                seen += 1;
            }
        }
        if seen > 0 {
            info!("👀 {} unconfirmed deposits seen in {}..{}", seen, from, to);
        }
        Ok(seen)
    }
}

/// A matched transfer the ledger cannot hold fails the batch instead of being dropped.
fn scaled_amount(value: U256, decimals: u32, tx_hash: &str, log_index: i64) -> EngineResult<Decimal> {
    to_decimal(value, decimals).ok_or_else(|| {
        EngineError::AmountOutOfRange(format!(
            "{} raw units at {} decimals in {}",
            value,
            decimals,
            event_key(tx_hash, log_index)
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use rusqlite::Connection;
    use rust_decimal::Decimal;

    use crate::config::RpcPolicy;
    use crate::events;
    use crate::ledger;
    use crate::models::DepositStatus;
    use crate::test_utils::{seed, shared_memory_db, Fixture, MockChain, CHAIN};

    const ONE_AND_A_HALF: u128 = 1_500_000_000_000_000_000;

    fn test_config() -> EngineConfig {
        EngineConfig {
            confirmations: 2,
            max_blocks_per_run: 100,
            blocks_per_batch: 10,
            time_budget: Duration::from_secs(60),
            start_block: Some(100),
            rpc: RpcPolicy {
                throttle: Duration::ZERO,
                max_retries: 1,
                backoff_base: Duration::from_millis(1),
                backoff_max: Duration::from_millis(2),
            },
            ..EngineConfig::default()
        }
    }

    struct Harness {
        conn: SharedConn,
        fx: Fixture,
        chain: Arc<MockChain>,
    }

    impl Harness {
        fn new(head: u64) -> Self {
            let conn = shared_memory_db();
            let fx = seed(&db::lock(&conn).unwrap());
            Self {
                conn,
                fx,
                chain: Arc::new(MockChain::new(head)),
            }
        }

        fn engine(&self, cfg: EngineConfig) -> Engine {
            let rpc: Arc<dyn ChainRpc> = self.chain.clone();
            Engine::new(CHAIN, cfg, Arc::clone(&self.conn), rpc)
        }

        fn set_head(&self, head: u64) {
            self.chain.with(|s| s.head = head);
        }

        fn deposit_token(&self, value: u128, block: u64, tx_hash: &str, log_index: u64) {
            self.chain.token_transfer(
                self.fx.token_contract,
                self.fx.sender,
                self.fx.user_address,
                value,
                block,
                tx_hash,
                log_index,
            );
        }

        fn db<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
            f(&db::lock(&self.conn).unwrap())
        }

        fn status(&self, tx_hash: &str, log_index: i64) -> Option<DepositStatus> {
            self.db(|c| events::find(c, CHAIN, tx_hash, log_index).unwrap().map(|e| e.status))
        }

        fn balance(&self, asset_id: i64) -> Decimal {
            self.db(|c| {
                let account = ledger::user_account(c, self.fx.user_id, asset_id).unwrap();
                ledger::posted_balance(c, account).unwrap()
            })
        }

        fn available(&self, asset_id: i64) -> Decimal {
            self.db(|c| {
                let account = ledger::user_account(c, self.fx.user_id, asset_id).unwrap();
                ledger::available_balance(c, account).unwrap()
            })
        }

        fn count(&self, sql: &str) -> i64 {
            self.db(|c| c.query_row(sql, [], |r| r.get(0)).unwrap())
        }
    }

    #[tokio::test]
    async fn native_deposit_below_safe_tip_is_confirmed() {
        let h = Harness::new(103);
        h.chain
            .native_transfer(h.fx.sender, h.fx.user_address, ONE_AND_A_HALF, 100, "0xn1", true);
        // Reverted on chain: must not be credited.
        h.chain
            .native_transfer(h.fx.sender, h.fx.user_address, ONE_AND_A_HALF, 101, "0xn2", false);

        let report = h.engine(test_config()).run_once().await.unwrap();

        assert_eq!(report.from_block, 100);
        assert_eq!(report.cursor, 101);
        assert_eq!(report.credited, 1);
        assert_eq!(h.status("0xn1", NATIVE_LOG_INDEX), Some(DepositStatus::Confirmed));
        assert_eq!(h.status("0xn2", NATIVE_LOG_INDEX), None);
        assert_eq!(h.balance(h.fx.native_id), Decimal::new(15, 1));
    }

    #[tokio::test]
    async fn zero_value_and_foreign_transfers_leave_no_rows() {
        let h = Harness::new(120);
        h.deposit_token(0, 105, "0xz1", 0);
        h.chain
            .token_transfer(h.fx.token_contract, h.fx.sender, Address::from([0x77; 20]), 9, 106, "0xz2", 0);
        h.deposit_token(2_500_000, 107, "0xz3", 3);

        let report = h.engine(test_config()).run_once().await.unwrap();

        assert_eq!(report.credited, 1);
        assert_eq!(h.count("SELECT COUNT(*) FROM deposit_events"), 1);
        assert_eq!(h.balance(h.fx.token_id), Decimal::new(25, 1));
    }

    #[tokio::test]
    async fn overlapping_runs_never_double_credit() {
        let h = Harness::new(130);
        h.deposit_token(1_000_000, 104, "0xo1", 0);
        h.deposit_token(2_000_000, 117, "0xo2", 1);
        h.chain
            .native_transfer(h.fx.sender, h.fx.user_address, ONE_AND_A_HALF, 117, "0xo2", true);

        let first = h.engine(test_config()).run_once().await.unwrap();
        assert_eq!(first.credited, 3);

        // A second runner started from a stale cursor.
        h.db(|c| {
            c.execute("UPDATE chain_cursors SET last_scanned_block = 99", []).unwrap();
        });
        let second = h.engine(test_config()).run_once().await.unwrap();

        assert_eq!(second.credited, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(h.count("SELECT COUNT(*) FROM journal_entries"), 3);
        assert_eq!(h.balance(h.fx.token_id), Decimal::new(3, 0));
        assert_eq!(h.balance(h.fx.native_id), Decimal::new(15, 1));
    }

    #[tokio::test]
    async fn interrupted_batch_is_rescanned_without_double_credit() {
        let h = Harness::new(125);
        h.deposit_token(1_000_000, 103, "0xr1", 0);
        h.deposit_token(4_000_000, 115, "0xr2", 0);
        let engine = h.engine(test_config());

        // Credit the first sub-batch, then "crash" before the cursor moves.
        let mut ctx = engine.prepare().unwrap();
        ctx.safe_tip = 123;
        h.db(|c| cursor::load_or_init(c, CHAIN, 99).unwrap());
        let mut partial = ScanReport::default();
        engine.scan_range(&ctx, 100, 109, &mut partial).await.unwrap();
        assert_eq!(partial.credited, 1);
        assert_eq!(h.db(|c| cursor::load(c, CHAIN).unwrap()), Some(99));

        let resumed = engine.run_once().await.unwrap();
        assert_eq!(resumed.from_block, 100);
        assert_eq!(resumed.credited, 1);
        assert_eq!(resumed.duplicates, 1);
        assert_eq!(resumed.cursor, 123);
        assert_eq!(h.balance(h.fx.token_id), Decimal::new(5, 0));
        assert_eq!(h.count("SELECT COUNT(*) FROM journal_entries"), 2);
    }

    #[tokio::test]
    async fn orphaned_deposit_is_reversed_exactly_once() {
        let h = Harness::new(103);
        h.deposit_token(6_000_000, 100, "0xg1", 0);
        let engine = h.engine(test_config());
        engine.run_once().await.unwrap();
        assert_eq!(h.balance(h.fx.token_id), Decimal::new(6, 0));

        h.chain.orphan("0xg1");
        h.set_head(105);
        let report = engine.run_once().await.unwrap();
        assert_eq!(report.reverted, 1);
        assert!(h.status("0xg1", 0).unwrap().is_reverted());
        assert_eq!(h.balance(h.fx.token_id), Decimal::ZERO);

        h.set_head(106);
        let again = engine.run_once().await.unwrap();
        assert_eq!(again.reverted, 0);
        assert_eq!(
            h.count("SELECT COUNT(*) FROM journal_entries WHERE entry_type = 'deposit_reversal'"),
            1
        );
    }

    #[tokio::test]
    async fn pending_deposit_finalises_once_it_reaches_the_safe_tip() {
        let h = Harness::new(110);
        h.deposit_token(7_000_000, 108, "0xp1", 0);
        let cfg = EngineConfig {
            confirmations: 5,
            pending_credits: true,
            ..test_config()
        };
        let engine = h.engine(cfg);

        let first = engine.run_once().await.unwrap();
        assert_eq!(first.cursor, 105);
        assert_eq!(first.provisional_to, Some(110));
        assert!(matches!(h.status("0xp1", 0), Some(DepositStatus::Pending { .. })));
        assert_eq!(h.balance(h.fx.token_id), Decimal::new(7, 0));
        assert_eq!(h.available(h.fx.token_id), Decimal::ZERO);

        h.set_head(112);
        let second = engine.run_once().await.unwrap();
        assert_eq!(second.finalized, 0);
        assert!(matches!(h.status("0xp1", 0), Some(DepositStatus::Pending { .. })));

        h.set_head(113);
        let third = engine.run_once().await.unwrap();
        // Block 108 is rescanned as confirmed; the pending credit absorbs it.
        assert_eq!(third.cursor, 108);
        assert_eq!(third.credited, 0);
        assert_eq!(third.finalized, 1);
        assert_eq!(h.status("0xp1", 0), Some(DepositStatus::Confirmed));
        assert_eq!(h.available(h.fx.token_id), Decimal::new(7, 0));
        assert_eq!(h.count("SELECT COUNT(*) FROM holds WHERE status = 'released'"), 1);

        h.set_head(120);
        assert_eq!(engine.run_once().await.unwrap().finalized, 0);
    }

    fn pending_config() -> EngineConfig {
        EngineConfig {
            confirmations: 5,
            pending_credits: true,
            ..test_config()
        }
    }

    #[tokio::test]
    async fn pending_mode_never_moves_the_cursor_past_the_safe_tip() {
        let h = Harness::new(110);
        let engine = h.engine(pending_config());

        let report = engine.run_once().await.unwrap();
        assert_eq!(report.to_block, 105);
        assert_eq!(h.db(|c| cursor::load(c, CHAIN).unwrap()), Some(105));
    }

    #[tokio::test]
    async fn pending_transfer_remined_under_a_new_log_index_is_still_credited() {
        let h = Harness::new(110);
        h.deposit_token(5_000_000, 109, "0xm1", 3);
        let engine = h.engine(pending_config());

        engine.run_once().await.unwrap();
        assert!(matches!(h.status("0xm1", 3), Some(DepositStatus::Pending { .. })));

        // Two-block reorg: the same transaction lands in the new block 109 first.
        h.chain.orphan("0xm1");
        h.deposit_token(5_000_000, 109, "0xm1", 0);
        h.set_head(111);
        let report = engine.run_once().await.unwrap();
        assert_eq!(report.reverted, 1);
        assert_eq!(report.credited, 1);
        assert!(h.status("0xm1", 3).unwrap().is_reverted());
        assert!(matches!(h.status("0xm1", 0), Some(DepositStatus::Pending { .. })));

        h.set_head(114);
        let report = engine.run_once().await.unwrap();
        assert_eq!(report.finalized, 1);
        assert_eq!(h.status("0xm1", 0), Some(DepositStatus::Confirmed));
        assert_eq!(h.balance(h.fx.token_id), Decimal::new(5, 0));
        assert_eq!(h.available(h.fx.token_id), Decimal::new(5, 0));
        assert_eq!(h.count("SELECT COUNT(*) FROM holds WHERE status = 'released'"), 2);
    }

    #[tokio::test]
    async fn vanished_pending_credit_is_reverted_not_confirmed() {
        let h = Harness::new(110);
        h.deposit_token(8_000_000, 108, "0xv1", 0);
        let engine = h.engine(pending_config());

        engine.run_once().await.unwrap();
        assert!(matches!(h.status("0xv1", 0), Some(DepositStatus::Pending { .. })));

        // Gone from the chain by the time its block reaches the safe tip.
        h.chain.orphan("0xv1");
        h.set_head(114);
        let report = engine.run_once().await.unwrap();
        assert_eq!(report.reverted, 1);
        assert_eq!(report.finalized, 0);
        assert!(h.status("0xv1", 0).unwrap().is_reverted());
        assert_eq!(h.count("SELECT COUNT(*) FROM holds"), 1);
        assert_eq!(h.count("SELECT COUNT(*) FROM holds WHERE status = 'released'"), 1);

        let reversal: i64 = h.count("SELECT id FROM journal_entries WHERE entry_type = 'deposit_reversal'");
        let lines = h.db(|c| ledger::entry_lines(c, reversal).unwrap());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines.iter().map(|l| l.amount).sum::<Decimal>(), Decimal::ZERO);
        assert_eq!(h.balance(h.fx.token_id), Decimal::ZERO);
        assert_eq!(h.available(h.fx.token_id), Decimal::ZERO);

        h.set_head(115);
        let again = engine.run_once().await.unwrap();
        assert_eq!(again.reverted, 0);
        assert_eq!(again.finalized, 0);
        assert_eq!(h.count("SELECT COUNT(*) FROM holds WHERE status = 'released'"), 1);
    }

    #[tokio::test]
    async fn unrepresentable_amount_fails_the_batch() {
        let h = Harness::new(130);
        h.deposit_token(1_000_000, 104, "0xl1", 0);
        // Far beyond what a Decimal can carry at six decimals.
        h.deposit_token(u128::MAX, 105, "0xl2", 0);
        let engine = h.engine(test_config());

        let err = engine.run_once().await.unwrap_err();
        assert!(matches!(err, EngineError::AmountOutOfRange(_)));
        assert_eq!(h.db(|c| cursor::load(c, CHAIN).unwrap()), Some(99));
        assert_eq!(h.count("SELECT COUNT(*) FROM journal_entries"), 0);
    }

    #[tokio::test]
    async fn configuration_errors_fail_before_any_write() {
        let h = Harness::new(150);
        h.deposit_token(1_000_000, 120, "0xc1", 0);

        let unknown_symbol = EngineConfig {
            token_symbols: BTreeSet::from(["DAI".to_string()]),
            ..test_config()
        };
        let err = h.engine(unknown_symbol).run_once().await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let no_holds = EngineConfig {
            pending_credits: true,
            ..test_config()
        };
        let err = h
            .engine(no_holds)
            .with_capabilities(Capabilities {
                pending_credits: false,
                notifications: true,
            })
            .run_once()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        assert_eq!(h.db(|c| cursor::load(c, CHAIN).unwrap()), None);
        assert_eq!(h.count("SELECT COUNT(*) FROM deposit_events"), 0);
        assert_eq!(h.chain.get_logs_calls(), 0);
    }

    #[tokio::test]
    async fn allowlist_narrows_the_watched_tokens() {
        let h = Harness::new(130);
        h.deposit_token(1_000_000, 105, "0xa1", 0);
        let cfg = EngineConfig {
            token_symbols: BTreeSet::from(["USDC".to_string()]),
            ..test_config()
        };
        assert_eq!(h.engine(cfg).run_once().await.unwrap().credited, 1);
    }

    #[tokio::test]
    async fn exhausted_budget_stops_between_batches() {
        let h = Harness::new(200);
        h.deposit_token(1_000_000, 115, "0xb1", 0);
        let cfg = EngineConfig {
            time_budget: Duration::ZERO,
            ..test_config()
        };
        let engine = h.engine(cfg);

        let report = engine.run_once().await.unwrap();
        assert!(report.budget_exhausted);
        assert_eq!(report.batches, 1);
        assert_eq!(report.cursor, 109);
        assert_eq!(report.credited, 0);

        // The next run resumes right after the last completed batch.
        let next = engine.run_once().await.unwrap();
        assert_eq!(next.from_block, 110);
        assert_eq!(next.credited, 1);
    }

    #[tokio::test]
    async fn fresh_cursor_without_start_block_begins_at_the_safe_tip() {
        let h = Harness::new(5_000);
        h.deposit_token(1_000_000, 100, "0xh1", 0);
        let cfg = EngineConfig {
            start_block: None,
            ..test_config()
        };

        let report = h.engine(cfg).run_once().await.unwrap();
        assert_eq!(report.cursor, 4_998);
        assert_eq!(report.batches, 0);
        assert_eq!(h.count("SELECT COUNT(*) FROM deposit_events"), 0);
    }

    #[tokio::test]
    async fn prescan_records_unconfirmed_transfers_as_seen() {
        let h = Harness::new(103);
        h.deposit_token(3_000_000, 103, "0xs1", 0);
        let cfg = EngineConfig {
            seen_prescan: true,
            ..test_config()
        };
        let engine = h.engine(cfg);

        let first = engine.run_once().await.unwrap();
        assert_eq!(first.seen, 1);
        assert_eq!(h.status("0xs1", 0), Some(DepositStatus::Seen));
        assert_eq!(h.count("SELECT COUNT(*) FROM journal_entries"), 0);

        h.set_head(106);
        let second = engine.run_once().await.unwrap();
        assert_eq!(second.credited, 1);
        assert_eq!(h.status("0xs1", 0), Some(DepositStatus::Confirmed));
        assert_eq!(h.balance(h.fx.token_id), Decimal::new(3, 0));
    }

    #[tokio::test]
    async fn provider_quirks_do_not_change_the_outcome() {
        let h = Harness::new(160);
        h.deposit_token(1_000_000, 101, "0xq1", 0);
        h.deposit_token(2_000_000, 149, "0xq2", 0);
        h.chain.with(|s| {
            s.reject_multi_topics = true;
            s.max_range = Some(3);
            s.rate_limit_next = 1;
        });

        let report = h.engine(test_config()).run_once().await.unwrap();
        assert_eq!(report.credited, 2);
        assert_eq!(h.balance(h.fx.token_id), Decimal::new(3, 0));
    }

    #[tokio::test]
    async fn gateway_failure_keeps_the_cursor() {
        let h = Harness::new(130);
        h.deposit_token(1_000_000, 105, "0xf1", 0);
        h.chain.with(|s| s.fail_get_logs = true);
        let engine = h.engine(test_config());

        assert!(engine.run_once().await.is_err());
        assert_eq!(h.db(|c| cursor::load(c, CHAIN).unwrap()), Some(99));

        h.chain.with(|s| s.fail_get_logs = false);
        assert_eq!(engine.run_once().await.unwrap().credited, 1);
    }
}
