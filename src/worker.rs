use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::db::{self, SharedConn};
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::lock::Lease;
use crate::models::ScanReport;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Run the engine forever: take the runner lock, run once, release, sleep.
pub async fn run(cfg: Config, engine: Arc<Engine>, conn: SharedConn) -> eyre::Result<()> {
    let lease = Lease::for_chain(&cfg.chain, cfg.worker_id.clone(), cfg.lock_ttl);
    let mut retry_delay = cfg.poll_interval;

    info!(
        "Worker {} started for {} (poll every {:?})",
        cfg.worker_id, cfg.chain, cfg.poll_interval
    );

    loop {
        let delay = match run_locked(&engine, &conn, &lease).await {
            Ok(Some(report)) => {
                retry_delay = cfg.poll_interval;
                if report.budget_exhausted {
                    // Still behind: go again straight away.
                    Duration::ZERO
                } else {
                    cfg.poll_interval
                }
            }
            Ok(None) => {
                debug!("{} is held by another worker", lease.name);
                cfg.poll_interval
            }
            Err(e) => {
                error!("Run failed: {}", e);
                retry_delay = (retry_delay * 2).min(MAX_RETRY_DELAY);
                retry_delay
            }
        };

        sleep(delay).await;
    }
}

/// One run under the runner lock. `None` when another holder owns it.
///
/// The lease is renewed after every sub-batch; a run that loses it stops there.
pub async fn run_locked(engine: &Engine, conn: &SharedConn, lease: &Lease) -> EngineResult<Option<ScanReport>> {
    let acquired = {
        let guard = db::lock(conn)?;
        lease.acquire(&guard)?
    };
    if !acquired {
        return Ok(None);
    }

    let result = engine.run_leased(lease).await;

    {
        let guard = db::lock(conn)?;
        lease.release(&guard)?;
    }
    result.map(Some)
}
