use std::sync::{Arc, Mutex};

use deposit_engine::{api, config, db, engine::Engine, rpc::HttpRpc, worker};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // RUST_LOG wins; plain info otherwise
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();

    info!("Deposit engine starting...");

    let cfg = config::load()?;
    info!("  Chain: {}", cfg.chain);
    info!("  RPC URL: {}", cfg.rpc_http_url);
    info!("  DB Path: {}", cfg.db_path);
    info!("  Confirmations: {}", cfg.engine.confirmations);
    info!("  Pending credits: {}", cfg.engine.pending_credits);
    info!("  Tokens allowlist: {:?}", cfg.engine.token_symbols);

    if cfg.run_migrations {
        let conn = db::connect(&cfg.db_path)?;
        db::run_migrations(&conn)?;
    }

    // Shared DB connection
    let shared_conn = Arc::new(Mutex::new(db::connect(&cfg.db_path)?));

    let rpc = Arc::new(HttpRpc::new(cfg.rpc_http_url.clone())?);
    let engine = Arc::new(Engine::new(
        cfg.chain.clone(),
        cfg.engine.clone(),
        Arc::clone(&shared_conn),
        rpc,
    ));

    let api_handle = tokio::spawn({
        let cfg = cfg.clone();
        let conn = Arc::clone(&shared_conn);
        async move { api::serve(cfg, conn).await }
    });

    let worker_handle = tokio::spawn({
        let cfg = cfg.clone();
        let engine = Arc::clone(&engine);
        let conn = Arc::clone(&shared_conn);
        async move { worker::run(cfg, engine, conn).await }
    });

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = worker_handle => match res {
            Ok(Ok(_)) => info!("Worker exited cleanly"),
            Ok(Err(e)) => error!("Worker error: {:?}", e),
            Err(e) => error!("Worker task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Deposit engine stopped.");
    Ok(())
}
