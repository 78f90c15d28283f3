use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use tokio::task;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::cursor;
use crate::db::{self, SharedConn};
use crate::error::EngineResult;
use crate::events;
use crate::lock;

/// Operational view of one chain's ingestion.
#[derive(Debug, Serialize, PartialEq)]
pub struct ChainStatus {
    pub chain: String,
    pub last_scanned_block: Option<u64>,
    /// Deposit events by status.
    pub events: BTreeMap<String, i64>,
    pub runner: Option<String>,
    pub runner_lease_expires_at: Option<i64>,
}

pub async fn serve(cfg: Config, conn: SharedConn) -> eyre::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(cfg.chain.clone(), conn).layer(cors);

    let addr = SocketAddr::from(([127, 0, 0, 1], cfg.port));
    info!("API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

pub fn router(chain: String, conn: SharedConn) -> Router {
    Router::new()
        .route("/", get(|| async { "Deposit engine running" }))
        .route(
            "/status",
            get(move || {
                let conn = Arc::clone(&conn);
                let chain = chain.clone();
                async move { get_status(conn, chain).await }
            }),
        )
}

async fn get_status(conn: SharedConn, chain: String) -> Result<Json<ChainStatus>, (StatusCode, String)> {
    task::spawn_blocking(move || load_status(&conn, &chain))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

pub fn load_status(conn: &SharedConn, chain: &str) -> EngineResult<ChainStatus> {
    let db = db::lock(conn)?;
    let lease = lock::current_holder(&db, &lock::lock_name(chain))?;

    Ok(ChainStatus {
        chain: chain.to_string(),
        last_scanned_block: cursor::load(&db, chain)?,
        events: events::status_counts(&db, chain)?.into_iter().collect(),
        runner: lease.as_ref().map(|(holder, _)| holder.clone()),
        runner_lease_expires_at: lease.map(|(_, expires_at)| expires_at),
    })
}
