//! Pledge reconciler daemon — entry point.
//!
//! Tracks crowdfunding projects and their pledges against the Bitcoin UTXO
//! set, cross-checking every answer across the configured Esplora sources.
//! Background tasks watch the chain tip and the optional status feed; a
//! small Axum REST API exposes the derived state.

use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reconciler::api;
use reconciler::config::Config;
use reconciler::db;
use reconciler::engine::{Engine, PledgeOrigin};
use reconciler::esplora::EsploraSource;
use reconciler::feed::{HttpStatusFeed, StatusFeed};
use reconciler::source::SharedSource;
use reconciler::watcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url).await?;

    // Shared by every source and the feed; per-request timeout bounds each call.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(config.query_timeout_secs))
        .build()?;

    let esplora: Vec<Arc<EsploraSource>> = config
        .utxo_source_urls
        .iter()
        .map(|url| Arc::new(EsploraSource::new(client.clone(), url.as_str())))
        .collect();
    let sources: Vec<SharedSource> = esplora.iter().map(|s| s.clone() as SharedSource).collect();
    let feed = config
        .status_feed_url
        .as_ref()
        .map(|url| Arc::new(HttpStatusFeed::new(client.clone(), url.as_str())) as Arc<dyn StatusFeed>);
    let has_feed = feed.is_some();

    let engine = Engine::new(config.engine(), sources, feed);
    info!(
        sources = config.utxo_source_urls.len(),
        status_feed = has_feed,
        "Engine ready"
    );

    // ─── Reload persisted state ───────────────────────────
    let projects = db::load_projects(&pool).await?;
    let project_count = projects.len();
    for project in projects {
        engine.track_project(project);
    }
    let mut pledge_count = 0usize;
    for pledge in db::load_pledges(&pool).await? {
        match engine.ingest_pledge(pledge, PledgeOrigin::Local) {
            Ok(_) => pledge_count += 1,
            Err(e) => warn!("Skipping stored pledge: {e}"),
        }
    }
    info!("Reloaded {project_count} projects and {pledge_count} pledges");

    // ─── Background tasks ─────────────────────────────────
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    if let Some(tips) = esplora.first() {
        tasks.push(tokio::spawn(watcher::watch_chain_tip(
            engine.clone(),
            tips.clone(),
            config.tip_poll_interval(),
            cancel.clone(),
        )));
    }
    if has_feed {
        tasks.push(tokio::spawn(watcher::poll_status_feed(
            engine.clone(),
            config.feed_poll_interval(),
            cancel.clone(),
        )));
    }
    tasks.push(tokio::spawn(watcher::prune_revoked(
        engine.clone(),
        pool.clone(),
        cancel.clone(),
    )));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { engine, pool });

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Reconciler stopped");
    Ok(())
}
