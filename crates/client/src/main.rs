//! `fieldsync-agent`: headless sync agent.
//!
//! Opens the durable offline state, probes connectivity in the background and
//! replays queued actions whenever the API is reachable. Runs until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use fieldsync_client::{
    ClientConfig, ConnectivityMonitor, ConnectivityState, ConnectivityWorker, DurableStore, HttpRemoteApi, OfflineEngine,
    SqliteKeyValueStore,
};
use fieldsync_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format = std::env::var("FIELDSYNC_LOG_FORMAT")
        .ok()
        .and_then(|v| LogFormat::parse(&v))
        .unwrap_or_default();
    fieldsync_observability::tracing::init(log_format);

    let config = ClientConfig::from_env().context("failed to load configuration")?;
    tracing::info!(
        api_url = %config.api_url,
        data_dir = %config.data_dir.display(),
        authenticated = config.auth_token.is_some(),
        "starting fieldsync agent"
    );

    let kv = Arc::new(SqliteKeyValueStore::open(config.db_path()));
    let remote = HttpRemoteApi::new(config.api_url.clone(), config.auth_token.clone(), config.request_timeout)
        .context("failed to build API client")?;

    // Start offline; the first probe decides.
    let monitor = ConnectivityMonitor::arc(ConnectivityState::Offline);
    let engine = OfflineEngine::open(DurableStore::new(kv), Arc::new(remote), monitor, config.engine_options()).await;

    let status = engine.status();
    tracing::info!(pending = status.pending, dead_lettered = status.dead_lettered, "offline state loaded");

    let worker = ConnectivityWorker::new(engine.clone(), config.probe_interval);
    let shutdown = worker.shutdown_handle();
    let handle = worker.start();

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    shutdown.notify_one();
    handle.await.context("connectivity worker panicked")?;

    let status = engine.status();
    tracing::info!(pending = status.pending, "fieldsync agent stopped");
    Ok(())
}
