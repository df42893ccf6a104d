//! Daemon wiring: config → collaborators → worker pool

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tokio::sync::watch;
use tracing::info;

use tutorflow_config::Config;
use tutorflow_dedup::DuplicateDetector;
use tutorflow_delivery::{DeliveryService, DeliveryTransport, RecordingTransport};
use tutorflow_llm::{AnthropicBackend, DefaultCompilationHeuristic, Extractor, LlmBackend};
use tutorflow_store::{MemoryStore, PgStore, Store};
use tutorflow_utils::MetricsRegistry;
use tutorflow_worker::{WorkerContext, WorkerPool, freshness};

/// Broadcast feed channel the daemon posts to.
const BROADCAST_CHANNEL: &str = "assignments-feed";

/// Which store adapter to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Postgres via `DATABASE_URL` (or the configured env var).
    Postgres,
    /// In-memory adapter; smoke runs and local development.
    Memory,
}

/// Build the store for the selected adapter, running migrations on
/// Postgres.
pub async fn build_store(config: &Config, kind: StoreKind) -> Result<Arc<dyn Store>> {
    match kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Postgres => {
            let url = std::env::var(&config.store.database_url_env).with_context(|| {
                format!(
                    "database URL not found in environment variable '{}'",
                    config.store.database_url_env
                )
            })?;
            let store = PgStore::connect(&url, config.store.pool_size).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

/// Wire the full worker context. The transport here is the recording
/// no-op; production deployments inject their messaging transport via
/// [`build_context_with_transport`].
pub fn build_context(config: Config, store: Arc<dyn Store>) -> Result<Arc<WorkerContext>> {
    let backend = AnthropicBackend::new_from_config(&config.llm)?;
    build_context_with_transport(config, store, Arc::new(backend), Arc::new(RecordingTransport::new()))
}

/// Wire the worker context with explicit backend and transport
/// collaborators (tests, alternative deployments).
pub fn build_context_with_transport(
    config: Config,
    store: Arc<dyn Store>,
    backend: Arc<dyn LlmBackend>,
    transport: Arc<dyn DeliveryTransport>,
) -> Result<Arc<WorkerContext>> {
    let extractor = Arc::new(Extractor::new(backend, &config.llm));
    let detector = Arc::new(DuplicateDetector::new(
        Arc::clone(&store),
        config.dedup.clone(),
    ));
    let delivery = Arc::new(DeliveryService::new(
        Arc::clone(&store),
        transport,
        config.delivery.clone(),
        BROADCAST_CHANNEL,
    ));
    Ok(Arc::new(WorkerContext {
        store,
        extractor,
        heuristic: Arc::new(DefaultCompilationHeuristic),
        detector,
        delivery,
        metrics: Arc::new(MetricsRegistry::new()),
        config: Arc::new(config),
    }))
}

/// Run the worker pool, the stale-requeue supervisor, and the freshness
/// job until ctrl-c.
pub async fn run_daemon(ctx: Arc<WorkerContext>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let freshness_task = tokio::spawn(freshness::run_periodic(
        Arc::clone(&ctx.store),
        ctx.config.freshness.clone(),
        shutdown_rx.clone(),
    ));

    let pool = WorkerPool::new(Arc::clone(&ctx));
    let pool_task = {
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { pool.run(shutdown_rx).await })
    };

    info!(
        workers = ctx.config.worker.worker_count,
        pipeline_version = %ctx.config.pipeline_version,
        "daemon started"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let _ = pool_task.await;
    freshness_task.abort();
    Ok(())
}
