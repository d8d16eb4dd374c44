//! Runtime assembly: builds the store, metrics, and provider registry once,
//! then starts the loops selected by the configured role (`api`, `worker`,
//! `all`) under a shared shutdown token.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api;
use crate::api::state::AppState;
use crate::config::Settings;
use crate::jobs::ProviderKind;
use crate::observability::Metrics;
use crate::providers::ProviderRegistry;
use crate::store;
use crate::worker::{Executor, ExecutorConfig, JobRunner, RunnerContext};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(settings: Settings, providers: ProviderRegistry) -> Result<(), AnyError> {
    let settings = Arc::new(settings);
    std::fs::create_dir_all(&settings.runtime.data_dir)?;

    let store = store::open(&settings.db)?;
    let metrics = Arc::new(Metrics::new());
    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let role = settings.runtime.role;
    info!(role = role.as_str(), db = settings.db.backend.as_str(), "Starting nimbus-fetch");

    let mut worker_handle = None;
    if role.includes_worker() {
        let worker_id = settings
            .runtime
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));
        let provider_limits = settings
            .runtime
            .provider_limits
            .iter()
            .filter_map(|(name, &limit)| {
                name.parse::<ProviderKind>().ok().map(|kind| (kind, limit))
            })
            .collect();
        let providers_allow = settings.runtime.providers_allow.as_ref().map(|allow| {
            allow
                .iter()
                .filter_map(|name| name.parse::<ProviderKind>().ok())
                .collect::<Vec<_>>()
        });

        let runner = Arc::new(JobRunner::new(RunnerContext {
            store: store.clone(),
            providers: providers.clone(),
            data_dir: settings.runtime.data_dir.clone(),
            download: settings.download.to_config(),
            heartbeat_interval: settings.runtime.heartbeat_interval(),
            worker_id: worker_id.clone(),
            metrics: metrics.clone(),
        }));
        let executor = Executor::new(
            ExecutorConfig {
                worker_id,
                max_jobs: settings.runtime.max_jobs,
                provider_limits,
                poll_interval: settings.runtime.poll_interval(),
                stale_after: settings.runtime.stale_after(),
                providers_allow,
            },
            store.clone(),
            runner,
            metrics.clone(),
            shutdown.clone(),
        );
        worker_handle = Some(tokio::spawn(async move { executor.run().await }));
    }

    if role.includes_api() {
        let state = AppState::new(settings.clone(), store.clone(), metrics.clone());
        let router = api::server::build_router(state);
        api::server::serve(router, settings.server.bind_addr, shutdown.clone()).await?;
        // The API loop only returns on shutdown; make sure the worker
        // observes it too.
        shutdown.cancel();
    } else {
        shutdown.cancelled().await;
    }

    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task join failed");
        }
    }
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM where the platform has one.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; waiting on Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("Shutdown signal received");
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
