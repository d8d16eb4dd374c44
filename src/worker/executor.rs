//! Worker claim loop.
//!
//! Admission is two-level: a global semaphore of `max_jobs` gates total
//! in-flight jobs, then a per-provider semaphore gates each provider. The
//! provider slot is tried with zero timeout; a job claimed against a
//! saturated provider is handed straight back to the queue (owner cleared,
//! attempt unchanged) so it cannot block the head of the line. A background
//! sweep requeues jobs whose heartbeat has gone stale.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::ProviderKind;
use crate::observability::Metrics;
use crate::store::JobStore;
use crate::worker::runner::JobRunner;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub max_jobs: usize,
    pub provider_limits: HashMap<ProviderKind, usize>,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub providers_allow: Option<Vec<ProviderKind>>,
}

pub struct Executor {
    config: ExecutorConfig,
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
    metrics: Arc<Metrics>,
    global: Arc<Semaphore>,
    provider_slots: HashMap<ProviderKind, Arc<Semaphore>>,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        store: Arc<dyn JobStore>,
        runner: Arc<JobRunner>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let global = Arc::new(Semaphore::new(config.max_jobs.max(1)));
        let provider_slots = config
            .provider_limits
            .iter()
            .map(|(&provider, &limit)| (provider, Arc::new(Semaphore::new(limit.max(1)))))
            .collect();
        Self {
            config,
            store,
            runner,
            metrics,
            global,
            provider_slots,
            shutdown,
        }
    }

    /// Main loop: sweep once unconditionally (crash recovery), then claim and
    /// dispatch until shutdown; in-flight jobs are drained before returning.
    pub async fn run(&self) {
        info!(
            worker = %self.config.worker_id,
            max_jobs = self.config.max_jobs,
            "Worker executor starting"
        );

        match self.store.requeue_incomplete(None) {
            Ok(0) => {}
            Ok(count) => {
                self.metrics.jobs_requeued(count as u64);
                info!(count, "Startup sweep requeued incomplete jobs");
            }
            Err(e) => warn!(error = %e, "Startup sweep failed"),
        }

        let sweeper = tokio::spawn(sweep_loop(
            self.store.clone(),
            self.metrics.clone(),
            self.config.stale_after,
            self.shutdown.clone(),
        ));

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.global.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Claim only from providers with a free slot; without this a
            // single worker would re-claim the head-of-line job of a
            // saturated provider forever while other providers starve.
            let allow = self.claimable_providers();
            let claimed = if allow.is_empty() {
                None
            } else {
                match self.store.claim_next(&self.config.worker_id, Some(&allow)) {
                    Ok(claimed) => claimed,
                    Err(e) => {
                        warn!(error = %e, "Claim failed");
                        None
                    }
                }
            };

            let Some(job) = claimed else {
                drop(permit);
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            self.metrics.job_claimed();
            let provider = job.request.provider();
            let provider_permit = match self.provider_slots.get(&provider) {
                Some(slots) => match slots.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        // Saturated provider: hand the job back instead of
                        // holding a global slot hostage.
                        debug!(job_id = %job.job_id, %provider, "Provider saturated; releasing job");
                        if let Err(e) = self
                            .store
                            .release_to_queue(job.job_id, &self.config.worker_id)
                        {
                            warn!(job_id = %job.job_id, error = %e, "Release failed");
                        }
                        drop(permit);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.config.poll_interval) => {}
                        }
                        continue;
                    }
                },
                None => None,
            };

            debug!(job_id = %job.job_id, %provider, attempt = job.attempt, "Dispatching job");
            let runner = self.runner.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                let _global = permit;
                let _provider = provider_permit;
                runner.run(job, shutdown).await;
            });
        }

        info!("Executor stopping; draining in-flight jobs");
        while tasks.join_next().await.is_some() {}
        sweeper.abort();
        info!("Executor stopped");
    }

    /// The worker's allow-list minus providers whose semaphore is exhausted.
    /// The zero-timeout acquire below stays as the backstop for the race
    /// between this check and the claim.
    fn claimable_providers(&self) -> Vec<ProviderKind> {
        self.config
            .providers_allow
            .clone()
            .unwrap_or_else(|| ProviderKind::ALL.to_vec())
            .into_iter()
            .filter(|provider| {
                self.provider_slots
                    .get(provider)
                    .is_none_or(|slots| slots.available_permits() > 0)
            })
            .collect()
    }
}

/// Periodic stale sweep: any active job whose heartbeat is older than the
/// threshold gets requeued with `attempt` incremented.
async fn sweep_loop(
    store: Arc<dyn JobStore>,
    metrics: Arc<Metrics>,
    stale_after: Duration,
    shutdown: CancellationToken,
) {
    let period = stale_after.max(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(period) => {}
        }
        let threshold = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::seconds(60));
        match store.requeue_incomplete(Some(threshold)) {
            Ok(0) => {}
            Ok(count) => {
                metrics.jobs_requeued(count as u64);
                info!(count, "Stale sweep requeued jobs");
            }
            Err(e) => warn!(error = %e, "Stale sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::DownloadConfig;
    use crate::jobs::request::{Aoi, SearchDownloadRequest};
    use crate::jobs::{JobRequest, JobState};
    use crate::providers::{DownloadSource, Product, Provider, ProviderError, ProviderRegistry};
    use crate::store::MemoryJobStore;
    use crate::worker::runner::RunnerContext;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Zero-file provider that records its maximum search concurrency.
    struct ProbeProvider {
        kind: ProviderKind,
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ProbeProvider {
        fn new(kind: ProviderKind, delay: Duration) -> Self {
            Self {
                kind,
                delay,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn peak_concurrency(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ProbeProvider {
        fn key(&self) -> ProviderKind {
            self.kind
        }

        async fn authenticate(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn search(&self, _request: &JobRequest) -> Result<Vec<Product>, ProviderError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn resolve(&self, _product: &Product) -> Result<Vec<DownloadSource>, ProviderError> {
            Ok(vec![])
        }
    }

    fn request(provider: ProviderKind, output_dir: &str) -> JobRequest {
        JobRequest::SearchDownload(SearchDownloadRequest {
            provider,
            collection: "SENTINEL-2".to_string(),
            product_type: "S2MSI2A".to_string(),
            start_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: chrono::NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            aoi: Aoi {
                wkt: Some("POLYGON((0 0,0 1,1 1,1 0,0 0))".to_string()),
                geojson: None,
            },
            tile_id: None,
            output_dir: Some(output_dir.to_string()),
        })
    }

    fn build_executor(
        store: Arc<dyn JobStore>,
        data_dir: &std::path::Path,
        providers: ProviderRegistry,
        provider_limits: HashMap<ProviderKind, usize>,
        max_jobs: usize,
        shutdown: CancellationToken,
    ) -> Executor {
        let metrics = Arc::new(Metrics::new());
        let runner = Arc::new(JobRunner::new(RunnerContext {
            store: store.clone(),
            providers,
            data_dir: data_dir.to_path_buf(),
            download: DownloadConfig::default(),
            heartbeat_interval: Duration::from_millis(50),
            worker_id: "worker-exec".to_string(),
            metrics: metrics.clone(),
        }));
        Executor::new(
            ExecutorConfig {
                worker_id: "worker-exec".to_string(),
                max_jobs,
                provider_limits,
                poll_interval: Duration::from_millis(20),
                stale_after: Duration::from_secs(30),
                providers_allow: None,
            },
            store,
            runner,
            metrics,
            shutdown,
        )
    }

    async fn wait_for_terminal(store: &Arc<dyn JobStore>, job_ids: &[Uuid]) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let done = job_ids.iter().all(|&id| {
                    store
                        .get_job(id)
                        .ok()
                        .flatten()
                        .map(|j| j.state.is_terminal())
                        .unwrap_or(false)
                });
                if done {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("jobs did not reach a terminal state in time");
    }

    #[tokio::test]
    async fn drains_the_queue_to_success() {
        let data_dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(ProbeProvider::new(
            ProviderKind::Copernicus,
            Duration::from_millis(10),
        )));

        let job_ids: Vec<Uuid> = (0..3)
            .map(|i| {
                store
                    .create_job(request(ProviderKind::Copernicus, &format!("job-{i}")))
                    .unwrap()
            })
            .collect();

        let shutdown = CancellationToken::new();
        let executor = build_executor(
            store.clone(),
            data_dir.path(),
            providers,
            HashMap::new(),
            2,
            shutdown.clone(),
        );
        let handle = tokio::spawn(async move { executor.run().await });

        wait_for_terminal(&store, &job_ids).await;
        shutdown.cancel();
        handle.await.unwrap();

        for job_id in job_ids {
            let job = store.get_job(job_id).unwrap().unwrap();
            assert_eq!(job.state, JobState::Succeeded, "job {job_id} did not succeed");
        }
    }

    #[tokio::test]
    async fn provider_limit_caps_concurrency() {
        let data_dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let probe = Arc::new(ProbeProvider::new(
            ProviderKind::Copernicus,
            Duration::from_millis(100),
        ));
        let mut providers = ProviderRegistry::new();
        providers.register(probe.clone());

        let job_ids: Vec<Uuid> = (0..3)
            .map(|i| {
                store
                    .create_job(request(ProviderKind::Copernicus, &format!("capped-{i}")))
                    .unwrap()
            })
            .collect();

        let shutdown = CancellationToken::new();
        let executor = build_executor(
            store.clone(),
            data_dir.path(),
            providers,
            HashMap::from([(ProviderKind::Copernicus, 1)]),
            4,
            shutdown.clone(),
        );
        let handle = tokio::spawn(async move { executor.run().await });

        wait_for_terminal(&store, &job_ids).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(probe.peak_concurrency(), 1);
        for job_id in job_ids {
            assert_eq!(
                store.get_job(job_id).unwrap().unwrap().state,
                JobState::Succeeded
            );
        }
    }

    #[tokio::test]
    async fn saturated_provider_job_is_released_not_stuck() {
        // One slow copernicus job holds the single provider slot; a second
        // copernicus job must keep cycling through claim/release (attempt
        // unchanged) until the slot frees, then complete.
        let data_dir = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(ProbeProvider::new(
            ProviderKind::Copernicus,
            Duration::from_millis(150),
        )));

        let first = store
            .create_job(request(ProviderKind::Copernicus, "slot-0"))
            .unwrap();
        let second = store
            .create_job(request(ProviderKind::Copernicus, "slot-1"))
            .unwrap();

        let shutdown = CancellationToken::new();
        let executor = build_executor(
            store.clone(),
            data_dir.path(),
            providers,
            HashMap::from([(ProviderKind::Copernicus, 1)]),
            4,
            shutdown.clone(),
        );
        let handle = tokio::spawn(async move { executor.run().await });

        wait_for_terminal(&store, &[first, second]).await;
        shutdown.cancel();
        handle.await.unwrap();

        let second = store.get_job(second).unwrap().unwrap();
        assert_eq!(second.state, JobState::Succeeded);
        // Releases are not restarts.
        assert_eq!(second.attempt, 1);
    }
}
