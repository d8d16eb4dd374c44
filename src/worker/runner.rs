//! Per-job execution.
//!
//! The runner drives one claimed job through its state machine: sandbox
//! resolution, exclusive output-directory reservation, provider search, the
//! concurrent download, checksums, the manifest, and the terminal store
//! write. Cancellation is observed cooperatively at every stage boundary and
//! after every downloaded chunk; a heartbeat watcher keeps the claim fresh
//! and trips the job's cancellation token when an operator cancel lands.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::download::{
    DownloadConfig, DownloadError, DownloadItem, DownloadManager, JobProgressTracker,
    ProgressUpdate, TokenRefresh,
};
use crate::humanize::format_rate;
use crate::jobs::{
    Job, JobError, JobErrorCode, JobEventKind, JobOutcome, JobResult, JobState, ProgressPatch,
    sandbox,
};
use crate::observability::Metrics;
use crate::providers::{Provider, ProviderError, ProviderRegistry};
use crate::store::JobStore;
use crate::worker::manifest;

/// Marker file naming the job that reserved an output directory, so a
/// re-attempt after a crash can reclaim it while a genuine collision fails.
const OWNER_MARKER: &str = ".nimbus-job";

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
enum RunError {
    /// Operator cancellation observed; finish as cancelled.
    Cancelled,
    /// Worker is shutting down or lost ownership; release without a
    /// terminal write.
    Shutdown,
    Failure(JobError),
}

impl From<JobError> for RunError {
    fn from(error: JobError) -> Self {
        RunError::Failure(error)
    }
}

/// Everything a runner needs, assembled once per worker.
pub struct RunnerContext {
    pub store: Arc<dyn JobStore>,
    pub providers: ProviderRegistry,
    pub data_dir: PathBuf,
    pub download: DownloadConfig,
    pub heartbeat_interval: Duration,
    pub worker_id: String,
    pub metrics: Arc<Metrics>,
}

pub struct JobRunner {
    ctx: RunnerContext,
}

impl JobRunner {
    pub fn new(ctx: RunnerContext) -> Self {
        Self { ctx }
    }

    /// Run a claimed job to a terminal state (or release it on shutdown).
    /// Never panics the worker: every failure lands in the store.
    pub async fn run(&self, job: Job, shutdown: CancellationToken) {
        let job_id = job.job_id;
        let job_cancel = shutdown.child_token();

        let watcher = tokio::spawn(heartbeat_watcher(
            self.ctx.store.clone(),
            job_id,
            self.ctx.worker_id.clone(),
            self.ctx.heartbeat_interval,
            job_cancel.clone(),
        ));

        let mut created_dir = None;
        let outcome = self.execute(&job, &job_cancel, &mut created_dir).await;
        watcher.abort();

        match outcome {
            Ok(result) => {
                info!(%job_id, paths = result.paths.len(), "Job succeeded");
                match self.ctx.store.finish(
                    job_id,
                    &self.ctx.worker_id,
                    JobOutcome::Succeeded(result),
                ) {
                    Ok(true) => self.ctx.metrics.job_succeeded(),
                    Ok(false) => warn!(%job_id, "Success write rejected; job was requeued"),
                    Err(e) => warn!(%job_id, error = %e, "Failed to record success"),
                }
            }
            Err(RunError::Cancelled) => {
                info!(%job_id, "Job cancelled");
                self.cleanup(&created_dir).await;
                match self
                    .ctx
                    .store
                    .finish(job_id, &self.ctx.worker_id, JobOutcome::Cancelled)
                {
                    Ok(true) => self.ctx.metrics.job_cancelled(),
                    Ok(false) => warn!(%job_id, "Cancel write rejected; job was requeued"),
                    Err(e) => warn!(%job_id, error = %e, "Failed to record cancellation"),
                }
            }
            Err(RunError::Shutdown) => {
                // Only touch the directory if this worker still owns the job;
                // after a sweep requeue the next attempt owns it.
                let still_owner = matches!(
                    self.ctx.store.get_job(job_id),
                    Ok(Some(j)) if j.is_owned_by(&self.ctx.worker_id)
                );
                if still_owner {
                    self.cleanup(&created_dir).await;
                    match self.ctx.store.release_to_queue(job_id, &self.ctx.worker_id) {
                        Ok(true) => info!(%job_id, "Job released back to queue on shutdown"),
                        Ok(false) => debug!(%job_id, "Release skipped; ownership already gone"),
                        Err(e) => warn!(%job_id, error = %e, "Failed to release job"),
                    }
                } else {
                    debug!(%job_id, "Ownership lost mid-run; leaving job to its new owner");
                }
            }
            Err(RunError::Failure(error)) => {
                warn!(%job_id, code = error.code.as_str(), message = %error.message, "Job failed");
                self.cleanup(&created_dir).await;
                match self
                    .ctx
                    .store
                    .finish(job_id, &self.ctx.worker_id, JobOutcome::Failed(error))
                {
                    Ok(true) => self.ctx.metrics.job_failed(),
                    Ok(false) => warn!(%job_id, "Failure write rejected; job was requeued"),
                    Err(e) => warn!(%job_id, error = %e, "Failed to record failure"),
                }
            }
        }
    }

    async fn execute(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        created_dir: &mut Option<PathBuf>,
    ) -> Result<JobResult, RunError> {
        let store = &self.ctx.store;
        let job_id = job.job_id;

        self.check_store_cancel(job_id)?;
        self.check_token(job_id, cancel)?;

        let requested_dir = job
            .request
            .output_dir()
            .map(str::to_owned)
            .unwrap_or_else(|| job_id.to_string());
        let output_dir =
            sandbox::resolve_output_dir(&self.ctx.data_dir, &requested_dir).map_err(|e| {
                JobError::new(
                    JobErrorCode::PathViolation,
                    e.to_string(),
                    json!({ "output_dir": requested_dir }),
                )
            })?;

        self.reserve_output_dir(&output_dir, job_id).await?;
        *created_dir = Some(output_dir.clone());

        let provider_kind = job.request.provider();
        let provider = self.ctx.providers.get(provider_kind).ok_or_else(|| {
            JobError::new(
                JobErrorCode::ProviderSearchError,
                format!("provider {provider_kind} is not configured on this worker"),
                json!({ "provider": provider_kind.as_str() }),
            )
        })?;

        provider.authenticate().await.map_err(|e| {
            JobError::new(
                JobErrorCode::ProviderAuthError,
                e.to_string(),
                json!({ "provider": provider_kind.as_str() }),
            )
        })?;

        let products = provider.search(&job.request).await.map_err(|e| {
            let code = match &e {
                ProviderError::Auth(_) => JobErrorCode::ProviderAuthError,
                _ => JobErrorCode::ProviderSearchError,
            };
            JobError::new(code, e.to_string(), json!({ "provider": provider_kind.as_str() }))
        })?;

        store
            .append_event(
                job_id,
                JobEventKind::ProductsFound,
                json!({
                    "count": products.len(),
                    "product_ids": products.iter().map(|p| p.id.clone()).collect::<Vec<_>>(),
                }),
            )
            .map_err(unknown_failure)?;
        debug!(%job_id, products = products.len(), "Provider search complete");

        let mut items = Vec::new();
        let mut taken = HashSet::new();
        for product in &products {
            self.check_token(job_id, cancel)?;
            let sources = provider.resolve(product).await.map_err(|e| {
                JobError::new(
                    JobErrorCode::ProviderSearchError,
                    e.to_string(),
                    json!({ "product_id": product.id }),
                )
            })?;
            if sources.is_empty() {
                return Err(JobError::new(
                    JobErrorCode::NoDownloadUrl,
                    format!("product {} resolved to no download URLs", product.id),
                    json!({ "product_id": product.id }),
                )
                .into());
            }
            for source in sources {
                items.push(DownloadItem {
                    url: source.url,
                    filename: unique_filename(&mut taken, &source.filename),
                    auth: source.auth,
                });
            }
        }

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let aggregator = tokio::spawn(aggregate_progress(
            store.clone(),
            job_id,
            self.ctx.worker_id.clone(),
            self.ctx.metrics.clone(),
            progress_rx,
        ));

        let refresh: Arc<dyn TokenRefresh> =
            Arc::new(ProviderTokenRefresh { provider: provider.clone() });
        let downloader = DownloadManager::new(self.ctx.download.clone(), Some(refresh))
            .map_err(unknown_failure)?;

        let fetched = downloader
            .fetch_all(items, &output_dir, cancel, progress_tx)
            .await;
        let (bytes_downloaded, bytes_total) = aggregator.await.unwrap_or((0, None));

        let files = match fetched {
            Ok(paths) => paths,
            Err(DownloadError::Cancelled) => return Err(self.cancel_reason(job_id)),
            Err(DownloadError::Failed { url, reason }) => {
                return Err(JobError::new(
                    JobErrorCode::DownloadFailed,
                    reason,
                    json!({ "url": url }),
                )
                .into());
            }
            Err(other) => {
                return Err(JobError::new(
                    JobErrorCode::DownloadFailed,
                    other.to_string(),
                    json!({}),
                )
                .into());
            }
        };

        self.check_token(job_id, cancel)?;
        let mut checksums = BTreeMap::new();
        for path in &files {
            let digest = manifest::sha256_file(path).await.map_err(|e| {
                JobError::new(
                    JobErrorCode::ChecksumFailed,
                    e.to_string(),
                    json!({ "path": path.display().to_string() }),
                )
            })?;
            checksums.insert(path.display().to_string(), manifest::checksum_entry(&digest));
        }

        self.check_token(job_id, cancel)?;
        let metadata = json!({
            "job_type": job.request.job_type(),
            "attempt": job.attempt,
            "products": products.len(),
            "files": files.len(),
        });
        let manifest_doc = manifest::build_manifest(
            job_id,
            provider_kind.as_str(),
            job.request.collection(),
            &files,
            &checksums,
            metadata.clone(),
        );
        let manifest_path = manifest::write_manifest(&output_dir, &manifest_doc)
            .await
            .map_err(|e| {
                JobError::new(JobErrorCode::ManifestWriteFailed, e.to_string(), json!({}))
            })?;
        let manifest_digest = manifest::sha256_file(&manifest_path).await.map_err(|e| {
            JobError::new(JobErrorCode::ManifestWriteFailed, e.to_string(), json!({}))
        })?;

        let mut paths: Vec<String> = files.iter().map(|p| p.display().to_string()).collect();
        paths.push(manifest_path.display().to_string());
        checksums.insert(
            manifest_path.display().to_string(),
            manifest::checksum_entry(&manifest_digest),
        );

        // Bring the record up to date before the terminal write; the throttle
        // may have swallowed the last in-flight update.
        let _ = store.update_progress(
            job_id,
            &self.ctx.worker_id,
            ProgressPatch {
                bytes_downloaded,
                bytes_total,
                progress: None,
            },
        );

        Ok(JobResult {
            job_id,
            paths,
            checksums,
            metadata,
            manifest_entry: manifest_doc,
            created_at: Utc::now(),
        })
    }

    /// Reserve the output directory by exclusive create. A directory left by
    /// an earlier attempt of the same job is wiped and recreated; anything
    /// else is a conflict.
    async fn reserve_output_dir(&self, path: &Path, job_id: Uuid) -> Result<(), RunError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(unknown_failure)?;
        }
        match tokio::fs::create_dir(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let marker = path.join(OWNER_MARKER);
                let owned = matches!(
                    tokio::fs::read_to_string(&marker).await,
                    Ok(contents) if contents.trim() == job_id.to_string()
                );
                if !owned {
                    return Err(JobError::new(
                        JobErrorCode::PathConflict,
                        "output directory is already reserved by another job",
                        json!({ "output_dir": path.display().to_string() }),
                    )
                    .into());
                }
                debug!(%job_id, path = %path.display(), "Reclaiming directory from earlier attempt");
                tokio::fs::remove_dir_all(path)
                    .await
                    .map_err(unknown_failure)?;
                tokio::fs::create_dir(path).await.map_err(unknown_failure)?;
            }
            Err(e) => return Err(unknown_failure(e)),
        }
        tokio::fs::write(path.join(OWNER_MARKER), job_id.to_string())
            .await
            .map_err(unknown_failure)?;
        Ok(())
    }

    async fn cleanup(&self, created_dir: &Option<PathBuf>) {
        if let Some(dir) = created_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                warn!(path = %dir.display(), error = %e, "Failed to remove output directory");
            }
        }
    }

    fn check_store_cancel(&self, job_id: Uuid) -> Result<(), RunError> {
        match self.ctx.store.get_job(job_id) {
            Ok(Some(job)) => match job.state {
                JobState::CancelRequested => Err(RunError::Cancelled),
                JobState::Running => Ok(()),
                _ => Err(RunError::Shutdown),
            },
            _ => Err(RunError::Shutdown),
        }
    }

    fn check_token(&self, job_id: Uuid, cancel: &CancellationToken) -> Result<(), RunError> {
        if cancel.is_cancelled() {
            Err(self.cancel_reason(job_id))
        } else {
            Ok(())
        }
    }

    /// The token tripped: an operator cancel shows up as `cancel_requested`
    /// in the store; everything else is a shutdown or ownership loss.
    fn cancel_reason(&self, job_id: Uuid) -> RunError {
        match self.ctx.store.get_job(job_id) {
            Ok(Some(job)) if job.state == JobState::CancelRequested => RunError::Cancelled,
            _ => RunError::Shutdown,
        }
    }
}

fn unknown_failure(error: impl std::fmt::Display) -> RunError {
    RunError::Failure(JobError::new(
        JobErrorCode::Unknown,
        error.to_string(),
        json!({}),
    ))
}

/// Consume the download progress channel: keep the job record fresh (at most
/// once per second plus file boundaries), emit throttled `job.progress`
/// events, and return the final byte accounting.
async fn aggregate_progress(
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    worker_id: String,
    metrics: Arc<Metrics>,
    mut rx: mpsc::Receiver<ProgressUpdate>,
) -> (u64, Option<u64>) {
    let mut tracker = JobProgressTracker::new();
    while let Some(update) = rx.recv().await {
        metrics.add_bytes(update.delta);
        tracker.observe(&update);

        if tracker.should_write_store(update.file_complete) {
            let patch = ProgressPatch {
                bytes_downloaded: tracker.bytes_downloaded(),
                bytes_total: tracker.bytes_total(),
                progress: tracker.percent(),
            };
            if let Err(e) = store.update_progress(job_id, &worker_id, patch) {
                warn!(%job_id, error = %e, "Progress write failed");
            }
        }
        if tracker.should_emit_event() {
            let payload = json!({
                "bytes_downloaded": tracker.bytes_downloaded(),
                "bytes_total": tracker.bytes_total(),
                "progress": tracker.percent(),
                "speed_bps": tracker.speed_bps(),
                "speed": format_rate(tracker.speed_bps()),
            });
            if let Err(e) = store.append_event(job_id, JobEventKind::Progress, payload) {
                warn!(%job_id, error = %e, "Progress event append failed");
            }
        }
    }
    (tracker.bytes_downloaded(), tracker.bytes_total())
}

/// Keeps `last_heartbeat_at` fresh and trips the job token when a cancel
/// request or an ownership loss is observed.
async fn heartbeat_watcher(
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    worker_id: String,
    interval: Duration,
    job_cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = store.heartbeat(job_id, &worker_id) {
            warn!(%job_id, error = %e, "Heartbeat failed");
        }
        match store.get_job(job_id) {
            Ok(Some(job)) if job.state == JobState::CancelRequested => {
                info!(%job_id, "Cancel requested; stopping job");
                job_cancel.cancel();
                return;
            }
            Ok(Some(job)) if !job.is_owned_by(&worker_id) => {
                warn!(%job_id, "Ownership lost; stopping job");
                job_cancel.cancel();
                return;
            }
            _ => {}
        }
    }
}

struct ProviderTokenRefresh {
    provider: Arc<dyn Provider>,
}

#[async_trait]
impl TokenRefresh for ProviderTokenRefresh {
    async fn refresh(&self) -> Option<String> {
        self.provider.refresh_token().await
    }
}

/// Deduplicate suggested filenames within one job.
fn unique_filename(taken: &mut HashSet<String>, candidate: &str) -> String {
    let base = Path::new(candidate)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(candidate);
    if taken.insert(base.to_string()) {
        return base.to_string();
    }
    let (stem, extension) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
        _ => (base.to_string(), String::new()),
    };
    let mut n = 1;
    loop {
        let name = format!("{stem}-{n}{extension}");
        if taken.insert(name.clone()) {
            return name;
        }
        n += 1;
    }
}
