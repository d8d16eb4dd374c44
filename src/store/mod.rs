//! Durable job store: the single shared mutable state of the system.
//!
//! All cross-worker coordination happens through a [`JobStore`]: atomic queue
//! claim, owner-checked writes, append-only events with a store-wide
//! monotonic sequence, and the stale-job sweep. Two backends ship — the
//! durable fjall keyspace and an in-memory store for tests — both driven by
//! the transition helpers below so their semantics cannot drift.

pub mod fjall;
pub mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{DbBackend, DbSettings};
use crate::jobs::{
    CancelOutcome, Job, JobError, JobEvent, JobEventKind, JobOutcome, JobRequest, JobResult,
    JobState, ProgressPatch, ProviderKind,
};

pub use self::fjall::FjallJobStore;
pub use self::memory::MemoryJobStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Scope for event tailing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    All,
    Job(Uuid),
}

/// Listing filter; all clauses are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub provider: Option<ProviderKind>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(state) = self.state {
            if job.state != state {
                return false;
            }
        }
        if let Some(provider) = self.provider {
            if job.request.provider() != provider {
                return false;
            }
        }
        if let Some(from) = self.date_from {
            if job.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.date_to {
            if job.created_at > to {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

/// Store contract. Operations commit durably before returning.
pub trait JobStore: Send + Sync {
    /// Insert a `queued` job (attempt=1) and its `job.queued` event.
    fn create_job(&self, request: JobRequest) -> Result<Uuid>;

    /// Atomically claim the oldest queued job (FIFO by `created_at`, then
    /// `job_id`), optionally restricted to an allow-list of providers.
    /// Appends `job.started`. No two callers can claim the same job.
    fn claim_next(&self, worker_id: &str, providers: Option<&[ProviderKind]>)
    -> Result<Option<Job>>;

    /// Inverse of claim (owner-checked): back to `queued`, owner cleared,
    /// attempt unchanged, no event.
    fn release_to_queue(&self, job_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Owner-checked heartbeat while the job is active.
    fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool>;

    /// Owner-checked, monotonic progress write. Throttling is the caller's
    /// responsibility.
    fn update_progress(&self, job_id: Uuid, worker_id: &str, patch: ProgressPatch)
    -> Result<bool>;

    /// Queued jobs cancel immediately; running jobs move to
    /// `cancel_requested`; terminal jobs are untouched.
    fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome>;

    /// Owner-checked terminal transition; persists the result atomically for
    /// `succeeded` and appends the matching terminal event.
    fn finish(&self, job_id: Uuid, worker_id: &str, outcome: JobOutcome) -> Result<bool>;

    /// Append an event with the next store-wide monotonic id.
    fn append_event(&self, job_id: Uuid, kind: JobEventKind, payload: Value) -> Result<u64>;

    /// Requeue active jobs whose heartbeat is older than `stale_before`
    /// (`None` = unconditional, used by the startup sweep). Increments
    /// `attempt` and appends `job.requeued_after_restart`.
    fn requeue_incomplete(&self, stale_before: Option<DateTime<Utc>>) -> Result<usize>;

    /// Stable listing: `created_at` desc, `job_id` asc. `page` is 1-based.
    fn list_jobs(&self, filter: &JobFilter, page: u32, page_size: u32) -> Result<JobPage>;

    fn get_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>>;

    /// Events with `id > since`, ordered by id, at most `limit` per call.
    /// Restartable from any persisted id.
    fn events_after(&self, scope: EventScope, since: u64, limit: usize) -> Result<Vec<JobEvent>>;
}

/// Open the configured backend.
pub fn open(settings: &DbSettings) -> Result<Arc<dyn JobStore>> {
    match settings.backend {
        DbBackend::Fjall => Ok(Arc::new(FjallJobStore::open(&settings.path)?)),
        DbBackend::Memory => Ok(Arc::new(MemoryJobStore::new())),
    }
}

// --- shared transition logic -------------------------------------------------
//
// Both backends funnel state changes through these helpers; each returns the
// event(s) the caller must append inside the same critical section.

pub(crate) fn queued_event_payload(job: &Job) -> Value {
    json!({
        "job_type": job.request.job_type(),
        "provider": job.request.provider().as_str(),
        "collection": job.request.collection(),
    })
}

pub(crate) fn started_event_payload(job: &Job, worker_id: &str) -> Value {
    json!({ "worker": worker_id, "attempt": job.attempt })
}

pub(crate) fn requeued_event_payload(job: &Job) -> Value {
    json!({ "attempt": job.attempt })
}

/// Whether `job` is claimable by a worker with the given provider allow-list.
pub(crate) fn claimable(job: &Job, providers: Option<&[ProviderKind]>) -> bool {
    job.state == JobState::Queued
        && providers.is_none_or(|allowed| allowed.contains(&job.request.provider()))
}

pub(crate) enum CancelDecision {
    /// queued -> cancelled, with the `job.cancelled` payload.
    Immediate(Value),
    /// running -> cancel_requested, with the `job.cancel_requested` payload.
    Requested(Value),
    AlreadyTerminal,
    /// cancel_requested already set; nothing to do.
    Noop,
}

pub(crate) fn try_cancel(job: &mut Job) -> CancelDecision {
    match job.state {
        JobState::Queued => {
            job.state = JobState::Cancelled;
            job.finished_at = Some(Utc::now());
            job.owner_token = None;
            CancelDecision::Immediate(json!({ "while": "queued" }))
        }
        JobState::Running => {
            job.state = JobState::CancelRequested;
            CancelDecision::Requested(json!({}))
        }
        JobState::CancelRequested => CancelDecision::Noop,
        _ => CancelDecision::AlreadyTerminal,
    }
}

/// Apply a terminal transition if the worker still owns an active job.
/// Returns the terminal event to append, or `None` when rejected (stale
/// owner after a requeue, or already terminal).
pub(crate) fn try_finish(
    job: &mut Job,
    worker_id: &str,
    outcome: &JobOutcome,
) -> Option<(JobEventKind, Value)> {
    if !job.state.is_active() || !job.is_owned_by(worker_id) {
        return None;
    }
    job.mark_finished(outcome);
    let event = match outcome {
        JobOutcome::Succeeded(result) => (
            JobEventKind::Succeeded,
            json!({
                "paths": result.paths.len(),
                "bytes_downloaded": job.bytes_downloaded,
            }),
        ),
        JobOutcome::Failed(error) => (JobEventKind::Failed, failed_event_payload(error)),
        JobOutcome::Cancelled => (JobEventKind::Cancelled, json!({})),
    };
    Some(event)
}

pub(crate) fn failed_event_payload(error: &JobError) -> Value {
    json!({
        "code": error.code.as_str(),
        "message": error.message,
        "context": error.context,
    })
}

pub(crate) fn try_heartbeat(job: &mut Job, worker_id: &str) -> bool {
    if job.state.is_active() && job.is_owned_by(worker_id) {
        job.last_heartbeat_at = Some(Utc::now());
        true
    } else {
        false
    }
}

pub(crate) fn try_update_progress(job: &mut Job, worker_id: &str, patch: ProgressPatch) -> bool {
    if job.state.is_active() && job.is_owned_by(worker_id) {
        job.apply_progress(patch);
        true
    } else {
        false
    }
}

/// Whether the sweep should requeue this job.
pub(crate) fn stale(job: &Job, stale_before: Option<DateTime<Utc>>) -> bool {
    if !job.state.is_active() {
        return false;
    }
    match (stale_before, job.last_heartbeat_at) {
        (None, _) => true,
        (Some(threshold), Some(heartbeat)) => heartbeat < threshold,
        (Some(_), None) => true,
    }
}

/// Shared listing implementation over a full scan; backends hand in every
/// job and get back a stable, filtered page.
pub(crate) fn paginate(
    mut jobs: Vec<Job>,
    filter: &JobFilter,
    page: u32,
    page_size: u32,
) -> JobPage {
    jobs.retain(|job| filter.matches(job));
    jobs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.job_id.cmp(&b.job_id))
    });
    let total = jobs.len();
    let page = page.max(1);
    let start = (page as usize - 1).saturating_mul(page_size as usize);
    let items = jobs.into_iter().skip(start).take(page_size as usize).collect();
    JobPage { items, total, page, page_size }
}
