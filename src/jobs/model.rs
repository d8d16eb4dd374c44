use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::request::JobRequest;

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    CancelRequested,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// A worker currently holds execution rights.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running | JobState::CancelRequested)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::CancelRequested => "cancel_requested",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "cancel_requested" => Ok(JobState::CancelRequested),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Event types appended to the per-store event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEventKind {
    #[serde(rename = "job.queued")]
    Queued,
    #[serde(rename = "job.started")]
    Started,
    #[serde(rename = "job.products_found")]
    ProductsFound,
    #[serde(rename = "job.progress")]
    Progress,
    #[serde(rename = "job.cancel_requested")]
    CancelRequested,
    #[serde(rename = "job.cancelled")]
    Cancelled,
    #[serde(rename = "job.failed")]
    Failed,
    #[serde(rename = "job.succeeded")]
    Succeeded,
    #[serde(rename = "job.requeued_after_restart")]
    RequeuedAfterRestart,
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Queued => "job.queued",
            JobEventKind::Started => "job.started",
            JobEventKind::ProductsFound => "job.products_found",
            JobEventKind::Progress => "job.progress",
            JobEventKind::CancelRequested => "job.cancel_requested",
            JobEventKind::Cancelled => "job.cancelled",
            JobEventKind::Failed => "job.failed",
            JobEventKind::Succeeded => "job.succeeded",
            JobEventKind::RequeuedAfterRestart => "job.requeued_after_restart",
        }
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only log entry. `id` is strictly increasing across the whole
/// store and doubles as the SSE resume cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: u64,
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub kind: JobEventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Error descriptors recorded on a terminal `failed` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobErrorCode {
    PathViolation,
    PathConflict,
    ProviderAuthError,
    ProviderSearchError,
    #[serde(rename = "NoDownloadURL")]
    NoDownloadUrl,
    DownloadFailed,
    ChecksumFailed,
    ManifestWriteFailed,
    Unknown,
}

impl JobErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobErrorCode::PathViolation => "PathViolation",
            JobErrorCode::PathConflict => "PathConflict",
            JobErrorCode::ProviderAuthError => "ProviderAuthError",
            JobErrorCode::ProviderSearchError => "ProviderSearchError",
            JobErrorCode::NoDownloadUrl => "NoDownloadURL",
            JobErrorCode::DownloadFailed => "DownloadFailed",
            JobErrorCode::ChecksumFailed => "ChecksumFailed",
            JobErrorCode::ManifestWriteFailed => "ManifestWriteFailed",
            JobErrorCode::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub code: JobErrorCode,
    pub message: String,
    #[serde(default)]
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl JobError {
    pub fn new(code: JobErrorCode, message: impl Into<String>, context: Value) -> Self {
        Self {
            code,
            message: message.into(),
            context,
            timestamp: Utc::now(),
        }
    }
}

/// Terminal artifact description, written once on the `succeeded` transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub paths: Vec<String>,
    pub checksums: BTreeMap<String, String>,
    pub metadata: Value,
    pub manifest_entry: Value,
    pub created_at: DateTime<Utc>,
}

/// Outcome handed to `JobStore::finish`.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(JobResult),
    Failed(JobError),
    Cancelled,
}

/// Result of `JobStore::request_cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Transitioned to `cancelled` (queued) or `cancel_requested` (running).
    Applied,
    AlreadyTerminal,
    Unknown,
}

/// Owner-checked progress update.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressPatch {
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub progress: Option<f64>,
}

/// A submission lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub request: JobRequest,
    pub state: JobState,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub owner_token: Option<String>,
    pub attempt: u32,
    pub errors: Vec<JobError>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            request,
            state: JobState::Queued,
            progress: 0.0,
            bytes_downloaded: 0,
            bytes_total: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            owner_token: None,
            attempt: 1,
            errors: Vec::new(),
        }
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner_token.as_deref() == Some(worker_id)
    }

    /// Claim transition: queued -> running under `worker_id`.
    pub fn mark_claimed(&mut self, worker_id: &str) {
        let now = Utc::now();
        self.state = JobState::Running;
        self.owner_token = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.last_heartbeat_at = Some(now);
    }

    /// Inverse of claim: back to queued, owner cleared, attempt unchanged.
    pub fn mark_released(&mut self) {
        self.state = JobState::Queued;
        self.owner_token = None;
        self.started_at = None;
        self.last_heartbeat_at = None;
    }

    /// Restart requeue: back to queued with attempt incremented.
    pub fn mark_requeued(&mut self) {
        self.mark_released();
        self.attempt += 1;
    }

    /// Monotonic progress application; never moves counters backwards.
    pub fn apply_progress(&mut self, patch: ProgressPatch) {
        if patch.bytes_downloaded > self.bytes_downloaded {
            self.bytes_downloaded = patch.bytes_downloaded;
        }
        if let Some(total) = patch.bytes_total {
            self.bytes_total = Some(total);
        }
        if let Some(progress) = patch.progress {
            if progress > self.progress {
                self.progress = progress.clamp(0.0, 100.0);
            }
        }
    }

    /// Terminal transition shared by both store backends. The caller has
    /// already verified ownership and that the current state permits it.
    pub fn mark_finished(&mut self, outcome: &JobOutcome) {
        self.finished_at = Some(Utc::now());
        self.owner_token = None;
        match outcome {
            JobOutcome::Succeeded(_) => {
                self.state = JobState::Succeeded;
                self.progress = 100.0;
            }
            JobOutcome::Failed(error) => {
                self.state = JobState::Failed;
                self.errors.push(error.clone());
            }
            JobOutcome::Cancelled => {
                self.state = JobState::Cancelled;
            }
        }
    }
}
