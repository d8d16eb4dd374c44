//! API response and query models.
//!
//! Submission payloads are validated through [`crate::jobs::JobRequest`];
//! the types here shape what goes back out.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::{Job, JobError, JobState};

#[derive(Debug, Serialize)]
pub struct ServiceBanner {
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub runtime_role: String,
    pub db_backend: String,
    pub metrics_enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobAcceptedResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchAcceptedResponse {
    pub job_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancel_requested: bool,
}

/// Client-facing job record.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub job_type: String,
    pub provider: String,
    pub collection: String,
    pub state: JobState,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_total: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub errors: Vec<JobError>,
    pub request: Value,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        let request = serde_json::to_value(&job.request).unwrap_or(Value::Null);
        Self {
            job_id: job.job_id,
            job_type: job.request.job_type().to_string(),
            provider: job.request.provider().as_str().to_string(),
            collection: job.request.collection().to_string(),
            state: job.state,
            progress: job.progress,
            bytes_downloaded: job.bytes_downloaded,
            bytes_total: job.bytes_total,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            attempt: job.attempt,
            errors: job.errors,
            request,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub items: Vec<JobStatusResponse>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
}

/// Raw query parameters for `GET /v1/jobs`; parsed leniently so malformed
/// values come back as 422 rather than axum's default rejection.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsParams {
    pub state: Option<String>,
    pub provider: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub page: Option<String>,
    pub page_size: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub since: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

/// Parse an ISO calendar date query parameter.
pub fn parse_date_param(name: &str, value: &str) -> Result<NaiveDate, String> {
    value
        .parse::<NaiveDate>()
        .map_err(|_| format!("invalid {name}: {value}"))
}
