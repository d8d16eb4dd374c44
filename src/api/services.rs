use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{NaiveTime, Utc};
use futures::{Stream, StreamExt};
use serde_json::Value;
use uuid::Uuid;

use crate::events::{StreamItem, TailConfig, tail_events};
use crate::jobs::{CancelOutcome, JobRequest, JobState, ProviderKind};
use crate::store::{EventScope, JobFilter};

use super::error::ApiError;
use super::models::{
    BatchAcceptedResponse, CancelResponse, EventsParams, HealthResponse, JobAcceptedResponse,
    JobListResponse, JobStatusResponse, ListJobsParams, ServiceBanner, parse_date_param,
};
use super::state::AppState;
use super::utils::{ensure_json_content_type, read_limited_body};

/// Unauthenticated service banner (GET /)
pub async fn root() -> Json<ServiceBanner> {
    Json(ServiceBanner {
        service: "nimbus-fetch",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Health probe (GET /v1/health)
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        runtime_role: state.settings.runtime.role.as_str().to_string(),
        db_backend: state.settings.db.backend.as_str().to_string(),
        metrics_enabled: state.settings.server.metrics_enabled,
    })
}

/// Job submission (POST /v1/jobs) — the only write path for new jobs.
///
/// The raw body is read under the configured size cap, parsed as JSON, and
/// validated against the request model (unknown fields rejected, AOI
/// geometry parsed, dates and output_dir checked) before the store insert.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    let payload = read_submission(&state, &headers, body).await?;
    let request = JobRequest::parse(&payload)?;

    let job_id = state.store.create_job(request)?;
    state.metrics.job_submitted();

    Ok((StatusCode::CREATED, Json(JobAcceptedResponse { job_id })))
}

/// Batch submission (POST /v1/jobs/batch). All requests are validated
/// before any job is inserted, so a 422 never leaves partial state.
pub async fn submit_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<impl IntoResponse, ApiError> {
    let payload = read_submission(&state, &headers, body).await?;
    let object = payload
        .as_object()
        .ok_or_else(|| ApiError::Validation("body must be a JSON object".to_string()))?;
    for key in object.keys() {
        if key != "jobs" {
            return Err(ApiError::Validation(format!("unknown field: {key}")));
        }
    }
    let jobs = object
        .get("jobs")
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::Validation("jobs must be an array".to_string()))?;
    if jobs.is_empty() {
        return Err(ApiError::Validation("jobs must not be empty".to_string()));
    }

    let requests = jobs
        .iter()
        .enumerate()
        .map(|(index, value)| {
            JobRequest::parse(value)
                .map_err(|e| ApiError::Validation(format!("jobs[{index}]: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut job_ids = Vec::with_capacity(requests.len());
    for request in requests {
        job_ids.push(state.store.create_job(request)?);
        state.metrics.job_submitted();
    }

    Ok((StatusCode::CREATED, Json(BatchAcceptedResponse { job_ids })))
}

/// Job status (GET /v1/jobs/{job_id})
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job = state
        .store
        .get_job(job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;
    Ok(Json(job.into()))
}

/// Cancellation (DELETE /v1/jobs/{job_id}). Queued jobs cancel immediately;
/// running jobs get a cancel request their worker observes cooperatively.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    match state.store.request_cancel(job_id)? {
        CancelOutcome::Applied => Ok(Json(CancelResponse {
            job_id,
            cancel_requested: true,
        })),
        CancelOutcome::AlreadyTerminal => Ok(Json(CancelResponse {
            job_id,
            cancel_requested: false,
        })),
        CancelOutcome::Unknown => Err(ApiError::NotFound(format!("job {job_id}"))),
    }
}

/// Terminal artifact description (GET /v1/jobs/{job_id}/result)
pub async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .store
        .get_result(job_id)?
        .ok_or_else(|| ApiError::NotFound(format!("result for job {job_id}")))?;
    Ok(Json(result))
}

/// Filtered listing (GET /v1/jobs)
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<JobListResponse>, ApiError> {
    let mut filter = JobFilter::default();

    if let Some(raw) = &params.state {
        filter.state = Some(
            raw.parse::<JobState>()
                .map_err(ApiError::Validation)?,
        );
    }
    if let Some(raw) = &params.provider {
        filter.provider = Some(
            raw.parse::<ProviderKind>()
                .map_err(ApiError::Validation)?,
        );
    }
    if let Some(raw) = &params.date_from {
        let date = parse_date_param("date_from", raw).map_err(ApiError::Validation)?;
        filter.date_from = Some(date.and_time(NaiveTime::MIN).and_utc());
    }
    if let Some(raw) = &params.date_to {
        let date = parse_date_param("date_to", raw).map_err(ApiError::Validation)?;
        // Inclusive end of day.
        filter.date_to = Some(
            date.and_time(NaiveTime::MIN).and_utc() + chrono::Duration::days(1)
                - chrono::Duration::microseconds(1),
        );
    }

    let page = parse_positive(&params.page, "page", 1)?;
    let page_size = parse_positive(&params.page_size, "page_size", 20)?.min(100);

    let result = state.store.list_jobs(&filter, page, page_size)?;
    Ok(Json(JobListResponse {
        items: result.items.into_iter().map(Into::into).collect(),
        total: result.total,
        page: result.page,
        page_size: result.page_size,
    }))
}

/// Resumable event stream (GET /v1/events), framed as SSE. The persisted
/// event id is the frame id and the only durable resume cursor; idle
/// connections get synthetic `heartbeat` frames without an id.
pub async fn events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let scope = params
        .job_id
        .map(EventScope::Job)
        .unwrap_or(EventScope::All);
    let since = params.since.unwrap_or(0);

    let stream = tail_events(state.store.clone(), scope, since, TailConfig::default()).map(
        |item| {
            Ok(match item {
                StreamItem::Event(event) => {
                    let data =
                        serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                    Event::default()
                        .id(event.id.to_string())
                        .event(event.kind.as_str())
                        .data(data)
                }
                StreamItem::Heartbeat => Event::default().event("heartbeat").data("{}"),
            })
        },
    );

    Sse::new(stream)
}

/// Prometheus text exposition (GET /v1/metrics); 404 when disabled.
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    if !state.settings.server.metrics_enabled {
        return Err(ApiError::NotFound("metrics are disabled".to_string()));
    }
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    ))
}

async fn read_submission(
    state: &AppState,
    headers: &HeaderMap,
    body: axum::body::Body,
) -> Result<Value, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation("missing Content-Type header".to_string()))?;
    ensure_json_content_type(content_type)?;

    let max_bytes = state.settings.server.max_request_mb as usize * 1024 * 1024;
    let data = read_limited_body(body, max_bytes).await?;
    Ok(serde_json::from_slice(&data)?)
}

fn parse_positive(raw: &Option<String>, name: &str, default: u32) -> Result<u32, ApiError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|&n| n >= 1)
            .ok_or_else(|| ApiError::Validation(format!("invalid {name}: {value}"))),
    }
}
