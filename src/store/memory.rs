//! In-memory job store for tests and local development.
//!
//! Implements the same [`JobStore`] contract as the fjall backend, including
//! the FIFO claim index and the store-wide monotonic event sequence, with a
//! single mutex standing in for durability.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::{
    CancelOutcome, Job, JobEvent, JobEventKind, JobOutcome, JobRequest, JobResult, JobState,
    ProgressPatch, ProviderKind,
};

use super::{
    CancelDecision, EventScope, JobFilter, JobPage, JobStore, Result, StoreError, claimable,
    paginate, queued_event_payload, requeued_event_payload, stale, started_event_payload,
    try_cancel, try_finish, try_heartbeat, try_update_progress,
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    results: HashMap<Uuid, JobResult>,
    events: BTreeMap<u64, JobEvent>,
    queue: BTreeSet<(DateTime<Utc>, Uuid)>,
    next_event_id: u64,
}

impl Inner {
    fn append_event(&mut self, job_id: Uuid, kind: JobEventKind, payload: Value) -> u64 {
        if self.next_event_id == 0 {
            self.next_event_id = 1;
        }
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.events.insert(
            id,
            JobEvent {
                id,
                job_id,
                kind,
                timestamp: Utc::now(),
                payload,
            },
        );
        id
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

impl JobStore for MemoryJobStore {
    fn create_job(&self, request: JobRequest) -> Result<Uuid> {
        let mut inner = self.lock()?;
        let job = Job::new(request);
        let job_id = job.job_id;
        inner.queue.insert((job.created_at, job_id));
        let payload = queued_event_payload(&job);
        inner.jobs.insert(job_id, job);
        inner.append_event(job_id, JobEventKind::Queued, payload);
        Ok(job_id)
    }

    fn claim_next(
        &self,
        worker_id: &str,
        providers: Option<&[ProviderKind]>,
    ) -> Result<Option<Job>> {
        let mut inner = self.lock()?;
        let mut dead = Vec::new();
        let mut pick = None;

        for &(created_at, job_id) in inner.queue.iter() {
            match inner.jobs.get(&job_id) {
                Some(job) if job.state == JobState::Queued => {
                    if claimable(job, providers) {
                        pick = Some((created_at, job_id));
                        break;
                    }
                }
                _ => dead.push((created_at, job_id)),
            }
        }

        for entry in dead {
            inner.queue.remove(&entry);
        }

        let Some(entry) = pick else {
            return Ok(None);
        };
        inner.queue.remove(&entry);

        let job = {
            let job = inner
                .jobs
                .get_mut(&entry.1)
                .ok_or_else(|| StoreError::Corrupt("queue index desync".to_string()))?;
            job.mark_claimed(worker_id);
            job.clone()
        };
        let payload = started_event_payload(&job, worker_id);
        inner.append_event(job.job_id, JobEventKind::Started, payload);
        Ok(Some(job))
    }

    fn release_to_queue(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.state != JobState::Running || !job.is_owned_by(worker_id) {
            return Ok(false);
        }
        job.mark_released();
        let created_at = job.created_at;
        inner.queue.insert((created_at, job_id));
        Ok(true)
    }

    fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .jobs
            .get_mut(&job_id)
            .is_some_and(|job| try_heartbeat(job, worker_id)))
    }

    fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        patch: ProgressPatch,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .jobs
            .get_mut(&job_id)
            .is_some_and(|job| try_update_progress(job, worker_id, patch)))
    }

    fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(CancelOutcome::Unknown);
        };
        let created_at = job.created_at;
        match try_cancel(job) {
            CancelDecision::Immediate(payload) => {
                inner.queue.remove(&(created_at, job_id));
                inner.append_event(job_id, JobEventKind::Cancelled, payload);
                Ok(CancelOutcome::Applied)
            }
            CancelDecision::Requested(payload) => {
                inner.append_event(job_id, JobEventKind::CancelRequested, payload);
                Ok(CancelOutcome::Applied)
            }
            CancelDecision::Noop => Ok(CancelOutcome::Applied),
            CancelDecision::AlreadyTerminal => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    fn finish(&self, job_id: Uuid, worker_id: &str, outcome: JobOutcome) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        let Some((kind, payload)) = try_finish(job, worker_id, &outcome) else {
            return Ok(false);
        };
        if let JobOutcome::Succeeded(result) = outcome {
            inner.results.insert(job_id, result);
        }
        inner.append_event(job_id, kind, payload);
        Ok(true)
    }

    fn append_event(&self, job_id: Uuid, kind: JobEventKind, payload: Value) -> Result<u64> {
        let mut inner = self.lock()?;
        Ok(inner.append_event(job_id, kind, payload))
    }

    fn requeue_incomplete(&self, stale_before: Option<DateTime<Utc>>) -> Result<usize> {
        let mut inner = self.lock()?;
        let stale_ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| stale(job, stale_before))
            .map(|job| job.job_id)
            .collect();

        for &job_id in &stale_ids {
            let (created_at, payload) = {
                let job = inner
                    .jobs
                    .get_mut(&job_id)
                    .ok_or_else(|| StoreError::Corrupt("sweep desync".to_string()))?;
                job.mark_requeued();
                (job.created_at, requeued_event_payload(job))
            };
            inner.queue.insert((created_at, job_id));
            inner.append_event(job_id, JobEventKind::RequeuedAfterRestart, payload);
        }
        Ok(stale_ids.len())
    }

    fn list_jobs(&self, filter: &JobFilter, page: u32, page_size: u32) -> Result<JobPage> {
        let inner = self.lock()?;
        let jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        Ok(paginate(jobs, filter, page, page_size))
    }

    fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let inner = self.lock()?;
        Ok(inner.jobs.get(&job_id).cloned())
    }

    fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>> {
        let inner = self.lock()?;
        Ok(inner.results.get(&job_id).cloned())
    }

    fn events_after(&self, scope: EventScope, since: u64, limit: usize) -> Result<Vec<JobEvent>> {
        let inner = self.lock()?;
        let events = inner
            .events
            .range(since.saturating_add(1)..)
            .map(|(_, event)| event)
            .filter(|event| match scope {
                EventScope::All => true,
                EventScope::Job(job_id) => event.job_id == job_id,
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::request::test_helpers::search_download_request;
    use serde_json::json;

    // The heavyweight contract tests live next to the fjall backend; these
    // cover the divergent code paths of the in-memory implementation.

    #[test]
    fn claim_and_finish_cycle() {
        let store = MemoryJobStore::new();
        let job_id = store.create_job(search_download_request()).unwrap();

        let job = store.claim_next("w1", None).unwrap().unwrap();
        assert_eq!(job.job_id, job_id);
        assert!(store.claim_next("w2", None).unwrap().is_none());

        assert!(store.finish(job_id, "w1", JobOutcome::Cancelled).unwrap());
        assert_eq!(
            store.get_job(job_id).unwrap().unwrap().state,
            JobState::Cancelled
        );
    }

    #[test]
    fn claim_order_matches_creation_order() {
        let store = MemoryJobStore::new();
        let first = store.create_job(search_download_request()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.create_job(search_download_request()).unwrap();

        assert_eq!(store.claim_next("w", None).unwrap().unwrap().job_id, first);
        assert_eq!(store.claim_next("w", None).unwrap().unwrap().job_id, second);
    }

    #[test]
    fn events_are_globally_ordered_across_jobs() {
        let store = MemoryJobStore::new();
        let a = store.create_job(search_download_request()).unwrap();
        let b = store.create_job(search_download_request()).unwrap();
        store.append_event(a, JobEventKind::Progress, json!({})).unwrap();
        store.append_event(b, JobEventKind::Progress, json!({})).unwrap();

        let all = store.events_after(EventScope::All, 0, 100).unwrap();
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let scoped = store.events_after(EventScope::Job(b), 0, 100).unwrap();
        assert!(scoped.iter().all(|e| e.job_id == b));
    }

    #[test]
    fn requeue_unconditional_only_touches_active_jobs() {
        let store = MemoryJobStore::new();
        let queued = store.create_job(search_download_request()).unwrap();
        let running = store.create_job(search_download_request()).unwrap();
        // Claim the first created job; leave the second queued.
        let claimed = store.claim_next("w", None).unwrap().unwrap();
        assert_eq!(claimed.job_id, queued);

        assert_eq!(store.requeue_incomplete(None).unwrap(), 1);
        assert_eq!(store.get_job(queued).unwrap().unwrap().attempt, 2);
        assert_eq!(store.get_job(running).unwrap().unwrap().attempt, 1);
    }
}
