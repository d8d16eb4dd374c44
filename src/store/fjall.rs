//! Fjall-backed durable job store.
//!
//! Partition layout:
//! - `jobs`: job_id (16 bytes) -> Job (JSON)
//! - `results`: job_id -> JobResult (JSON)
//! - `events`: event id (u64 big-endian) -> JobEvent (JSON)
//! - `events_by_job`: job_id + event id (BE) -> JobEvent (JSON)
//! - `queue`: created_at millis (BE) + job_id -> job_id (claim index, FIFO)
//! - `metadata`: "next_event_id" -> u64 (BE)
//!
//! Event ids come from an in-memory atomic counter persisted to `metadata`
//! after every append, so the sequence survives restarts. Read-modify-write
//! operations (claim, cancel, finish, sweep) run under a store-wide mutex;
//! the claim scan is therefore a single critical section and no two callers
//! can claim the same job.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde_json::Value;
use tracing::{debug, info};
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

const META_NEXT_EVENT_ID: &[u8] = b"next_event_id";

impl From<fjall::Error> for StoreError {
    fn from(err: fjall::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub struct FjallJobStore {
    keyspace: Keyspace,
    jobs: PartitionHandle,
    results: PartitionHandle,
    events: PartitionHandle,
    events_by_job: PartitionHandle,
    queue: PartitionHandle,
    metadata: PartitionHandle,
    event_seq: AtomicU64,
    write_lock: Mutex<()>,
}

impl FjallJobStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening fjall job store");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let results = keyspace.open_partition("results", PartitionCreateOptions::default())?;
        let events = keyspace.open_partition("events", PartitionCreateOptions::default())?;
        let events_by_job =
            keyspace.open_partition("events_by_job", PartitionCreateOptions::default())?;
        let queue = keyspace.open_partition("queue", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        // Event ids start at 1 so `since=0` replays from the beginning.
        let next_event_id = metadata
            .get(META_NEXT_EVENT_ID)?
            .map(|bytes| decode_u64(bytes.as_ref()))
            .transpose()?
            .unwrap_or(1);

        info!(next_event_id, "Fjall job store opened");

        Ok(Self {
            keyspace,
            jobs,
            results,
            events,
            events_by_job,
            queue,
            metadata,
            event_seq: AtomicU64::new(next_event_id),
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }

    fn load_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        match self.jobs.get(job_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_job(&self, job: &Job) -> Result<()> {
        self.jobs
            .insert(job.job_id.as_bytes(), serde_json::to_vec(job)?)?;
        Ok(())
    }

    fn queue_key(job: &Job) -> [u8; 24] {
        encode_queue_key(job.created_at, job.job_id)
    }

    /// Allocate the next event id, write both event partitions, then persist
    /// the counter. Safe to call from any holder; only the id allocation is
    /// contended.
    fn append_event_inner(&self, job_id: Uuid, kind: JobEventKind, payload: Value) -> Result<u64> {
        let id = self.event_seq.fetch_add(1, Ordering::SeqCst);
        let event = JobEvent {
            id,
            job_id,
            kind,
            timestamp: Utc::now(),
            payload,
        };
        let encoded = serde_json::to_vec(&event)?;
        self.events.insert(id.to_be_bytes(), encoded.as_slice())?;
        self.events_by_job
            .insert(encode_job_event_key(job_id, id), encoded.as_slice())?;
        self.metadata
            .insert(META_NEXT_EVENT_ID, (id + 1).to_be_bytes())?;
        debug!(%job_id, id, kind = %kind, "Event appended");
        Ok(id)
    }

    fn persist(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

impl JobStore for FjallJobStore {
    fn create_job(&self, request: JobRequest) -> Result<Uuid> {
        let _guard = self.lock()?;
        let job = Job::new(request);
        self.put_job(&job)?;
        self.queue
            .insert(Self::queue_key(&job), job.job_id.as_bytes())?;
        self.append_event_inner(job.job_id, JobEventKind::Queued, queued_event_payload(&job))?;
        self.persist()?;
        debug!(job_id = %job.job_id, "Job created");
        Ok(job.job_id)
    }

    fn claim_next(
        &self,
        worker_id: &str,
        providers: Option<&[ProviderKind]>,
    ) -> Result<Option<Job>> {
        let _guard = self.lock()?;
        let mut dead_keys = Vec::new();
        let mut claimed = None;

        for item in self.queue.iter() {
            let (key, value) = item?;
            let job_id = Uuid::from_slice(&value)
                .map_err(|e| StoreError::Corrupt(format!("queue value: {e}")))?;
            let Some(mut job) = self.load_job(job_id)? else {
                dead_keys.push(key);
                continue;
            };
            if job.state != JobState::Queued {
                dead_keys.push(key);
                continue;
            }
            if !claimable(&job, providers) {
                // Disallowed provider: leave the entry for another worker.
                continue;
            }

            job.mark_claimed(worker_id);
            self.put_job(&job)?;
            dead_keys.push(key);
            self.append_event_inner(
                job.job_id,
                JobEventKind::Started,
                started_event_payload(&job, worker_id),
            )?;
            claimed = Some(job);
            break;
        }

        for key in dead_keys {
            self.queue.remove(key)?;
        }
        if claimed.is_some() {
            self.persist()?;
        }
        Ok(claimed)
    }

    fn release_to_queue(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(mut job) = self.load_job(job_id)? else {
            return Ok(false);
        };
        if job.state != JobState::Running || !job.is_owned_by(worker_id) {
            return Ok(false);
        }
        job.mark_released();
        self.put_job(&job)?;
        self.queue
            .insert(Self::queue_key(&job), job.job_id.as_bytes())?;
        self.persist()?;
        debug!(%job_id, "Job released back to queue");
        Ok(true)
    }

    fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(mut job) = self.load_job(job_id)? else {
            return Ok(false);
        };
        if !try_heartbeat(&mut job, worker_id) {
            return Ok(false);
        }
        self.put_job(&job)?;
        Ok(true)
    }

    fn update_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        patch: ProgressPatch,
    ) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(mut job) = self.load_job(job_id)? else {
            return Ok(false);
        };
        if !try_update_progress(&mut job, worker_id, patch) {
            return Ok(false);
        }
        self.put_job(&job)?;
        Ok(true)
    }

    fn request_cancel(&self, job_id: Uuid) -> Result<CancelOutcome> {
        let _guard = self.lock()?;
        let Some(mut job) = self.load_job(job_id)? else {
            return Ok(CancelOutcome::Unknown);
        };
        let created_at = job.created_at;
        match try_cancel(&mut job) {
            CancelDecision::Immediate(payload) => {
                self.put_job(&job)?;
                self.queue.remove(encode_queue_key(created_at, job_id))?;
                self.append_event_inner(job_id, JobEventKind::Cancelled, payload)?;
                self.persist()?;
                Ok(CancelOutcome::Applied)
            }
            CancelDecision::Requested(payload) => {
                self.put_job(&job)?;
                self.append_event_inner(job_id, JobEventKind::CancelRequested, payload)?;
                self.persist()?;
                Ok(CancelOutcome::Applied)
            }
            CancelDecision::Noop => Ok(CancelOutcome::Applied),
            CancelDecision::AlreadyTerminal => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    fn finish(&self, job_id: Uuid, worker_id: &str, outcome: JobOutcome) -> Result<bool> {
        let _guard = self.lock()?;
        let Some(mut job) = self.load_job(job_id)? else {
            return Ok(false);
        };
        let Some((kind, payload)) = try_finish(&mut job, worker_id, &outcome) else {
            return Ok(false);
        };
        if let JobOutcome::Succeeded(result) = &outcome {
            self.results
                .insert(job_id.as_bytes(), serde_json::to_vec(result)?)?;
        }
        self.put_job(&job)?;
        self.append_event_inner(job_id, kind, payload)?;
        self.persist()?;
        debug!(%job_id, state = %job.state, "Job finished");
        Ok(true)
    }

    fn append_event(&self, job_id: Uuid, kind: JobEventKind, payload: Value) -> Result<u64> {
        self.append_event_inner(job_id, kind, payload)
    }

    fn requeue_incomplete(&self, stale_before: Option<DateTime<Utc>>) -> Result<usize> {
        let _guard = self.lock()?;
        let mut requeued = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            let job: Job = serde_json::from_slice(&value)?;
            if stale(&job, stale_before) {
                requeued.push(job);
            }
        }
        let count = requeued.len();
        for mut job in requeued {
            job.mark_requeued();
            self.put_job(&job)?;
            self.queue
                .insert(Self::queue_key(&job), job.job_id.as_bytes())?;
            self.append_event_inner(
                job.job_id,
                JobEventKind::RequeuedAfterRestart,
                requeued_event_payload(&job),
            )?;
            info!(job_id = %job.job_id, attempt = job.attempt, "Requeued incomplete job");
        }
        if count > 0 {
            self.persist()?;
        }
        Ok(count)
    }

    fn list_jobs(&self, filter: &JobFilter, page: u32, page_size: u32) -> Result<JobPage> {
        let mut jobs = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item?;
            jobs.push(serde_json::from_slice(&value)?);
        }
        Ok(paginate(jobs, filter, page, page_size))
    }

    fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.load_job(job_id)
    }

    fn get_result(&self, job_id: Uuid) -> Result<Option<JobResult>> {
        match self.results.get(job_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn events_after(&self, scope: EventScope, since: u64, limit: usize) -> Result<Vec<JobEvent>> {
        let mut events = Vec::new();
        match scope {
            EventScope::All => {
                let start = since.saturating_add(1).to_be_bytes();
                for item in self.events.range(start..).take(limit) {
                    let (_, value) = item?;
                    events.push(serde_json::from_slice(&value)?);
                }
            }
            EventScope::Job(job_id) => {
                let start = encode_job_event_key(job_id, since.saturating_add(1));
                let end = encode_job_event_key(job_id, u64::MAX);
                for item in self.events_by_job.range(start..=end).take(limit) {
                    let (_, value) = item?;
                    events.push(serde_json::from_slice(&value)?);
                }
            }
        }
        Ok(events)
    }
}

// Microsecond precision: jobs created within the same millisecond must
// still claim in creation order, with job_id as the final tie-break.
fn encode_queue_key(created_at: DateTime<Utc>, job_id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&(created_at.timestamp_micros() as u64).to_be_bytes());
    key[8..].copy_from_slice(job_id.as_bytes());
    key
}

fn encode_job_event_key(job_id: Uuid, event_id: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(job_id.as_bytes());
    key[16..].copy_from_slice(&event_id.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("metadata counter".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobError, JobErrorCode};
    use crate::jobs::request::test_helpers::search_download_request;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open_store() -> (FjallJobStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = FjallJobStore::open(temp.path().join("store")).unwrap();
        (store, temp)
    }

    fn sample_result(job_id: Uuid) -> JobResult {
        JobResult {
            job_id,
            paths: vec!["/data/s1/file.tif".to_string()],
            checksums: BTreeMap::new(),
            metadata: json!({}),
            manifest_entry: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn create_appends_queued_event() {
        let (store, _temp) = open_store();
        let job_id = store.create_job(search_download_request()).unwrap();

        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 1);

        let events = store.events_after(EventScope::Job(job_id), 0, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, JobEventKind::Queued);
        assert_eq!(events[0].id, 1);
    }

    #[test]
    fn claim_is_fifo_and_exclusive() {
        let (store, _temp) = open_store();
        let first = store.create_job(search_download_request()).unwrap();
        let second = store.create_job(search_download_request()).unwrap();

        let a = store.claim_next("worker-a", None).unwrap().unwrap();
        let b = store.claim_next("worker-b", None).unwrap().unwrap();
        assert_eq!(a.job_id, first);
        assert_eq!(b.job_id, second);
        assert_eq!(a.state, JobState::Running);
        assert_eq!(a.owner_token.as_deref(), Some("worker-a"));
        assert!(a.started_at.is_some());

        assert!(store.claim_next("worker-c", None).unwrap().is_none());
    }

    #[test]
    fn claim_respects_provider_allow_list() {
        let (store, _temp) = open_store();
        store.create_job(search_download_request()).unwrap();

        let claimed = store
            .claim_next("worker-a", Some(&[ProviderKind::Usgs]))
            .unwrap();
        assert!(claimed.is_none());

        let claimed = store
            .claim_next("worker-a", Some(&[ProviderKind::Copernicus]))
            .unwrap();
        assert!(claimed.is_some());
    }

    #[test]
    fn cancel_while_queued_is_immediate() {
        let (store, _temp) = open_store();
        let job_id = store.create_job(search_download_request()).unwrap();

        assert_eq!(store.request_cancel(job_id).unwrap(), CancelOutcome::Applied);
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.finished_at.is_some());

        // Cancelled before any worker touched it: no claim possible, no
        // job.started event.
        assert!(store.claim_next("worker-a", None).unwrap().is_none());
        let events = store.events_after(EventScope::Job(job_id), 0, 10).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JobEventKind::Queued, JobEventKind::Cancelled]);

        assert_eq!(
            store.request_cancel(job_id).unwrap(),
            CancelOutcome::AlreadyTerminal
        );
    }

    #[test]
    fn cancel_while_running_requests_cancel() {
        let (store, _temp) = open_store();
        let job_id = store.create_job(search_download_request()).unwrap();
        store.claim_next("worker-a", None).unwrap().unwrap();

        assert_eq!(store.request_cancel(job_id).unwrap(), CancelOutcome::Applied);
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::CancelRequested);
        assert_eq!(job.owner_token.as_deref(), Some("worker-a"));

        // Worker may still finish as cancelled.
        assert!(store.finish(job_id, "worker-a", JobOutcome::Cancelled).unwrap());
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.owner_token, None);
    }

    #[test]
    fn cancel_unknown_job() {
        let (store, _temp) = open_store();
        assert_eq!(
            store.request_cancel(Uuid::new_v4()).unwrap(),
            CancelOutcome::Unknown
        );
    }

    #[test]
    fn finish_success_persists_result() {
        let (store, _temp) = open_store();
        let job_id = store.create_job(search_download_request()).unwrap();
        store.claim_next("worker-a", None).unwrap().unwrap();

        let result = sample_result(job_id);
        assert!(
            store
                .finish(job_id, "worker-a", JobOutcome::Succeeded(result))
                .unwrap()
        );

        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert_eq!(job.progress, 100.0);
        assert!(store.get_result(job_id).unwrap().is_some());

        let events = store.events_after(EventScope::Job(job_id), 0, 10).unwrap();
        assert_eq!(events.last().unwrap().kind, JobEventKind::Succeeded);
    }

    #[test]
    fn finish_rejects_wrong_owner() {
        let (store, _temp) = open_store();
        let job_id = store.create_job(search_download_request()).unwrap();
        store.claim_next("worker-a", None).unwrap().unwrap();

        let rejected = store
            .finish(job_id, "worker-b", JobOutcome::Cancelled)
            .unwrap();
        assert!(!rejected);
    }

    #[test]
    fn stale_owner_writes_rejected_after_requeue() {
        let (store, _temp) = open_store();
        let job_id = store.create_job(search_download_request()).unwrap();
        store.claim_next("worker-a", None).unwrap().unwrap();

        assert_eq!(store.requeue_incomplete(None).unwrap(), 1);
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 2);

        // Old owner's writes all bounce.
        assert!(!store.heartbeat(job_id, "worker-a").unwrap());
        assert!(
            !store
                .update_progress(job_id, "worker-a", ProgressPatch::default())
                .unwrap()
        );
        assert!(
            !store
                .finish(
                    job_id,
                    "worker-a",
                    JobOutcome::Failed(JobError::new(
                        JobErrorCode::Unknown,
                        "late",
                        json!({})
                    ))
                )
                .unwrap()
        );

        // And the job is claimable again.
        let reclaimed = store.claim_next("worker-b", None).unwrap().unwrap();
        assert_eq!(reclaimed.job_id, job_id);
        assert_eq!(reclaimed.attempt, 2);

        let kinds: Vec<_> = store
            .events_after(EventScope::Job(job_id), 0, 10)
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                JobEventKind::Queued,
                JobEventKind::Started,
                JobEventKind::RequeuedAfterRestart,
                JobEventKind::Started,
            ]
        );
    }

    #[test]
    fn requeue_with_threshold_skips_fresh_jobs() {
        let (store, _temp) = open_store();
        store.create_job(search_download_request()).unwrap();
        store.claim_next("worker-a", None).unwrap().unwrap();

        // Heartbeat is fresh; a one-hour-old threshold must not requeue.
        let threshold = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.requeue_incomplete(Some(threshold)).unwrap(), 0);
    }

    #[test]
    fn release_to_queue_keeps_attempt() {
        let (store, _temp) = open_store();
        let job_id = store.create_job(search_download_request()).unwrap();
        store.claim_next("worker-a", None).unwrap().unwrap();

        assert!(store.release_to_queue(job_id, "worker-a").unwrap());
        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.owner_token, None);

        // No event for a provider-slot release.
        let events = store.events_after(EventScope::Job(job_id), 0, 10).unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![JobEventKind::Queued, JobEventKind::Started]);
    }

    #[test]
    fn progress_is_monotonic_and_owner_checked() {
        let (store, _temp) = open_store();
        let job_id = store.create_job(search_download_request()).unwrap();
        store.claim_next("worker-a", None).unwrap().unwrap();

        assert!(
            store
                .update_progress(
                    job_id,
                    "worker-a",
                    ProgressPatch {
                        bytes_downloaded: 100,
                        bytes_total: Some(400),
                        progress: Some(25.0),
                    }
                )
                .unwrap()
        );
        assert!(
            store
                .update_progress(
                    job_id,
                    "worker-a",
                    ProgressPatch {
                        bytes_downloaded: 50,
                        bytes_total: None,
                        progress: Some(10.0),
                    }
                )
                .unwrap()
        );

        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.bytes_downloaded, 100);
        assert_eq!(job.progress, 25.0);

        assert!(
            !store
                .update_progress(job_id, "worker-b", ProgressPatch::default())
                .unwrap()
        );
    }

    #[test]
    fn event_ids_are_strictly_increasing_and_resumable() {
        let (store, _temp) = open_store();
        let a = store.create_job(search_download_request()).unwrap();
        let b = store.create_job(search_download_request()).unwrap();
        store.append_event(a, JobEventKind::Progress, json!({"n": 1})).unwrap();
        store.append_event(b, JobEventKind::Progress, json!({"n": 2})).unwrap();
        store.append_event(a, JobEventKind::Progress, json!({"n": 3})).unwrap();

        let all = store.events_after(EventScope::All, 0, 100).unwrap();
        let ids: Vec<_> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        // Resume from a mid-stream cursor.
        let resumed = store.events_after(EventScope::All, 3, 100).unwrap();
        assert_eq!(resumed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![4, 5]);

        // Scoped tail only sees its own job, still ordered.
        let scoped = store.events_after(EventScope::Job(a), 0, 100).unwrap();
        assert!(scoped.iter().all(|e| e.job_id == a));
        assert!(scoped.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn event_sequence_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store");

        let job_id = {
            let store = FjallJobStore::open(&path).unwrap();
            store.create_job(search_download_request()).unwrap()
        };

        let store = FjallJobStore::open(&path).unwrap();
        let id = store
            .append_event(job_id, JobEventKind::Progress, json!({}))
            .unwrap();
        assert_eq!(id, 2);

        let job = store.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn list_jobs_sorts_and_filters() {
        let (store, _temp) = open_store();
        let first = store.create_job(search_download_request()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.create_job(search_download_request()).unwrap();

        let page = store.list_jobs(&JobFilter::default(), 1, 10).unwrap();
        assert_eq!(page.total, 2);
        // created_at descending.
        assert_eq!(page.items[0].job_id, second);
        assert_eq!(page.items[1].job_id, first);

        let filter = JobFilter {
            state: Some(JobState::Queued),
            provider: Some(ProviderKind::Usgs),
            ..Default::default()
        };
        assert_eq!(store.list_jobs(&filter, 1, 10).unwrap().total, 0);

        let page = store.list_jobs(&JobFilter::default(), 2, 1).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].job_id, first);
    }
}
