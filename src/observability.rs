//! Process-local metrics.
//!
//! Plain atomic counters shared between the API and worker loops, rendered
//! as Prometheus text exposition for `GET /v1/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    jobs_submitted: AtomicU64,
    jobs_claimed: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_requeued: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_claimed(&self) {
        self.jobs_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jobs_requeued(&self, count: u64) {
        self.jobs_requeued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_claimed: self.jobs_claimed.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            jobs_requeued: self.jobs_requeued.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format (0.0.4).
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("nimbusfetch_jobs_submitted_total", snapshot.jobs_submitted),
            ("nimbusfetch_jobs_claimed_total", snapshot.jobs_claimed),
            ("nimbusfetch_jobs_succeeded_total", snapshot.jobs_succeeded),
            ("nimbusfetch_jobs_failed_total", snapshot.jobs_failed),
            ("nimbusfetch_jobs_cancelled_total", snapshot.jobs_cancelled),
            ("nimbusfetch_jobs_requeued_total", snapshot.jobs_requeued),
            ("nimbusfetch_bytes_downloaded_total", snapshot.bytes_downloaded),
        ];
        let mut out = String::new();
        for (name, value) in counters {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        }
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_requeued: u64,
    pub bytes_downloaded: u64,
}
