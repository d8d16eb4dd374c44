//! Typed download progress, delivered over a channel instead of callbacks so
//! the downloader stays decoupled from store writes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One observation emitted by the download manager after a chunk lands (or a
/// file completes). `file_bytes` is absolute for the file, so a retried file
/// that restarts from zero simply re-reports lower numbers; aggregate
/// accounting stays monotonic at the store.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub filename: String,
    pub delta: u64,
    pub file_bytes: u64,
    pub file_total: Option<u64>,
    pub file_complete: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct FileProgress {
    bytes: u64,
    total: Option<u64>,
}

/// Per-job aggregation: job byte totals, an exponentially smoothed transfer
/// rate, and the write throttles (store writes at most once per second plus
/// every file boundary; progress events at most once per two seconds).
#[derive(Debug)]
pub struct JobProgressTracker {
    files: HashMap<String, FileProgress>,
    speed_bps: f64,
    window_start: Instant,
    window_bytes: u64,
    last_store_write: Option<Instant>,
    last_event: Option<Instant>,
}

const STORE_WRITE_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_INTERVAL: Duration = Duration::from_secs(2);
const SPEED_WINDOW: Duration = Duration::from_millis(500);
const SPEED_ALPHA: f64 = 0.3;

impl JobProgressTracker {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            speed_bps: 0.0,
            window_start: Instant::now(),
            window_bytes: 0,
            last_store_write: None,
            last_event: None,
        }
    }

    /// Fold one observation into the aggregate.
    pub fn observe(&mut self, update: &ProgressUpdate) {
        let entry = self.files.entry(update.filename.clone()).or_default();
        entry.bytes = update.file_bytes;
        if update.file_total.is_some() {
            entry.total = update.file_total;
        }

        self.window_bytes += update.delta;
        let elapsed = self.window_start.elapsed();
        if elapsed >= SPEED_WINDOW {
            let instant_bps = self.window_bytes as f64 / elapsed.as_secs_f64();
            self.speed_bps = if self.speed_bps == 0.0 {
                instant_bps
            } else {
                SPEED_ALPHA * instant_bps + (1.0 - SPEED_ALPHA) * self.speed_bps
            };
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.files.values().map(|f| f.bytes).sum()
    }

    /// Sum of the known file totals; `None` until at least one total is
    /// known.
    pub fn bytes_total(&self) -> Option<u64> {
        let known: u64 = self.files.values().filter_map(|f| f.total).sum();
        if self.files.values().any(|f| f.total.is_some()) {
            Some(known)
        } else {
            None
        }
    }

    /// Percentage estimate, capped below 100 while the job is running; only
    /// the succeeded transition reports 100.
    pub fn percent(&self) -> Option<f64> {
        let total = self.bytes_total()?;
        if total == 0 {
            return None;
        }
        let pct = self.bytes_downloaded() as f64 * 100.0 / total as f64;
        Some(pct.min(99.0))
    }

    pub fn speed_bps(&self) -> f64 {
        self.speed_bps
    }

    /// Store writes are throttled to once per second, plus every file
    /// boundary.
    pub fn should_write_store(&mut self, file_boundary: bool) -> bool {
        let due = file_boundary
            || self
                .last_store_write
                .is_none_or(|at| at.elapsed() >= STORE_WRITE_INTERVAL);
        if due {
            self.last_store_write = Some(Instant::now());
        }
        due
    }

    /// `job.progress` events are throttled to once per two seconds.
    pub fn should_emit_event(&mut self) -> bool {
        let due = self
            .last_event
            .is_none_or(|at| at.elapsed() >= EVENT_INTERVAL);
        if due {
            self.last_event = Some(Instant::now());
        }
        due
    }
}

impl Default for JobProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
