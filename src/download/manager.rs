//! Concurrent chunked HTTP downloader.
//!
//! Fetches a list of `(url, filename, auth)` items into a destination
//! directory under a task-slot semaphore, with jittered exponential-backoff
//! retries, a one-shot 401 token-refresh hook, cooperative cancellation
//! checked after every chunk, and atomic temp-file renames. If any URL
//! exhausts its retries the outstanding transfers are cancelled and the
//! first real error is reported; already-completed files stay on disk (the
//! caller owns the directory).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::progress::ProgressUpdate;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,
    #[error("download failed for {url}: {reason}")]
    Failed { url: String, reason: String },
    #[error("invalid suggested filename: {0}")]
    InvalidFilename(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client error: {0}")]
    Client(String),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Asynchronous supplier of a fresh Authorization value after a 401.
#[async_trait]
pub trait TokenRefresh: Send + Sync {
    async fn refresh(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            chunk_size: 256 * 1024,
        }
    }
}

/// One file to fetch.
#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub url: String,
    pub filename: String,
    pub auth: Option<String>,
}

#[derive(Clone)]
pub struct DownloadManager {
    client: reqwest::Client,
    config: DownloadConfig,
    token_refresh: Option<Arc<dyn TokenRefresh>>,
}

/// Statuses worth retrying; everything else non-2xx fails the URL outright.
const RETRYABLE_STATUS: &[u16] = &[408, 429, 500, 502, 503, 504];

enum AttemptError {
    Unauthorized,
    Retryable(String),
    Fatal(String),
    Cancelled,
}

impl DownloadManager {
    pub fn new(
        config: DownloadConfig,
        token_refresh: Option<Arc<dyn TokenRefresh>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| DownloadError::Client(e.to_string()))?;
        Ok(Self {
            client,
            config,
            token_refresh,
        })
    }

    /// Fetch every item into `dest`, returning final paths in input order.
    pub async fn fetch_all(
        &self,
        items: Vec<DownloadItem>,
        dest: &Path,
        cancel: &CancellationToken,
        progress: mpsc::Sender<ProgressUpdate>,
    ) -> Result<Vec<PathBuf>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        // Child token: trips on external cancellation AND on first failure,
        // so sibling transfers stop instead of finishing doomed work.
        let abort = cancel.child_token();
        let mut tasks = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let manager = self.clone();
            let semaphore = semaphore.clone();
            let abort = abort.clone();
            let progress = progress.clone();
            let dest = dest.to_path_buf();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Err(DownloadError::Cancelled)),
                };
                (index, manager.fetch_one(item, &dest, &abort, progress).await)
            });
        }

        let mut paths: Vec<Option<PathBuf>> = Vec::new();
        let mut first_error: Option<DownloadError> = None;

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    first_error.get_or_insert(DownloadError::Client(e.to_string()));
                    abort.cancel();
                    continue;
                }
            };
            match outcome {
                Ok(path) => {
                    if paths.len() <= index {
                        paths.resize(index + 1, None);
                    }
                    paths[index] = Some(path);
                }
                Err(DownloadError::Cancelled) => {
                    // Either external or failure fan-out; keep a real error
                    // if one arrives.
                    abort.cancel();
                }
                Err(error) => {
                    first_error.get_or_insert(error);
                    abort.cancel();
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if let Some(error) = first_error {
            return Err(error);
        }
        Ok(paths.into_iter().flatten().collect())
    }

    async fn fetch_one(
        &self,
        item: DownloadItem,
        dest: &Path,
        cancel: &CancellationToken,
        progress: mpsc::Sender<ProgressUpdate>,
    ) -> Result<PathBuf> {
        let filename = sanitize_filename(&item.filename)?;
        let final_path = dest.join(&filename);
        let tmp_path = dest.join(format!("{filename}.part"));

        let mut auth = item.auth.clone();
        let mut refreshed = false;
        let mut attempt = 0u32;

        let outcome = loop {
            if cancel.is_cancelled() {
                break Err(DownloadError::Cancelled);
            }
            match self
                .attempt_once(&item.url, auth.as_deref(), &filename, &tmp_path, cancel, &progress)
                .await
            {
                Ok(bytes) => break Ok(bytes),
                Err(AttemptError::Cancelled) => break Err(DownloadError::Cancelled),
                Err(AttemptError::Unauthorized) => {
                    // One refresh per URL, off the retry budget.
                    if !refreshed {
                        if let Some(hook) = &self.token_refresh {
                            if let Some(fresh) = hook.refresh().await {
                                debug!(url = %item.url, "Retrying with refreshed token");
                                auth = Some(fresh);
                                refreshed = true;
                                continue;
                            }
                        }
                    }
                    break Err(DownloadError::Failed {
                        url: item.url.clone(),
                        reason: "unauthorized (401) and token refresh unavailable".to_string(),
                    });
                }
                Err(AttemptError::Fatal(reason)) => {
                    break Err(DownloadError::Failed { url: item.url.clone(), reason });
                }
                Err(AttemptError::Retryable(reason)) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!(url = %item.url, attempt, reason, "Download failed after retries");
                        break Err(DownloadError::Failed { url: item.url.clone(), reason });
                    }
                    let backoff = self.backoff_for(attempt);
                    warn!(url = %item.url, attempt, reason, backoff_ms = backoff.as_millis() as u64, "Download failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        };

        match outcome {
            Ok(bytes) => {
                tokio::fs::rename(&tmp_path, &final_path).await?;
                let _ = progress
                    .send(ProgressUpdate {
                        filename: filename.clone(),
                        delta: 0,
                        file_bytes: bytes,
                        file_total: Some(bytes),
                        file_complete: true,
                    })
                    .await;
                debug!(url = %item.url, path = %final_path.display(), bytes, "Download complete");
                Ok(final_path)
            }
            Err(error) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Err(error)
            }
        }
    }

    async fn attempt_once(
        &self,
        url: &str,
        auth: Option<&str>,
        filename: &str,
        tmp_path: &Path,
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ProgressUpdate>,
    ) -> std::result::Result<u64, AttemptError> {
        let mut request = self.client.get(url);
        if let Some(auth) = auth {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AttemptError::Unauthorized);
        }
        if RETRYABLE_STATUS.contains(&status.as_u16()) {
            return Err(AttemptError::Retryable(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(format!("HTTP {}", status.as_u16())));
        }

        let file_total = response.content_length();
        let mut file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::with_capacity(self.config.chunk_size);
        let mut received = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AttemptError::Retryable(e.to_string()))?;
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            received += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
            if buffer.len() >= self.config.chunk_size {
                file.write_all(&buffer)
                    .await
                    .map_err(|e| AttemptError::Retryable(e.to_string()))?;
                buffer.clear();
            }
            let _ = progress
                .send(ProgressUpdate {
                    filename: filename.to_string(),
                    delta: chunk.len() as u64,
                    file_bytes: received,
                    file_total,
                    file_complete: false,
                })
                .await;
        }

        if !buffer.is_empty() {
            file.write_all(&buffer)
                .await
                .map_err(|e| AttemptError::Retryable(e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        Ok(received)
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exponent));
        let capped = scaled.min(self.config.backoff_max);
        let jitter: f64 = rand::rng().random_range(0.5..1.5);
        capped.mul_f64(jitter)
    }
}

/// Providers suggest filenames; only the last path component is trusted.
fn sanitize_filename(suggested: &str) -> Result<String> {
    if suggested.contains('\0') {
        return Err(DownloadError::InvalidFilename(suggested.to_string()));
    }
    let name = Path::new(suggested)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    if name.is_empty() || name == "." || name == ".." {
        return Err(DownloadError::InvalidFilename(suggested.to_string()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Embedded mock file server, same shape as the e2e harness.
    async fn start_mock_server() -> String {
        let flaky_hits = Arc::new(AtomicU32::new(0));

        let app = Router::new()
            .route("/ok.bin", get(|| async { bytes::Bytes::from(vec![7u8; 1000]) }))
            .route("/other.bin", get(|| async { bytes::Bytes::from(vec![9u8; 500]) }))
            .route("/missing.bin", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/flaky.bin",
                get(move || {
                    let hits = flaky_hits.clone();
                    async move {
                        if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                            StatusCode::SERVICE_UNAVAILABLE.into_response()
                        } else {
                            bytes::Bytes::from_static(b"recovered").into_response()
                        }
                    }
                }),
            )
            .route(
                "/secured.bin",
                get(|headers: HeaderMap| async move {
                    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                        Some("Bearer fresh") => {
                            bytes::Bytes::from_static(b"secret").into_response()
                        }
                        _ => StatusCode::UNAUTHORIZED.into_response(),
                    }
                }),
            )
            .route(
                "/slow.bin",
                get(|| async {
                    let stream = futures::stream::unfold(0u32, |n| async move {
                        if n >= 50 {
                            return None;
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Some((Ok::<_, std::io::Error>(bytes::Bytes::from(vec![1u8; 4096])), n + 1))
                    });
                    Body::from_stream(stream)
                }),
            );

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{bound}")
    }

    fn manager(token_refresh: Option<Arc<dyn TokenRefresh>>) -> DownloadManager {
        let config = DownloadConfig {
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
            ..Default::default()
        };
        DownloadManager::new(config, token_refresh).unwrap()
    }

    fn item(base: &str, path: &str, filename: &str) -> DownloadItem {
        DownloadItem {
            url: format!("{base}/{path}"),
            filename: filename.to_string(),
            auth: None,
        }
    }

    #[tokio::test]
    async fn fetches_multiple_files_with_progress() {
        let base = start_mock_server().await;
        let dest = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let paths = manager(None)
            .fetch_all(
                vec![item(&base, "ok.bin", "ok.bin"), item(&base, "other.bin", "other.bin")],
                dest.path(),
                &cancel,
                tx,
            )
            .await
            .unwrap();

        assert_eq!(paths.len(), 2);
        assert_eq!(std::fs::read(&paths[0]).unwrap().len(), 1000);
        assert_eq!(std::fs::read(&paths[1]).unwrap().len(), 500);
        // No temp files left behind.
        assert!(!dest.path().join("ok.bin.part").exists());

        rx.close();
        let mut complete = 0;
        let mut delta_sum = 0;
        while let Some(update) = rx.recv().await {
            delta_sum += update.delta;
            if update.file_complete {
                complete += 1;
            }
        }
        assert_eq!(complete, 2);
        assert_eq!(delta_sum, 1500);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let base = start_mock_server().await;
        let dest = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(64);

        let paths = manager(None)
            .fetch_all(
                vec![item(&base, "flaky.bin", "flaky.bin")],
                dest.path(),
                &CancellationToken::new(),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"recovered");
    }

    #[tokio::test]
    async fn fatal_status_fails_without_retry() {
        let base = start_mock_server().await;
        let dest = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(64);

        let err = manager(None)
            .fetch_all(
                vec![item(&base, "missing.bin", "missing.bin")],
                dest.path(),
                &CancellationToken::new(),
                tx,
            )
            .await
            .unwrap_err();

        match err {
            DownloadError::Failed { reason, .. } => assert!(reason.contains("404")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dest.path().join("missing.bin").exists());
        assert!(!dest.path().join("missing.bin.part").exists());
    }

    struct StaticRefresh;

    #[async_trait]
    impl TokenRefresh for StaticRefresh {
        async fn refresh(&self) -> Option<String> {
            Some("Bearer fresh".to_string())
        }
    }

    #[tokio::test]
    async fn refreshes_token_on_unauthorized() {
        let base = start_mock_server().await;
        let dest = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(64);

        let mut stale = item(&base, "secured.bin", "secured.bin");
        stale.auth = Some("Bearer stale".to_string());

        let paths = manager(Some(Arc::new(StaticRefresh)))
            .fetch_all(vec![stale], dest.path(), &CancellationToken::new(), tx)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"secret");
    }

    #[tokio::test]
    async fn unauthorized_without_refresh_fails() {
        let base = start_mock_server().await;
        let dest = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::channel(64);

        let err = manager(None)
            .fetch_all(
                vec![item(&base, "secured.bin", "secured.bin")],
                dest.path(),
                &CancellationToken::new(),
                tx,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Failed { .. }));
    }

    #[tokio::test]
    async fn cancellation_mid_stream_removes_partial_file() {
        let base = start_mock_server().await;
        let dest = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let dm = manager(None);
        let dest_path = dest.path().to_path_buf();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            dm.fetch_all(
                vec![item(&base, "slow.bin", "slow.bin")],
                &dest_path,
                &cancel_clone,
                tx,
            )
            .await
        });

        // Wait for the first chunk, then cancel.
        let first = rx.recv().await;
        assert!(first.is_some());
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(!dest.path().join("slow.bin").exists());
        assert!(!dest.path().join("slow.bin.part").exists());
    }

    #[test]
    fn sanitize_accepts_plain_names_and_strips_directories() {
        assert_eq!(sanitize_filename("scene.tif").unwrap(), "scene.tif");
        assert_eq!(sanitize_filename("a/b/scene.tif").unwrap(), "scene.tif");
        assert!(sanitize_filename("..").is_err());
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("a\0b").is_err());
    }
}
