//! Concurrent chunked downloader and the typed progress channel feeding the
//! job runner.

pub mod manager;
pub mod progress;

pub use manager::{DownloadConfig, DownloadError, DownloadItem, DownloadManager, TokenRefresh};
pub use progress::{JobProgressTracker, ProgressUpdate};
