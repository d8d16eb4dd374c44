use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::download::DownloadConfig;
use crate::humanize::ByteSize;

/// Top-level settings, built once at startup and passed explicitly to the
/// API and worker loops.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub db: DbSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub download: DownloadSettings,
    /// Per-provider credentials and endpoints; opaque to the core.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// When set, every route except `/` and `/v1/health` requires the
    /// `X-API-Key` header.
    #[serde(default)]
    pub api_key: Option<String>,
    /// CORS allow-list; `*` allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_max_request_mb")]
    pub max_request_mb: u64,
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_key: None,
            cors_origins: default_cors_origins(),
            max_request_mb: default_max_request_mb(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DbBackend {
    #[default]
    Fjall,
    Memory,
}

impl DbBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbBackend::Fjall => "fjall",
            DbBackend::Memory => "memory",
        }
    }
}

impl std::str::FromStr for DbBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fjall" => Ok(DbBackend::Fjall),
            "memory" => Ok(DbBackend::Memory),
            other => Err(format!("unknown db backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbSettings {
    #[serde(default)]
    pub backend: DbBackend,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            backend: DbBackend::default(),
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeRole {
    Api,
    Worker,
    #[default]
    All,
}

impl RuntimeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeRole::Api => "api",
            RuntimeRole::Worker => "worker",
            RuntimeRole::All => "all",
        }
    }

    pub fn includes_api(&self) -> bool {
        matches!(self, RuntimeRole::Api | RuntimeRole::All)
    }

    pub fn includes_worker(&self) -> bool {
        matches!(self, RuntimeRole::Worker | RuntimeRole::All)
    }
}

impl std::str::FromStr for RuntimeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(RuntimeRole::Api),
            "worker" => Ok(RuntimeRole::Worker),
            "all" => Ok(RuntimeRole::All),
            other => Err(format!("unknown runtime role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub role: RuntimeRole,
    /// Sandbox root for all downloads.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Worker token; generated per process when unset.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Global in-flight job cap per worker.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Per-provider in-flight caps, keyed by provider name.
    #[serde(default)]
    pub provider_limits: HashMap<String, usize>,
    /// Optional allow-list of providers this worker claims.
    #[serde(default)]
    pub providers_allow: Option<Vec<String>>,
    #[serde(default = "default_queue_poll_seconds")]
    pub queue_poll_seconds: u64,
    #[serde(default = "default_stale_job_seconds")]
    pub stale_job_seconds: u64,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            role: RuntimeRole::default(),
            data_dir: default_data_dir(),
            worker_id: None,
            max_jobs: default_max_jobs(),
            provider_limits: HashMap::new(),
            providers_allow: None,
            queue_poll_seconds: default_queue_poll_seconds(),
            stale_job_seconds: default_stale_job_seconds(),
            heartbeat_seconds: default_heartbeat_seconds(),
        }
    }
}

impl RuntimeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.queue_poll_seconds.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_job_seconds.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadSettings {
    #[serde(default = "default_download_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_download_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_download_concurrency(),
            max_retries: default_download_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl DownloadSettings {
    pub fn to_config(&self) -> DownloadConfig {
        DownloadConfig {
            max_concurrency: self.max_concurrency,
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            chunk_size: self.chunk_size.as_u64() as usize,
        }
    }
}

/// Provider credentials and endpoint; the core never interprets these.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProviderSettings {
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Loaded from environment, never from config files.
    #[serde(skip)]
    pub password: Option<String>,
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("static default address")
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_max_request_mb() -> u64 {
    5
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/store")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/downloads")
}

fn default_max_jobs() -> usize {
    4
}

fn default_queue_poll_seconds() -> u64 {
    2
}

fn default_stale_job_seconds() -> u64 {
    120
}

fn default_heartbeat_seconds() -> u64 {
    10
}

fn default_download_concurrency() -> usize {
    4
}

fn default_download_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_chunk_size() -> ByteSize {
    ByteSize(256 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(settings.db.backend, DbBackend::Fjall);
        assert_eq!(settings.runtime.role, RuntimeRole::All);
        assert!(settings.runtime.heartbeat_seconds * 3 <= settings.runtime.stale_job_seconds);
        assert_eq!(settings.download.chunk_size.as_u64(), 256 * 1024);
    }

    #[test]
    fn role_capability_checks() {
        assert!(RuntimeRole::All.includes_api());
        assert!(RuntimeRole::All.includes_worker());
        assert!(RuntimeRole::Api.includes_api());
        assert!(!RuntimeRole::Api.includes_worker());
        assert!(!RuntimeRole::Worker.includes_api());
    }

    #[test]
    fn parses_from_toml() {
        let toml_content = r#"
[server]
bind_addr = "127.0.0.1:9000"
max_request_mb = 10
cors_origins = ["https://ui.example.com"]

[db]
backend = "memory"

[runtime]
role = "worker"
max_jobs = 8

[runtime.provider_limits]
copernicus = 2

[download]
chunk_size = "1MB"

[providers.copernicus]
endpoint = "https://catalogue.example.com"
        "#;

        let settings: Settings = toml::from_str(toml_content).unwrap();
        assert_eq!(settings.server.max_request_mb, 10);
        assert_eq!(settings.db.backend, DbBackend::Memory);
        assert_eq!(settings.runtime.role, RuntimeRole::Worker);
        assert_eq!(settings.runtime.provider_limits["copernicus"], 2);
        assert_eq!(settings.download.chunk_size.as_u64(), 1024 * 1024);
        assert!(settings.providers.contains_key("copernicus"));
    }
}
