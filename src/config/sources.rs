use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use config::{ConfigError, Environment, File};

use super::models::Settings;

const CONFIG_ENV_VAR: &str = "NIMBUS_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/nimbus.toml";
const ENV_PREFIX: &str = "NIMBUS";
const ENV_SEPARATOR: &str = "__";

/// Load settings from all sources with priority (highest last):
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if it exists)
/// 3. `NIMBUS__section__key` environment variables
/// 4. Flat deployment variables (`DB_BACKEND`, `DATA_DIR`, ...)
pub fn load() -> Result<Settings, ConfigError> {
    // Load .env if present (ignore errors if the file doesn't exist)
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut settings = load_from_sources(config_path)?;
    apply_flat_env(&mut settings)?;
    Ok(settings)
}

/// Load from a specific path; useful for tests.
pub fn load_from_sources(config_path: PathBuf) -> Result<Settings, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::debug!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

/// The flat variables used in container deployments. These win over
/// everything else; credentials only ever come from the environment.
pub fn apply_flat_env(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Ok(value) = env::var("DB_BACKEND") {
        settings.db.backend = value
            .parse()
            .map_err(|e: String| ConfigError::Message(e))?;
    }
    if let Ok(value) = env::var("DB_PATH") {
        settings.db.path = PathBuf::from(value);
    }
    if let Ok(value) = env::var("DATA_DIR") {
        settings.runtime.data_dir = PathBuf::from(value);
    }
    if let Ok(value) = env::var("RUNTIME_ROLE") {
        settings.runtime.role = value
            .parse()
            .map_err(|e: String| ConfigError::Message(e))?;
    }
    if let Ok(value) = env::var("WORKER_ID") {
        settings.runtime.worker_id = Some(value);
    }
    if let Ok(value) = env::var("MAX_JOBS") {
        settings.runtime.max_jobs = parse_number("MAX_JOBS", &value)?;
    }
    if let Ok(value) = env::var("PROVIDER_LIMITS") {
        settings.runtime.provider_limits = parse_provider_limits(&value)?;
    }
    if let Ok(value) = env::var("PROVIDERS_ALLOW") {
        settings.runtime.providers_allow = Some(parse_list(&value));
    }
    if let Ok(value) = env::var("QUEUE_POLL_SECONDS") {
        settings.runtime.queue_poll_seconds = parse_number("QUEUE_POLL_SECONDS", &value)?;
    }
    if let Ok(value) = env::var("STALE_JOB_SECONDS") {
        settings.runtime.stale_job_seconds = parse_number("STALE_JOB_SECONDS", &value)?;
    }
    if let Ok(value) = env::var("HEARTBEAT_SECONDS") {
        settings.runtime.heartbeat_seconds = parse_number("HEARTBEAT_SECONDS", &value)?;
    }
    if let Ok(value) = env::var("API_KEY") {
        settings.server.api_key = Some(value).filter(|v| !v.is_empty());
    }
    if let Ok(value) = env::var("CORS_ORIGINS") {
        settings.server.cors_origins = parse_list(&value);
    }
    if let Ok(value) = env::var("MAX_REQUEST_MB") {
        settings.server.max_request_mb = parse_number("MAX_REQUEST_MB", &value)?;
    }

    load_provider_credentials(settings);
    Ok(())
}

/// Per-provider credentials, e.g. `COPERNICUS_USERNAME` / `USGS_TOKEN`.
/// Never stored in TOML files.
fn load_provider_credentials(settings: &mut Settings) {
    for name in ["copernicus", "usgs"] {
        let prefix = name.to_uppercase();
        let username = env::var(format!("{prefix}_USERNAME")).ok();
        let password = env::var(format!("{prefix}_PASSWORD")).ok();
        let token = env::var(format!("{prefix}_TOKEN")).ok();
        let endpoint = env::var(format!("{prefix}_ENDPOINT")).ok();

        if username.is_none() && password.is_none() && token.is_none() && endpoint.is_none() {
            continue;
        }
        let entry = settings.providers.entry(name.to_string()).or_default();
        if username.is_some() {
            entry.username = username;
        }
        if password.is_some() {
            entry.password = password;
        }
        if token.is_some() {
            entry.token = token;
        }
        if endpoint.is_some() {
            entry.endpoint = endpoint;
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Message(format!("invalid {name}: {value}")))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// `copernicus=2,usgs=1`
fn parse_provider_limits(value: &str) -> Result<HashMap<String, usize>, ConfigError> {
    let mut limits = HashMap::new();
    for pair in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, limit) = pair.split_once('=').ok_or_else(|| {
            ConfigError::Message(format!("invalid PROVIDER_LIMITS entry: {pair}"))
        })?;
        limits.insert(
            key.trim().to_string(),
            parse_number("PROVIDER_LIMITS", limit)?,
        );
    }
    Ok(limits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn load_defaults_when_file_missing() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let settings = load_from_sources(config_path).unwrap();
        assert_eq!(settings.server.bind_addr.to_string(), "0.0.0.0:8080");
    }

    #[test]
    fn load_from_toml_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nimbus.toml");

        let toml_content = r#"
[server]
bind_addr = "127.0.0.1:9000"
max_request_mb = 2

[runtime]
max_jobs = 16
        "#;
        fs::write(&config_path, toml_content).unwrap();

        let settings = load_from_sources(config_path).unwrap();
        assert_eq!(settings.server.bind_addr.to_string(), "127.0.0.1:9000");
        assert_eq!(settings.server.max_request_mb, 2);
        assert_eq!(settings.runtime.max_jobs, 16);
    }

    // Flat env overrides are covered indirectly; mutating the process
    // environment in unit tests is unsafe under the threaded test runner,
    // so the parsers are tested directly instead.

    #[test]
    fn provider_limits_parser() {
        let limits = parse_provider_limits("copernicus=2, usgs=1").unwrap();
        assert_eq!(limits["copernicus"], 2);
        assert_eq!(limits["usgs"], 1);

        assert!(parse_provider_limits("copernicus").is_err());
        assert!(parse_provider_limits("copernicus=x").is_err());
        assert!(parse_provider_limits("").unwrap().is_empty());
    }

    #[test]
    fn list_parser_trims_and_drops_empties() {
        assert_eq!(
            parse_list("https://a.example, https://b.example,,"),
            vec!["https://a.example", "https://b.example"]
        );
    }
}
