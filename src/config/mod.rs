//! Configuration management.
//!
//! Layered loading, highest priority last:
//! 1. Defaults embedded in the structs
//! 2. TOML file (`config/nimbus.toml`, overridable via `NIMBUS_CONFIG`)
//! 3. `NIMBUS__<section>__<key>` environment variables
//! 4. Flat deployment variables (`DB_BACKEND`, `DATA_DIR`, `RUNTIME_ROLE`,
//!    `MAX_JOBS`, `PROVIDER_LIMITS`, `API_KEY`, ...) and per-provider
//!    credentials, which only ever come from the environment
//!
//! `.env` files are honored via `dotenvy`.

mod models;
mod sources;
mod validation;

pub use models::{
    DbBackend, DbSettings, DownloadSettings, ProviderSettings, RuntimeRole, RuntimeSettings,
    ServerSettings, Settings,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Settings {
    /// Load configuration from all sources (file + environment).
    pub fn load() -> Result<Self, ConfigError> {
        let settings = sources::load()?;
        validation::validate(&settings)?;
        Ok(settings)
    }

    /// Load configuration from a specific file, then apply environment
    /// overrides. Useful for `--config` and for tests.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let mut settings = sources::load_from_sources(path)?;
        sources::apply_flat_env(&mut settings)?;
        validation::validate(&settings)?;
        Ok(settings)
    }
}
