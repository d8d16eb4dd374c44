use thiserror::Error;

use crate::jobs::ProviderKind;

use super::models::Settings;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("max_jobs must be at least 1")]
    InvalidMaxJobs,
    #[error("heartbeat_seconds ({heartbeat}) must be less than a third of stale_job_seconds ({stale})")]
    HeartbeatTooSlow { heartbeat: u64, stale: u64 },
    #[error("unknown provider in {context}: {name}")]
    UnknownProvider { context: &'static str, name: String },
    #[error("provider limit for {0} must be at least 1")]
    InvalidProviderLimit(String),
    #[error("max_request_mb must be at least 1")]
    InvalidMaxRequestMb,
    #[error("data_dir must not be empty")]
    EmptyDataDir,
}

/// Cross-field validation run once after all sources are merged.
pub fn validate(settings: &Settings) -> Result<(), ValidationError> {
    if settings.runtime.max_jobs == 0 {
        return Err(ValidationError::InvalidMaxJobs);
    }

    // A worker must heartbeat several times within the stale window or the
    // sweep will cannibalize live jobs.
    let heartbeat = settings.runtime.heartbeat_seconds;
    let stale = settings.runtime.stale_job_seconds;
    if heartbeat * 3 > stale {
        return Err(ValidationError::HeartbeatTooSlow { heartbeat, stale });
    }

    for (name, &limit) in &settings.runtime.provider_limits {
        if name.parse::<ProviderKind>().is_err() {
            return Err(ValidationError::UnknownProvider {
                context: "provider_limits",
                name: name.clone(),
            });
        }
        if limit == 0 {
            return Err(ValidationError::InvalidProviderLimit(name.clone()));
        }
    }

    if let Some(allow) = &settings.runtime.providers_allow {
        for name in allow {
            if name.parse::<ProviderKind>().is_err() {
                return Err(ValidationError::UnknownProvider {
                    context: "providers_allow",
                    name: name.clone(),
                });
            }
        }
    }

    if settings.server.max_request_mb == 0 {
        return Err(ValidationError::InvalidMaxRequestMb);
    }

    if settings.runtime.data_dir.as_os_str().is_empty() {
        return Err(ValidationError::EmptyDataDir);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(validate(&Settings::default()).is_ok());
    }

    #[test]
    fn rejects_slow_heartbeat() {
        let mut settings = Settings::default();
        settings.runtime.heartbeat_seconds = 60;
        settings.runtime.stale_job_seconds = 90;
        assert!(matches!(
            validate(&settings),
            Err(ValidationError::HeartbeatTooSlow { .. })
        ));
    }

    #[test]
    fn rejects_unknown_provider_limit() {
        let mut settings = Settings::default();
        settings
            .runtime
            .provider_limits
            .insert("nasa".to_string(), 1);
        assert!(matches!(
            validate(&settings),
            Err(ValidationError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn rejects_zero_provider_limit() {
        let mut settings = Settings::default();
        settings
            .runtime
            .provider_limits
            .insert("copernicus".to_string(), 0);
        assert!(matches!(
            validate(&settings),
            Err(ValidationError::InvalidProviderLimit(_))
        ));
    }

    #[test]
    fn rejects_zero_max_jobs() {
        let mut settings = Settings::default();
        settings.runtime.max_jobs = 0;
        assert!(matches!(
            validate(&settings),
            Err(ValidationError::InvalidMaxJobs)
        ));
    }
}
