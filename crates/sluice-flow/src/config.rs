//! Runtime configuration for the constraint engine.
//!
//! Settings are read from the process environment with strict validation so
//! that retry and timeout limits are explicit and reproducible.

use std::time::Duration as StdDuration;

use chrono::Duration;

use sluice_core::LogFormat;

use crate::error::{Error, Result};

const ENV_MAX_CONFLICT_RETRIES: &str = "SLUICE_MAX_CONFLICT_RETRIES";
const ENV_CONFLICT_BACKOFF_MS: &str = "SLUICE_CONFLICT_BACKOFF_MS";
const ENV_ABORT_RELEASE_ATTEMPTS: &str = "SLUICE_ABORT_RELEASE_ATTEMPTS";
const ENV_BLOCKED_TIMEOUT_SECS: &str = "SLUICE_BLOCKED_TIMEOUT_SECS";
const ENV_RECONCILE_INTERVAL_SECS: &str = "SLUICE_RECONCILE_INTERVAL_SECS";
const ENV_LOG_FORMAT: &str = "SLUICE_LOG_FORMAT";

const DEFAULT_MAX_CONFLICT_RETRIES: u64 = 8;
const DEFAULT_CONFLICT_BACKOFF_MS: u64 = 10;
const DEFAULT_ABORT_RELEASE_ATTEMPTS: u64 = 3;
const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Retry, timeout and reconcile limits for the constraint engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintRuntimeConfig {
    /// Maximum commit attempts for one read-modify-commit cycle.
    pub max_conflict_retries: u32,
    /// Base backoff between conflicting commit attempts.
    pub conflict_backoff: StdDuration,
    /// Release attempts made when a step is aborted.
    pub abort_release_attempts: u32,
    /// How long a consumer may stay BLOCKED; `None` waits indefinitely.
    pub blocked_timeout: Option<Duration>,
    /// Interval between deadline reconcile sweeps.
    pub reconcile_interval: StdDuration,
    /// Log output format for [`sluice_core::init_logging`].
    pub log_format: LogFormat,
}

impl Default for ConstraintRuntimeConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 8,
            conflict_backoff: StdDuration::from_millis(DEFAULT_CONFLICT_BACKOFF_MS),
            abort_release_attempts: 3,
            blocked_timeout: None,
            reconcile_interval: StdDuration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS),
            log_format: LogFormat::default(),
        }
    }
}

impl ConstraintRuntimeConfig {
    /// Loads config from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer or exceeds the supported range.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads config with a custom environment source.
    ///
    /// This entry point is test-friendly and accepts a key lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when an environment value is not a
    /// positive integer or exceeds the supported range.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_conflict_retries = to_u32(
            ENV_MAX_CONFLICT_RETRIES,
            parse_positive_u64_env(&get_env, ENV_MAX_CONFLICT_RETRIES, DEFAULT_MAX_CONFLICT_RETRIES)?,
        )?;
        let conflict_backoff_ms =
            parse_positive_u64_env(&get_env, ENV_CONFLICT_BACKOFF_MS, DEFAULT_CONFLICT_BACKOFF_MS)?;
        let abort_release_attempts = to_u32(
            ENV_ABORT_RELEASE_ATTEMPTS,
            parse_positive_u64_env(
                &get_env,
                ENV_ABORT_RELEASE_ATTEMPTS,
                DEFAULT_ABORT_RELEASE_ATTEMPTS,
            )?,
        )?;
        let reconcile_interval_secs = parse_positive_u64_env(
            &get_env,
            ENV_RECONCILE_INTERVAL_SECS,
            DEFAULT_RECONCILE_INTERVAL_SECS,
        )?;

        let blocked_timeout = match get_env(ENV_BLOCKED_TIMEOUT_SECS) {
            None => None,
            Some(_) => {
                let secs = parse_positive_u64_env(&get_env, ENV_BLOCKED_TIMEOUT_SECS, 0)?;
                Some(Duration::seconds(i64::try_from(secs).map_err(|_| {
                    Error::configuration(format!(
                        "{ENV_BLOCKED_TIMEOUT_SECS} value {secs} exceeds supported range"
                    ))
                })?))
            }
        };

        Ok(Self {
            max_conflict_retries,
            conflict_backoff: StdDuration::from_millis(conflict_backoff_ms),
            abort_release_attempts,
            blocked_timeout,
            reconcile_interval: StdDuration::from_secs(reconcile_interval_secs),
            log_format: get_env(ENV_LOG_FORMAT)
                .map_or_else(LogFormat::default, |raw| LogFormat::from_name(raw.trim())),
        })
    }

    /// Sets the BLOCKED timeout.
    #[must_use]
    pub const fn with_blocked_timeout(mut self, timeout: Duration) -> Self {
        self.blocked_timeout = Some(timeout);
        self
    }

    /// Sets the conflict retry limit.
    #[must_use]
    pub const fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Sets the abort release attempt limit.
    #[must_use]
    pub const fn with_abort_release_attempts(mut self, attempts: u32) -> Self {
        self.abort_release_attempts = attempts;
        self
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn to_u32(key: &str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        Error::configuration(format!("{key} value {value} exceeds supported range"))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ConstraintRuntimeConfig::from_env_with(env(&[])).unwrap();
        assert_eq!(config, ConstraintRuntimeConfig::default());
        assert!(config.blocked_timeout.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = ConstraintRuntimeConfig::from_env_with(env(&[
            (ENV_MAX_CONFLICT_RETRIES, "3"),
            (ENV_CONFLICT_BACKOFF_MS, "25"),
            (ENV_ABORT_RELEASE_ATTEMPTS, "5"),
            (ENV_BLOCKED_TIMEOUT_SECS, "600"),
            (ENV_RECONCILE_INTERVAL_SECS, "15"),
            (ENV_LOG_FORMAT, "JSON"),
        ]))
        .unwrap();
        assert_eq!(config.max_conflict_retries, 3);
        assert_eq!(config.conflict_backoff, StdDuration::from_millis(25));
        assert_eq!(config.abort_release_attempts, 5);
        assert_eq!(config.blocked_timeout, Some(Duration::seconds(600)));
        assert_eq!(config.reconcile_interval, StdDuration::from_secs(15));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn zero_is_rejected() {
        let err = ConstraintRuntimeConfig::from_env_with(env(&[(ENV_MAX_CONFLICT_RETRIES, "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = ConstraintRuntimeConfig::from_env_with(env(&[(ENV_BLOCKED_TIMEOUT_SECS, "soon")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn retries_beyond_u32_are_rejected() {
        let err = ConstraintRuntimeConfig::from_env_with(env(&[(
            ENV_ABORT_RELEASE_ATTEMPTS,
            "99999999999",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("exceeds supported range"));
    }
}
