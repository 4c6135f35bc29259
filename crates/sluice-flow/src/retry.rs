//! Bounded retry for optimistic unit commits.
//!
//! Every read-modify-commit cycle on a resource unit runs under a
//! [`RetryPolicy`]: on a version conflict the caller reloads the unit and
//! tries again after an exponential backoff with random jitter, up to a fixed
//! number of attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::ConstraintRuntimeConfig;

/// Maximum backoff between attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Upper bound of the random jitter added to each delay, in milliseconds.
const JITTER_MAX_MS: u64 = 10;

/// Retry limits for conflicting commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles each attempt after that.
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConstraintRuntimeConfig::default())
    }
}

impl RetryPolicy {
    /// Builds the policy from runtime config.
    #[must_use]
    pub fn from_config(config: &ConstraintRuntimeConfig) -> Self {
        Self {
            max_attempts: config.max_conflict_retries.max(1),
            base_backoff: config.conflict_backoff,
        }
    }

    /// Returns true if another attempt is allowed after `attempts` tries.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Deterministic part of the delay after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1_u32 << exponent)
            .min(BACKOFF_MAX)
    }

    /// Sleeps for the backoff of `attempt` plus jitter.
    pub async fn wait(&self, attempt: u32) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=JITTER_MAX_MS));
        tokio::time::sleep(self.backoff_for(attempt) + jitter).await;
    }
}
