//! Error types for the constraint engine.

use sluice_core::{ConstraintId, ConsumerId};

/// The result type used throughout sluice-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in constraint operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A constraint definition is invalid (bad capacity, unknown strategy,
    /// non-positive permits). Surfaced to the pipeline author; never retried.
    #[error("invalid constraint configuration: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Invalid input was provided (e.g. an unresolvable resource unit).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A constraint was not found.
    #[error("constraint not found: {constraint_id}")]
    ConstraintNotFound {
        /// The constraint ID that was not found.
        constraint_id: ConstraintId,
    },

    /// An invalid consumer state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// Optimistic concurrency retries were exhausted.
    #[error("concurrency conflict on {operation} after {attempts} attempts")]
    ConcurrencyConflict {
        /// The operation that kept conflicting.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Releasing a consumer during abort failed permanently.
    ///
    /// This leaks capacity until an operator intervenes, so it is fatal.
    #[error("failed to release consumer {consumer_id} on abort after {attempts} attempts: {source}")]
    AbortReleaseFailed {
        /// The consumer that could not be released.
        consumer_id: ConsumerId,
        /// Number of release attempts made.
        attempts: u32,
        /// The last underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Releasing the consumers of an ended holding scope partially failed.
    #[error("failed to release {failed} of {total} consumers for scope {scope_id}")]
    ScopeReleaseFailed {
        /// The holding scope that ended.
        scope_id: String,
        /// Number of consumers that could not be released.
        failed: usize,
        /// Number of consumers the scope held.
        total: usize,
    },

    /// Delivering a resume signal to the engine failed.
    #[error("resume signal delivery failed: {message}")]
    Signal {
        /// Description of the delivery failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An error from sluice-core.
    #[error("core error: {0}")]
    Core(#[from] sluice_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the operation at a higher level.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::Storage { .. } | Self::Signal { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn configuration_error_is_not_transient() {
        let err = Error::configuration("capacity must be positive, got 0");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("capacity must be positive"));
    }

    #[test]
    fn conflict_error_is_transient() {
        let err = Error::ConcurrencyConflict {
            operation: "promote",
            attempts: 8,
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("promote"));
    }

    #[test]
    fn abort_release_failure_keeps_source() {
        let err = Error::AbortReleaseFailed {
            consumer_id: ConsumerId::generate(),
            attempts: 3,
            source: Box::new(Error::storage("connection reset")),
        };
        assert!(!err.is_transient());
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = Error::storage_with_source("commit failed", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
