//! Admission decisions: may a step proceed right now?

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constraint::Constraint;
use crate::consumer::{AcquireMode, UnitKey};
use crate::error::Result;
use crate::store::{ConstraintStore, UnitSnapshot};

/// How a step proceeds after facilitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// Capacity is available; the step completes without suspending.
    Sync,
    /// The step suspends and waits for a resume signal.
    Async,
}

impl ExecutionMode {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    /// Chosen execution mode.
    pub mode: ExecutionMode,
    /// Unit version the decision was based on.
    pub observed_version: u64,
}

/// Decides admission against a unit snapshot.
///
/// `Ensure` runs synchronously only if the permits fit the free capacity and
/// nobody is queued ahead; `Accumulate` always queues.
#[must_use]
pub fn decide(
    capacity: u32,
    snapshot: &UnitSnapshot,
    permits: u32,
    mode: AcquireMode,
) -> ExecutionMode {
    match mode {
        AcquireMode::Accumulate => ExecutionMode::Async,
        AcquireMode::Ensure => {
            if fits(capacity, snapshot.active_permits(), permits) && !snapshot.has_waiters() {
                ExecutionMode::Sync
            } else {
                ExecutionMode::Async
            }
        }
    }
}

/// Returns true if `permits` more can be held on top of `used`.
#[must_use]
pub fn fits(capacity: u32, used: u64, permits: u32) -> bool {
    used + u64::from(permits) <= u64::from(capacity)
}

/// Evaluates admission against the store.
#[derive(Clone)]
pub struct AdmissionEvaluator {
    store: Arc<dyn ConstraintStore>,
}

impl fmt::Debug for AdmissionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionEvaluator").finish_non_exhaustive()
    }
}

impl AdmissionEvaluator {
    /// Creates an evaluator over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ConstraintStore>) -> Self {
        Self { store }
    }

    /// Decides whether a request for `permits` on `resource_unit` can run
    /// synchronously.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the unit cannot be loaded.
    pub async fn evaluate(
        &self,
        constraint: &Constraint,
        resource_unit: &str,
        permits: u32,
        mode: AcquireMode,
    ) -> Result<AdmissionDecision> {
        let key = UnitKey::new(constraint.id, resource_unit);
        let snapshot = self.store.load_unit(&key).await?;
        Ok(AdmissionDecision {
            mode: decide(constraint.capacity, &snapshot, permits, mode),
            observed_version: snapshot.version,
        })
    }
}
