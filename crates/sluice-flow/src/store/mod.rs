//! Pluggable persistence for constraints and consumers.
//!
//! The [`ConstraintStore`] trait is the only shared mutable state of the
//! engine. Workers do not share in-process locks; instead every write that
//! touches a resource unit is committed as one batch conditioned on the unit
//! version that was read (optimistic concurrency).
//!
//! ## Design Principles
//!
//! - **Unit-scoped CAS**: Each (constraint, resource unit) carries a version;
//!   a commit applies only if the version and the constraint capacity it was
//!   planned against still match
//! - **Store-assigned sequence numbers**: Inserts receive the unit's next
//!   sequence number at commit time, so arrival order is gap-free per unit
//! - **Append-only history**: Consumers are never deleted
//! - **Testability**: In-memory implementation for tests, a transactional
//!   database for production

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::{ConstraintId, ConsumerId};

use crate::constraint::{Constraint, NewConstraint};
use crate::consumer::{Consumer, ConsumerState, NewConsumer, TransitionReason, UnitKey};
use crate::error::Result;

/// Result of a conditional unit commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The batch was applied.
    Success,
    /// A consumer referenced by the batch does not exist in the unit.
    NotFound,
    /// A consumer was not in the expected state.
    StateMismatch {
        /// The actual state that was found.
        actual: ConsumerState,
    },
    /// The unit was modified concurrently.
    VersionConflict {
        /// The actual version that was found.
        actual: u64,
    },
    /// The constraint capacity changed since the batch was planned.
    CapacityChanged {
        /// The capacity now in effect.
        actual: u32,
    },
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the entity was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// One write in a unit commit batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitWrite {
    /// Insert a new consumer at the tail of the unit queue.
    Insert(NewConsumer),
    /// Transition an existing consumer of the unit.
    Transition {
        /// The consumer to transition.
        consumer_id: ConsumerId,
        /// The state the consumer must currently be in.
        from: ConsumerState,
        /// The target state.
        to: ConsumerState,
        /// Why the transition happens.
        reason: TransitionReason,
    },
}

impl UnitWrite {
    /// Creates a transition write.
    #[must_use]
    pub const fn transition(
        consumer_id: ConsumerId,
        from: ConsumerState,
        to: ConsumerState,
        reason: TransitionReason,
    ) -> Self {
        Self::Transition {
            consumer_id,
            from,
            to,
            reason,
        }
    }
}

/// Point-in-time view of one resource unit's queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSnapshot {
    /// Unit version; zero for a unit that has never been written.
    pub version: u64,
    /// Sequence number the next inserted consumer will receive.
    pub next_sequence: u64,
    /// ACTIVE and BLOCKED consumers, ascending by sequence number.
    pub consumers: Vec<Consumer>,
}

impl UnitSnapshot {
    /// Sum of permits held by ACTIVE consumers.
    #[must_use]
    pub fn active_permits(&self) -> u64 {
        self.consumers
            .iter()
            .filter(|c| c.state == ConsumerState::Active)
            .map(|c| u64::from(c.permits))
            .sum()
    }

    /// BLOCKED consumers in arrival order.
    pub fn blocked(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers
            .iter()
            .filter(|c| c.state == ConsumerState::Blocked)
    }

    /// ACTIVE consumers in arrival order.
    pub fn active(&self) -> impl Iterator<Item = &Consumer> {
        self.consumers
            .iter()
            .filter(|c| c.state == ConsumerState::Active)
    }

    /// Returns true if any consumer is waiting.
    #[must_use]
    pub fn has_waiters(&self) -> bool {
        self.blocked().next().is_some()
    }

    /// Finds a live consumer by id.
    #[must_use]
    pub fn find(&self, consumer_id: &ConsumerId) -> Option<&Consumer> {
        self.consumers.iter().find(|c| c.id == *consumer_id)
    }
}

/// Storage abstraction for constraint state.
///
/// Implementations must provide:
/// - Idempotent get-or-create of constraints keyed by (owner, name)
/// - Atomic, version-conditioned batch commits per resource unit
/// - Range queries by unit, by holding scope and by deadline
///
/// ## CAS Semantics
///
/// [`commit_unit`](Self::commit_unit) is the core primitive for distributed
/// correctness: a batch applies only if the unit version equals
/// `expected_version` and the constraint capacity equals `expected_capacity`,
/// and it bumps the version on success. Two promoters racing on the same unit
/// therefore cannot both admit consumers against the same free capacity, and
/// nobody admits against a capacity an administrator has since lowered.
///
/// ## Resume Signals
///
/// A transition that owes a suspended step a resume signal sets
/// [`Consumer::signal_pending`] in the same commit. The flag stays set until
/// [`acknowledge_signals`](Self::acknowledge_signals) clears it, so a signal
/// lost to a delivery failure can be found and sent again.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from many
/// workers.
#[async_trait]
pub trait ConstraintStore: Send + Sync {
    // --- Constraint Operations ---

    /// Returns the constraint for (owner, name), creating it from `request`
    /// if it does not exist. Capacity and strategy of an existing constraint
    /// are left untouched.
    async fn get_or_create_constraint(&self, request: NewConstraint) -> Result<Constraint>;

    /// Gets a constraint by ID.
    async fn get_constraint(&self, constraint_id: &ConstraintId) -> Result<Option<Constraint>>;

    /// Replaces the capacity of a constraint.
    ///
    /// Returns `None` if the constraint does not exist.
    async fn update_capacity(
        &self,
        constraint_id: &ConstraintId,
        capacity: u32,
    ) -> Result<Option<Constraint>>;

    // --- Unit Queue Operations ---

    /// Loads the live consumers and version of a resource unit.
    async fn load_unit(&self, key: &UnitKey) -> Result<UnitSnapshot>;

    /// Atomically applies `writes` if the unit version equals
    /// `expected_version` and the constraint capacity equals
    /// `expected_capacity`.
    ///
    /// # Returns
    ///
    /// - `CasResult::Success` if the whole batch was applied
    /// - `CasResult::VersionConflict` if the unit changed since it was read
    /// - `CasResult::CapacityChanged` if the capacity changed since it was read
    /// - `CasResult::NotFound` if the constraint does not exist
    /// - `CasResult::NotFound` / `CasResult::StateMismatch` if a transition
    ///   references a consumer that is missing or in another state
    ///
    /// Nothing is applied unless the result is `Success`.
    async fn commit_unit(
        &self,
        key: &UnitKey,
        expected_version: u64,
        expected_capacity: u32,
        writes: Vec<UnitWrite>,
        now: DateTime<Utc>,
    ) -> Result<CasResult>;

    // --- Consumer Queries ---

    /// Gets a consumer by ID, in any state.
    async fn get_consumer(&self, consumer_id: &ConsumerId) -> Result<Option<Consumer>>;

    /// Gets consumers held by a scope whose state is one of `states`.
    async fn consumers_by_scope(
        &self,
        scope_id: &str,
        states: &[ConsumerState],
    ) -> Result<Vec<Consumer>>;

    /// Gets BLOCKED consumers whose deadline is at or before `now`.
    async fn blocked_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Consumer>>;

    /// Lists resource units of a constraint that have live consumers.
    async fn units_for_constraint(&self, constraint_id: &ConstraintId) -> Result<Vec<String>>;

    // --- Resume Signals ---

    /// Gets consumers whose resume signal has not been acknowledged, oldest
    /// first.
    async fn pending_signals(&self) -> Result<Vec<Consumer>>;

    /// Clears the pending-signal flag of the given consumers.
    ///
    /// Unknown ids are ignored. The unit version is left alone; the flag
    /// plays no part in admission.
    async fn acknowledge_signals(&self, consumer_ids: &[ConsumerId]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::{AcquireMode, HoldingScope};

    fn consumer(state: ConsumerState, permits: u32, sequence: u64) -> Consumer {
        NewConsumer {
            id: ConsumerId::generate(),
            constraint_id: ConstraintId::generate(),
            resource_unit: "prod".into(),
            permits,
            state,
            holding_scope: HoldingScope::stage("s"),
            claimant_id: "step".into(),
            acquire_mode: AcquireMode::Ensure,
            blocked_deadline: None,
        }
        .into_consumer(sequence, Utc::now())
        .unwrap()
    }

    #[test]
    fn cas_result_predicates() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::VersionConflict { actual: 3 }.is_success());
        assert!(!CasResult::CapacityChanged { actual: 1 }.is_success());
        assert!(CasResult::NotFound.is_not_found());
        assert!(
            !CasResult::StateMismatch {
                actual: ConsumerState::Finished
            }
            .is_not_found()
        );
    }

    #[test]
    fn snapshot_sums_active_permits_only() {
        let snapshot = UnitSnapshot {
            version: 4,
            next_sequence: 4,
            consumers: vec![
                consumer(ConsumerState::Active, 2, 1),
                consumer(ConsumerState::Active, 1, 2),
                consumer(ConsumerState::Blocked, 5, 3),
            ],
        };
        assert_eq!(snapshot.active_permits(), 3);
        assert!(snapshot.has_waiters());
        assert_eq!(snapshot.blocked().count(), 1);
    }

    #[test]
    fn empty_snapshot_has_no_waiters() {
        let snapshot = UnitSnapshot::default();
        assert_eq!(snapshot.active_permits(), 0);
        assert!(!snapshot.has_waiters());
    }
}
