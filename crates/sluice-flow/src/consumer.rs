//! Consumer records and their lifecycle.
//!
//! A [`Consumer`] is one step attempt's request to hold permits of a
//! constraint for a resource unit. Consumers are never deleted; they end in
//! `FINISHED` or `REJECTED` so that release is idempotent and history stays
//! auditable.
//!
//! ## State Machine
//!
//! ```text
//!  (new) ──► BLOCKED ──► ACTIVE ──► FINISHED
//!    │          │  │                   ▲
//!    │          │  └───────────────────┘
//!    │          └──► REJECTED
//!    └─────────────► ACTIVE
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::{ConstraintId, ConsumerId};

use crate::error::{Error, Result};

/// Consumer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerState {
    /// Waiting in the queue for capacity.
    Blocked,
    /// Holding its permits.
    Active,
    /// Released; permits (if any) were returned.
    Finished,
    /// Can never be admitted (e.g. asks for more permits than the capacity).
    Rejected,
}

impl ConsumerState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Rejected)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Blocked => matches!(target, Self::Active | Self::Finished | Self::Rejected),
            Self::Active => matches!(target, Self::Finished),
            Self::Finished | Self::Rejected => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Blocked => "BLOCKED",
            Self::Active => "ACTIVE",
            Self::Finished => "FINISHED",
            Self::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Reason for a consumer state transition.
///
/// Every transition carries a reason for auditing and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Created ACTIVE because capacity was available.
    AdmittedOnArrival,
    /// Created BLOCKED to wait in the queue.
    QueuedOnArrival,
    /// Promoted from the queue after capacity freed up.
    Promoted,
    /// Released explicitly.
    Released,
    /// Released while still waiting, before it was ever admitted.
    ReleasedBeforeAdmission,
    /// Released because its holding scope ended.
    ScopeEnded,
    /// Released because the step was aborted.
    Aborted,
    /// Waited past its deadline.
    DeadlineExpired,
    /// Requests more permits than the constraint capacity.
    ExceedsCapacity,
}

impl TransitionReason {
    /// Returns a label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::AdmittedOnArrival => "admitted_on_arrival",
            Self::QueuedOnArrival => "queued_on_arrival",
            Self::Promoted => "promoted",
            Self::Released => "released",
            Self::ReleasedBeforeAdmission => "released_before_admission",
            Self::ScopeEnded => "scope_ended",
            Self::Aborted => "aborted",
            Self::DeadlineExpired => "deadline_expired",
            Self::ExceedsCapacity => "exceeds_capacity",
        }
    }

    /// Returns true if a transition for this reason owes the suspended step
    /// a resume signal.
    #[must_use]
    pub const fn requires_resume_signal(&self) -> bool {
        matches!(
            self,
            Self::Promoted | Self::ExceedsCapacity | Self::DeadlineExpired
        )
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// How a step wants to acquire its permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireMode {
    /// Check availability once; proceed synchronously when it fits and
    /// nobody is waiting, otherwise queue.
    Ensure,
    /// Always queue, even when capacity would admit the step immediately.
    Accumulate,
}

/// Kind of pipeline entity whose completion releases held permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeType {
    /// A single plan node.
    Node,
    /// A pipeline stage.
    Stage,
    /// A whole pipeline run.
    Run,
}

/// The pipeline entity holding a consumer's permits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldingScope {
    /// Scope kind.
    pub scope_type: ScopeType,
    /// Scope identifier (node/stage/run execution id).
    pub scope_id: String,
}

impl HoldingScope {
    /// Creates a holding scope.
    #[must_use]
    pub fn new(scope_type: ScopeType, scope_id: impl Into<String>) -> Self {
        Self {
            scope_type,
            scope_id: scope_id.into(),
        }
    }

    /// Convenience constructor for a stage scope.
    #[must_use]
    pub fn stage(scope_id: impl Into<String>) -> Self {
        Self::new(ScopeType::Stage, scope_id)
    }

    /// Convenience constructor for a run scope.
    #[must_use]
    pub fn run(scope_id: impl Into<String>) -> Self {
        Self::new(ScopeType::Run, scope_id)
    }
}

/// Identifies the independent queue of one resource unit of a constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitKey {
    /// The constraint.
    pub constraint_id: ConstraintId,
    /// The resource unit within the constraint.
    pub resource_unit: String,
}

impl UnitKey {
    /// Creates a unit key.
    #[must_use]
    pub fn new(constraint_id: ConstraintId, resource_unit: impl Into<String>) -> Self {
        Self {
            constraint_id,
            resource_unit: resource_unit.into(),
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.constraint_id, self.resource_unit)
    }
}

/// One step attempt's hold on a constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumer {
    /// Consumer id; also the callback id of a suspended step.
    pub id: ConsumerId,
    /// The constraint being consumed.
    pub constraint_id: ConstraintId,
    /// The resource unit being contended for.
    pub resource_unit: String,
    /// Requested permits.
    pub permits: u32,
    /// Current state.
    pub state: ConsumerState,
    /// Arrival order within the resource unit; assigned by the store.
    pub sequence_number: u64,
    /// Scope whose end releases this consumer.
    pub holding_scope: HoldingScope,
    /// The step (or other actor) that claimed the permits.
    pub claimant_id: String,
    /// Acquire mode of the requesting step.
    pub acquire_mode: AcquireMode,
    /// When the consumer was created.
    pub created_at: DateTime<Utc>,
    /// When the consumer became ACTIVE.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    /// When the consumer reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Deadline after which a BLOCKED consumer expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_deadline: Option<DateTime<Utc>>,
    /// Reason for the most recent transition.
    pub last_transition_reason: TransitionReason,
    /// Set when the most recent transition owes the step a resume signal
    /// that has not been acknowledged yet.
    #[serde(default)]
    pub signal_pending: bool,
}

impl Consumer {
    /// Returns the key of the queue this consumer belongs to.
    #[must_use]
    pub fn unit_key(&self) -> UnitKey {
        UnitKey::new(self.constraint_id, self.resource_unit.clone())
    }

    /// Returns true if the consumer is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if this consumer is BLOCKED and its deadline has passed.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == ConsumerState::Blocked && self.blocked_deadline.is_some_and(|d| d <= now)
    }

    /// Transitions to a new state, recording the reason and timestamps.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not legal.
    pub fn transition_to(
        &mut self,
        target: ConsumerState,
        reason: TransitionReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!("consumer {} ({reason})", self.id),
            });
        }

        match target {
            ConsumerState::Active => self.activated_at = Some(now),
            ConsumerState::Finished | ConsumerState::Rejected => self.finished_at = Some(now),
            ConsumerState::Blocked => {}
        }
        self.state = target;
        self.last_transition_reason = reason;
        self.signal_pending = reason.requires_resume_signal();
        Ok(())
    }
}

/// A consumer to be created; the store assigns its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConsumer {
    /// Pre-generated id (returned to the engine as the callback id).
    pub id: ConsumerId,
    /// The constraint being consumed.
    pub constraint_id: ConstraintId,
    /// The resolved resource unit.
    pub resource_unit: String,
    /// Requested permits.
    pub permits: u32,
    /// Initial state: `Active` or `Blocked`.
    pub state: ConsumerState,
    /// Holding scope.
    pub holding_scope: HoldingScope,
    /// Claimant.
    pub claimant_id: String,
    /// Acquire mode.
    pub acquire_mode: AcquireMode,
    /// Optional deadline for a BLOCKED consumer.
    pub blocked_deadline: Option<DateTime<Utc>>,
}

impl NewConsumer {
    /// Materializes the record with the sequence number chosen by the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial state is terminal.
    pub fn into_consumer(self, sequence_number: u64, now: DateTime<Utc>) -> Result<Consumer> {
        let (activated_at, blocked_deadline, reason) = match self.state {
            ConsumerState::Active => (Some(now), None, TransitionReason::AdmittedOnArrival),
            ConsumerState::Blocked => (None, self.blocked_deadline, TransitionReason::QueuedOnArrival),
            state @ (ConsumerState::Finished | ConsumerState::Rejected) => {
                return Err(Error::InvalidStateTransition {
                    from: "NEW".into(),
                    to: state.to_string(),
                    reason: "consumers are created ACTIVE or BLOCKED".into(),
                });
            }
        };

        Ok(Consumer {
            id: self.id,
            constraint_id: self.constraint_id,
            resource_unit: self.resource_unit,
            permits: self.permits,
            state: self.state,
            sequence_number,
            holding_scope: self.holding_scope,
            claimant_id: self.claimant_id,
            acquire_mode: self.acquire_mode,
            created_at: now,
            activated_at,
            finished_at: None,
            blocked_deadline,
            last_transition_reason: reason,
            signal_pending: false,
        })
    }
}
