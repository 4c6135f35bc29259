//! Resume signalling towards the hosting engine.
//!
//! A suspended step holds no thread or lock. When the queue promotes,
//! rejects or expires its consumer, the callback id is delivered through a
//! [`ResumeSignaller`]; the engine then calls `handle_resume` for that id.
//!
//! The transition that owes a signal marks the consumer in the same commit,
//! and the mark is cleared only once delivery succeeded or the engine resumed
//! the step. Signals lost to an outage are rebuilt with [`pending_signal`]
//! and sent again.
//!
//! ## Implementations
//!
//! - [`memory::InMemoryResumeQueue`]: buffered signals for tests
//! - [`channel::ChannelResumeSignaller`]: tokio channel feeding an engine task

pub mod channel;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::ConsumerId;

use crate::consumer::{Consumer, ConsumerState, TransitionReason};
use crate::error::Result;
use crate::queue::PromotionOutcome;

/// Why a suspended step is being woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResumeOutcome {
    /// The consumer holds its permits; the step may succeed.
    Promoted,
    /// The consumer can never be admitted; the step must fail.
    Rejected,
    /// The consumer waited past its deadline; the step must fail.
    Expired,
}

impl ResumeOutcome {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Promoted => "promoted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for ResumeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A resume notification for one callback id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSignal {
    /// Callback id of the suspended step (its consumer id).
    pub callback_id: ConsumerId,
    /// What happened to the consumer.
    pub outcome: ResumeOutcome,
    /// When the signal was produced.
    pub signalled_at: DateTime<Utc>,
}

impl ResumeSignal {
    /// Creates a signal stamped with the current time.
    #[must_use]
    pub fn new(callback_id: ConsumerId, outcome: ResumeOutcome) -> Self {
        Self {
            callback_id,
            outcome,
            signalled_at: Utc::now(),
        }
    }
}

/// Builds the signals implied by a queue outcome.
///
/// Released consumers are not signalled; their steps already finished or
/// were aborted.
#[must_use]
pub fn signals_for(outcome: &PromotionOutcome) -> Vec<ResumeSignal> {
    let promoted = outcome
        .promoted
        .iter()
        .map(|id| ResumeSignal::new(*id, ResumeOutcome::Promoted));
    let rejected = outcome
        .rejected
        .iter()
        .map(|id| ResumeSignal::new(*id, ResumeOutcome::Rejected));
    let expired = outcome
        .expired
        .iter()
        .map(|id| ResumeSignal::new(*id, ResumeOutcome::Expired));
    promoted.chain(rejected).chain(expired).collect()
}

/// Rebuilds the signal a consumer is still owed, if any.
#[must_use]
pub fn pending_signal(consumer: &Consumer) -> Option<ResumeSignal> {
    if !consumer.signal_pending {
        return None;
    }
    let outcome = match (consumer.state, consumer.last_transition_reason) {
        (ConsumerState::Active, _) => ResumeOutcome::Promoted,
        (ConsumerState::Rejected, _) => ResumeOutcome::Rejected,
        (ConsumerState::Finished, TransitionReason::DeadlineExpired) => ResumeOutcome::Expired,
        _ => return None,
    };
    Some(ResumeSignal::new(consumer.id, outcome))
}

/// Delivers resume signals to the engine.
///
/// Delivery must be at-least-once; `handle_resume` is idempotent, so
/// duplicate signals are harmless.
#[async_trait]
pub trait ResumeSignaller: Send + Sync {
    /// Delivers one signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signal`](crate::error::Error::Signal) if the signal
    /// could not be delivered.
    async fn signal(&self, signal: ResumeSignal) -> Result<()>;

    /// Delivers several signals in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first delivery failure.
    async fn signal_all(&self, signals: Vec<ResumeSignal>) -> Result<()> {
        for signal in signals {
            self.signal(signal).await?;
        }
        Ok(())
    }
}
