//! Step execution against a constraint: acquire, resume and abort.
//!
//! The executor turns a [`Facilitation`] into a persisted consumer and a
//! [`StepResponse`] for the engine:
//!
//! - `execute_sync`: insert ACTIVE when the capacity is still there
//! - `execute_async`: insert BLOCKED, promote, signal, suspend
//! - `handle_resume`: report the consumer's state when the engine wakes the step
//! - `handle_abort`: release unconditionally, retrying transient failures
//!
//! Signals are acknowledged in the store only after they were delivered, so a
//! delivery failure leaves them pending for [`StepExecutor::redeliver_pending`].

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use sluice_core::ConsumerId;

use crate::config::ConstraintRuntimeConfig;
use crate::consumer::{ConsumerState, NewConsumer, TransitionReason, UnitKey};
use crate::error::{Error, Result};
use crate::facilitator::Facilitation;
use crate::metrics::ConstraintMetrics;
use crate::queue::{AcquireOutcome, PromotionOutcome, QueueManager};
use crate::resume::{ResumeSignaller, pending_signal, signals_for};
use crate::retry::RetryPolicy;
use crate::step::{StepResponse, StepSpec};
use crate::store::ConstraintStore;

/// Executes steps that hold constraint permits.
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn ConstraintStore>,
    queue: QueueManager,
    signaller: Arc<dyn ResumeSignaller>,
    abort_release_attempts: u32,
    abort_backoff: RetryPolicy,
    metrics: ConstraintMetrics,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("queue", &self.queue)
            .field("abort_release_attempts", &self.abort_release_attempts)
            .finish_non_exhaustive()
    }
}

impl StepExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        store: Arc<dyn ConstraintStore>,
        queue: QueueManager,
        signaller: Arc<dyn ResumeSignaller>,
        config: &ConstraintRuntimeConfig,
    ) -> Self {
        Self {
            store,
            queue,
            signaller,
            abort_release_attempts: config.abort_release_attempts.max(1),
            abort_backoff: RetryPolicy::from_config(config),
            metrics: ConstraintMetrics::new(),
        }
    }

    /// Runs a step that facilitation admitted synchronously.
    ///
    /// The consumer is inserted ACTIVE if its permits still fit and nobody
    /// is waiting. If a concurrent writer took the capacity in the meantime,
    /// the consumer is queued instead and the step suspends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyConflict`] when commit retries are
    /// exhausted, [`Error::Signal`] if a promotion could not be delivered, or
    /// a storage error.
    #[tracing::instrument(
        skip(self, step, facilitation),
        fields(
            constraint_id = %facilitation.constraint.id,
            resource_unit = %facilitation.resource_unit,
            claimant_id = %step.claimant_id,
        )
    )]
    pub async fn execute_sync(
        &self,
        step: &StepSpec,
        facilitation: &Facilitation,
    ) -> Result<StepResponse> {
        let request = new_consumer(step, facilitation);
        let consumer_id = request.id;
        let outcome = self.queue.acquire(request, true).await?;

        if outcome.state != ConsumerState::Active {
            debug!(
                consumer_id = %consumer_id,
                observed_version = facilitation.observed_version,
                state = %outcome.state,
                "capacity changed since facilitation; step queued"
            );
        }
        self.deliver(&outcome.promotion, Some(consumer_id)).await?;
        Ok(self.respond(&outcome, facilitation))
    }

    /// Queues a step and suspends it.
    ///
    /// The consumer is inserted BLOCKED and the unit is promoted in the same
    /// commit; promotions (possibly of this very consumer) are signalled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyConflict`] when commit retries are
    /// exhausted, [`Error::Signal`] if a promotion could not be delivered, or
    /// a storage error.
    #[tracing::instrument(
        skip(self, step, facilitation),
        fields(
            constraint_id = %facilitation.constraint.id,
            resource_unit = %facilitation.resource_unit,
            claimant_id = %step.claimant_id,
        )
    )]
    pub async fn execute_async(
        &self,
        step: &StepSpec,
        facilitation: &Facilitation,
    ) -> Result<StepResponse> {
        let request = new_consumer(step, facilitation);
        let consumer_id = request.id;
        let outcome = self.queue.acquire(request, false).await?;

        let answered = (outcome.state == ConsumerState::Rejected).then_some(consumer_id);
        self.deliver(&outcome.promotion, answered).await?;
        match outcome.state {
            ConsumerState::Rejected => Ok(self.respond(&outcome, facilitation)),
            _ => Ok(StepResponse::Waiting {
                callback_id: consumer_id,
            }),
        }
    }

    /// Reports the state of a suspended step's consumer.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the consumer cannot be read.
    #[tracing::instrument(skip(self), fields(callback_id = %callback_id))]
    pub async fn handle_resume(&self, callback_id: &ConsumerId) -> Result<StepResponse> {
        let Some(consumer) = self.store.get_consumer(callback_id).await? else {
            warn!("resume for unknown consumer; treating as finished");
            return Ok(StepResponse::Done { consumer_id: None });
        };

        let response = match consumer.state {
            ConsumerState::Active => StepResponse::done(consumer.id),
            ConsumerState::Blocked => StepResponse::Waiting {
                callback_id: consumer.id,
            },
            ConsumerState::Rejected => StepResponse::Failed {
                consumer_id: Some(consumer.id),
                reason: format!(
                    "{} permits can never be granted by constraint {}",
                    consumer.permits, consumer.constraint_id
                ),
            },
            // Admitted first, then released before the engine caught up.
            ConsumerState::Finished if consumer.activated_at.is_some() => {
                StepResponse::done(consumer.id)
            }
            ConsumerState::Finished => StepResponse::Failed {
                consumer_id: Some(consumer.id),
                reason: format!(
                    "consumer finished before admission ({})",
                    consumer.last_transition_reason
                ),
            },
        };
        if consumer.signal_pending && consumer.state != ConsumerState::Blocked {
            self.store.acknowledge_signals(&[consumer.id]).await?;
        }
        debug!(state = %consumer.state, ?response, "resume handled");
        Ok(response)
    }

    /// Releases the consumer of an aborted step.
    ///
    /// Transient failures are retried up to the configured number of
    /// attempts. Promotions produced by the release are signalled, along with
    /// any signal of the same unit still pending from an earlier failure, so
    /// retrying an abort after a signal outage wakes the promoted steps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AbortReleaseFailed`] if the release cannot be made,
    /// which leaks capacity and must not be swallowed, or [`Error::Signal`]
    /// if a promotion could not be delivered.
    #[tracing::instrument(
        skip(self, step),
        fields(
            callback_id = %callback_id,
            claimant_id = %step.claimant_id,
            scope_id = %step.holding_scope.scope_id,
        )
    )]
    pub async fn handle_abort(
        &self,
        step: &StepSpec,
        callback_id: &ConsumerId,
    ) -> Result<PromotionOutcome> {
        let mut attempt = 0_u32;
        let outcome = loop {
            attempt += 1;
            match self
                .queue
                .release_with_reason(callback_id, TransitionReason::Aborted)
                .await
            {
                Ok(outcome) => break outcome,
                Err(e) if e.is_transient() && attempt < self.abort_release_attempts => {
                    warn!(attempt, error = %e, "abort release failed; retrying");
                    self.abort_backoff.wait(attempt).await;
                }
                Err(e) => {
                    error!(attempt, error = %e, "abort release failed permanently");
                    return Err(Error::AbortReleaseFailed {
                        consumer_id: *callback_id,
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
            }
        };

        if !outcome.released.is_empty() {
            info!("consumer released on abort");
        }
        self.deliver(&outcome, None).await?;
        if let Some(consumer) = self.store.get_consumer(callback_id).await? {
            self.redeliver_pending(Some(&[consumer.unit_key()])).await?;
        }
        Ok(outcome)
    }

    /// Signals promotions, rejections and expiries, except for `answered`,
    /// whose step learns its outcome from the response instead. Everything
    /// delivered (and `answered`) is acknowledged afterwards.
    pub(crate) async fn deliver(
        &self,
        outcome: &PromotionOutcome,
        answered: Option<ConsumerId>,
    ) -> Result<()> {
        let (signals, in_response): (Vec<_>, Vec<_>) = signals_for(outcome)
            .into_iter()
            .partition(|s| Some(s.callback_id) != answered);
        let mut acknowledged: Vec<ConsumerId> =
            in_response.iter().map(|s| s.callback_id).collect();
        if !signals.is_empty() {
            for signal in &signals {
                self.metrics.record_resume_signal(signal.outcome.as_label());
            }
            acknowledged.extend(signals.iter().map(|s| s.callback_id));
            self.signaller.signal_all(signals).await?;
        }
        if acknowledged.is_empty() {
            return Ok(());
        }
        self.store.acknowledge_signals(&acknowledged).await
    }

    /// Sends every signal still pending, optionally only for `units`, and
    /// acknowledges them.
    ///
    /// Delivery is at-least-once: a signal being delivered concurrently by
    /// another worker may be sent twice, which `handle_resume` tolerates.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or [`Error::Signal`] if delivery fails again,
    /// in which case the signals stay pending.
    pub async fn redeliver_pending(&self, units: Option<&[UnitKey]>) -> Result<Vec<ConsumerId>> {
        let signals: Vec<_> = self
            .store
            .pending_signals()
            .await?
            .iter()
            .filter(|c| units.is_none_or(|units| units.contains(&c.unit_key())))
            .filter_map(pending_signal)
            .collect();
        if signals.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ConsumerId> = signals.iter().map(|s| s.callback_id).collect();
        for signal in &signals {
            self.metrics.record_resume_signal(signal.outcome.as_label());
        }
        self.signaller.signal_all(signals).await?;
        self.store.acknowledge_signals(&ids).await?;
        info!(redelivered = ids.len(), "pending resume signals redelivered");
        Ok(ids)
    }

    fn respond(&self, outcome: &AcquireOutcome, facilitation: &Facilitation) -> StepResponse {
        match outcome.state {
            ConsumerState::Active => StepResponse::done(outcome.consumer_id),
            ConsumerState::Blocked => StepResponse::Waiting {
                callback_id: outcome.consumer_id,
            },
            ConsumerState::Rejected | ConsumerState::Finished => {
                self.metrics.record_rejections(
                    TransitionReason::ExceedsCapacity.as_label(),
                    1,
                );
                StepResponse::Failed {
                    consumer_id: Some(outcome.consumer_id),
                    reason: format!(
                        "requested permits exceed capacity {} of constraint '{}'",
                        facilitation.constraint.capacity, facilitation.constraint.name
                    ),
                }
            }
        }
    }
}

fn new_consumer(step: &StepSpec, facilitation: &Facilitation) -> NewConsumer {
    NewConsumer {
        id: ConsumerId::generate(),
        constraint_id: facilitation.constraint.id,
        resource_unit: facilitation.resource_unit.clone(),
        permits: step.permits,
        state: ConsumerState::Blocked,
        holding_scope: step.holding_scope.clone(),
        claimant_id: step.claimant_id.clone(),
        acquire_mode: step.acquire_mode,
        blocked_deadline: None,
    }
}
