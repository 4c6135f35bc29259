//! Per-unit FIFO queues: acquisition, promotion and release.
//!
//! Every resource unit of a constraint has an independent queue of ACTIVE and
//! BLOCKED consumers ordered by sequence number. All mutations follow the same
//! cycle:
//!
//! 1. Load the unit snapshot (consumers + version)
//! 2. Compute the full write batch (the mutation plus the promotions it enables)
//! 3. Commit the batch conditioned on the snapshot version and on the capacity
//!    it was planned against
//! 4. On conflict, back off and start over from a fresh snapshot
//!
//! Because promotion is planned and committed together with the write that
//! freed capacity, two workers releasing consumers of the same unit cannot
//! both admit against the same free permits.
//!
//! ## Promotion Rule
//!
//! Walk BLOCKED consumers in sequence order. A consumer that fits is
//! promoted; the walk stops at the first consumer that does not fit. A
//! consumer asking for more permits than the capacity can never fit and is
//! rejected instead, so it never wedges the head of the queue.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use sluice_core::{ConstraintId, ConsumerId};

use crate::admission::fits;
use crate::config::ConstraintRuntimeConfig;
use crate::consumer::{Consumer, ConsumerState, NewConsumer, TransitionReason, UnitKey};
use crate::error::{Error, Result};
use crate::metrics::ConstraintMetrics;
use crate::retry::RetryPolicy;
use crate::store::{CasResult, ConstraintStore, UnitSnapshot, UnitWrite};

/// Promotions and rejections planned for one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionPlan {
    /// BLOCKED consumers to activate, in sequence order.
    pub promote: Vec<ConsumerId>,
    /// BLOCKED consumers that can never fit.
    pub reject: Vec<ConsumerId>,
    /// BLOCKED consumers left waiting afterwards.
    pub remaining_blocked: usize,
}

impl PromotionPlan {
    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.promote.is_empty() && self.reject.is_empty()
    }

    /// Converts the plan into unit writes.
    #[must_use]
    pub fn writes(&self) -> Vec<UnitWrite> {
        let promotions = self.promote.iter().map(|id| {
            UnitWrite::transition(
                *id,
                ConsumerState::Blocked,
                ConsumerState::Active,
                TransitionReason::Promoted,
            )
        });
        let rejections = self.reject.iter().map(|id| {
            UnitWrite::transition(
                *id,
                ConsumerState::Blocked,
                ConsumerState::Rejected,
                TransitionReason::ExceedsCapacity,
            )
        });
        promotions.chain(rejections).collect()
    }
}

/// Plans promotions over a unit's live consumers.
///
/// Waiters are admitted in order until the first one that does not fit;
/// everything behind it keeps waiting. Waiters asking for more than the
/// whole capacity are rejected wherever they sit in the queue.
///
/// `consumers` must be in sequence order and contain only ACTIVE and BLOCKED
/// entries.
#[must_use]
pub fn plan_promotion(capacity: u32, consumers: &[Consumer]) -> PromotionPlan {
    let mut used: u64 = consumers
        .iter()
        .filter(|c| c.state == ConsumerState::Active)
        .map(|c| u64::from(c.permits))
        .sum();

    let mut plan = PromotionPlan::default();
    let mut stopped = false;
    for consumer in consumers
        .iter()
        .filter(|c| c.state == ConsumerState::Blocked)
    {
        if consumer.permits > capacity {
            plan.reject.push(consumer.id);
        } else if !stopped && fits(capacity, used, consumer.permits) {
            used += u64::from(consumer.permits);
            plan.promote.push(consumer.id);
        } else {
            stopped = true;
            plan.remaining_blocked += 1;
        }
    }
    plan
}

/// What a queue operation changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionOutcome {
    /// Consumers released (moved to FINISHED) by the operation itself.
    pub released: Vec<ConsumerId>,
    /// Consumers that expired while waiting.
    pub expired: Vec<ConsumerId>,
    /// Consumers promoted to ACTIVE.
    pub promoted: Vec<ConsumerId>,
    /// Consumers rejected because they can never fit.
    pub rejected: Vec<ConsumerId>,
}

impl PromotionOutcome {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
            && self.expired.is_empty()
            && self.promoted.is_empty()
            && self.rejected.is_empty()
    }

    /// Folds another outcome into this one.
    pub fn merge(&mut self, other: Self) {
        self.released.extend(other.released);
        self.expired.extend(other.expired);
        self.promoted.extend(other.promoted);
        self.rejected.extend(other.rejected);
    }

    fn from_plan(plan: PromotionPlan) -> Self {
        Self {
            promoted: plan.promote,
            rejected: plan.reject,
            ..Self::default()
        }
    }
}

/// Result of inserting a new consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOutcome {
    /// The inserted consumer.
    pub consumer_id: ConsumerId,
    /// State of the consumer once the commit landed.
    pub state: ConsumerState,
    /// Promotions and rejections committed alongside the insert, which may
    /// include the new consumer itself.
    pub promotion: PromotionOutcome,
}

/// Operator view of one unit queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// The constraint.
    pub constraint_id: ConstraintId,
    /// The resource unit.
    pub resource_unit: String,
    /// Current constraint capacity.
    pub capacity: u32,
    /// Unit version.
    pub version: u64,
    /// Sum of permits held by ACTIVE consumers.
    pub active_permits: u64,
    /// ACTIVE consumers in sequence order.
    pub active: Vec<Consumer>,
    /// BLOCKED consumers in sequence order.
    pub blocked: Vec<Consumer>,
}

/// Maintains unit queues in the store.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn ConstraintStore>,
    retry: RetryPolicy,
    blocked_timeout: Option<Duration>,
    metrics: ConstraintMetrics,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("retry", &self.retry)
            .field("blocked_timeout", &self.blocked_timeout)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates a queue manager.
    #[must_use]
    pub fn new(store: Arc<dyn ConstraintStore>, config: &ConstraintRuntimeConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::from_config(config),
            blocked_timeout: config.blocked_timeout,
            metrics: ConstraintMetrics::new(),
        }
    }

    /// Inserts a new consumer at the tail of its unit queue.
    ///
    /// With `admit_if_fits`, the consumer is inserted ACTIVE when its permits
    /// fit and nobody is waiting. Otherwise it is inserted BLOCKED and the
    /// queue is promoted in the same commit, so a consumer that can run right
    /// away (or that can never run) leaves BLOCKED immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyConflict`] when retries are exhausted,
    /// [`Error::ConstraintNotFound`] for an unknown constraint, or a storage
    /// error.
    #[tracing::instrument(
        skip(self, request),
        fields(
            constraint_id = %request.constraint_id,
            resource_unit = %request.resource_unit,
            consumer_id = %request.id,
        )
    )]
    pub async fn acquire(
        &self,
        request: NewConsumer,
        admit_if_fits: bool,
    ) -> Result<AcquireOutcome> {
        let key = UnitKey::new(request.constraint_id, request.resource_unit.clone());
        let consumer_id = request.id;
        let blocked_timeout = self.blocked_timeout;

        let outcome = self
            .run_cycle(&key, "acquire", |capacity, snapshot, now| {
                if admit_if_fits
                    && fits(capacity, snapshot.active_permits(), request.permits)
                    && !snapshot.has_waiters()
                {
                    let mut insert = request.clone();
                    insert.state = ConsumerState::Active;
                    insert.blocked_deadline = None;
                    let outcome = AcquireOutcome {
                        consumer_id,
                        state: ConsumerState::Active,
                        promotion: PromotionOutcome::default(),
                    };
                    return Ok(Some((vec![UnitWrite::Insert(insert)], outcome, 0)));
                }

                let mut insert = request.clone();
                insert.state = ConsumerState::Blocked;
                insert.blocked_deadline =
                    blocked_timeout.and_then(|timeout| now.checked_add_signed(timeout));

                let mut queue = snapshot.consumers.clone();
                queue.push(insert.clone().into_consumer(snapshot.next_sequence, now)?);
                let plan = plan_promotion(capacity, &queue);

                let state = if plan.promote.contains(&consumer_id) {
                    ConsumerState::Active
                } else if plan.reject.contains(&consumer_id) {
                    ConsumerState::Rejected
                } else {
                    ConsumerState::Blocked
                };

                let mut writes = vec![UnitWrite::Insert(insert)];
                writes.extend(plan.writes());
                let depth = plan.remaining_blocked;
                let outcome = AcquireOutcome {
                    consumer_id,
                    state,
                    promotion: PromotionOutcome::from_plan(plan),
                };
                Ok(Some((writes, outcome, depth)))
            })
            .await?
            .ok_or_else(|| Error::storage("acquire produced no writes"))?;

        self.metrics
            .record_transition(outcome.state.as_label(), "acquired");
        self.record_promotion(&outcome.promotion);
        debug!(state = %outcome.state, "consumer inserted");
        Ok(outcome)
    }

    /// Promotes waiting consumers of a unit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyConflict`] when retries are exhausted or a
    /// storage error.
    #[tracing::instrument(skip(self), fields(constraint_id = %constraint_id))]
    pub async fn promote(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &str,
    ) -> Result<PromotionOutcome> {
        let key = UnitKey::new(*constraint_id, resource_unit);
        let outcome = self
            .run_cycle(&key, "promote", |capacity, snapshot, _now| {
                let plan = plan_promotion(capacity, &snapshot.consumers);
                if plan.is_empty() {
                    return Ok(None);
                }
                let writes = plan.writes();
                let depth = plan.remaining_blocked;
                Ok(Some((writes, PromotionOutcome::from_plan(plan), depth)))
            })
            .await?
            .unwrap_or_default();

        self.record_promotion(&outcome);
        Ok(outcome)
    }

    /// Promotes every unit of a constraint that has live consumers.
    ///
    /// # Errors
    ///
    /// Returns the first failure; units before it keep their promotions.
    pub async fn promote_all(&self, constraint_id: &ConstraintId) -> Result<PromotionOutcome> {
        let mut total = PromotionOutcome::default();
        for unit in self.store.units_for_constraint(constraint_id).await? {
            total.merge(self.promote(constraint_id, &unit).await?);
        }
        Ok(total)
    }

    /// Releases a consumer and promotes its unit.
    ///
    /// # Errors
    ///
    /// See [`release_with_reason`](Self::release_with_reason).
    pub async fn release(&self, consumer_id: &ConsumerId) -> Result<PromotionOutcome> {
        self.release_with_reason(consumer_id, TransitionReason::Released)
            .await
    }

    /// Moves a consumer to FINISHED and promotes its unit in the same commit.
    ///
    /// Releasing a missing or already terminal consumer is a no-op that
    /// returns an empty outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyConflict`] when retries are exhausted or a
    /// storage error.
    #[tracing::instrument(skip(self), fields(consumer_id = %consumer_id, reason = %reason))]
    pub async fn release_with_reason(
        &self,
        consumer_id: &ConsumerId,
        reason: TransitionReason,
    ) -> Result<PromotionOutcome> {
        let Some(consumer) = self.store.get_consumer(consumer_id).await? else {
            warn!("release of unknown consumer ignored");
            return Ok(PromotionOutcome::default());
        };
        if consumer.is_terminal() {
            debug!(state = %consumer.state, "consumer already released");
            return Ok(PromotionOutcome::default());
        }

        let id = *consumer_id;
        let outcome = self
            .run_cycle(&consumer.unit_key(), "release", |capacity, snapshot, _now| {
                let Some(current) = snapshot.find(&id) else {
                    return Ok(None);
                };
                let from = current.state;
                let reason = if from == ConsumerState::Blocked && reason == TransitionReason::Released
                {
                    TransitionReason::ReleasedBeforeAdmission
                } else {
                    reason
                };

                let remaining: Vec<Consumer> = snapshot
                    .consumers
                    .iter()
                    .filter(|c| c.id != id)
                    .cloned()
                    .collect();
                let plan = plan_promotion(capacity, &remaining);

                let mut writes = vec![UnitWrite::transition(
                    id,
                    from,
                    ConsumerState::Finished,
                    reason,
                )];
                writes.extend(plan.writes());
                let depth = plan.remaining_blocked;
                let mut outcome = PromotionOutcome::from_plan(plan);
                outcome.released.push(id);
                Ok(Some((writes, outcome, depth)))
            })
            .await?
            .unwrap_or_default();

        if !outcome.released.is_empty() {
            self.metrics
                .record_transition(ConsumerState::Finished.as_label(), reason.as_label());
        }
        self.record_promotion(&outcome);
        Ok(outcome)
    }

    /// Expires a BLOCKED consumer whose deadline has passed and promotes its
    /// unit.
    ///
    /// A consumer that was admitted, released or given a later deadline in
    /// the meantime is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrencyConflict`] when retries are exhausted or a
    /// storage error.
    #[tracing::instrument(skip(self), fields(consumer_id = %consumer_id))]
    pub async fn expire(
        &self,
        consumer_id: &ConsumerId,
        now: DateTime<Utc>,
    ) -> Result<PromotionOutcome> {
        let Some(consumer) = self.store.get_consumer(consumer_id).await? else {
            return Ok(PromotionOutcome::default());
        };
        if !consumer.is_expired_at(now) {
            return Ok(PromotionOutcome::default());
        }

        let id = *consumer_id;
        let outcome = self
            .run_cycle(&consumer.unit_key(), "expire", |capacity, snapshot, _now| {
                let Some(current) = snapshot.find(&id) else {
                    return Ok(None);
                };
                if !current.is_expired_at(now) {
                    return Ok(None);
                }
                let remaining: Vec<Consumer> = snapshot
                    .consumers
                    .iter()
                    .filter(|c| c.id != id)
                    .cloned()
                    .collect();
                let plan = plan_promotion(capacity, &remaining);

                let mut writes = vec![UnitWrite::transition(
                    id,
                    ConsumerState::Blocked,
                    ConsumerState::Finished,
                    TransitionReason::DeadlineExpired,
                )];
                writes.extend(plan.writes());
                let depth = plan.remaining_blocked;
                let mut outcome = PromotionOutcome::from_plan(plan);
                outcome.expired.push(id);
                Ok(Some((writes, outcome, depth)))
            })
            .await?
            .unwrap_or_default();

        if !outcome.expired.is_empty() {
            info!("blocked consumer expired");
            self.metrics.record_transition(
                ConsumerState::Finished.as_label(),
                TransitionReason::DeadlineExpired.as_label(),
            );
        }
        self.record_promotion(&outcome);
        Ok(outcome)
    }

    /// Returns the operator view of a unit queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstraintNotFound`] for an unknown constraint or a
    /// storage error.
    pub async fn snapshot(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &str,
    ) -> Result<QueueSnapshot> {
        let capacity = self.capacity_of(constraint_id).await?;
        let snapshot = self
            .store
            .load_unit(&UnitKey::new(*constraint_id, resource_unit))
            .await?;
        Ok(QueueSnapshot {
            constraint_id: *constraint_id,
            resource_unit: resource_unit.to_string(),
            capacity,
            version: snapshot.version,
            active_permits: snapshot.active_permits(),
            active: snapshot.active().cloned().collect(),
            blocked: snapshot.blocked().cloned().collect(),
        })
    }

    async fn capacity_of(&self, constraint_id: &ConstraintId) -> Result<u32> {
        self.store
            .get_constraint(constraint_id)
            .await?
            .map(|c| c.capacity)
            .ok_or(Error::ConstraintNotFound {
                constraint_id: *constraint_id,
            })
    }

    /// Runs one read-modify-commit cycle under the retry policy.
    ///
    /// `build` receives the current capacity, a fresh snapshot and the commit
    /// time, and returns the batch to commit, the value to hand back and the
    /// resulting queue depth. Returning `None` means there is nothing to do.
    async fn run_cycle<T, F>(
        &self,
        key: &UnitKey,
        operation: &'static str,
        mut build: F,
    ) -> Result<Option<T>>
    where
        T: Send,
        F: FnMut(u32, &UnitSnapshot, DateTime<Utc>) -> Result<Option<(Vec<UnitWrite>, T, usize)>>
            + Send,
    {
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            let capacity = self.capacity_of(&key.constraint_id).await?;
            let snapshot = self.store.load_unit(key).await?;
            let now = Utc::now();

            let Some((writes, value, depth)) = build(capacity, &snapshot, now)? else {
                return Ok(None);
            };

            match self
                .store
                .commit_unit(key, snapshot.version, capacity, writes, now)
                .await?
            {
                CasResult::Success => {
                    self.metrics.set_queue_depth(&key.to_string(), depth);
                    return Ok(Some(value));
                }
                conflict => {
                    self.metrics.record_conflict(operation);
                    debug!(
                        unit = %key,
                        attempts,
                        expected_version = snapshot.version,
                        expected_capacity = capacity,
                        ?conflict,
                        "unit commit conflicted"
                    );
                    if !self.retry.should_retry(attempts) {
                        warn!(unit = %key, attempts, operation, "conflict retries exhausted");
                        return Err(Error::ConcurrencyConflict {
                            operation,
                            attempts,
                        });
                    }
                    self.retry.wait(attempts).await;
                }
            }
        }
    }

    fn record_promotion(&self, outcome: &PromotionOutcome) {
        if !outcome.promoted.is_empty() {
            info!(promoted = outcome.promoted.len(), "consumers promoted");
        }
        if !outcome.rejected.is_empty() {
            warn!(
                rejected = outcome.rejected.len(),
                "consumers rejected: permits exceed capacity"
            );
        }
        self.metrics.record_promotions(outcome.promoted.len());
        self.metrics.record_rejections(
            TransitionReason::ExceedsCapacity.as_label(),
            outcome.rejected.len(),
        );
    }
}
