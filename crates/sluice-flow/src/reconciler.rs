//! Periodic expiry of BLOCKED consumers past their deadline.
//!
//! Deadlines are only set when a BLOCKED timeout is configured. The
//! reconciler finds waiters whose deadline has passed, finishes them with
//! `DeadlineExpired`, promotes their units and signals both the expired and
//! the promoted steps.
//!
//! Every sweep also resends resume signals that are still pending after a
//! failed delivery, so a promoted step is woken even if nobody retries the
//! operation that promoted it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sluice_core::ConsumerId;

use crate::error::Result;
use crate::executor::StepExecutor;
use crate::metrics::time_operation;
use crate::queue::{PromotionOutcome, QueueManager};
use crate::store::ConstraintStore;

/// Result of one reconcile sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Consumers expired.
    pub expired: Vec<ConsumerId>,
    /// Consumers promoted after expiries freed their place.
    pub promoted: Vec<ConsumerId>,
    /// Consumers rejected during the re-promotion.
    pub rejected: Vec<ConsumerId>,
    /// Consumers whose pending signal was sent again.
    pub redelivered: Vec<ConsumerId>,
    /// Expiries that failed transiently and will be retried next sweep.
    pub deferred: usize,
}

/// Expires overdue BLOCKED consumers.
#[derive(Clone)]
pub struct DeadlineReconciler {
    store: Arc<dyn ConstraintStore>,
    queue: QueueManager,
    executor: StepExecutor,
}

impl std::fmt::Debug for DeadlineReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineReconciler").finish_non_exhaustive()
    }
}

impl DeadlineReconciler {
    /// Creates a reconciler. Signals go through the executor's signaller.
    #[must_use]
    pub fn new(store: Arc<dyn ConstraintStore>, queue: QueueManager, executor: StepExecutor) -> Self {
        Self {
            store,
            queue,
            executor,
        }
    }

    /// Runs one sweep as of `now`.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient failure, or a signal error if fresh
    /// or pending signals cannot be delivered. Transient expiry failures are
    /// counted in [`ReconcileReport::deferred`] instead.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let _timer = time_operation("reconcile");
        let overdue = self.store.blocked_past_deadline(now).await?;
        if overdue.is_empty() {
            debug!("no overdue consumers");
        }

        let mut outcome = PromotionOutcome::default();
        let mut deferred = 0;
        for consumer in overdue {
            match self.queue.expire(&consumer.id, now).await {
                Ok(expired) => outcome.merge(expired),
                Err(e) if e.is_transient() => {
                    warn!(consumer_id = %consumer.id, error = %e, "expiry deferred");
                    deferred += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.executor.deliver(&outcome, None).await?;
        let redelivered = self.executor.redeliver_pending(None).await?;
        if !outcome.is_empty() || !redelivered.is_empty() || deferred > 0 {
            info!(
                expired = outcome.expired.len(),
                promoted = outcome.promoted.len(),
                redelivered = redelivered.len(),
                deferred,
                "deadline reconcile complete"
            );
        }
        Ok(ReconcileReport {
            expired: outcome.expired,
            promoted: outcome.promoted,
            rejected: outcome.rejected,
            redelivered,
            deferred,
        })
    }

    /// Sweeps every `interval` until `cancel` fires.
    ///
    /// Sweep failures are logged and retried on the next tick.
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(?interval, "deadline reconciler started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once(Utc::now()).await {
                        warn!(error = %e, "deadline reconcile failed");
                    }
                }
            }
        }
        info!("deadline reconciler stopped");
    }
}
