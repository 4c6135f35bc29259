//! Holding-scope completion: release everything the scope held.
//!
//! When a node, stage or run ends, the hosting engine dispatches a
//! [`ScopeEndEvent`] through a [`ScopeEndDispatcher`]. Subscribers are wired
//! explicitly at construction; [`ConstraintScopeObserver`] is the one that
//! releases constraint consumers and wakes the steps promoted as a result.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sluice_core::ConsumerId;

use crate::consumer::{ConsumerState, HoldingScope, TransitionReason, UnitKey};
use crate::error::{Error, Result};
use crate::executor::StepExecutor;
use crate::queue::{PromotionOutcome, QueueManager};
use crate::store::ConstraintStore;

/// Final status of an ended scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeStatus {
    /// The scope completed successfully.
    Succeeded,
    /// The scope failed.
    Failed,
    /// The scope was aborted.
    Aborted,
}

/// Notification that a holding scope ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeEndEvent {
    /// The scope that ended.
    pub scope: HoldingScope,
    /// How it ended.
    pub status: ScopeStatus,
}

/// Reacts to ended scopes.
#[async_trait]
pub trait ScopeEndSubscriber: Send + Sync {
    /// Subscriber name, used in logs.
    fn name(&self) -> &'static str;

    /// Handles one ended scope.
    ///
    /// # Errors
    ///
    /// Implementation specific.
    async fn handle_scope_end(&self, event: &ScopeEndEvent) -> Result<()>;
}

/// Fans scope-end events out to subscribers in registration order.
#[derive(Clone, Default)]
pub struct ScopeEndDispatcher {
    subscribers: Vec<Arc<dyn ScopeEndSubscriber>>,
}

impl std::fmt::Debug for ScopeEndDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.subscribers.iter().map(|s| s.name()).collect();
        f.debug_struct("ScopeEndDispatcher")
            .field("subscribers", &names)
            .finish()
    }
}

impl ScopeEndDispatcher {
    /// Creates a dispatcher with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber.
    #[must_use]
    pub fn with_subscriber(mut self, subscriber: Arc<dyn ScopeEndSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Returns the number of subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns true if there are no subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Delivers `event` to every subscriber.
    ///
    /// A failing subscriber does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns the first subscriber failure after all were invoked.
    pub async fn dispatch(&self, event: &ScopeEndEvent) -> Result<()> {
        let mut first_error = None;
        for subscriber in &self.subscribers {
            if let Err(e) = subscriber.handle_scope_end(event).await {
                warn!(
                    subscriber = subscriber.name(),
                    scope_id = %event.scope.scope_id,
                    error = %e,
                    "scope end subscriber failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// What ending a scope released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeEndReport {
    /// The ended scope.
    pub scope_id: String,
    /// Consumers released.
    pub released: Vec<ConsumerId>,
    /// Consumers of other scopes promoted as a result.
    pub promoted: Vec<ConsumerId>,
    /// Consumers rejected as a result.
    pub rejected: Vec<ConsumerId>,
    /// Consumers whose signal from an earlier, failed delivery was sent
    /// again.
    pub redelivered: Vec<ConsumerId>,
    /// Consumers whose release failed, with the error text.
    pub failed: Vec<(ConsumerId, String)>,
}

/// Releases constraint consumers held by an ended scope.
#[derive(Clone)]
pub struct ConstraintScopeObserver {
    store: Arc<dyn ConstraintStore>,
    queue: QueueManager,
    executor: StepExecutor,
}

impl std::fmt::Debug for ConstraintScopeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintScopeObserver")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl ConstraintScopeObserver {
    /// Creates an observer. Signals go through the executor's signaller.
    #[must_use]
    pub fn new(store: Arc<dyn ConstraintStore>, queue: QueueManager, executor: StepExecutor) -> Self {
        Self {
            store,
            queue,
            executor,
        }
    }

    /// Releases every live consumer held by `scope_id` and signals the
    /// promotions this enables.
    ///
    /// Waiting consumers are released before active ones so their permits
    /// are never handed to a sibling that is about to be released too.
    ///
    /// Signals still pending in the units the scope held are sent as well,
    /// so ending a scope again after a signal outage wakes the steps that
    /// were promoted the first time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScopeReleaseFailed`] if any release failed (after
    /// attempting all of them), [`Error::Signal`] if a promotion could not be
    /// delivered, or a storage error if the scope cannot be queried.
    #[tracing::instrument(skip(self))]
    pub async fn on_scope_end(&self, scope_id: &str) -> Result<ScopeEndReport> {
        let held = self
            .store
            .consumers_by_scope(
                scope_id,
                &[
                    ConsumerState::Blocked,
                    ConsumerState::Active,
                    ConsumerState::Finished,
                    ConsumerState::Rejected,
                ],
            )
            .await?;
        let mut units: Vec<UnitKey> = held.iter().map(|c| c.unit_key()).collect();
        units.sort();
        units.dedup();

        let mut consumers: Vec<_> = held.into_iter().filter(|c| !c.is_terminal()).collect();
        consumers.sort_by_key(|c| {
            (
                c.state != ConsumerState::Blocked,
                c.created_at,
                c.sequence_number,
            )
        });

        let total = consumers.len();
        let mut outcome = PromotionOutcome::default();
        let mut failed = Vec::new();
        for consumer in consumers {
            match self
                .queue
                .release_with_reason(&consumer.id, TransitionReason::ScopeEnded)
                .await
            {
                Ok(released) => outcome.merge(released),
                Err(e) => {
                    warn!(consumer_id = %consumer.id, error = %e, "scope release failed");
                    failed.push((consumer.id, e.to_string()));
                }
            }
        }

        // A sibling promoted by an earlier release and then released itself
        // needs no signal.
        let released = outcome.released.clone();
        outcome.promoted.retain(|id| !released.contains(id));
        outcome.rejected.retain(|id| !released.contains(id));

        self.executor.deliver(&outcome, None).await?;
        let redelivered = self.executor.redeliver_pending(Some(&units)).await?;

        let report = ScopeEndReport {
            scope_id: scope_id.to_string(),
            released: outcome.released,
            promoted: outcome.promoted,
            rejected: outcome.rejected,
            redelivered,
            failed,
        };
        if !report.released.is_empty() {
            info!(
                released = report.released.len(),
                promoted = report.promoted.len(),
                "scope consumers released"
            );
        }

        if report.failed.is_empty() {
            Ok(report)
        } else {
            Err(Error::ScopeReleaseFailed {
                scope_id: scope_id.to_string(),
                failed: report.failed.len(),
                total,
            })
        }
    }
}

#[async_trait]
impl ScopeEndSubscriber for ConstraintScopeObserver {
    fn name(&self) -> &'static str {
        "constraint-release"
    }

    async fn handle_scope_end(&self, event: &ScopeEndEvent) -> Result<()> {
        self.on_scope_end(&event.scope.scope_id).await.map(|_| ())
    }
}
