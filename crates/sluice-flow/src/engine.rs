//! Engine-facing facade wiring every constraint component.
//!
//! [`ConstraintEngine`] is what a workflow engine holds: it is built once from
//! a store, a resume signaller and runtime config, and exposes the operations
//! the engine calls around a step's lifecycle.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sluice_flow::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let signals = Arc::new(InMemoryResumeQueue::new());
//! let engine = ConstraintEngine::new(
//!     Arc::new(InMemoryConstraintStore::new()),
//!     signals.clone(),
//!     ConstraintRuntimeConfig::default(),
//! );
//!
//! let step = StepSpec {
//!     owner_id: "acct".into(),
//!     constraint: ConstraintDefinition {
//!         name: "deploy-prod".into(),
//!         capacity: 1,
//!         strategy: "FIFO".into(),
//!     },
//!     resource_unit: "prod".into(),
//!     permits: 1,
//!     acquire_mode: AcquireMode::Ensure,
//!     holding_scope: HoldingScope::stage("stage-1"),
//!     claimant_id: "deploy-step".into(),
//! };
//!
//! let response = engine.start_step(&step, &ExecutionContext::new()).await.unwrap();
//! assert!(response.is_done());
//! # });
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info};

use sluice_core::observability::{constraint_span, scope_span};
use sluice_core::{ConstraintId, ConsumerId};

use crate::admission::{AdmissionEvaluator, ExecutionMode};
use crate::config::ConstraintRuntimeConfig;
use crate::constraint::Constraint;
use crate::error::Result;
use crate::executor::StepExecutor;
use crate::facilitator::{Facilitation, StepFacilitator};
use crate::metrics::time_operation;
use crate::queue::{PromotionOutcome, QueueManager, QueueSnapshot};
use crate::reconciler::{DeadlineReconciler, ReconcileReport};
use crate::registry::ConstraintRegistry;
use crate::resume::ResumeSignaller;
use crate::scope::{ConstraintScopeObserver, ScopeEndReport, ScopeEndSubscriber};
use crate::step::{StepResponse, StepSpec};
use crate::store::ConstraintStore;
use crate::template::ExecutionContext;

/// Constraint engine facade.
#[derive(Clone)]
pub struct ConstraintEngine {
    config: ConstraintRuntimeConfig,
    registry: ConstraintRegistry,
    facilitator: StepFacilitator,
    queue: QueueManager,
    executor: StepExecutor,
    scope_observer: Arc<ConstraintScopeObserver>,
    reconciler: DeadlineReconciler,
}

impl std::fmt::Debug for ConstraintEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConstraintEngine {
    /// Wires an engine from its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn ConstraintStore>,
        signaller: Arc<dyn ResumeSignaller>,
        config: ConstraintRuntimeConfig,
    ) -> Self {
        let registry = ConstraintRegistry::new(Arc::clone(&store));
        let facilitator = StepFacilitator::new(
            registry.clone(),
            AdmissionEvaluator::new(Arc::clone(&store)),
        );
        let queue = QueueManager::new(Arc::clone(&store), &config);
        let executor = StepExecutor::new(Arc::clone(&store), queue.clone(), signaller, &config);
        let scope_observer = Arc::new(ConstraintScopeObserver::new(
            Arc::clone(&store),
            queue.clone(),
            executor.clone(),
        ));
        let reconciler = DeadlineReconciler::new(store, queue.clone(), executor.clone());

        Self {
            config,
            registry,
            facilitator,
            queue,
            executor,
            scope_observer,
            reconciler,
        }
    }

    /// Returns the runtime config.
    #[must_use]
    pub const fn config(&self) -> &ConstraintRuntimeConfig {
        &self.config
    }

    /// Decides whether a step runs synchronously or suspends.
    ///
    /// # Errors
    ///
    /// See [`StepFacilitator::facilitate`].
    pub async fn facilitate(&self, step: &StepSpec, ctx: &ExecutionContext) -> Result<Facilitation> {
        self.facilitator.facilitate(step, ctx).await
    }

    /// Runs a synchronously admitted step.
    ///
    /// # Errors
    ///
    /// See [`StepExecutor::execute_sync`].
    pub async fn execute_sync(
        &self,
        step: &StepSpec,
        facilitation: &Facilitation,
    ) -> Result<StepResponse> {
        self.executor.execute_sync(step, facilitation).await
    }

    /// Queues a step and suspends it.
    ///
    /// # Errors
    ///
    /// See [`StepExecutor::execute_async`].
    pub async fn execute_async(
        &self,
        step: &StepSpec,
        facilitation: &Facilitation,
    ) -> Result<StepResponse> {
        self.executor.execute_async(step, facilitation).await
    }

    /// Facilitates a step and executes it in the chosen mode.
    ///
    /// # Errors
    ///
    /// Returns any facilitation or execution failure.
    pub async fn start_step(&self, step: &StepSpec, ctx: &ExecutionContext) -> Result<StepResponse> {
        let _timer = time_operation("start_step");
        let facilitation = self.facilitate(step, ctx).await?;
        let span = constraint_span(
            "start_step",
            &facilitation.constraint.id.to_string(),
            &facilitation.resource_unit,
        );
        match facilitation.mode {
            ExecutionMode::Sync => self.execute_sync(step, &facilitation).instrument(span).await,
            ExecutionMode::Async => self.execute_async(step, &facilitation).instrument(span).await,
        }
    }

    /// Reports a suspended step's state after a resume signal.
    ///
    /// # Errors
    ///
    /// See [`StepExecutor::handle_resume`].
    pub async fn handle_resume(&self, callback_id: &ConsumerId) -> Result<StepResponse> {
        self.executor.handle_resume(callback_id).await
    }

    /// Like [`handle_resume`](Self::handle_resume), for a callback id in its
    /// string form as handed back by the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Core`](crate::error::Error::Core) if the id does not parse.
    pub async fn handle_resume_callback(&self, raw_callback_id: &str) -> Result<StepResponse> {
        let callback_id: ConsumerId = raw_callback_id.parse()?;
        self.handle_resume(&callback_id).await
    }

    /// Releases an aborted step's consumer.
    ///
    /// # Errors
    ///
    /// See [`StepExecutor::handle_abort`].
    pub async fn handle_abort(
        &self,
        step: &StepSpec,
        callback_id: &ConsumerId,
    ) -> Result<PromotionOutcome> {
        let _timer = time_operation("abort");
        self.executor.handle_abort(step, callback_id).await
    }

    /// Releases everything a finished scope held.
    ///
    /// # Errors
    ///
    /// See [`ConstraintScopeObserver::on_scope_end`].
    pub async fn on_scope_end(&self, scope_id: &str) -> Result<ScopeEndReport> {
        let _timer = time_operation("scope_end");
        self.scope_observer
            .on_scope_end(scope_id)
            .instrument(scope_span("scope_end", scope_id))
            .await
    }

    /// Changes a constraint's capacity and re-promotes all of its units.
    ///
    /// Raised capacity admits waiters right away; lowered capacity rejects
    /// waiters that can never fit.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero capacity,
    /// [`ConstraintNotFound`](crate::error::Error::ConstraintNotFound), or any
    /// promotion or signal failure.
    #[tracing::instrument(skip(self), fields(constraint_id = %constraint_id))]
    pub async fn update_capacity(
        &self,
        constraint_id: &ConstraintId,
        capacity: u32,
    ) -> Result<PromotionOutcome> {
        self.registry.update_capacity(constraint_id, capacity).await?;
        let outcome = self.queue.promote_all(constraint_id).await?;
        self.executor.deliver(&outcome, None).await?;
        info!(
            promoted = outcome.promoted.len(),
            rejected = outcome.rejected.len(),
            "capacity change applied"
        );
        Ok(outcome)
    }

    /// Gets a constraint by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails.
    pub async fn constraint(&self, constraint_id: &ConstraintId) -> Result<Option<Constraint>> {
        self.registry.get(constraint_id).await
    }

    /// Expires BLOCKED consumers past their deadline as of `now`.
    ///
    /// # Errors
    ///
    /// See [`DeadlineReconciler::reconcile_once`].
    pub async fn reconcile_expired(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        self.reconciler.reconcile_once(now).await
    }

    /// Returns the operator view of one unit queue.
    ///
    /// # Errors
    ///
    /// See [`QueueManager::snapshot`].
    pub async fn queue_snapshot(
        &self,
        constraint_id: &ConstraintId,
        resource_unit: &str,
    ) -> Result<QueueSnapshot> {
        self.queue.snapshot(constraint_id, resource_unit).await
    }

    /// Returns the scope-end subscriber to register with a
    /// [`ScopeEndDispatcher`](crate::scope::ScopeEndDispatcher).
    #[must_use]
    pub fn scope_observer(&self) -> Arc<dyn ScopeEndSubscriber> {
        self.scope_observer.clone()
    }

    /// Runs the deadline reconciler at the configured interval until
    /// `cancel` fires.
    pub async fn run_reconciler(&self, cancel: CancellationToken) {
        self.reconciler
            .run(self.config.reconcile_interval, cancel)
            .await;
    }
}
