//! Step-start facilitation: decide once per attempt whether a step runs
//! synchronously or suspends.

use tracing::debug;

use crate::admission::{AdmissionEvaluator, ExecutionMode};
use crate::constraint::Constraint;
use crate::error::Result;
use crate::metrics::ConstraintMetrics;
use crate::registry::ConstraintRegistry;
use crate::step::StepSpec;
use crate::template::ExecutionContext;

/// The facilitation decision carried into execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facilitation {
    /// How the step proceeds.
    pub mode: ExecutionMode,
    /// The constraint, created if this was its first use.
    pub constraint: Constraint,
    /// The resolved resource unit.
    pub resource_unit: String,
    /// Unit version the decision was based on.
    pub observed_version: u64,
}

/// Resolves the step's constraint and unit and evaluates admission.
#[derive(Debug, Clone)]
pub struct StepFacilitator {
    registry: ConstraintRegistry,
    evaluator: AdmissionEvaluator,
    metrics: ConstraintMetrics,
}

impl StepFacilitator {
    /// Creates a facilitator.
    #[must_use]
    pub fn new(registry: ConstraintRegistry, evaluator: AdmissionEvaluator) -> Self {
        Self {
            registry,
            evaluator,
            metrics: ConstraintMetrics::new(),
        }
    }

    /// Facilitates a step attempt.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid step or constraint
    /// definition, [`InvalidInput`](crate::error::Error::InvalidInput) if the
    /// resource unit does not resolve, or a storage error.
    #[tracing::instrument(
        skip(self, step, ctx),
        fields(claimant_id = %step.claimant_id, constraint = %step.constraint.name)
    )]
    pub async fn facilitate(&self, step: &StepSpec, ctx: &ExecutionContext) -> Result<Facilitation> {
        step.validate()?;
        let strategy = step.constraint.strategy()?;
        let resource_unit = ctx.resolve(&step.resource_unit)?;

        let constraint = self
            .registry
            .get_or_create(
                &step.owner_id,
                &step.constraint.name,
                step.constraint.capacity,
                strategy,
            )
            .await?;

        let decision = self
            .evaluator
            .evaluate(&constraint, &resource_unit, step.permits, step.acquire_mode)
            .await?;

        self.metrics.record_admission(decision.mode.as_label());
        debug!(
            constraint_id = %constraint.id,
            resource_unit = %resource_unit,
            mode = %decision.mode,
            version = decision.observed_version,
            "step facilitated"
        );

        Ok(Facilitation {
            mode: decision.mode,
            constraint,
            resource_unit,
            observed_version: decision.observed_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::consumer::{AcquireMode, HoldingScope};
    use crate::error::Error;
    use crate::step::ConstraintDefinition;
    use crate::store::ConstraintStore;
    use crate::store::memory::InMemoryConstraintStore;

    fn facilitator() -> StepFacilitator {
        let store: Arc<dyn ConstraintStore> = Arc::new(InMemoryConstraintStore::new());
        StepFacilitator::new(
            ConstraintRegistry::new(store.clone()),
            AdmissionEvaluator::new(store),
        )
    }

    fn step(mode: AcquireMode) -> StepSpec {
        StepSpec {
            owner_id: "acct".into(),
            constraint: ConstraintDefinition {
                name: "deploy".into(),
                capacity: 10,
                strategy: "FIFO".into(),
            },
            resource_unit: "deploy-<+env>".into(),
            permits: 1,
            acquire_mode: mode,
            holding_scope: HoldingScope::stage("stage"),
            claimant_id: "step".into(),
        }
    }

    #[tokio::test]
    async fn ensure_on_empty_constraint_is_sync() {
        let ctx = ExecutionContext::new().with_variable("env", "prod");
        let facilitation = facilitator()
            .facilitate(&step(AcquireMode::Ensure), &ctx)
            .await
            .unwrap();
        assert_eq!(facilitation.mode, ExecutionMode::Sync);
        assert_eq!(facilitation.resource_unit, "deploy-prod");
        assert_eq!(facilitation.observed_version, 0);
    }

    #[tokio::test]
    async fn accumulate_on_empty_constraint_is_async() {
        let ctx = ExecutionContext::new().with_variable("env", "prod");
        let facilitation = facilitator()
            .facilitate(&step(AcquireMode::Accumulate), &ctx)
            .await
            .unwrap();
        assert_eq!(facilitation.mode, ExecutionMode::Async);
    }

    #[tokio::test]
    async fn unresolved_unit_fails() {
        let err = facilitator()
            .facilitate(&step(AcquireMode::Ensure), &ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
