//! Pre-built test fixtures for common constraint scenarios.

use std::sync::Arc;

use sluice_flow::config::ConstraintRuntimeConfig;
use sluice_flow::consumer::{AcquireMode, HoldingScope};
use sluice_flow::engine::ConstraintEngine;
use sluice_flow::resume::memory::InMemoryResumeQueue;
use sluice_flow::step::{ConstraintDefinition, StepResponse, StepSpec};
use sluice_flow::store::ConstraintStore;
use sluice_flow::store::memory::InMemoryConstraintStore;
use sluice_flow::template::ExecutionContext;

/// Builds step specs against one constraint and resource unit.
#[derive(Debug, Clone)]
pub struct StepFactory {
    owner_id: String,
    name: String,
    capacity: u32,
    resource_unit: String,
}

impl StepFactory {
    /// Creates a factory for constraint `name` with the given capacity.
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            owner_id: "test-account".to_string(),
            name: name.into(),
            capacity,
            resource_unit: "prod".to_string(),
        }
    }

    /// Targets a different resource unit.
    #[must_use]
    pub fn on_unit(mut self, resource_unit: impl Into<String>) -> Self {
        self.resource_unit = resource_unit.into();
        self
    }

    /// A one-permit ENSURE step held by stage `scope_id`.
    pub fn step(&self, scope_id: &str) -> StepSpec {
        self.step_with(scope_id, 1, AcquireMode::Ensure)
    }

    /// A step with explicit permits and acquire mode.
    pub fn step_with(&self, scope_id: &str, permits: u32, acquire_mode: AcquireMode) -> StepSpec {
        StepSpec {
            owner_id: self.owner_id.clone(),
            constraint: ConstraintDefinition {
                name: self.name.clone(),
                capacity: self.capacity,
                strategy: "FIFO".to_string(),
            },
            resource_unit: self.resource_unit.clone(),
            permits,
            acquire_mode,
            holding_scope: HoldingScope::stage(scope_id),
            claimant_id: format!("step-{scope_id}"),
        }
    }
}

/// Engine wired to in-memory storage, with handles to inspect both.
pub struct EngineHarness {
    /// The engine under test.
    pub engine: ConstraintEngine,
    /// Backing store, shared with the engine.
    pub store: Arc<InMemoryConstraintStore>,
    /// Resume signals the engine delivered.
    pub signals: Arc<InMemoryResumeQueue>,
}

impl EngineHarness {
    /// Creates a harness with default runtime config.
    pub fn new() -> Self {
        Self::with_config(ConstraintRuntimeConfig::default())
    }

    /// Creates a harness with the given runtime config.
    pub fn with_config(config: ConstraintRuntimeConfig) -> Self {
        let store = Arc::new(InMemoryConstraintStore::new());
        let signals = Arc::new(InMemoryResumeQueue::new());
        let engine = ConstraintEngine::new(store.clone(), signals.clone(), config);
        Self {
            engine,
            store,
            signals,
        }
    }

    /// Creates a harness whose engine talks to `store` instead of the
    /// in-memory store directly. `inner` must be the store `store` wraps.
    pub fn with_store(
        store: Arc<dyn ConstraintStore>,
        inner: Arc<InMemoryConstraintStore>,
        config: ConstraintRuntimeConfig,
    ) -> Self {
        let signals = Arc::new(InMemoryResumeQueue::new());
        let engine = ConstraintEngine::new(store, signals.clone(), config);
        Self {
            engine,
            store: inner,
            signals,
        }
    }

    /// Facilitates and executes `step` with an empty context.
    pub async fn start(&self, step: &StepSpec) -> StepResponse {
        self.engine
            .start_step(step, &ExecutionContext::new())
            .await
            .expect("start step")
    }
}

impl Default for EngineHarness {
    fn default() -> Self {
        Self::new()
    }
}
