//! # sluice-flow
//!
//! Admission control and FIFO queueing for capacity-limited pipeline
//! resources.
//!
//! Pipeline steps declare that they need `N` permits of a named constraint
//! (for example "at most one deployment to `prod-us-east` at a time"). This
//! crate decides whether such a step runs right away or suspends, keeps
//! waiting steps in strict arrival order per resource unit, and wakes them
//! when the capacity they need is freed.
//!
//! ## Core Concepts
//!
//! - **Constraint**: A named capacity limit owned by an account, with a
//!   queueing strategy
//! - **Resource unit**: The runtime-resolved key (environment, region,
//!   service) a constraint is applied to; capacity is enforced per unit
//! - **Consumer**: One step's request for permits, moving through
//!   `BLOCKED -> ACTIVE -> FINISHED` (or `REJECTED`)
//! - **Holding scope**: The node, stage or run whose end releases the
//!   consumer
//!
//! ## Guarantees
//!
//! - **Capacity**: Active permits on a unit never exceed its capacity
//! - **FIFO**: Waiters are promoted in arrival order; a waiter that does not
//!   fit blocks those behind it
//! - **No lost wake-ups**: Promotion is committed together with the write
//!   that freed the capacity
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use sluice_flow::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let engine = ConstraintEngine::new(
//!     Arc::new(InMemoryConstraintStore::new()),
//!     Arc::new(InMemoryResumeQueue::new()),
//!     ConstraintRuntimeConfig::default(),
//! );
//!
//! let step = StepSpec {
//!     owner_id: "acct".into(),
//!     constraint: ConstraintDefinition {
//!         name: "db-migrations".into(),
//!         capacity: 2,
//!         strategy: "FIFO".into(),
//!     },
//!     resource_unit: "<+env.name>".into(),
//!     permits: 1,
//!     acquire_mode: AcquireMode::Ensure,
//!     holding_scope: HoldingScope::run("run-42"),
//!     claimant_id: "migrate".into(),
//! };
//! let ctx = ExecutionContext::new().with_variable("env.name", "staging");
//!
//! let facilitation = engine.facilitate(&step, &ctx).await.unwrap();
//! assert_eq!(facilitation.mode, ExecutionMode::Sync);
//! assert_eq!(facilitation.resource_unit, "staging");
//! # });
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod config;
pub mod constraint;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod executor;
pub mod facilitator;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod resume;
pub mod retry;
pub mod scope;
pub mod step;
pub mod store;
pub mod template;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::admission::{AdmissionDecision, AdmissionEvaluator, ExecutionMode};
    pub use crate::config::ConstraintRuntimeConfig;
    pub use crate::constraint::{Constraint, NewConstraint, Strategy};
    pub use crate::consumer::{
        AcquireMode, Consumer, ConsumerState, HoldingScope, NewConsumer, ScopeType,
        TransitionReason, UnitKey,
    };
    pub use crate::engine::ConstraintEngine;
    pub use crate::error::{Error, Result};
    pub use crate::facilitator::Facilitation;
    pub use crate::metrics::ConstraintMetrics;
    pub use crate::queue::{PromotionOutcome, QueueManager, QueueSnapshot};
    pub use crate::reconciler::{DeadlineReconciler, ReconcileReport};
    pub use crate::resume::channel::ChannelResumeSignaller;
    pub use crate::resume::memory::InMemoryResumeQueue;
    pub use crate::resume::{ResumeOutcome, ResumeSignal, ResumeSignaller};
    pub use crate::scope::{
        ScopeEndDispatcher, ScopeEndEvent, ScopeEndReport, ScopeEndSubscriber, ScopeStatus,
    };
    pub use crate::step::{ConstraintDefinition, StepResponse, StepSpec};
    pub use crate::store::memory::InMemoryConstraintStore;
    pub use crate::store::{CasResult, ConstraintStore, UnitSnapshot, UnitWrite};
    pub use crate::template::ExecutionContext;
    pub use sluice_core::{ConstraintId, ConsumerId};
}
