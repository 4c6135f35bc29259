//! Shared test utilities for Sluice integration tests.
//!
//! This crate provides:
//! - [`EngineHarness`]: An engine wired to in-memory storage and signals
//! - [`StepFactory`]: Step specs with sensible defaults
//! - [`FaultInjectingStore`]: A store wrapper that fails or conflicts on demand
//! - Custom assertion helpers for queue invariants
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice_test_utils::{EngineHarness, StepFactory, assert_capacity_invariant};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = EngineHarness::new();
//!     let steps = StepFactory::new("deploy", 1);
//!     let response = harness.start(&steps.step("stage-1")).await;
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod store;

pub use assertions::*;
pub use fixtures::*;
pub use store::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sluice_flow=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
