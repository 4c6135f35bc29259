//! # sluice-core
//!
//! Shared primitives for the Sluice constraint engine.
//!
//! This crate provides the foundational types used across all Sluice components:
//!
//! - **Identifiers**: Strongly-typed ULID identifiers for constraints and consumers
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `sluice-core` holds only primitives that are shared by more than one crate.
//! Constraint semantics (admission, queueing, step execution) live in
//! `sluice-flow`.
//!
//! ## Example
//!
//! ```rust
//! use sluice_core::prelude::*;
//!
//! let constraint = ConstraintId::generate();
//! let consumer = ConsumerId::generate();
//! assert_ne!(constraint.to_string(), consumer.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use sluice_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ConstraintId, ConsumerId};
    pub use crate::observability::{LogFormat, init_logging};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{ConstraintId, ConsumerId};
pub use observability::{LogFormat, init_logging};
