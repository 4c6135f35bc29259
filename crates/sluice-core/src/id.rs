//! Strongly-typed identifiers for Sluice entities.
//!
//! All identifiers in Sluice are:
//! - **Strongly typed**: Prevents mixing up constraint and consumer IDs at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! A [`ConsumerId`] doubles as the callback id handed to the pipeline engine
//! when a step suspends, so it must round-trip through its string form.
//!
//! # Example
//!
//! ```rust
//! use sluice_core::id::{ConstraintId, ConsumerId};
//!
//! let constraint = ConstraintId::generate();
//! let consumer = ConsumerId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: ConstraintId = consumer;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a constraint.
///
/// A constraint is a named, capacity-limited resource shared by pipeline
/// steps of one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConstraintId(Ulid);

impl ConstraintId {
    /// Generates a new unique constraint ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a constraint ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConstraintId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::invalid_id(format!("invalid constraint ID '{s}': {e}")))
    }
}

/// A unique identifier for a consumer (one step's hold on a constraint).
///
/// Also used as the callback id correlating a suspended step with its
/// resume signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(Ulid);

impl ConsumerId {
    /// Generates a new unique consumer ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a consumer ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConsumerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::invalid_id(format!("invalid consumer ID '{s}': {e}")))
    }
}
