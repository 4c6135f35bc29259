//! Constraint definitions.
//!
//! A [`Constraint`] is a named, capacity-limited logical resource owned by an
//! account (or any other owner scope). Constraints are created lazily the
//! first time a step references them and are immutable afterwards, except for
//! administrative capacity updates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::ConstraintId;

use crate::error::{Error, Result};

/// Ordering strategy used when promoting waiting consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Strict arrival order per resource unit.
    Fifo,
}

impl Strategy {
    /// Returns the canonical name of the strategy.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "FIFO",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("fifo") {
            Ok(Self::Fifo)
        } else {
            Err(Error::configuration(format!("unknown strategy '{s}'")))
        }
    }
}

/// A capacity-limited resource shared by pipeline steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    /// Unique constraint identifier.
    pub id: ConstraintId,
    /// Owner scope (typically an account).
    pub owner_id: String,
    /// Name, unique within the owner scope.
    pub name: String,
    /// Number of permits that may be held concurrently per resource unit.
    pub capacity: u32,
    /// Promotion ordering strategy.
    pub strategy: Strategy,
    /// When the constraint was created.
    pub created_at: DateTime<Utc>,
    /// When the constraint was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Request to create a constraint if it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConstraint {
    /// Owner scope.
    pub owner_id: String,
    /// Name within the owner scope.
    pub name: String,
    /// Capacity, fixed at first creation.
    pub capacity: u32,
    /// Strategy, fixed at first creation.
    pub strategy: Strategy,
}

impl NewConstraint {
    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the owner or name is blank or the
    /// capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(Error::configuration("constraint owner must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(Error::configuration("constraint name must not be empty"));
        }
        validate_capacity(self.capacity)
    }

    /// Materializes the constraint with a fresh id.
    #[must_use]
    pub fn into_constraint(self, now: DateTime<Utc>) -> Constraint {
        Constraint {
            id: ConstraintId::generate(),
            owner_id: self.owner_id,
            name: self.name,
            capacity: self.capacity,
            strategy: self.strategy,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Validates a constraint capacity.
///
/// # Errors
///
/// Returns a configuration error if `capacity` is zero.
pub fn validate_capacity(capacity: u32) -> Result<()> {
    if capacity == 0 {
        return Err(Error::configuration(
            "constraint capacity must be positive, got 0",
        ));
    }
    Ok(())
}
