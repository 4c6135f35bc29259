//! Lazy creation and lookup of constraints.

use std::sync::Arc;

use tracing::{debug, info};

use sluice_core::ConstraintId;

use crate::constraint::{Constraint, NewConstraint, Strategy, validate_capacity};
use crate::error::{Error, Result};
use crate::store::ConstraintStore;

/// Creates and fetches constraints, keyed by (owner, name).
#[derive(Clone)]
pub struct ConstraintRegistry {
    store: Arc<dyn ConstraintStore>,
}

impl std::fmt::Debug for ConstraintRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstraintRegistry").finish_non_exhaustive()
    }
}

impl ConstraintRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn ConstraintStore>) -> Self {
        Self { store }
    }

    /// Returns the constraint named `name` in `owner_id`, creating it on
    /// first use.
    ///
    /// Capacity and strategy are only used when the constraint is created;
    /// an existing constraint is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the definition is invalid, or a
    /// storage error.
    pub async fn get_or_create(
        &self,
        owner_id: &str,
        name: &str,
        capacity: u32,
        strategy: Strategy,
    ) -> Result<Constraint> {
        let request = NewConstraint {
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            capacity,
            strategy,
        };
        request.validate()?;

        let constraint = self.store.get_or_create_constraint(request).await?;
        if constraint.capacity != capacity {
            debug!(
                constraint_id = %constraint.id,
                existing = constraint.capacity,
                requested = capacity,
                "constraint exists with a different capacity; keeping existing"
            );
        }
        Ok(constraint)
    }

    /// Gets a constraint by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails.
    pub async fn get(&self, constraint_id: &ConstraintId) -> Result<Option<Constraint>> {
        self.store.get_constraint(constraint_id).await
    }

    /// Gets a constraint by id, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConstraintNotFound`] if the constraint is missing.
    pub async fn require(&self, constraint_id: &ConstraintId) -> Result<Constraint> {
        self.get(constraint_id)
            .await?
            .ok_or(Error::ConstraintNotFound {
                constraint_id: *constraint_id,
            })
    }

    /// Replaces the capacity of a constraint.
    ///
    /// Callers are expected to re-promote the constraint's units afterwards.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a zero capacity and
    /// [`Error::ConstraintNotFound`] if the constraint is missing.
    pub async fn update_capacity(
        &self,
        constraint_id: &ConstraintId,
        capacity: u32,
    ) -> Result<Constraint> {
        validate_capacity(capacity)?;
        let updated = self
            .store
            .update_capacity(constraint_id, capacity)
            .await?
            .ok_or(Error::ConstraintNotFound {
                constraint_id: *constraint_id,
            })?;
        info!(constraint_id = %constraint_id, capacity, "constraint capacity updated");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryConstraintStore;

    fn registry() -> ConstraintRegistry {
        ConstraintRegistry::new(Arc::new(InMemoryConstraintStore::new()))
    }

    #[tokio::test]
    async fn creates_once_per_owner_and_name() {
        let registry = registry();
        let a = registry
            .get_or_create("acct", "deploy", 1, Strategy::Fifo)
            .await
            .unwrap();
        let b = registry
            .get_or_create("acct", "deploy", 5, Strategy::Fifo)
            .await
            .unwrap();
        let other_owner = registry
            .get_or_create("other", "deploy", 1, Strategy::Fifo)
            .await
            .unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(b.capacity, 1);
        assert_ne!(a.id, other_owner.id);
    }

    #[tokio::test]
    async fn zero_capacity_fails_before_touching_the_store() {
        let registry = registry();
        let err = registry
            .get_or_create("acct", "deploy", 0, Strategy::Fifo)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn update_capacity_validates_and_persists() {
        let registry = registry();
        let constraint = registry
            .get_or_create("acct", "deploy", 2, Strategy::Fifo)
            .await
            .unwrap();

        assert!(registry.update_capacity(&constraint.id, 0).await.is_err());
        let updated = registry.update_capacity(&constraint.id, 4).await.unwrap();
        assert_eq!(updated.capacity, 4);
        assert_eq!(registry.require(&constraint.id).await.unwrap().capacity, 4);
    }

    #[tokio::test]
    async fn update_capacity_of_missing_constraint() {
        let err = registry()
            .update_capacity(&ConstraintId::generate(), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintNotFound { .. }));
    }
}
