//! Store wrapper with injectable failures.
//!
//! Wraps any [`ConstraintStore`] and, on demand, fails commits with a storage
//! error, answers them with a version conflict, changes a capacity between a
//! cycle's reads and its commit, or yields before committing so concurrent
//! tasks interleave.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::{ConstraintId, ConsumerId};
use sluice_flow::constraint::{Constraint, NewConstraint};
use sluice_flow::consumer::{Consumer, ConsumerState, UnitKey};
use sluice_flow::error::{Error, Result};
use sluice_flow::store::{CasResult, ConstraintStore, UnitSnapshot, UnitWrite};

/// A [`ConstraintStore`] that misbehaves when told to.
pub struct FaultInjectingStore {
    inner: Arc<dyn ConstraintStore>,
    failing_commits: AtomicU32,
    conflicting_commits: AtomicU32,
    fail_all_commits: AtomicBool,
    yield_before_commit: AtomicBool,
    capacity_change: Mutex<Option<(ConstraintId, u32)>>,
    commits: AtomicU64,
}

impl std::fmt::Debug for FaultInjectingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultInjectingStore")
            .field("failing_commits", &self.failing_commits)
            .field("conflicting_commits", &self.conflicting_commits)
            .field("fail_all_commits", &self.fail_all_commits)
            .finish_non_exhaustive()
    }
}

impl FaultInjectingStore {
    /// Wraps `inner` with no faults enabled.
    pub fn new(inner: Arc<dyn ConstraintStore>) -> Self {
        Self {
            inner,
            failing_commits: AtomicU32::new(0),
            conflicting_commits: AtomicU32::new(0),
            fail_all_commits: AtomicBool::new(false),
            yield_before_commit: AtomicBool::new(false),
            capacity_change: Mutex::new(None),
            commits: AtomicU64::new(0),
        }
    }

    /// Fails the next `count` commits with a storage error.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Fails every commit until cleared.
    pub fn fail_all_commits(&self, enabled: bool) {
        self.fail_all_commits.store(enabled, Ordering::SeqCst);
    }

    /// Answers the next `count` commits with a version conflict.
    pub fn conflict_next_commits(&self, count: u32) {
        self.conflicting_commits.store(count, Ordering::SeqCst);
    }

    /// Yields to the scheduler before every commit.
    pub fn yield_before_commit(&self, enabled: bool) {
        self.yield_before_commit.store(enabled, Ordering::SeqCst);
    }

    /// Sets the capacity of `constraint_id` right before the next commit is
    /// forwarded, as if an operator changed it while the commit was in
    /// flight.
    pub fn change_capacity_before_next_commit(&self, constraint_id: ConstraintId, capacity: u32) {
        *self.capacity_change.lock().unwrap() = Some((constraint_id, capacity));
    }

    /// Number of commits attempted through this wrapper.
    pub fn commit_attempts(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ConstraintStore for FaultInjectingStore {
    async fn get_or_create_constraint(&self, request: NewConstraint) -> Result<Constraint> {
        self.inner.get_or_create_constraint(request).await
    }

    async fn get_constraint(&self, constraint_id: &ConstraintId) -> Result<Option<Constraint>> {
        self.inner.get_constraint(constraint_id).await
    }

    async fn update_capacity(
        &self,
        constraint_id: &ConstraintId,
        capacity: u32,
    ) -> Result<Option<Constraint>> {
        self.inner.update_capacity(constraint_id, capacity).await
    }

    async fn load_unit(&self, key: &UnitKey) -> Result<UnitSnapshot> {
        self.inner.load_unit(key).await
    }

    async fn commit_unit(
        &self,
        key: &UnitKey,
        expected_version: u64,
        expected_capacity: u32,
        writes: Vec<UnitWrite>,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.yield_before_commit.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        let capacity_change = self.capacity_change.lock().unwrap().take();
        if let Some((constraint_id, capacity)) = capacity_change {
            self.inner.update_capacity(&constraint_id, capacity).await?;
        }
        if self.fail_all_commits.load(Ordering::SeqCst) || Self::take_one(&self.failing_commits) {
            return Err(Error::storage_with_source(
                format!("injected commit failure on {key}"),
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
            ));
        }
        if Self::take_one(&self.conflicting_commits) {
            return Ok(CasResult::VersionConflict {
                actual: expected_version + 1,
            });
        }
        self.inner
            .commit_unit(key, expected_version, expected_capacity, writes, now)
            .await
    }

    async fn get_consumer(&self, consumer_id: &ConsumerId) -> Result<Option<Consumer>> {
        self.inner.get_consumer(consumer_id).await
    }

    async fn consumers_by_scope(
        &self,
        scope_id: &str,
        states: &[ConsumerState],
    ) -> Result<Vec<Consumer>> {
        self.inner.consumers_by_scope(scope_id, states).await
    }

    async fn blocked_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Consumer>> {
        self.inner.blocked_past_deadline(now).await
    }

    async fn units_for_constraint(&self, constraint_id: &ConstraintId) -> Result<Vec<String>> {
        self.inner.units_for_constraint(constraint_id).await
    }

    async fn pending_signals(&self) -> Result<Vec<Consumer>> {
        self.inner.pending_signals().await
    }

    async fn acknowledge_signals(&self, consumer_ids: &[ConsumerId]) -> Result<()> {
        self.inner.acknowledge_signals(consumer_ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_flow::constraint::Strategy;
    use sluice_flow::store::memory::InMemoryConstraintStore;

    async fn store_with_unit() -> (FaultInjectingStore, UnitKey) {
        let inner = Arc::new(InMemoryConstraintStore::new());
        let constraint = inner
            .get_or_create_constraint(NewConstraint {
                owner_id: "acct".into(),
                name: "deploy".into(),
                capacity: 2,
                strategy: Strategy::Fifo,
            })
            .await
            .unwrap();
        (
            FaultInjectingStore::new(inner),
            UnitKey::new(constraint.id, "prod"),
        )
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let (store, key) = store_with_unit().await;
        store.fail_next_commits(1);

        let err = store
            .commit_unit(&key, 0, 2, Vec::new(), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let ok = store
            .commit_unit(&key, 0, 2, Vec::new(), Utc::now())
            .await
            .unwrap();
        assert!(ok.is_success());
        assert_eq!(store.commit_attempts(), 2);
    }

    #[tokio::test]
    async fn injected_conflicts_report_a_newer_version() {
        let (store, key) = store_with_unit().await;
        store.conflict_next_commits(1);
        let result = store
            .commit_unit(&key, 3, 2, Vec::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(result, CasResult::VersionConflict { actual: 4 });
    }

    #[tokio::test]
    async fn capacity_change_lands_before_the_commit() {
        let (store, key) = store_with_unit().await;
        store.change_capacity_before_next_commit(key.constraint_id, 1);

        let result = store
            .commit_unit(&key, 0, 2, Vec::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(result, CasResult::CapacityChanged { actual: 1 });

        // The change is applied once.
        let result = store
            .commit_unit(&key, 0, 1, Vec::new(), Utc::now())
            .await
            .unwrap();
        assert!(result.is_success());
    }
}
