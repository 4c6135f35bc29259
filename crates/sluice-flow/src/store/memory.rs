//! In-memory constraint store for testing.
//!
//! This module provides [`InMemoryConstraintStore`], an implementation of the
//! [`ConstraintStore`] trait suitable for tests and single-process
//! deployments.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sluice_core::{ConstraintId, ConsumerId};

use super::{CasResult, ConstraintStore, UnitSnapshot, UnitWrite};
use crate::constraint::{Constraint, NewConstraint};
use crate::consumer::{Consumer, ConsumerState, UnitKey};
use crate::error::{Error, Result};

/// Version and live queue of one resource unit.
#[derive(Debug, Clone)]
struct UnitRecord {
    version: u64,
    next_sequence: u64,
    /// Live (ACTIVE or BLOCKED) consumer ids in sequence order.
    live: Vec<ConsumerId>,
}

impl Default for UnitRecord {
    fn default() -> Self {
        Self {
            version: 0,
            next_sequence: 1,
            live: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    constraints: HashMap<ConstraintId, Constraint>,
    names: HashMap<(String, String), ConstraintId>,
    units: HashMap<UnitKey, UnitRecord>,
    consumers: HashMap<ConsumerId, Consumer>,
    scopes: HashMap<String, Vec<ConsumerId>>,
}

/// In-memory constraint store.
///
/// All state lives behind a single `RwLock`, so a unit commit is trivially
/// atomic with respect to every other operation.
///
/// ## Example
///
/// ```rust
/// use sluice_flow::store::memory::InMemoryConstraintStore;
///
/// let store = InMemoryConstraintStore::new();
/// assert_eq!(store.consumer_count().unwrap(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryConstraintStore {
    state: RwLock<StoreState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryConstraintStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of consumers ever recorded, in any state.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn consumer_count(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.consumers.len()
        };
        Ok(count)
    }

    /// Returns every consumer of a unit, terminal ones included, in
    /// sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn unit_history(&self, key: &UnitKey) -> Result<Vec<Consumer>> {
        let mut history: Vec<Consumer> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .consumers
                .values()
                .filter(|c| c.constraint_id == key.constraint_id && c.resource_unit == key.resource_unit)
                .cloned()
                .collect()
        };
        history.sort_by_key(|c| c.sequence_number);
        Ok(history)
    }
}

#[async_trait]
impl ConstraintStore for InMemoryConstraintStore {
    async fn get_or_create_constraint(&self, request: NewConstraint) -> Result<Constraint> {
        let mut state = self.state.write().map_err(poison_err)?;

        let name_key = (request.owner_id.clone(), request.name.clone());
        let existing = state
            .names
            .get(&name_key)
            .and_then(|id| state.constraints.get(id))
            .cloned();
        if let Some(existing) = existing {
            drop(state);
            return Ok(existing);
        }

        let constraint = request.into_constraint(Utc::now());
        state.names.insert(name_key, constraint.id);
        state.constraints.insert(constraint.id, constraint.clone());
        drop(state);
        Ok(constraint)
    }

    async fn get_constraint(&self, constraint_id: &ConstraintId) -> Result<Option<Constraint>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.constraints.get(constraint_id).cloned()
        };
        Ok(result)
    }

    async fn update_capacity(
        &self,
        constraint_id: &ConstraintId,
        capacity: u32,
    ) -> Result<Option<Constraint>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(constraint) = state.constraints.get_mut(constraint_id) else {
            drop(state);
            return Ok(None);
        };
        constraint.capacity = capacity;
        constraint.updated_at = Utc::now();
        let updated = constraint.clone();
        drop(state);
        Ok(Some(updated))
    }

    async fn load_unit(&self, key: &UnitKey) -> Result<UnitSnapshot> {
        let snapshot = {
            let state = self.state.read().map_err(poison_err)?;
            state.units.get(key).map_or_else(
                || UnitSnapshot {
                    version: 0,
                    next_sequence: 1,
                    consumers: Vec::new(),
                },
                |unit| UnitSnapshot {
                    version: unit.version,
                    next_sequence: unit.next_sequence,
                    consumers: unit
                        .live
                        .iter()
                        .filter_map(|id| state.consumers.get(id).cloned())
                        .collect(),
                },
            )
        };
        Ok(snapshot)
    }

    async fn commit_unit(
        &self,
        key: &UnitKey,
        expected_version: u64,
        expected_capacity: u32,
        writes: Vec<UnitWrite>,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let unit = state.units.get(key).cloned().unwrap_or_default();
        if unit.version != expected_version {
            drop(state);
            return Ok(CasResult::VersionConflict {
                actual: unit.version,
            });
        }
        let Some(capacity) = state.constraints.get(&key.constraint_id).map(|c| c.capacity) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if capacity != expected_capacity {
            drop(state);
            return Ok(CasResult::CapacityChanged { actual: capacity });
        }

        // Stage every write against copies; nothing touches the map until the
        // whole batch has validated.
        let mut staged: Vec<Consumer> = Vec::new();
        let mut inserted: Vec<ConsumerId> = Vec::new();
        let mut next_sequence = unit.next_sequence;

        for write in writes {
            match write {
                UnitWrite::Insert(request) => {
                    if request.constraint_id != key.constraint_id
                        || request.resource_unit != key.resource_unit
                    {
                        drop(state);
                        return Err(Error::InvalidInput(format!(
                            "consumer {} does not belong to unit {key}",
                            request.id
                        )));
                    }
                    if state.consumers.contains_key(&request.id) || inserted.contains(&request.id) {
                        drop(state);
                        return Err(Error::storage(format!(
                            "consumer {} already exists",
                            request.id
                        )));
                    }
                    let consumer = request.into_consumer(next_sequence, now)?;
                    next_sequence += 1;
                    inserted.push(consumer.id);
                    staged.push(consumer);
                }
                UnitWrite::Transition {
                    consumer_id,
                    from,
                    to,
                    reason,
                } => {
                    let index = if let Some(i) = staged.iter().position(|c| c.id == consumer_id) {
                        i
                    } else {
                        let Some(existing) = state
                            .consumers
                            .get(&consumer_id)
                            .filter(|c| c.unit_key() == *key)
                        else {
                            drop(state);
                            return Ok(CasResult::NotFound);
                        };
                        staged.push(existing.clone());
                        staged.len() - 1
                    };

                    let current = &mut staged[index];
                    if current.state != from {
                        let actual = current.state;
                        drop(state);
                        return Ok(CasResult::StateMismatch { actual });
                    }
                    if let Err(e) = current.transition_to(to, reason, now) {
                        drop(state);
                        return Err(e);
                    }
                }
            }
        }

        let mut record = unit;
        record.version += 1;
        record.next_sequence = next_sequence;
        record.live.extend(inserted.iter().copied());
        for consumer in &staged {
            if inserted.contains(&consumer.id) {
                state
                    .scopes
                    .entry(consumer.holding_scope.scope_id.clone())
                    .or_default()
                    .push(consumer.id);
            }
        }
        record
            .live
            .retain(|id| !staged.iter().any(|c| c.id == *id && c.is_terminal()));
        for consumer in staged {
            state.consumers.insert(consumer.id, consumer);
        }
        state.units.insert(key.clone(), record);
        drop(state);
        Ok(CasResult::Success)
    }

    async fn get_consumer(&self, consumer_id: &ConsumerId) -> Result<Option<Consumer>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.consumers.get(consumer_id).cloned()
        };
        Ok(result)
    }

    async fn consumers_by_scope(
        &self,
        scope_id: &str,
        states: &[ConsumerState],
    ) -> Result<Vec<Consumer>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.scopes.get(scope_id).map_or_else(Vec::new, |ids| {
                ids.iter()
                    .filter_map(|id| state.consumers.get(id))
                    .filter(|c| states.contains(&c.state))
                    .cloned()
                    .collect()
            })
        };
        Ok(result)
    }

    async fn blocked_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<Consumer>> {
        let mut result: Vec<Consumer> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .units
                .values()
                .flat_map(|unit| unit.live.iter())
                .filter_map(|id| state.consumers.get(id))
                .filter(|c| c.is_expired_at(now))
                .cloned()
                .collect()
        };
        result.sort_by_key(|c| (c.blocked_deadline, c.sequence_number));
        Ok(result)
    }

    async fn units_for_constraint(&self, constraint_id: &ConstraintId) -> Result<Vec<String>> {
        let mut result: Vec<String> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .units
                .iter()
                .filter(|(key, unit)| key.constraint_id == *constraint_id && !unit.live.is_empty())
                .map(|(key, _)| key.resource_unit.clone())
                .collect()
        };
        result.sort();
        Ok(result)
    }

    async fn pending_signals(&self) -> Result<Vec<Consumer>> {
        let mut result: Vec<Consumer> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .consumers
                .values()
                .filter(|c| c.signal_pending)
                .cloned()
                .collect()
        };
        result.sort_by_key(|c| (c.created_at, c.sequence_number));
        Ok(result)
    }

    async fn acknowledge_signals(&self, consumer_ids: &[ConsumerId]) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        for id in consumer_ids {
            if let Some(consumer) = state.consumers.get_mut(id) {
                consumer.signal_pending = false;
            }
        }
        drop(state);
        Ok(())
    }
}
