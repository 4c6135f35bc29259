//! Custom assertion helpers for queue invariants.

use sluice_flow::consumer::{Consumer, ConsumerState, UnitKey};
use sluice_flow::queue::QueueSnapshot;
use sluice_flow::store::memory::InMemoryConstraintStore;
use sluice_core::ConsumerId;

/// Asserts that active permits on a unit do not exceed its capacity.
///
/// # Panics
///
/// Panics if the snapshot holds more active permits than capacity.
pub fn assert_capacity_invariant(snapshot: &QueueSnapshot) {
    let active: u64 = snapshot.active.iter().map(|c| u64::from(c.permits)).sum();
    assert_eq!(
        active, snapshot.active_permits,
        "active permit sum disagrees with snapshot"
    );
    assert!(
        active <= u64::from(snapshot.capacity),
        "unit {} holds {active} permits over capacity {}",
        snapshot.resource_unit,
        snapshot.capacity
    );
}

/// Asserts that no waiter could have been admitted: the oldest BLOCKED
/// consumer does not fit in the free capacity.
///
/// # Panics
///
/// Panics if the head of the queue fits but was left waiting.
pub fn assert_no_stranded_waiter(snapshot: &QueueSnapshot) {
    if let Some(head) = snapshot.blocked.first() {
        let free = u64::from(snapshot.capacity).saturating_sub(snapshot.active_permits);
        assert!(
            u64::from(head.permits) > free,
            "consumer {} ({} permits) is waiting with {free} permits free",
            head.id,
            head.permits
        );
    }
}

/// Asserts that consumers of a unit were activated in arrival order.
///
/// Only consumers that ever became ACTIVE are considered.
///
/// # Panics
///
/// Panics if a later arrival was activated before an earlier one.
pub fn assert_activated_in_arrival_order(store: &InMemoryConstraintStore, key: &UnitKey) {
    let history = store.unit_history(key).expect("unit history");
    let mut activated: Vec<&Consumer> = history
        .iter()
        .filter(|c| c.activated_at.is_some())
        .collect();
    activated.sort_by_key(|c| c.sequence_number);
    for pair in activated.windows(2) {
        assert!(
            pair[0].activated_at <= pair[1].activated_at,
            "consumer #{} activated after later arrival #{}",
            pair[0].sequence_number,
            pair[1].sequence_number
        );
    }
}

/// Asserts that a consumer is in the expected state.
///
/// # Panics
///
/// Panics if the consumer is missing or in another state.
pub async fn assert_consumer_state(
    store: &InMemoryConstraintStore,
    consumer_id: &ConsumerId,
    expected: ConsumerState,
) {
    use sluice_flow::store::ConstraintStore;

    let consumer = store
        .get_consumer(consumer_id)
        .await
        .expect("get consumer")
        .unwrap_or_else(|| panic!("consumer {consumer_id} not found"));
    assert_eq!(
        consumer.state, expected,
        "consumer {consumer_id} is {:?}, expected {expected:?}",
        consumer.state
    );
}
