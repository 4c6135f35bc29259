//! Racing workers against one unit queue.
//!
//! Workers share nothing but the store. These tests run them on a
//! multi-threaded runtime with commits yielding mid-flight, and check that
//! optimistic concurrency never admits more permits than the capacity.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;

use sluice_flow::config::ConstraintRuntimeConfig;
use sluice_flow::consumer::{AcquireMode, ConsumerState, UnitKey};
use sluice_flow::store::memory::InMemoryConstraintStore;
use sluice_flow::template::ExecutionContext;
use sluice_test_utils::{
    EngineHarness, FaultInjectingStore, StepFactory, assert_capacity_invariant,
    assert_consumer_state, assert_no_stranded_waiter,
};

fn racing_harness() -> (EngineHarness, Arc<FaultInjectingStore>) {
    let inner = Arc::new(InMemoryConstraintStore::new());
    let faulty = Arc::new(FaultInjectingStore::new(inner.clone()));
    faulty.yield_before_commit(true);
    let harness = EngineHarness::with_store(
        faulty.clone(),
        inner,
        ConstraintRuntimeConfig::default().with_max_conflict_retries(64),
    );
    (harness, faulty)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_never_exceed_capacity() {
    let (harness, faulty) = racing_harness();
    let steps = StepFactory::new("pool", 3);
    let constraint_id = harness
        .engine
        .facilitate(&steps.step("lookup"), &ExecutionContext::new())
        .await
        .unwrap()
        .constraint
        .id;

    let done = Arc::new(AtomicBool::new(false));
    let monitor = {
        let engine = harness.engine.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let snapshot = engine.queue_snapshot(&constraint_id, "prod").await.unwrap();
                assert_capacity_invariant(&snapshot);
                tokio::task::yield_now().await;
            }
        })
    };

    let workers = (0..24).map(|i| {
        let engine = harness.engine.clone();
        let mode = if i % 3 == 0 {
            AcquireMode::Accumulate
        } else {
            AcquireMode::Ensure
        };
        let step = steps.step_with(&format!("w{i}"), 1 + i % 2, mode);
        tokio::spawn(async move {
            engine
                .start_step(&step, &ExecutionContext::new())
                .await
                .unwrap()
        })
    });
    let responses: Vec<_> = join_all(workers)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(responses.len(), 24);
    assert!(responses.iter().all(|r| !r.is_failed()));

    let snapshot = harness
        .engine
        .queue_snapshot(&constraint_id, "prod")
        .await
        .unwrap();
    assert_capacity_invariant(&snapshot);
    assert_no_stranded_waiter(&snapshot);
    assert_eq!(snapshot.active.len() + snapshot.blocked.len(), 24);

    done.store(true, Ordering::SeqCst);
    monitor.await.unwrap();
    assert!(faulty.commit_attempts() >= 24);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_scope_ends_drain_the_queue() {
    let (harness, _faulty) = racing_harness();
    let steps = StepFactory::new("serial", 2);

    for i in 0..16 {
        harness.start(&steps.step(&format!("s{i}"))).await;
    }
    let constraint_id = harness
        .engine
        .facilitate(&steps.step("lookup"), &ExecutionContext::new())
        .await
        .unwrap()
        .constraint
        .id;

    let enders = (0..16).map(|i| {
        let engine = harness.engine.clone();
        tokio::spawn(async move { engine.on_scope_end(&format!("s{i}")).await.unwrap() })
    });
    for ender in join_all(enders).await {
        ender.unwrap();
    }

    let snapshot = harness
        .engine
        .queue_snapshot(&constraint_id, "prod")
        .await
        .unwrap();
    assert!(snapshot.active.is_empty());
    assert!(snapshot.blocked.is_empty());

    let history = harness
        .store
        .unit_history(&UnitKey::new(constraint_id, "prod"))
        .unwrap();
    assert_eq!(history.len(), 16);
    assert!(history.iter().all(|c| c.state == ConsumerState::Finished));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_releases_racing_admit_only_one_waiter() {
    let (harness, _faulty) = racing_harness();
    let steps = StepFactory::new("deploy", 1);

    harness.start(&steps.step("a")).await;
    let b = harness.start(&steps.step("b")).await.callback_id().unwrap();
    let c = harness.start(&steps.step("c")).await.callback_id().unwrap();
    let d = harness.start(&steps.step("d")).await.callback_id().unwrap();

    let (first, second) = tokio::join!(
        harness.engine.on_scope_end("a"),
        harness.engine.on_scope_end("b"),
    );
    first.unwrap();
    second.unwrap();

    // Whichever order the releases landed in, exactly one waiter holds the
    // single permit and the last arrival is still queued.
    assert_consumer_state(&harness.store, &b, ConsumerState::Finished).await;
    assert_consumer_state(&harness.store, &c, ConsumerState::Active).await;
    assert_consumer_state(&harness.store, &d, ConsumerState::Blocked).await;
}
