//! End-to-end constraint scenarios driven through the engine facade.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use sluice_flow::admission::ExecutionMode;
use sluice_flow::config::ConstraintRuntimeConfig;
use sluice_flow::consumer::{AcquireMode, ConsumerState, UnitKey};
use sluice_flow::error::Error;
use sluice_flow::resume::ResumeOutcome;
use sluice_flow::step::StepResponse;
use sluice_flow::store::ConstraintStore;
use sluice_flow::store::memory::InMemoryConstraintStore;
use sluice_flow::template::ExecutionContext;
use sluice_test_utils::{
    EngineHarness, FaultInjectingStore, StepFactory, assert_activated_in_arrival_order,
    assert_capacity_invariant, assert_consumer_state, assert_no_stranded_waiter,
    init_test_logging,
};

fn consumer_of(response: &StepResponse) -> sluice_core::ConsumerId {
    match response {
        StepResponse::Done {
            consumer_id: Some(id),
        }
        | StepResponse::Failed {
            consumer_id: Some(id),
            ..
        } => *id,
        StepResponse::Waiting { callback_id } => *callback_id,
        other => panic!("response carries no consumer: {other:?}"),
    }
}

#[tokio::test]
async fn release_promotes_next_and_keeps_the_rest_waiting() {
    init_test_logging();
    let harness = EngineHarness::new();
    let steps = StepFactory::new("deploy-prod", 1);

    let a = harness.start(&steps.step("a")).await;
    let b = harness.start(&steps.step("b")).await;
    let c = harness.start(&steps.step("c")).await;
    assert!(a.is_done());
    let b_id = b.callback_id().unwrap();
    let c_id = c.callback_id().unwrap();

    let report = harness.engine.on_scope_end("a").await.unwrap();
    assert_eq!(report.promoted, vec![b_id]);
    assert_eq!(harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap(), vec![b_id]);
    assert!(harness.engine.handle_resume(&b_id).await.unwrap().is_done());
    assert_consumer_state(&harness.store, &c_id, ConsumerState::Blocked).await;

    harness.engine.on_scope_end("b").await.unwrap();
    assert_eq!(harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap(), vec![c_id]);
    assert_consumer_state(&harness.store, &c_id, ConsumerState::Active).await;
}

#[tokio::test]
async fn fifo_admits_one_at_a_time_in_arrival_order() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("serial", 1);

    assert!(harness.start(&steps.step("s0")).await.is_done());
    let mut waiting = Vec::new();
    for i in 1..6 {
        let response = harness.start(&steps.step(&format!("s{i}"))).await;
        waiting.push(response.callback_id().unwrap());
    }

    let constraint_id = harness
        .engine
        .facilitate(&steps.step("lookup"), &ExecutionContext::new())
        .await
        .unwrap()
        .constraint
        .id;

    for (i, expected) in waiting.iter().enumerate() {
        harness.engine.on_scope_end(&format!("s{i}")).await.unwrap();
        let promoted = harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap();
        assert_eq!(promoted, vec![*expected]);

        let snapshot = harness
            .engine
            .queue_snapshot(&constraint_id, "prod")
            .await
            .unwrap();
        assert_capacity_invariant(&snapshot);
        assert_no_stranded_waiter(&snapshot);
        assert_eq!(snapshot.active.len(), 1);
    }

    assert_activated_in_arrival_order(&harness.store, &UnitKey::new(constraint_id, "prod"));
}

#[tokio::test]
async fn ensure_runs_sync_until_capacity_is_used() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("pool", 3);
    let ctx = ExecutionContext::new();

    let first = steps.step_with("a", 2, AcquireMode::Ensure);
    let facilitation = harness.engine.facilitate(&first, &ctx).await.unwrap();
    assert_eq!(facilitation.mode, ExecutionMode::Sync);
    assert!(
        harness
            .engine
            .execute_sync(&first, &facilitation)
            .await
            .unwrap()
            .is_done()
    );

    let second = steps.step_with("b", 2, AcquireMode::Ensure);
    let facilitation = harness.engine.facilitate(&second, &ctx).await.unwrap();
    assert_eq!(facilitation.mode, ExecutionMode::Async);
    let response = harness
        .engine
        .execute_async(&second, &facilitation)
        .await
        .unwrap();
    assert!(response.is_waiting());
    assert!(harness.signals.is_empty().unwrap());
}

#[tokio::test]
async fn accumulate_always_suspends() {
    let harness = EngineHarness::new();
    let step = StepFactory::new("ordered", 10).step_with("a", 1, AcquireMode::Accumulate);

    let facilitation = harness
        .engine
        .facilitate(&step, &ExecutionContext::new())
        .await
        .unwrap();
    assert_eq!(facilitation.mode, ExecutionMode::Async);

    let response = harness.start(&step).await;
    let callback_id = response.callback_id().unwrap();

    // Capacity was free, so the resume signal is already queued.
    assert_eq!(
        harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap(),
        vec![callback_id]
    );
    assert!(harness.engine.handle_resume(&callback_id).await.unwrap().is_done());
}

#[tokio::test]
async fn ensure_waits_behind_existing_waiters_even_when_it_fits() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("pool", 3);

    harness.start(&steps.step_with("a", 2, AcquireMode::Ensure)).await;
    let big = harness.start(&steps.step_with("b", 2, AcquireMode::Ensure)).await;
    assert!(big.is_waiting());

    // One permit is free, but the head of the queue is waiting for two.
    let small = harness.start(&steps.step_with("c", 1, AcquireMode::Ensure)).await;
    assert!(small.is_waiting());

    harness.engine.on_scope_end("a").await.unwrap();
    let promoted = harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap();
    assert_eq!(
        promoted,
        vec![big.callback_id().unwrap(), small.callback_id().unwrap()]
    );
}

#[tokio::test]
async fn oversize_request_fails_without_holding_capacity() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("tiny", 2);

    let response = harness.start(&steps.step_with("a", 3, AcquireMode::Ensure)).await;
    assert!(response.is_failed());
    assert_consumer_state(&harness.store, &consumer_of(&response), ConsumerState::Rejected).await;

    // The failed request never blocks later arrivals.
    assert!(harness.start(&steps.step_with("b", 2, AcquireMode::Ensure)).await.is_done());
}

#[tokio::test]
async fn scope_end_is_idempotent() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("deploy", 1);

    harness.start(&steps.step("a")).await;
    let waiting = harness.start(&steps.step("b")).await;

    let first = harness.engine.on_scope_end("a").await.unwrap();
    assert_eq!(first.released.len(), 1);
    let second = harness.engine.on_scope_end("a").await.unwrap();
    assert!(second.released.is_empty());
    assert!(second.promoted.is_empty());

    assert_eq!(
        harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap(),
        vec![waiting.callback_id().unwrap()]
    );
}

#[tokio::test]
async fn abort_of_waiting_step_does_not_disturb_holder() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("deploy", 1);

    let holder = harness.start(&steps.step("a")).await;
    let waiting = harness.start(&steps.step("b")).await;
    let behind = harness.start(&steps.step("c")).await;
    let waiting_id = waiting.callback_id().unwrap();

    let outcome = harness
        .engine
        .handle_abort(&steps.step("b"), &waiting_id)
        .await
        .unwrap();
    assert_eq!(outcome.released, vec![waiting_id]);
    assert!(outcome.promoted.is_empty());
    assert_consumer_state(&harness.store, &consumer_of(&holder), ConsumerState::Active).await;

    let resumed = harness.engine.handle_resume(&waiting_id).await.unwrap();
    assert!(resumed.is_failed());

    harness.engine.on_scope_end("a").await.unwrap();
    assert_eq!(
        harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap(),
        vec![behind.callback_id().unwrap()]
    );
}

#[tokio::test]
async fn lowering_capacity_rejects_waiters_that_can_never_fit() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("shrinking", 4);

    harness.start(&steps.step_with("a", 3, AcquireMode::Ensure)).await;
    let big = harness.start(&steps.step_with("b", 3, AcquireMode::Ensure)).await;
    let small = harness.start(&steps.step_with("c", 1, AcquireMode::Ensure)).await;
    assert!(big.is_waiting());
    assert!(small.is_waiting());

    let constraint_id = harness
        .engine
        .facilitate(&steps.step("lookup"), &ExecutionContext::new())
        .await
        .unwrap()
        .constraint
        .id;
    let outcome = harness.engine.update_capacity(&constraint_id, 2).await.unwrap();
    assert_eq!(outcome.rejected, vec![big.callback_id().unwrap()]);
    assert!(outcome.promoted.is_empty());

    let rejected = harness.signals.drain_ids(ResumeOutcome::Rejected).unwrap();
    assert_eq!(rejected, vec![big.callback_id().unwrap()]);
    assert!(
        harness
            .engine
            .handle_resume(&big.callback_id().unwrap())
            .await
            .unwrap()
            .is_failed()
    );

    // The over-capacity holder keeps its permits until its scope ends.
    harness.engine.on_scope_end("a").await.unwrap();
    assert_eq!(
        harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap(),
        vec![small.callback_id().unwrap()]
    );
}

#[tokio::test]
async fn templated_units_queue_independently() {
    let harness = EngineHarness::new();
    let mut step = StepFactory::new("regional", 1).step("a");
    step.resource_unit = "<+env.region>".to_string();

    let east = ExecutionContext::new().with_variable("env.region", "us-east");
    let west = ExecutionContext::new().with_variable("env.region", "us-west");

    let first = harness.engine.start_step(&step, &east).await.unwrap();
    step.holding_scope.scope_id = "b".to_string();
    let second = harness.engine.start_step(&step, &west).await.unwrap();
    step.holding_scope.scope_id = "c".to_string();
    let third = harness.engine.start_step(&step, &east).await.unwrap();

    assert!(first.is_done());
    assert!(second.is_done());
    assert!(third.is_waiting());

    let mut bad = step.clone();
    bad.resource_unit = "<+env.missing>".to_string();
    let err = harness.engine.start_step(&bad, &east).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn waiting_consumers_expire_past_their_deadline() {
    let harness = EngineHarness::with_config(
        ConstraintRuntimeConfig::default().with_blocked_timeout(ChronoDuration::seconds(60)),
    );
    let steps = StepFactory::new("deploy", 1);

    harness.start(&steps.step("a")).await;
    let waiting = harness.start(&steps.step("b")).await;
    let callback_id = waiting.callback_id().unwrap();

    let early = harness.engine.reconcile_expired(Utc::now()).await.unwrap();
    assert!(early.expired.is_empty());

    let report = harness
        .engine
        .reconcile_expired(Utc::now() + ChronoDuration::seconds(61))
        .await
        .unwrap();
    assert_eq!(report.expired, vec![callback_id]);
    assert_eq!(
        harness.signals.drain_ids(ResumeOutcome::Expired).unwrap(),
        vec![callback_id]
    );
    assert!(harness.engine.handle_resume(&callback_id).await.unwrap().is_failed());
}

#[tokio::test]
async fn abort_retries_transient_release_failures() {
    let inner = Arc::new(InMemoryConstraintStore::new());
    let faulty = Arc::new(FaultInjectingStore::new(inner.clone()));
    let harness = EngineHarness::with_store(
        faulty.clone(),
        inner,
        ConstraintRuntimeConfig::default().with_abort_release_attempts(3),
    );
    let steps = StepFactory::new("deploy", 1);

    let holder = consumer_of(&harness.start(&steps.step("a")).await);
    let waiting = harness.start(&steps.step("b")).await;

    faulty.fail_next_commits(2);
    let outcome = harness
        .engine
        .handle_abort(&steps.step("a"), &holder)
        .await
        .unwrap();
    assert_eq!(outcome.released, vec![holder]);
    assert_eq!(outcome.promoted, vec![waiting.callback_id().unwrap()]);
}

#[tokio::test]
async fn abort_release_failure_is_surfaced() {
    let inner = Arc::new(InMemoryConstraintStore::new());
    let faulty = Arc::new(FaultInjectingStore::new(inner.clone()));
    let harness = EngineHarness::with_store(
        faulty.clone(),
        inner,
        ConstraintRuntimeConfig::default().with_abort_release_attempts(3),
    );
    let step = StepFactory::new("deploy", 1).step("a");
    let holder = consumer_of(&harness.start(&step).await);

    faulty.fail_all_commits(true);
    let err = harness.engine.handle_abort(&step, &holder).await.unwrap_err();
    match err {
        Error::AbortReleaseFailed {
            consumer_id,
            attempts,
            ..
        } => {
            assert_eq!(consumer_id, holder);
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    faulty.fail_all_commits(false);
    assert_consumer_state(&harness.store, &holder, ConsumerState::Active).await;
}

#[tokio::test(start_paused = true)]
async fn persistent_conflicts_exhaust_retries() {
    let inner = Arc::new(InMemoryConstraintStore::new());
    let faulty = Arc::new(FaultInjectingStore::new(inner.clone()));
    let harness = EngineHarness::with_store(
        faulty.clone(),
        inner.clone(),
        ConstraintRuntimeConfig::default().with_max_conflict_retries(4),
    );

    faulty.conflict_next_commits(u32::MAX);
    let err = harness
        .engine
        .start_step(&StepFactory::new("deploy", 1).step("a"), &ExecutionContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConcurrencyConflict { attempts: 4, .. }));
    assert!(err.is_transient());
    assert_eq!(inner.consumer_count().unwrap(), 0);
}

#[tokio::test]
async fn signal_outage_is_reported_to_the_caller() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("deploy", 1);
    harness.start(&steps.step("a")).await;
    harness.start(&steps.step("b")).await;

    harness.signals.set_unavailable(true);
    let err = harness.engine.on_scope_end("a").await.unwrap_err();
    assert!(matches!(err, Error::Signal { .. }));

    // The release itself was committed.
    let remaining = harness
        .store
        .consumers_by_scope("a", &[ConsumerState::Active])
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn retried_scope_end_wakes_the_step_promoted_during_an_outage() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("deploy", 1);
    harness.start(&steps.step("a")).await;
    let b = harness.start(&steps.step("b")).await.callback_id().unwrap();

    harness.signals.set_unavailable(true);
    let err = harness.engine.on_scope_end("a").await.unwrap_err();
    assert!(matches!(err, Error::Signal { .. }));
    assert_consumer_state(&harness.store, &b, ConsumerState::Active).await;
    assert!(harness.signals.is_empty().unwrap());

    harness.signals.set_unavailable(false);
    let report = harness.engine.on_scope_end("a").await.unwrap();
    assert!(report.released.is_empty());
    assert_eq!(report.redelivered, vec![b]);
    assert_eq!(
        harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap(),
        vec![b]
    );
    assert!(harness.engine.handle_resume(&b).await.unwrap().is_done());

    // Nothing is owed any more.
    let again = harness.engine.on_scope_end("a").await.unwrap();
    assert!(again.redelivered.is_empty());
    assert!(harness.signals.is_empty().unwrap());
}

#[tokio::test]
async fn reconciler_wakes_the_step_promoted_during_an_outage() {
    let harness = EngineHarness::new();
    let steps = StepFactory::new("deploy", 1);
    harness.start(&steps.step("a")).await;
    let b = harness.start(&steps.step("b")).await.callback_id().unwrap();

    harness.signals.set_unavailable(true);
    harness.engine.on_scope_end("a").await.unwrap_err();
    harness.signals.set_unavailable(false);

    // Nobody retries the scope end; the periodic sweep catches it.
    let report = harness.engine.reconcile_expired(Utc::now()).await.unwrap();
    assert_eq!(report.redelivered, vec![b]);
    assert_eq!(
        harness.signals.drain_ids(ResumeOutcome::Promoted).unwrap(),
        vec![b]
    );
}

#[tokio::test]
async fn capacity_lowered_mid_acquire_is_not_overrun() {
    let inner = Arc::new(InMemoryConstraintStore::new());
    let faulty = Arc::new(FaultInjectingStore::new(inner.clone()));
    let harness = EngineHarness::with_store(
        faulty.clone(),
        inner,
        ConstraintRuntimeConfig::default(),
    );
    let steps = StepFactory::new("deploy", 3);

    let holder = harness.start(&steps.step("a")).await;
    assert!(holder.is_done());
    let constraint_id = harness
        .engine
        .facilitate(&steps.step("lookup"), &ExecutionContext::new())
        .await
        .unwrap()
        .constraint
        .id;

    // Facilitation and the acquire cycle both see capacity 3; an operator
    // lowers it to 1 before the acquire commits.
    faulty.change_capacity_before_next_commit(constraint_id, 1);
    let attempts_before = faulty.commit_attempts();
    let response = harness
        .start(&steps.step_with("b", 2, AcquireMode::Ensure))
        .await;

    assert!(response.is_failed());
    assert!(faulty.commit_attempts() >= attempts_before + 2);
    let snapshot = harness
        .engine
        .queue_snapshot(&constraint_id, "prod")
        .await
        .unwrap();
    assert_eq!(snapshot.capacity, 1);
    assert_eq!(snapshot.active_permits, 1);
    assert!(snapshot.blocked.is_empty());
    assert_capacity_invariant(&snapshot);
}
