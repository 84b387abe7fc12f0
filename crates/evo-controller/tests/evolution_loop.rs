//! End-to-end tests of the per-agent evolution loop
//!
//! All tests drive ticks explicitly (the spawned interval is set to an
//! hour) and deliver publisher/sandbox outcomes by hand, so ordering is
//! deterministic.

use std::sync::Arc;
use std::time::Duration;

use evo_cluster::{ReplicaId, ReservationTable};
use evo_controller::{
    channel, AgentHandle, Collaborators, EvolutionController, EvolutionEvent, ProposeOutcome,
    SandboxVerdict,
};
use evo_core::{
    fingerprint, AgentId, AgentStatus, ChangePayload, EvolutionConfig, EvolutionError,
    RateLimiter, ResourceSnapshot, TriggerContext,
};
use evo_test_utils::{
    init_tracing, MemoryQueueStore, ScriptedPublisher, ScriptedSandbox, StaticValidator,
    StubSnapshots,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    handle: AgentHandle,
    publisher: Arc<ScriptedPublisher>,
    sandbox: Arc<ScriptedSandbox>,
    snapshots: Arc<StubSnapshots>,
    store: Arc<MemoryQueueStore>,
    reservations: Arc<ReservationTable>,
    limiter: Arc<RateLimiter>,
    events: UnboundedReceiver<EvolutionEvent>,
}

fn test_config() -> EvolutionConfig {
    // Tests drive ticks by hand.
    EvolutionConfig::default()
        .with_tick_interval(Duration::from_secs(3600))
        .with_validation_delay(Duration::from_millis(20))
}

fn spawn(id: &str, config: EvolutionConfig) -> Harness {
    init_tracing();
    let publisher = Arc::new(ScriptedPublisher::new());
    let sandbox = Arc::new(ScriptedSandbox::new());
    let snapshots = Arc::new(StubSnapshots::new(ResourceSnapshot::new(100.0, 5.0)));
    let store = Arc::new(MemoryQueueStore::new());
    let reservations = Arc::new(ReservationTable::new(
        ReplicaId::generate(),
        Duration::from_millis(config.reservation_ttl_ms),
    ));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max,
        Duration::from_millis(config.rate_limit_window_ms),
    ));
    let (sink, events) = channel();
    let handle = EvolutionController::spawn(
        AgentId::new(id),
        config,
        Collaborators {
            validator: Arc::new(StaticValidator::accepting()),
            publisher: publisher.clone(),
            sandbox: sandbox.clone(),
            snapshots: snapshots.clone(),
            store: store.clone(),
        },
        reservations.clone(),
        limiter.clone(),
        sink,
    )
    .unwrap();
    Harness {
        handle,
        publisher,
        sandbox,
        snapshots,
        store,
        reservations,
        limiter,
        events,
    }
}

fn tuning_payload(tag: u64) -> ChangePayload {
    ChangePayload::Structured(serde_json::json!({
        "kind": "parameters",
        "target": "runtime/tuning",
        "tag": tag,
    }))
}

fn core_payload() -> ChangePayload {
    ChangePayload::Structured(serde_json::json!({
        "kind": "code",
        "target": "controller/tick",
    }))
}

fn trigger() -> TriggerContext {
    TriggerContext::new("test", 0)
}

fn drain_events(rx: &mut UnboundedReceiver<EvolutionEvent>) -> Vec<EvolutionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn low_risk_proposal_applies_and_advances_the_version() {
    let mut h = spawn("a1", test_config());
    let payload = tuning_payload(1);
    let fp = fingerprint::fingerprint(&payload);

    let outcome = h.handle.propose(payload, trigger()).await.unwrap();
    assert_eq!(
        outcome,
        ProposeOutcome::Applying {
            fingerprint: fp.clone()
        }
    );
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.status, AgentStatus::Applying);
    assert!(h.reservations.is_reserved(&AgentId::new("a1"), &fp));
    assert_eq!(h.publisher.last_version(), Some(1));

    h.handle.apply_completed(1).await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.version, 1);
    assert_eq!(state.status, AgentStatus::Idle);
    assert!(!h.reservations.is_reserved(&AgentId::new("a1"), &fp));

    // Delayed validation passes and finalizes the change.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.recent_count, 1);
    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Validated { version: 1, .. })));
}

#[tokio::test]
async fn duplicate_proposal_is_rejected_without_queueing() {
    let mut h = spawn("a1", test_config());
    let payload = tuning_payload(1);
    let fp = fingerprint::fingerprint(&payload);

    h.handle.propose(payload.clone(), trigger()).await.unwrap();
    let err = h.handle.propose(payload, trigger()).await.unwrap_err();
    assert!(matches!(err, EvolutionError::Duplicate(d) if d == fp));

    let state = h.handle.state().await.unwrap();
    assert_eq!(state.queue_len, 0);
    assert_eq!(h.publisher.enqueued().len(), 1);
    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Duplicate { .. })));
}

#[tokio::test]
async fn invalid_proposal_never_reaches_the_queue() {
    init_tracing();
    let h = spawn("a1", test_config());
    // Swap in a rejecting validator by spawning a dedicated agent.
    let store = Arc::new(MemoryQueueStore::new());
    let handle = EvolutionController::spawn(
        AgentId::new("a2"),
        test_config(),
        Collaborators {
            validator: Arc::new(StaticValidator::rejecting("syntax error")),
            publisher: h.publisher.clone(),
            sandbox: h.sandbox.clone(),
            snapshots: h.snapshots.clone(),
            store: store.clone(),
        },
        h.reservations.clone(),
        h.limiter.clone(),
        evo_controller::EventSink::disconnected(),
    )
    .unwrap();

    let err = handle
        .propose(tuning_payload(1), trigger())
        .await
        .unwrap_err();
    assert!(matches!(err, EvolutionError::InvalidPayload(_)));
    let state = handle.state().await.unwrap();
    assert_eq!(state.queue_len, 0);
    assert_eq!(state.status, AgentStatus::Idle);
}

#[tokio::test]
async fn failed_apply_returns_to_idle_and_releases_the_reservation() {
    let mut h = spawn("a1", test_config());
    let payload = tuning_payload(1);
    let fp = fingerprint::fingerprint(&payload);

    h.handle.propose(payload, trigger()).await.unwrap();
    h.handle.apply_failed("publisher crashed").await.unwrap();

    let state = h.handle.state().await.unwrap();
    assert_eq!(state.status, AgentStatus::Idle);
    assert_eq!(state.version, 0);
    assert_eq!(state.metrics.get("failures"), Some(&1.0));
    assert!(!h.reservations.is_reserved(&AgentId::new("a1"), &fp));
    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::ApplyFailed { .. })));
}

#[tokio::test]
async fn proposals_while_busy_are_queued_and_drained_in_order() {
    let h = spawn("a1", test_config());

    h.handle.propose(tuning_payload(1), trigger()).await.unwrap();
    let second = h.handle.propose(tuning_payload(2), trigger()).await.unwrap();
    let third = h.handle.propose(tuning_payload(3), trigger()).await.unwrap();
    assert!(matches!(second, ProposeOutcome::Queued { queue_len: 1, .. }));
    assert!(matches!(third, ProposeOutcome::Queued { queue_len: 2, .. }));

    // Completing the first change drains the backlog head.
    h.handle.apply_completed(1).await.unwrap();
    h.handle.state().await.unwrap();
    assert_eq!(h.publisher.enqueued().len(), 2);
    h.handle.apply_completed(2).await.unwrap();
    h.handle.apply_completed(3).await.unwrap();

    let state = h.handle.state().await.unwrap();
    assert_eq!(state.version, 3);
    assert_eq!(state.queue_len, 0);
    let applied: Vec<u64> = h
        .publisher
        .enqueued()
        .iter()
        .map(|(_, p, _)| p.field_u64("tag").unwrap())
        .collect();
    assert_eq!(applied, vec![1, 2, 3]);
}

#[tokio::test]
async fn version_numbers_are_strictly_monotonic() {
    let config = test_config().with_rate_limit(10, Duration::from_secs(60));
    let h = spawn("a1", config);
    for tag in 1..=5 {
        h.handle.propose(tuning_payload(tag), trigger()).await.unwrap();
        h.handle.apply_completed(tag).await.unwrap();
    }
    let versions: Vec<u64> = h.publisher.enqueued().iter().map(|(_, _, v)| *v).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.version, 5);
    assert_eq!(state.history.len(), 5);
}

#[tokio::test]
async fn rate_limited_entries_wait_at_the_queue_front() {
    let config = test_config().with_rate_limit(1, Duration::from_millis(50));
    let h = spawn("a1", config);

    h.handle.propose(tuning_payload(1), trigger()).await.unwrap();
    h.handle.apply_completed(1).await.unwrap();

    // The limiter window is exhausted, so this one queues even though the
    // agent is idle.
    let outcome = h.handle.propose(tuning_payload(2), trigger()).await.unwrap();
    assert!(matches!(outcome, ProposeOutcome::Queued { .. }));
    assert_eq!(h.publisher.enqueued().len(), 1);

    // After the window expires a tick drains the backlog.
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.handle.tick().await.unwrap();
    h.handle.apply_completed(2).await.unwrap();

    let state = h.handle.state().await.unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(state.queue_len, 0);
}

#[tokio::test]
async fn high_risk_change_goes_through_the_sandbox() {
    let h = spawn("a1", test_config());
    let payload = core_payload();

    let outcome = h.handle.propose(payload.clone(), trigger()).await.unwrap();
    let experiment = match outcome {
        ProposeOutcome::SandboxSubmitted { experiment } => experiment,
        other => panic!("expected sandbox submission, got {other:?}"),
    };
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.status, AgentStatus::AwaitingSandbox);
    assert_eq!(h.sandbox.submitted().len(), 1);
    assert!(h.publisher.enqueued().is_empty());

    // Merge verdict promotes the change to a local apply.
    h.handle
        .sandbox_verdict(experiment, SandboxVerdict::Merge, Default::default())
        .await
        .unwrap();
    h.handle.state().await.unwrap();
    assert_eq!(h.publisher.enqueued().len(), 1);
    h.handle.apply_completed(1).await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.version, 1);
}

#[tokio::test]
async fn sandbox_rollback_discards_the_change() {
    let mut h = spawn("a1", test_config());
    let outcome = h.handle.propose(core_payload(), trigger()).await.unwrap();
    let experiment = match outcome {
        ProposeOutcome::SandboxSubmitted { experiment } => experiment,
        other => panic!("expected sandbox submission, got {other:?}"),
    };

    h.handle
        .sandbox_verdict(experiment, SandboxVerdict::Rollback, Default::default())
        .await
        .unwrap();

    let state = h.handle.state().await.unwrap();
    assert_eq!(state.status, AgentStatus::Idle);
    assert_eq!(state.version, 0);
    assert!(h.publisher.enqueued().is_empty());
    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Rollback { .. })));
}

#[tokio::test]
async fn memory_regression_rolls_back_to_the_previous_code() {
    let mut h = spawn("a1", test_config());
    let good = tuning_payload(1);
    let bad = tuning_payload(2);

    // Establish v1 as known-good code.
    h.handle.propose(good.clone(), trigger()).await.unwrap();
    h.handle.apply_completed(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    // Apply the bad change, then grow memory past baseline * 1.25.
    h.handle.propose(bad, trigger()).await.unwrap();
    h.handle.apply_completed(2).await.unwrap();
    h.snapshots.set(ResourceSnapshot::new(130.0, 5.0));
    tokio::time::sleep(Duration::from_millis(60)).await;

    // The previous code was resubmitted as v3.
    let enqueued = h.publisher.enqueued();
    assert_eq!(enqueued.len(), 3);
    assert_eq!(enqueued[2].1, good);
    assert_eq!(enqueued[2].2, 3);
    let events = drain_events(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        EvolutionEvent::Rollback { version: 2, reason, .. } if reason.contains("regression detected")
    )));

    h.handle.apply_completed(3).await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.version, 3);
}

#[tokio::test]
async fn overlapping_validation_windows_each_get_validated() {
    let config = test_config().with_validation_delay(Duration::from_millis(200));
    let mut h = spawn("a1", config);

    // Two applies complete well inside the validation delay, so both
    // windows are outstanding at once.
    h.handle.propose(tuning_payload(1), trigger()).await.unwrap();
    h.handle.apply_completed(1).await.unwrap();
    h.handle.propose(tuning_payload(2), trigger()).await.unwrap();
    h.handle.apply_completed(2).await.unwrap();

    let state = h.handle.state().await.unwrap();
    assert_eq!(state.validating_versions, vec![1, 2]);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.recent_count, 2);
    assert!(state.validating_versions.is_empty());
    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Validated { version: 1, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Validated { version: 2, .. })));
}

#[tokio::test]
async fn rollback_queued_while_busy_still_resubmits() {
    let config = test_config().with_validation_delay(Duration::from_millis(50));
    let mut h = spawn("a1", config);
    let good = tuning_payload(1);
    let bad = tuning_payload(2);

    // Establish v1 as validated known-good code.
    h.handle.propose(good.clone(), trigger()).await.unwrap();
    h.handle.apply_completed(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    // Apply the bad change, then start another change so the agent is
    // busy when the bad change's validation fires.
    h.handle.propose(bad, trigger()).await.unwrap();
    h.handle.apply_completed(2).await.unwrap();
    h.handle.propose(tuning_payload(3), trigger()).await.unwrap();
    h.snapshots.set(ResourceSnapshot::new(130.0, 5.0));
    tokio::time::sleep(Duration::from_millis(120)).await;

    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Rollback { version: 2, .. })));

    // Completing the in-flight change drains the queued rollback even
    // though the good code's fingerprint was recently validated.
    h.handle.apply_completed(3).await.unwrap();
    h.handle.state().await.unwrap();
    let enqueued = h.publisher.enqueued();
    assert_eq!(enqueued.len(), 4);
    assert_eq!(enqueued[3].1, good);
    assert_eq!(enqueued[3].2, 4);
}

#[tokio::test]
async fn refused_reservation_keeps_the_queue_front_position() {
    let config = test_config().with_rate_limit(10, Duration::from_secs(60));
    let h = spawn("a1", config);
    let blocked = tuning_payload(7);
    let fp = fingerprint::fingerprint(&blocked);

    h.handle.propose(tuning_payload(1), trigger()).await.unwrap();
    // A peer replica holds the reservation for the next entry.
    assert!(h.reservations.reserve(&AgentId::new("a1"), &fp));
    h.handle.propose(blocked.clone(), trigger()).await.unwrap();
    h.handle.propose(tuning_payload(8), trigger()).await.unwrap();

    // The drain pops the blocked entry, cannot reserve it, and must put
    // it back at the front rather than behind younger entries.
    h.handle.apply_completed(1).await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.queue_len, 2);
    assert_eq!(h.publisher.enqueued().len(), 1);

    h.reservations.release(&AgentId::new("a1"), &fp);
    h.handle.tick().await.unwrap();
    h.handle.apply_completed(2).await.unwrap();
    h.handle.apply_completed(3).await.unwrap();
    h.handle.state().await.unwrap();

    let applied: Vec<u64> = h
        .publisher
        .enqueued()
        .iter()
        .map(|(_, p, _)| p.field_u64("tag").unwrap())
        .collect();
    assert_eq!(applied, vec![1, 7, 8]);
}

#[tokio::test]
async fn memory_growth_within_the_threshold_validates() {
    let mut h = spawn("a1", test_config());
    h.handle.propose(tuning_payload(1), trigger()).await.unwrap();
    h.handle.apply_completed(1).await.unwrap();

    // 120 is below the 125 threshold for a baseline of 100.
    h.snapshots.set(ResourceSnapshot::new(120.0, 5.0));
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(h.publisher.enqueued().len(), 1);
    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Validated { version: 1, .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Rollback { .. })));
}

#[tokio::test]
async fn forced_improvement_acts_on_the_next_tick() {
    let h = spawn("a1", test_config());
    // A healthy agent would otherwise do nothing.
    for _ in 0..5 {
        h.handle.record_outcome(true).await.unwrap();
    }
    h.handle.tick().await.unwrap();
    h.handle.state().await.unwrap();
    assert!(h.publisher.enqueued().is_empty());

    h.handle.force_improvement("operator request").await.unwrap();
    h.handle.tick().await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.status, AgentStatus::Applying);
    assert_eq!(h.publisher.enqueued().len(), 1);
}

#[tokio::test]
async fn stuck_change_is_failed_by_supervision() {
    let mut h = spawn("a1", test_config().with_stuck_after_ticks(2));
    h.handle.propose(tuning_payload(1), trigger()).await.unwrap();

    h.handle.tick().await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.status, AgentStatus::Applying);

    h.handle.tick().await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.status, AgentStatus::Idle);
    assert_eq!(state.version, 0);
    assert_eq!(state.metrics.get("failures"), Some(&1.0));
    let events = drain_events(&mut h.events);
    assert!(events
        .iter()
        .any(|e| matches!(e, EvolutionEvent::Stuck { since_cycle: 0, cycle: 2, .. })));
}

#[tokio::test]
async fn reservation_held_elsewhere_queues_the_change() {
    let h = spawn("a1", test_config());
    let payload = tuning_payload(1);
    let fp = fingerprint::fingerprint(&payload);

    // Simulate a peer replica already applying the same change.
    assert!(h.reservations.reserve(&AgentId::new("a1"), &fp));

    let outcome = h.handle.propose(payload, trigger()).await.unwrap();
    assert!(matches!(outcome, ProposeOutcome::Queued { queue_len: 1, .. }));
    assert!(h.publisher.enqueued().is_empty());
}

#[tokio::test]
async fn queued_changes_survive_a_controller_restart() {
    let h = spawn("a1", test_config());
    h.handle.propose(tuning_payload(1), trigger()).await.unwrap();
    h.handle.propose(tuning_payload(2), trigger()).await.unwrap();
    h.handle.propose(tuning_payload(3), trigger()).await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert_eq!(state.queue_len, 2);
    drop(h.handle);

    // A fresh controller over the same store sees the same backlog.
    let restarted = EvolutionController::spawn(
        AgentId::new("a1"),
        test_config(),
        Collaborators {
            validator: Arc::new(StaticValidator::accepting()),
            publisher: Arc::new(ScriptedPublisher::new()),
            sandbox: Arc::new(ScriptedSandbox::new()),
            snapshots: h.snapshots.clone(),
            store: h.store.clone(),
        },
        h.reservations.clone(),
        h.limiter.clone(),
        evo_controller::EventSink::disconnected(),
    )
    .unwrap();
    let state = restarted.state().await.unwrap();
    assert_eq!(state.queue_len, 2);
}

#[tokio::test]
async fn metric_updates_feed_the_health_score() {
    let h = spawn("a1", test_config());
    h.handle.record_outcome(true).await.unwrap();
    h.handle.record_outcome(true).await.unwrap();
    h.handle.record_outcome(false).await.unwrap();
    h.handle
        .update_metrics(std::collections::HashMap::from([(
            "latency_p99".to_string(),
            42.0,
        )]))
        .await
        .unwrap();

    h.handle.tick().await.unwrap();
    let state = h.handle.state().await.unwrap();
    assert!((state.last_score - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(state.metrics.get("latency_p99"), Some(&42.0));
}
