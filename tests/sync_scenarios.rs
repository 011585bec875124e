use std::sync::Arc;
use std::time::Duration;

use driftsync::common::clock::{Clock, ManualClock};
use driftsync::network::{
    PlatformSignal, RemoteError, SimulatedRemote, SyncContext, SyncCoordinator, SyncEvent,
    SyncOutcome,
};
use driftsync::storage::{
    DrainReport, DropReason, MemoryStore, Mutation, OperationKind, QueueStore, QueuedAction,
};
use driftsync::SyncConfig;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    remote: Arc<SimulatedRemote>,
    coordinator: Arc<SyncCoordinator>,
}

async fn harness(online: bool, config: SyncConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(MemoryStore::new());
    let ctx = SyncContext::new(config, clock.clone(), store.clone(), online).await;
    let remote = Arc::new(SimulatedRemote::new());
    let coordinator = SyncCoordinator::new(ctx, remote.clone());
    Harness {
        clock,
        store,
        remote,
        coordinator,
    }
}

fn mutation(kind: OperationKind, data: Value) -> Mutation {
    Mutation::from_parts(kind, data).expect("valid mutation")
}

async fn next_drain(events: &mut broadcast::Receiver<SyncEvent>) -> DrainReport {
    loop {
        if let SyncEvent::DrainFinished(report) = events.recv().await.unwrap() {
            return report;
        }
    }
}

#[tokio::test]
async fn offline_update_is_replayed_when_connection_returns() {
    let h = harness(false, SyncConfig::default()).await;
    let update = mutation(OperationKind::Update, json!({"id": "a1", "bio": "x"}));

    let outcome = h.coordinator.smart_sync("profiles", update).await.unwrap();
    let SyncOutcome::Queued { action_id } = outcome else {
        panic!("expected queued, got {outcome:?}");
    };
    assert_eq!(h.coordinator.get_queue_length(), 1);
    assert_eq!(h.remote.calls(), 0);

    let queued = h.coordinator.queue().pending().await;
    assert_eq!(queued[0].id, action_id);
    assert_eq!(queued[0].table, "profiles");
    assert_eq!(queued[0].operation(), OperationKind::Update);
    assert_eq!(queued[0].timestamp, h.clock.now_ms());
    assert_eq!(queued[0].retry_count, 0);

    // The queue blob is durable before the call returns.
    let blob = h.store.load("offline_queue").await.unwrap().expect("persisted");
    let persisted: Value = serde_json::from_slice(&blob).unwrap();
    assert_eq!(persisted[0]["mutation"]["operation"], "update");
    assert_eq!(persisted[0]["mutation"]["data"]["id"], "a1");

    h.coordinator
        .monitor()
        .handle_platform_signal(PlatformSignal::Online);
    let report = h.coordinator.drain_now().await.expect("drain ran");
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(h.coordinator.get_queue_length(), 0);
    assert_eq!(h.remote.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn connection_lost_mid_retry_queues_with_completed_attempts() {
    let h = harness(true, SyncConfig::default()).await;
    h.remote.push_failure(RemoteError::Network("reset".into()));

    let flip = {
        let monitor = h.coordinator.monitor().clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            monitor.handle_platform_signal(PlatformSignal::Offline);
        }
    };
    let write = h.coordinator.smart_sync(
        "profiles",
        mutation(OperationKind::Upsert, json!({"id": "p1", "bio": "x"})),
    );

    let (outcome, _) = tokio::join!(write, flip);
    assert!(matches!(outcome.unwrap(), SyncOutcome::Queued { .. }));
    assert_eq!(h.remote.calls(), 1, "backoff wait is abandoned once offline");

    let queued = h.coordinator.queue().pending().await;
    assert_eq!(queued[0].retry_count, 1);
    assert_eq!(
        queued[0].last_error.as_deref(),
        Some("Network error: reset")
    );
}

#[tokio::test]
async fn rejected_write_is_surfaced_and_never_queued() {
    let h = harness(true, SyncConfig::default()).await;
    let insert = mutation(OperationKind::Insert, json!({"id": "p1", "bio": "a"}));
    h.coordinator.smart_sync("profiles", insert).await.unwrap();

    // Same id, different body: the simulated remote reports a conflict.
    let clash = mutation(OperationKind::Insert, json!({"id": "p1", "bio": "b"}));
    let outcome = h.coordinator.smart_sync("profiles", clash).await.unwrap();
    assert!(matches!(
        outcome,
        SyncOutcome::Rejected(RemoteError::Conflict(_))
    ));
    assert_eq!(h.coordinator.get_queue_length(), 0);
    assert_eq!(h.remote.row("profiles", "p1").unwrap()["bio"], "a");
}

#[tokio::test]
async fn local_rate_limit_defers_writes_until_window_rolls() {
    let config = SyncConfig {
        rate_limit_max_requests: 2,
        ..SyncConfig::default()
    };
    let h = harness(true, config).await;

    for i in 0..4 {
        let m = mutation(OperationKind::Upsert, json!({"id": format!("p{i}")}));
        h.coordinator.smart_sync("profiles", m).await.unwrap();
    }
    assert_eq!(h.remote.calls(), 2);
    assert_eq!(h.coordinator.get_queue_length(), 2);
    assert!(h.coordinator.get_rate_limit_info().blocked);

    // Still inside the window: the pass is deferred without calling out.
    let report = h.coordinator.drain_now().await.unwrap();
    assert_eq!(report.deferred, 2);
    assert_eq!(h.remote.calls(), 2);

    h.clock.advance(60_000);
    let report = h.coordinator.drain_now().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(h.remote.row_count("profiles"), 4);
}

#[tokio::test]
async fn queued_semantic_failure_is_dropped_with_event() {
    let h = harness(false, SyncConfig::default()).await;
    let mut events = h.coordinator.subscribe_events();

    let m = mutation(OperationKind::Update, json!({"id": "p1", "bio": "x"}));
    h.coordinator.smart_sync("profiles", m).await.unwrap();
    h.remote.push_failure(RemoteError::Validation("bio too long".into()));

    h.coordinator
        .monitor()
        .handle_platform_signal(PlatformSignal::Online);
    let report = h.coordinator.drain_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.coordinator.get_queue_length(), 0);

    let mut dropped = None;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::Dropped(d) = event {
            dropped = Some(d);
        }
    }
    let dropped = dropped.expect("drop event");
    assert!(matches!(dropped.reason, DropReason::Rejected(_)));
}

#[tokio::test]
async fn started_coordinator_drains_on_reconnect() {
    let h = harness(false, SyncConfig::default()).await;
    let mut events = h.coordinator.subscribe_events();
    h.coordinator.start(None);
    assert!(h.coordinator.is_running());

    for i in 0..3 {
        let m = mutation(OperationKind::Upsert, json!({"id": format!("p{i}")}));
        h.coordinator.smart_sync("profiles", m).await.unwrap();
    }

    h.coordinator
        .monitor()
        .handle_platform_signal(PlatformSignal::Online);

    let report = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let SyncEvent::DrainFinished(report) = events.recv().await.unwrap() {
                return report;
            }
        }
    })
    .await
    .expect("drain after reconnect");

    assert_eq!(report.succeeded, 3);
    assert_eq!(h.coordinator.get_queue_length(), 0);
    assert!(h.coordinator.status().last_drain.is_some());

    h.coordinator.shutdown().await;
    assert!(!h.coordinator.is_running());
    assert_eq!(h.coordinator.monitor().listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn periodic_tick_drains_queue_while_online() {
    let config = SyncConfig {
        rate_limit_max_requests: 1,
        ..SyncConfig::default()
    };
    let h = harness(true, config).await;
    let mut events = h.coordinator.subscribe_events();
    let started = Instant::now();
    h.coordinator.start(None);

    // Start-up pass over the empty queue.
    let initial = next_drain(&mut events).await;
    assert_eq!(initial.succeeded, 0);

    for i in 0..2 {
        let m = mutation(OperationKind::Upsert, json!({"id": format!("p{i}")}));
        h.coordinator.smart_sync("profiles", m).await.unwrap();
    }
    assert_eq!(h.remote.calls(), 1);
    assert_eq!(h.coordinator.get_queue_length(), 1);

    // No connection transition follows, so only the drain interval can fire.
    h.clock.advance(60_000);
    let report = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let report = next_drain(&mut events).await;
            if report.succeeded == 1 {
                return report;
            }
        }
    })
    .await
    .expect("periodic drain");

    assert!(started.elapsed() >= Duration::from_millis(15_000));
    assert_eq!(report.remaining, 0);
    assert_eq!(h.coordinator.get_queue_length(), 0);
    assert_eq!(h.remote.row_count("profiles"), 2);

    h.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn start_drains_immediately_when_already_online() {
    let h = harness(true, SyncConfig::default()).await;
    let upsert = mutation(OperationKind::Upsert, json!({"id": "p1", "bio": "x"}));
    h.coordinator
        .queue()
        .enqueue(QueuedAction::new("profiles", upsert, h.clock.now_ms()))
        .await
        .unwrap();

    let mut events = h.coordinator.subscribe_events();
    let started = Instant::now();
    h.coordinator.start(None);

    let report = tokio::time::timeout(Duration::from_secs(20), next_drain(&mut events))
        .await
        .expect("start-up drain");

    assert_eq!(report.succeeded, 1);
    assert!(started.elapsed() < Duration::from_millis(15_000));
    assert_eq!(h.coordinator.get_queue_length(), 0);
    assert!(h.remote.row("profiles", "p1").is_some());

    h.coordinator.shutdown().await;
}
