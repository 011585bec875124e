use std::sync::{Arc, Mutex};
use std::time::Duration;

use driftsync::common::clock::ManualClock;
use driftsync::network::{
    ConnectionMonitor, ConnectionQuality, ConnectivityProbe, PlatformSignal, SimulatedProbe,
};
use driftsync::SyncConfig;
use tokio_util::sync::CancellationToken;

fn monitor(online: bool) -> Arc<ConnectionMonitor> {
    let clock = Arc::new(ManualClock::new(1_000));
    Arc::new(ConnectionMonitor::new(clock, &SyncConfig::default(), online))
}

#[tokio::test]
async fn check_once_brings_offline_monitor_online_for_reachable_target() {
    let monitor = monitor(false);
    let probe = SimulatedProbe::new(true);

    let state = monitor
        .check_once(&probe, Duration::from_secs(5))
        .await
        .expect("transition to online");
    assert!(state.is_online);
    assert_eq!(state.connection_quality, ConnectionQuality::Good);
}

#[tokio::test]
async fn check_once_reports_unreachable_target_as_degraded() {
    let monitor = monitor(true);
    let probe = SimulatedProbe::new(false);

    monitor.check_once(&probe, Duration::from_secs(5)).await;
    let state = monitor.get_connection_state();
    assert!(state.is_online, "a single failure must not flip to offline");
    assert_eq!(state.connection_quality, ConnectionQuality::Slow);
}

#[tokio::test(start_paused = true)]
async fn slow_probe_marks_connection_slow_and_timeout_counts_as_failure() {
    let monitor = monitor(true);
    let probe = SimulatedProbe::new(true);

    probe.set_latency(Duration::from_millis(1_500));
    monitor.check_once(&probe, Duration::from_secs(5)).await;
    assert_eq!(
        monitor.get_connection_state().connection_quality,
        ConnectionQuality::Slow
    );

    probe.set_latency(Duration::from_millis(10));
    monitor.check_once(&probe, Duration::from_secs(5)).await;
    assert_eq!(
        monitor.get_connection_state().connection_quality,
        ConnectionQuality::Good
    );

    probe.set_latency(Duration::from_secs(30));
    for _ in 0..3 {
        monitor.check_once(&probe, Duration::from_secs(5)).await;
    }
    assert!(!monitor.is_online());
}

#[tokio::test(start_paused = true)]
async fn probe_loop_tracks_reachability_until_cancelled() {
    let monitor = monitor(true);
    let probe = Arc::new(SimulatedProbe::new(false));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    let _sub = monitor.subscribe_to_connection(move |state| {
        sink.lock().unwrap().push(state.is_online);
    });

    let token = CancellationToken::new();
    let dyn_probe: Arc<dyn ConnectivityProbe> = probe.clone();
    let handle = monitor.spawn_probe_loop(
        dyn_probe,
        Duration::from_secs(30),
        Duration::from_secs(5),
        token.clone(),
    );

    // Ticks at 0s, 30s and 60s: three failures take the monitor offline.
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(!monitor.is_online());

    probe.set_reachable(true);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(monitor.is_online());

    token.cancel();
    handle.await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.first(), Some(&true), "first failure only degrades quality");
    assert_eq!(seen.last(), Some(&true));
    assert!(seen.contains(&false));
}

#[tokio::test]
async fn platform_signals_override_probe_state() {
    let monitor = monitor(true);
    let mut rx = monitor.watch();

    monitor.handle_platform_signal(PlatformSignal::Offline);
    rx.changed().await.unwrap();
    assert!(!rx.borrow().is_online);

    let probe = SimulatedProbe::new(false);
    monitor.check_once(&probe, Duration::from_secs(1)).await;
    assert!(!monitor.is_online());

    monitor.handle_platform_signal(PlatformSignal::Online);
    assert!(monitor.is_online());
}
