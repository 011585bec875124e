use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::common::clock::SharedClock;
use crate::common::lock;
use crate::config::SyncConfig;
use crate::network::remote::ConnectivityProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Good,
    Slow,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub is_online: bool,
    /// Time of the most recent transition to online, in ms since epoch.
    pub last_online: u64,
    pub connection_quality: ConnectionQuality,
}

impl ConnectionState {
    fn same_as(&self, other: &ConnectionState) -> bool {
        self.is_online == other.is_online && self.connection_quality == other.connection_quality
    }
}

/// Connectivity change reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
    Online,
    Offline,
}

type Listener = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Deregistration handle returned by [`ConnectionMonitor::subscribe`].
/// Dropping it also unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

struct MonitorState {
    current: ConnectionState,
    consecutive_failures: u32,
}

/// Owns the connection state machine.
///
/// `offline -> online` happens on a platform online signal or the first
/// successful probe; `online -> offline` on a platform offline signal or
/// `offline_after_probe_failures` consecutive probe failures. Quality
/// (`good`/`slow`) is an overlay on the online state driven by probe latency.
pub struct ConnectionMonitor {
    state: Mutex<MonitorState>,
    registry: Arc<Mutex<Registry>>,
    // Serializes transitions so listeners see them in the order they happened.
    dispatch: Mutex<()>,
    watch_tx: watch::Sender<ConnectionState>,
    clock: SharedClock,
    slow_threshold: Duration,
    offline_after: u32,
}

impl ConnectionMonitor {
    pub fn new(clock: SharedClock, config: &SyncConfig, initially_online: bool) -> Self {
        let initial = ConnectionState {
            is_online: initially_online,
            last_online: clock.now_ms(),
            connection_quality: if initially_online {
                ConnectionQuality::Good
            } else {
                ConnectionQuality::Offline
            },
        };
        let (watch_tx, _) = watch::channel(initial);

        Self {
            state: Mutex::new(MonitorState {
                current: initial,
                consecutive_failures: 0,
            }),
            registry: Arc::new(Mutex::new(Registry::default())),
            dispatch: Mutex::new(()),
            watch_tx,
            clock,
            slow_threshold: Duration::from_millis(config.slow_latency_threshold_ms),
            offline_after: config.offline_after_probe_failures,
        }
    }

    /// Snapshot of the current state.
    pub fn get_connection_state(&self) -> ConnectionState {
        lock(&self.state).current
    }

    pub fn is_online(&self) -> bool {
        self.get_connection_state().is_online
    }

    /// Register a listener called synchronously, in registration order, on
    /// every state transition.
    ///
    /// Listeners may read the monitor but must not drive a transition from
    /// inside the callback.
    pub fn subscribe_to_connection<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.listeners.push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }

    /// Async view of the state, for waiters such as the retry executor.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.watch_tx.subscribe()
    }

    pub fn handle_platform_signal(&self, signal: PlatformSignal) -> Option<ConnectionState> {
        self.transition(|st, now| match signal {
            PlatformSignal::Online => {
                st.consecutive_failures = 0;
                if !st.current.is_online {
                    st.current.last_online = now;
                }
                st.current.is_online = true;
                if st.current.connection_quality == ConnectionQuality::Offline {
                    st.current.connection_quality = ConnectionQuality::Good;
                }
            }
            PlatformSignal::Offline => {
                st.current.is_online = false;
                st.current.connection_quality = ConnectionQuality::Offline;
            }
        })
    }

    pub fn record_probe_success(&self, latency: Duration) -> Option<ConnectionState> {
        let slow = latency >= self.slow_threshold;
        self.transition(|st, now| {
            st.consecutive_failures = 0;
            if !st.current.is_online {
                st.current.is_online = true;
                st.current.last_online = now;
            }
            st.current.connection_quality = if slow {
                ConnectionQuality::Slow
            } else {
                ConnectionQuality::Good
            };
        })
    }

    pub fn record_probe_failure(&self) -> Option<ConnectionState> {
        let offline_after = self.offline_after;
        self.transition(|st, _| {
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            if !st.current.is_online {
                return;
            }
            if st.consecutive_failures >= offline_after {
                st.current.is_online = false;
                st.current.connection_quality = ConnectionQuality::Offline;
            } else {
                st.current.connection_quality = ConnectionQuality::Slow;
            }
        })
    }

    /// Run one probe and feed the result into the state machine.
    pub async fn check_once(
        &self,
        probe: &dyn ConnectivityProbe,
        timeout: Duration,
    ) -> Option<ConnectionState> {
        let start = Instant::now();
        match tokio::time::timeout(timeout, probe.probe()).await {
            Ok(Ok(())) => self.record_probe_success(start.elapsed()),
            Ok(Err(e)) => {
                log::debug!("Connectivity probe failed: {e}");
                self.record_probe_failure()
            }
            Err(_) => {
                log::debug!("Connectivity probe timed out after {timeout:?}");
                self.record_probe_failure()
            }
        }
    }

    /// Probe every `every` until `token` is cancelled.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        every: Duration,
        timeout: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.check_once(probe.as_ref(), timeout).await;
                    }
                }
            }
            log::debug!("Connectivity probe loop stopped");
        })
    }

    /// Restore a fresh state. Listeners stay registered.
    pub fn reset(&self, online: bool) {
        let signal = if online {
            PlatformSignal::Online
        } else {
            PlatformSignal::Offline
        };
        self.handle_platform_signal(signal);
        lock(&self.state).consecutive_failures = 0;
    }

    fn transition<F>(&self, apply: F) -> Option<ConnectionState>
    where
        F: FnOnce(&mut MonitorState, u64),
    {
        let _dispatch = lock(&self.dispatch);

        let changed = {
            let mut st = lock(&self.state);
            let before = st.current;
            apply(&mut st, self.clock.now_ms());
            if st.current.same_as(&before) {
                None
            } else {
                Some(st.current)
            }
        }?;

        log::info!(
            "Connection state changed: online={} quality={:?}",
            changed.is_online,
            changed.connection_quality
        );
        self.watch_tx.send_replace(changed);

        let listeners: Vec<Listener> = lock(&self.registry)
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&changed);
        }

        Some(changed)
    }
}
