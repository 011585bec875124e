use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::common::clock::SharedClock;
use crate::common::lock;
use crate::config::SyncConfig;
use crate::network::connectivity::{ConnectionMonitor, ConnectionState, Subscription};
use crate::network::error::{RemoteError, RetryError, SyncError};
use crate::network::rate_limit::{RateLimitInfo, RateLimiter};
use crate::network::remote::{ConnectivityProbe, RemoteExecutor};
use crate::network::retry::{RetryExecutor, RetryPolicy};
use crate::network::sync_status::{DrainRecord, SyncStatus};
use crate::optimistic::OptimisticUpdateManager;
use crate::storage::{
    DrainReport, DroppedAction, Mutation, OfflineQueue, OperationKind, QueueStore, QueuedAction,
    StorageError,
};

const EVENT_CAPACITY: usize = 256;

/// Per-call switches for [`SyncCoordinator::smart_sync_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub enable_retry: bool,
    pub enable_offline_queue: bool,
    pub enable_rate_limit: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            enable_retry: true,
            enable_offline_queue: true,
            enable_rate_limit: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// The remote accepted the write now.
    Executed(Value),
    /// The write was deferred to the offline queue.
    Queued { action_id: String },
    /// The remote refused the write; it was not queued.
    Rejected(RemoteError),
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConnectionChanged(ConnectionState),
    Executed {
        table: String,
        operation: OperationKind,
    },
    Queued {
        action_id: String,
        table: String,
        operation: OperationKind,
    },
    Rejected {
        table: String,
        operation: OperationKind,
        error: RemoteError,
    },
    /// A queued action was discarded for good.
    Dropped(DroppedAction),
    DrainFinished(DrainReport),
}

/// Result of [`SyncCoordinator::sync_optimistic`].
#[derive(Debug)]
pub enum OptimisticSync<T> {
    Confirmed(Value),
    /// Queued for later; the optimistic update stays pending.
    Pending { action_id: String },
    /// Remote rejection. `restored` is the state to put back.
    RolledBack {
        restored: Option<T>,
        error: RemoteError,
    },
    /// Local failure. `restored` is the state to put back.
    Failed {
        restored: Option<T>,
        error: SyncError,
    },
}

/// The engine's shared state, constructed once and owned by the coordinator.
pub struct SyncContext {
    pub config: SyncConfig,
    pub clock: SharedClock,
    pub monitor: Arc<ConnectionMonitor>,
    pub limiter: Arc<RateLimiter>,
    pub retry: Arc<RetryExecutor>,
    pub queue: Arc<OfflineQueue>,
}

impl SyncContext {
    pub async fn new(
        config: SyncConfig,
        clock: SharedClock,
        store: Arc<dyn QueueStore>,
        initially_online: bool,
    ) -> Self {
        let monitor = Arc::new(ConnectionMonitor::new(
            Arc::clone(&clock),
            &config,
            initially_online,
        ));
        let limiter = Arc::new(RateLimiter::from_config(Arc::clone(&clock), &config));
        let retry = Arc::new(RetryExecutor::new(
            RetryPolicy::from_config(&config),
            Arc::clone(&monitor),
        ));
        let queue = Arc::new(OfflineQueue::open(store, &config).await);

        Self {
            config,
            clock,
            monitor,
            limiter,
            retry,
            queue,
        }
    }

    /// Clear the queue and rate-limit counters.
    pub async fn reset(&self) -> Result<(), StorageError> {
        self.limiter.reset();
        self.queue.clear().await?;
        Ok(())
    }
}

struct Background {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    _subscription: Subscription,
}

/// Decides per write whether to execute now or defer, and drains the
/// offline queue when connectivity returns.
pub struct SyncCoordinator {
    ctx: SyncContext,
    remote: Arc<dyn RemoteExecutor>,
    events: broadcast::Sender<SyncEvent>,
    last_drain: Mutex<Option<DrainRecord>>,
    background: Mutex<Option<Background>>,
}

impl SyncCoordinator {
    pub fn new(ctx: SyncContext, remote: Arc<dyn RemoteExecutor>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            ctx,
            remote,
            events,
            last_drain: Mutex::new(None),
            background: Mutex::new(None),
        })
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.ctx.monitor
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.ctx.queue
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        self.ctx.monitor.get_connection_state()
    }

    pub fn get_queue_length(&self) -> usize {
        self.ctx.queue.len()
    }

    pub fn get_rate_limit_info(&self) -> RateLimitInfo {
        self.ctx.limiter.get_rate_limit_info()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            connection: self.get_connection_state(),
            queue_length: self.get_queue_length(),
            rate_limit: self.get_rate_limit_info(),
            draining: self.ctx.queue.is_draining(),
            last_drain: lock(&self.last_drain).clone(),
        }
    }

    /// Retry-wrapped invocation of an arbitrary remote call.
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.ctx.retry.run(op).await
    }

    pub async fn smart_sync(
        &self,
        table: &str,
        mutation: Mutation,
    ) -> Result<SyncOutcome, SyncError> {
        self.smart_sync_with(table, mutation, SyncOptions::default())
            .await
    }

    /// Execute a write now when connectivity and the rate limiter allow it,
    /// otherwise defer it to the offline queue.
    pub async fn smart_sync_with(
        &self,
        table: &str,
        mutation: Mutation,
        opts: SyncOptions,
    ) -> Result<SyncOutcome, SyncError> {
        if !self.ctx.monitor.is_online() {
            return self.defer(table, mutation, 0, None, opts, SyncError::Offline).await;
        }
        if opts.enable_rate_limit && !self.ctx.limiter.admit() {
            return self
                .defer(table, mutation, 0, None, opts, SyncError::RateLimited)
                .await;
        }

        let attempts = if opts.enable_retry {
            self.ctx.retry.policy().max_attempts
        } else {
            1
        };
        let remote = &self.remote;
        let result = self
            .ctx
            .retry
            .run_observed(attempts, || remote.execute(table, &mutation), |_, _| {})
            .await;

        let operation = mutation.kind();
        match result {
            Ok(value) => {
                self.emit(SyncEvent::Executed {
                    table: table.to_string(),
                    operation,
                });
                Ok(SyncOutcome::Executed(value))
            }
            Err(RetryError::NonRetryable { error, .. }) => {
                log::warn!("Remote rejected {operation} on {table}: {error}");
                self.emit(SyncEvent::Rejected {
                    table: table.to_string(),
                    operation,
                    error: error.clone(),
                });
                Ok(SyncOutcome::Rejected(error))
            }
            Err(err) => {
                if let RetryError::RateLimited { retry_after, .. } = &err {
                    self.ctx.limiter.record_server_rejection(*retry_after);
                }
                let attempts = err.attempts();
                let last = err.last_error();
                self.defer(table, mutation, attempts, last, opts, SyncError::Failed(err))
                    .await
            }
        }
    }

    async fn defer(
        &self,
        table: &str,
        mutation: Mutation,
        attempts: u32,
        last_error: Option<RemoteError>,
        opts: SyncOptions,
        otherwise: SyncError,
    ) -> Result<SyncOutcome, SyncError> {
        if !opts.enable_offline_queue {
            return Err(otherwise);
        }

        let operation = mutation.kind();
        let mut action = QueuedAction::new(table, mutation, self.ctx.clock.now_ms());
        action.retry_count = attempts;
        action.last_error = last_error.map(|e| e.to_string());
        let action_id = action.id.clone();

        if let Some(dropped) = self.ctx.queue.enqueue(action).await? {
            self.emit(SyncEvent::Dropped(dropped));
        }
        self.emit(SyncEvent::Queued {
            action_id: action_id.clone(),
            table: table.to_string(),
            operation,
        });
        Ok(SyncOutcome::Queued { action_id })
    }

    /// Apply `next` optimistically, sync the write, then confirm or roll back
    /// depending on the outcome. A queued write leaves the update pending.
    pub async fn sync_optimistic<T: Clone>(
        &self,
        updates: &OptimisticUpdateManager<T>,
        key: &str,
        prior: T,
        next: T,
        table: &str,
        mutation: Mutation,
    ) -> OptimisticSync<T> {
        updates.create_optimistic_update(key, prior, next);

        match self.smart_sync(table, mutation).await {
            Ok(SyncOutcome::Executed(value)) => {
                updates.confirm_optimistic_update(key);
                OptimisticSync::Confirmed(value)
            }
            Ok(SyncOutcome::Queued { action_id }) => OptimisticSync::Pending { action_id },
            Ok(SyncOutcome::Rejected(error)) => OptimisticSync::RolledBack {
                restored: updates.rollback_optimistic_update(key),
                error,
            },
            Err(error) => OptimisticSync::Failed {
                restored: updates.rollback_optimistic_update(key),
                error,
            },
        }
    }

    /// Run one drain pass against the remote. Returns `None` when offline or
    /// when a pass is already running.
    pub async fn drain_now(&self) -> Option<DrainReport> {
        if !self.ctx.monitor.is_online() {
            log::debug!("Offline, not draining");
            return None;
        }

        let remote = Arc::clone(&self.remote);
        let report = self
            .ctx
            .queue
            .drain(&self.ctx.limiter, &self.ctx.retry, move |action| {
                let remote = Arc::clone(&remote);
                async move { remote.execute(&action.table, &action.mutation).await }
            })
            .await?;

        log::info!(
            "Drain finished: succeeded={} failed={} deferred={} remaining={}",
            report.succeeded,
            report.failed,
            report.deferred,
            report.remaining
        );

        for dropped in &report.dropped {
            self.emit(SyncEvent::Dropped(dropped.clone()));
        }
        *lock(&self.last_drain) = Some(DrainRecord {
            finished_at_ms: self.ctx.clock.now_ms(),
            report: report.clone(),
        });
        self.emit(SyncEvent::DrainFinished(report.clone()));
        Some(report)
    }

    /// Subscribe to connection transitions, start the periodic drain trigger
    /// and, when a probe is given, the connectivity probe loop. Drains once
    /// immediately if already online.
    pub fn start(self: &Arc<Self>, probe: Option<Arc<dyn ConnectivityProbe>>) {
        let mut background = lock(&self.background);
        if background.is_some() {
            log::warn!("Sync coordinator already started");
            return;
        }

        let token = CancellationToken::new();
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel::<()>();

        let was_online = AtomicBool::new(self.ctx.monitor.is_online());
        let events = self.events.clone();
        let on_transition = trigger_tx.clone();
        let subscription = self.ctx.monitor.subscribe_to_connection(move |state| {
            let _ = events.send(SyncEvent::ConnectionChanged(*state));
            let previously = was_online.swap(state.is_online, Ordering::AcqRel);
            if state.is_online && !previously {
                let _ = on_transition.send(());
            }
        });

        let mut handles = vec![self.spawn_drain_loop(trigger_rx, token.clone())];
        if let Some(probe) = probe {
            handles.push(self.ctx.monitor.spawn_probe_loop(
                probe,
                self.ctx.config.probe_interval(),
                self.ctx.config.probe_timeout(),
                token.clone(),
            ));
        }

        if self.ctx.monitor.is_online() {
            let _ = trigger_tx.send(());
        }

        *background = Some(Background {
            token,
            handles,
            _subscription: subscription,
        });
        log::info!("Sync service initialized");
    }

    fn spawn_drain_loop(
        self: &Arc<Self>,
        mut triggers: mpsc::UnboundedReceiver<()>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let every = this.ctx.config.drain_interval();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let due = tokio::select! {
                    _ = token.cancelled() => break,
                    Some(()) = triggers.recv() => true,
                    _ = ticker.tick() => {
                        this.ctx.monitor.is_online() && !this.ctx.queue.is_empty()
                    }
                };
                if !due {
                    continue;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = this.drain_now() => {}
                }
            }
            log::debug!("Drain loop stopped");
        })
    }

    pub fn is_running(&self) -> bool {
        lock(&self.background).is_some()
    }

    /// Stop background tasks and drop the connection subscription.
    pub async fn shutdown(&self) {
        let background = lock(&self.background).take();
        let Some(background) = background else {
            return;
        };

        background.token.cancel();
        for handle in background.handles {
            if let Err(e) = handle.await {
                log::warn!("Background task ended abnormally: {e}");
            }
        }
        log::info!("Sync service stopped");
    }
}
