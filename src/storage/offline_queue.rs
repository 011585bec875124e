use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::network::{RateLimiter, RemoteError, RetryError, RetryExecutor};
use crate::storage::action::QueuedAction;
use crate::storage::error::StorageError;
use crate::storage::store::QueueStore;

/// What to do when an enqueue would exceed `max_queue_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    RejectNew,
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DropReason {
    /// `retry_count` reached `max_action_attempts`.
    AttemptsExhausted,
    /// The remote refused the action for a reason retrying cannot fix.
    Rejected(String),
    /// Evicted to make room under `OverflowStrategy::DropOldest`.
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedAction {
    pub action: QueuedAction,
    pub reason: DropReason,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Actions not attempted because the pass stopped early (rate limit or
    /// connection loss).
    pub deferred: usize,
    /// Queue length once the pass finished.
    pub remaining: usize,
    pub dropped: Vec<DroppedAction>,
}

/// Durable FIFO of pending writes.
///
/// Every mutation (enqueue, removal, failure bookkeeping) rewrites the whole
/// queue blob under a single storage key. The in-memory lock is held across
/// the write so blobs land in mutation order.
pub struct OfflineQueue {
    items: Mutex<VecDeque<QueuedAction>>,
    store: Arc<dyn QueueStore>,
    key: String,
    max_len: usize,
    strategy: OverflowStrategy,
    max_action_attempts: u32,
    len: AtomicUsize,
    processing: AtomicBool,
}

/// Releases the single-drain flag when a pass ends, including on panic or
/// cancellation of the draining future.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainGuard(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl OfflineQueue {
    /// Load the queue from `store`. A missing, unreadable or corrupt blob
    /// yields an empty queue.
    pub async fn open(store: Arc<dyn QueueStore>, config: &SyncConfig) -> Self {
        let key = config.queue_storage_key.clone();
        let items = Self::load_items(store.as_ref(), &key).await;
        if !items.is_empty() {
            log::info!("Loaded {} queued actions from '{}'", items.len(), key);
        }

        Self {
            len: AtomicUsize::new(items.len()),
            items: Mutex::new(items),
            store,
            key,
            max_len: config.max_queue_len,
            strategy: config.overflow,
            max_action_attempts: config.max_action_attempts,
            processing: AtomicBool::new(false),
        }
    }

    async fn load_items(store: &dyn QueueStore, key: &str) -> VecDeque<QueuedAction> {
        let bytes = match store.load(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return VecDeque::new(),
            Err(e) => {
                log::error!("Failed to read offline queue '{key}': {e}. Starting empty");
                return VecDeque::new();
            }
        };

        match serde_json::from_slice::<Vec<QueuedAction>>(&bytes) {
            Ok(actions) => actions.into(),
            Err(e) => {
                log::error!("Offline queue '{key}' is corrupt ({e}). Starting empty");
                VecDeque::new()
            }
        }
    }

    async fn persist(&self, items: &VecDeque<QueuedAction>) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(items)?;
        self.store.save(&self.key, &bytes).await?;
        self.len.store(items.len(), Ordering::Release);
        Ok(())
    }

    /// Persist after a change that has already happened remotely. Failing to
    /// write here cannot be undone, so it is logged rather than returned.
    async fn persist_logged(&self, items: &VecDeque<QueuedAction>) {
        self.len.store(items.len(), Ordering::Release);
        if let Err(e) = self.persist(items).await {
            log::error!("Error saving offline queue '{}': {e}", self.key);
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Snapshot of the queue, oldest first.
    pub async fn pending(&self) -> Vec<QueuedAction> {
        self.items.lock().await.iter().cloned().collect()
    }

    /// Append an action. Returns the evicted head when the queue was full and
    /// the strategy is `DropOldest`.
    pub async fn enqueue(
        &self,
        action: QueuedAction,
    ) -> Result<Option<DroppedAction>, StorageError> {
        let mut items = self.items.lock().await;

        let mut evicted = None;
        if items.len() >= self.max_len {
            match self.strategy {
                OverflowStrategy::RejectNew => {
                    log::warn!(
                        "Offline queue full ({} actions), rejecting {} on {}",
                        items.len(),
                        action.operation(),
                        action.table
                    );
                    return Err(StorageError::QueueFull(items.len()));
                }
                OverflowStrategy::DropOldest => {
                    evicted = items.pop_front();
                }
            }
        }

        let table = action.table.clone();
        let operation = action.operation();
        items.push_back(action);

        if let Err(e) = self.persist(&items).await {
            items.pop_back();
            if let Some(old) = evicted {
                items.push_front(old);
            }
            self.len.store(items.len(), Ordering::Release);
            return Err(e);
        }

        log::info!("Action queued for later: {table} {operation}");

        Ok(evicted.map(|action| {
            log::warn!("Dropped oldest queued action {} to make room", action.id);
            DroppedAction {
                action,
                reason: DropReason::Overflow,
            }
        }))
    }

    pub async fn remove(&self, id: &str) -> Option<QueuedAction> {
        let mut items = self.items.lock().await;
        let pos = items.iter().position(|a| a.id == id)?;
        let removed = items.remove(pos);
        self.persist_logged(&items).await;
        removed
    }

    /// Remove every queued action, returning how many were discarded. The
    /// in-memory queue is left intact if the stored blob cannot be removed.
    pub async fn clear(&self) -> Result<usize, StorageError> {
        let mut items = self.items.lock().await;
        let count = items.len();
        self.store.remove(&self.key).await?;
        items.clear();
        self.len.store(0, Ordering::Release);
        Ok(count)
    }

    /// Record `attempts` failed attempts against an action. Drops the action
    /// once the attempt ceiling is reached.
    async fn record_failure(
        &self,
        id: &str,
        attempts: u32,
        error: Option<&RemoteError>,
    ) -> Option<DroppedAction> {
        let mut items = self.items.lock().await;
        let pos = items.iter().position(|a| a.id == id)?;

        let exhausted = {
            let action = &mut items[pos];
            action.retry_count = action.retry_count.saturating_add(attempts);
            if let Some(err) = error {
                action.last_error = Some(err.to_string());
            }
            action.retry_count >= self.max_action_attempts
        };

        let dropped = if exhausted {
            items.remove(pos).map(|action| {
                log::error!(
                    "Action {} failed after {} attempts, dropping: {:?}",
                    action.id,
                    action.retry_count,
                    action.last_error
                );
                DroppedAction {
                    action,
                    reason: DropReason::AttemptsExhausted,
                }
            })
        } else {
            None
        };

        self.persist_logged(&items).await;
        dropped
    }

    async fn reject(&self, id: &str, error: &RemoteError) -> Option<DroppedAction> {
        let mut action = self.remove(id).await?;
        log::error!("Queued action {} rejected by remote: {error}", action.id);
        action.last_error = Some(error.to_string());
        Some(DroppedAction {
            action,
            reason: DropReason::Rejected(error.to_string()),
        })
    }

    /// Replay queued actions oldest-first.
    ///
    /// Each action needs the connection to be up and rate-limiter admission;
    /// the first miss on either ends the pass with the rest left in order. A transient failure is recorded and
    /// the pass moves on to the next action. Returns `None` when another pass
    /// is already running.
    pub async fn drain<F, Fut>(
        &self,
        limiter: &RateLimiter,
        retry: &RetryExecutor,
        mut execute: F,
    ) -> Option<DrainReport>
    where
        F: FnMut(QueuedAction) -> Fut,
        Fut: Future<Output = Result<Value, RemoteError>>,
    {
        let Some(_guard) = DrainGuard::acquire(&self.processing) else {
            log::debug!("Drain already in progress, skipping");
            return None;
        };

        // Actions enqueued after this point wait for the next pass.
        let snapshot = self.pending().await;
        let total = snapshot.len();
        let mut report = DrainReport::default();

        log::info!("Processing {total} queued actions...");

        for (idx, action) in snapshot.iter().enumerate() {
            if !retry.monitor().is_online() {
                report.deferred = total - idx;
                log::info!("Offline, deferring {} queued actions", report.deferred);
                break;
            }
            if !limiter.admit() {
                report.deferred = total - idx;
                log::warn!("Rate limit reached, deferring {} queued actions", report.deferred);
                break;
            }

            match retry.run(|| execute(action.clone())).await {
                Ok(_) => {
                    self.remove(&action.id).await;
                    report.succeeded += 1;
                    log::info!("Queued action executed: {} {}", action.table, action.operation());
                }
                Err(RetryError::NonRetryable { error, .. }) => {
                    report.failed += 1;
                    report.dropped.extend(self.reject(&action.id, &error).await);
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    report.failed += 1;
                    report
                        .dropped
                        .extend(self.record_failure(&action.id, attempts, Some(&last)).await);
                }
                Err(RetryError::Offline { attempts: 0, .. }) => {
                    // Nothing completed, so the action was never really tried.
                    report.deferred = total - idx;
                    log::warn!("Connection lost during drain, stopping pass");
                    break;
                }
                Err(RetryError::Offline { attempts, last }) => {
                    report.failed += 1;
                    report
                        .dropped
                        .extend(self.record_failure(&action.id, attempts, last.as_ref()).await);
                    report.deferred = total - idx - 1;
                    log::warn!("Connection lost during drain, stopping pass");
                    break;
                }
                Err(RetryError::RateLimited { attempts, retry_after }) => {
                    limiter.record_server_rejection(retry_after);
                    report.failed += 1;
                    let err = RemoteError::RateLimited { retry_after };
                    report
                        .dropped
                        .extend(self.record_failure(&action.id, attempts, Some(&err)).await);
                    report.deferred = total - idx - 1;
                    break;
                }
            }
        }

        report.remaining = self.len();
        if report.remaining > 0 {
            log::info!("{} actions still pending", report.remaining);
        }
        Some(report)
    }
}
