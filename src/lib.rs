// Offline-tolerant write synchronization
pub mod common;
pub mod config;
pub mod conflict;
pub mod network;
pub mod optimistic;
pub mod storage;

// Public exports
pub use config::{ConfigError, SyncConfig};
pub use conflict::{detect_conflict, resolve_conflict, ConflictStrategy};
pub use network::{
    ConnectionMonitor, ConnectionQuality, ConnectionState, RateLimiter, RemoteError,
    RetryExecutor, SyncContext, SyncCoordinator, SyncError, SyncEvent, SyncOptions, SyncOutcome,
};
pub use optimistic::{OptimisticStatus, OptimisticUpdate, OptimisticUpdateManager};
pub use storage::{Mutation, OfflineQueue, OperationKind, QueuedAction, StorageError};
