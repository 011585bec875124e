pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod rate_limit;
pub mod remote;
pub mod retry;
pub mod simulated;
pub mod sync_status;

pub use connectivity::{
    ConnectionMonitor, ConnectionQuality, ConnectionState, PlatformSignal, Subscription,
};
pub use coordinator::{
    OptimisticSync, SyncContext, SyncCoordinator, SyncEvent, SyncOptions, SyncOutcome,
};
pub use error::{FailureClass, RemoteError, RetryError, SyncError};
pub use rate_limit::{RateLimitInfo, RateLimitState, RateLimiter};
pub use remote::{ConnectivityProbe, RemoteExecutor};
pub use retry::{RetryExecutor, RetryPolicy};
pub use simulated::{SimulatedProbe, SimulatedRemote};
pub use sync_status::{DrainRecord, SyncStatus};
