use serde::Serialize;

use crate::network::connectivity::ConnectionState;
use crate::network::rate_limit::RateLimitInfo;
use crate::storage::DrainReport;

/// Outcome of the most recent completed drain pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainRecord {
    /// Completion time in milliseconds since `UNIX_EPOCH`.
    pub finished_at_ms: u64,
    pub report: DrainReport,
}

/// Aggregate, point-in-time view of the sync engine for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub connection: ConnectionState,
    /// Actions waiting in the offline queue.
    pub queue_length: usize,
    pub rate_limit: RateLimitInfo,
    /// True while a drain pass is in flight.
    pub draining: bool,
    pub last_drain: Option<DrainRecord>,
}

impl SyncStatus {
    pub fn has_pending_actions(&self) -> bool {
        self.queue_length > 0
    }

    pub fn is_slow_connection(&self) -> bool {
        self.connection.connection_quality == crate::network::ConnectionQuality::Slow
    }
}
