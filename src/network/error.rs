use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

/// Coarse class of a remote failure; decides retry and queueing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transport or server hiccup. Retried, then deferred to the queue.
    Transient,
    /// The remote asked us to slow down.
    RateLimited,
    /// Validation, conflict or permission failure. Never retried.
    Semantic,
}

/// Failure reported by the injected remote executor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout error")]
    Timeout,

    #[error("Server error: {0}")]
    Server(String),

    #[error("Rate limited by remote")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Auth error: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::Server(_) => {
                FailureClass::Transient
            }
            RemoteError::RateLimited { .. } => FailureClass::RateLimited,
            RemoteError::Validation(_)
            | RemoteError::Conflict(_)
            | RemoteError::Permission(_)
            | RemoteError::Auth(_) => FailureClass::Semantic,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Why a retry-wrapped call did not produce a value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError {
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: RemoteError },

    #[error("Offline, deferred after {attempts} attempts")]
    Offline {
        attempts: u32,
        last: Option<RemoteError>,
    },

    #[error("Rate limited by remote after {attempts} attempts")]
    RateLimited {
        attempts: u32,
        retry_after: Option<Duration>,
    },

    #[error("Rejected: {error}")]
    NonRetryable { attempts: u32, error: RemoteError },
}

impl RetryError {
    /// Attempts that ran to completion. An attempt abandoned because the
    /// connection dropped is not counted.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Offline { attempts, .. }
            | RetryError::RateLimited { attempts, .. }
            | RetryError::NonRetryable { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> Option<RemoteError> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last.clone()),
            RetryError::Offline { last, .. } => last.clone(),
            RetryError::RateLimited { retry_after, .. } => Some(RemoteError::RateLimited {
                retry_after: *retry_after,
            }),
            RetryError::NonRetryable { error, .. } => Some(error.clone()),
        }
    }
}

/// Local failures of `smart_sync` that are not a remote verdict.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No connection")]
    Offline,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Remote call failed: {0}")]
    Failed(RetryError),
}
