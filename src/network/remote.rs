use async_trait::async_trait;
use serde_json::Value;

use crate::network::error::RemoteError;
use crate::storage::Mutation;

/// The transport to the remote data store, supplied by the host application.
///
/// Implementations should be idempotent per action: a crash between a remote
/// success and the local dequeue replays the same mutation.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, table: &str, mutation: &Mutation) -> Result<Value, RemoteError>;
}

/// Liveness check used by the connection monitor's periodic probe.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> Result<(), RemoteError>;
}
