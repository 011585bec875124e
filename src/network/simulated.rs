use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::common::lock;
use crate::network::error::RemoteError;
use crate::network::remote::{ConnectivityProbe, RemoteExecutor};
use crate::storage::Mutation;

type Table = BTreeMap<String, Map<String, Value>>;

/// In-process stand-in for a remote table store.
///
/// Rows are keyed by the display form of `id`; the stored body keeps the id as
/// sent. Every operation is idempotent for a given payload, so replaying an
/// action leaves the same state as running it once. Inserts without an id are
/// rejected, since a server-generated key would differ on replay. Failures
/// can be scripted (consumed in order) or injected at random.
pub struct SimulatedRemote {
    tables: Mutex<HashMap<String, Table>>,
    script: Mutex<VecDeque<RemoteError>>,
    failure_rate: f64,
    latency: Duration,
    calls: AtomicUsize,
}

impl Default for SimulatedRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedRemote {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            script: Mutex::new(VecDeque::new()),
            failure_rate: 0.0,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail this fraction of calls with a transient network error.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a failure returned by the next call that is not already
    /// consuming an earlier scripted failure.
    pub fn push_failure(&self, err: RemoteError) {
        lock(&self.script).push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn row(&self, table: &str, id: &str) -> Option<Map<String, Value>> {
        lock(&self.tables).get(table)?.get(id).cloned()
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.tables).get(table).map_or(0, |t| t.len())
    }

    pub fn snapshot(&self) -> HashMap<String, BTreeMap<String, Map<String, Value>>> {
        lock(&self.tables).clone()
    }

    /// Apply a mutation directly, bypassing latency and failure injection.
    pub fn apply(&self, table: &str, mutation: &Mutation) -> Result<Value, RemoteError> {
        let mut tables = lock(&self.tables);
        let rows = tables.entry(table.to_string()).or_default();

        match mutation {
            Mutation::Insert(record) => {
                let id = record
                    .id()
                    .ok_or_else(|| {
                        RemoteError::Validation("insert requires an id".to_string())
                    })?
                    .to_string();
                let body = record.fields().clone();
                if rows.get(&id).is_some_and(|existing| *existing != body) {
                    return Err(RemoteError::Conflict(format!(
                        "duplicate key {id} in {table}"
                    )));
                }
                rows.insert(id, body.clone());
                Ok(Value::Object(body))
            }
            Mutation::Upsert(record) => {
                let id = record.id().ok_or_else(|| {
                    RemoteError::Validation("upsert requires an id".to_string())
                })?;
                rows.insert(id.to_string(), record.fields().clone());
                Ok(Value::Object(record.fields().clone()))
            }
            Mutation::Update(patch) => match rows.get_mut(&patch.id.to_string()) {
                Some(row) => {
                    for (k, v) in &patch.fields {
                        row.insert(k.clone(), v.clone());
                    }
                    Ok(Value::Object(row.clone()))
                }
                None => Ok(Value::Null),
            },
            Mutation::Delete(target) => {
                rows.remove(&target.id.to_string());
                Ok(Value::Null)
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for SimulatedRemote {
    async fn execute(&self, table: &str, mutation: &Mutation) -> Result<Value, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(err) = lock(&self.script).pop_front() {
            return Err(err);
        }
        if self.failure_rate > 0.0 && rand::random::<f64>() < self.failure_rate {
            return Err(RemoteError::Network("simulated packet loss".to_string()));
        }

        self.apply(table, mutation)
    }
}

/// Probe whose reachability and latency are set by the caller.
pub struct SimulatedProbe {
    reachable: AtomicBool,
    latency: Mutex<Duration>,
}

impl SimulatedProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }
}

#[async_trait]
impl ConnectivityProbe for SimulatedProbe {
    async fn probe(&self) -> Result<(), RemoteError> {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Network("unreachable".to_string()))
        }
    }
}
