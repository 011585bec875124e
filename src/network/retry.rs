use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::network::connectivity::{ConnectionMonitor, ConnectionState};
use crate::network::error::{FailureClass, RemoteError, RetryError};

/// Attempt budget and the fixed backoff schedule between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.max_retries, config.retry_delays())
    }

    /// Wait after the `completed`-th failed attempt. The last entry repeats
    /// once the schedule runs out.
    pub fn delay_after(&self, completed: u32) -> Duration {
        let idx = completed.saturating_sub(1) as usize;
        self.delays
            .get(idx)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Runs a remote call with bounded backoff retry.
///
/// Only transient failures are retried. The sequence is abandoned as soon as
/// the connection monitor reports offline, including while a call or a
/// backoff wait is in flight.
pub struct RetryExecutor {
    policy: RetryPolicy,
    monitor: Arc<ConnectionMonitor>,
}

async fn wait_offline(rx: &mut watch::Receiver<ConnectionState>) {
    if rx.wait_for(|s| !s.is_online).await.is_err() {
        // Monitor gone: nothing will ever report offline.
        std::future::pending::<()>().await;
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, monitor: Arc<ConnectionMonitor>) -> Self {
        Self { policy, monitor }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        self.run_observed(self.policy.max_attempts, op, |_, _| {})
            .await
    }

    /// Like [`run`](Self::run) with an explicit attempt budget and an observer
    /// called with `(attempt, error)` before each backoff wait.
    pub async fn run_observed<T, F, Fut, O>(
        &self,
        max_attempts: u32,
        mut op: F,
        mut on_retry: O,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
        O: FnMut(u32, &RemoteError),
    {
        let max_attempts = max_attempts.max(1);
        let mut offline = self.monitor.watch();
        let mut last: Option<RemoteError> = None;
        let mut completed: u32 = 0;

        loop {
            if !self.monitor.is_online() {
                return Err(RetryError::Offline {
                    attempts: completed,
                    last,
                });
            }

            let result = tokio::select! {
                biased;
                r = op() => r,
                _ = wait_offline(&mut offline) => {
                    log::info!("Connection lost mid-call, abandoning attempt {}", completed + 1);
                    return Err(RetryError::Offline { attempts: completed, last });
                }
            };
            completed += 1;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err.class() {
                FailureClass::Semantic => {
                    return Err(RetryError::NonRetryable {
                        attempts: completed,
                        error: err,
                    })
                }
                FailureClass::RateLimited => {
                    let retry_after = match err {
                        RemoteError::RateLimited { retry_after } => retry_after,
                        _ => None,
                    };
                    return Err(RetryError::RateLimited {
                        attempts: completed,
                        retry_after,
                    });
                }
                FailureClass::Transient => {}
            }

            if completed >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: completed,
                    last: err,
                });
            }
            if !self.monitor.is_online() {
                return Err(RetryError::Offline {
                    attempts: completed,
                    last: Some(err),
                });
            }

            let delay = self.policy.delay_after(completed);
            log::info!(
                "Retry {}/{} in {}ms...",
                completed,
                max_attempts - 1,
                delay.as_millis()
            );
            on_retry(completed, &err);
            last = Some(err);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_offline(&mut offline) => {
                    return Err(RetryError::Offline { attempts: completed, last });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::network::connectivity::PlatformSignal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn executor() -> (Arc<ConnectionMonitor>, RetryExecutor) {
        let clock = Arc::new(ManualClock::new(0));
        let monitor = Arc::new(ConnectionMonitor::new(
            clock,
            &SyncConfig::default(),
            true,
        ));
        let exec = RetryExecutor::new(RetryPolicy::default(), monitor.clone());
        (monitor, exec)
    }

    fn assert_close(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    #[test]
    fn delay_schedule_repeats_last_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(3_000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(10_000));
        assert_eq!(policy.delay_after(7), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_call_stops_after_budget_with_fixed_waits() {
        let (_monitor, exec) = executor();
        let started = Instant::now();
        let mut stamps = Vec::new();

        let res: Result<(), _> = exec
            .run(|| {
                stamps.push(started.elapsed());
                async { Err(RemoteError::Network("down".into())) }
            })
            .await;

        match res {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, RemoteError::Network("down".into()));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(stamps.len(), 3);
        assert_close(stamps[0], 0);
        assert_close(stamps[1], 1_000);
        assert_close(stamps[2], 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn longer_budget_uses_full_schedule() {
        let (_monitor, exec) = executor();
        let started = Instant::now();
        let mut stamps = Vec::new();
        let mut observed = Vec::new();

        let _: Result<(), _> = exec
            .run_observed(
                4,
                || {
                    stamps.push(started.elapsed());
                    async { Err(RemoteError::Timeout) }
                },
                |attempt, _| observed.push(attempt),
            )
            .await;

        assert_eq!(observed, vec![1, 2, 3]);
        assert_close(stamps[3], 14_000);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let (_monitor, exec) = executor();
        let calls = AtomicU32::new(0);

        let res = exec
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RemoteError::Server("502".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(res.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn semantic_failure_is_not_retried() {
        let (_monitor, exec) = executor();
        let calls = AtomicU32::new(0);

        let res: Result<(), _> = exec
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::Validation("bad".into())) }
            })
            .await;

        assert!(matches!(
            res,
            Err(RetryError::NonRetryable { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_rate_limit_stops_retrying() {
        let (_monitor, exec) = executor();
        let res: Result<(), _> = exec
            .run(|| async {
                Err(RemoteError::RateLimited {
                    retry_after: Some(Duration::from_secs(5)),
                })
            })
            .await;

        assert_eq!(
            res.unwrap_err(),
            RetryError::RateLimited {
                attempts: 1,
                retry_after: Some(Duration::from_secs(5)),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_after_first_attempt_short_circuits() {
        let (monitor, exec) = executor();
        let calls = AtomicU32::new(0);

        let res: Result<(), _> = exec
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                monitor.handle_platform_signal(PlatformSignal::Offline);
                async { Err(RemoteError::Network("no route".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match res {
            Err(RetryError::Offline { attempts, last }) => {
                assert_eq!(attempts, 1);
                assert_eq!(last, Some(RemoteError::Network("no route".into())));
            }
            other => panic!("expected Offline, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn going_offline_during_backoff_cancels_wait() {
        let (monitor, exec) = executor();
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let flip = {
            let monitor = monitor.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                monitor.handle_platform_signal(PlatformSignal::Offline);
            }
        };

        let run = exec.run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RemoteError::Timeout) }
        });

        let (res, _) = tokio::join!(run, flip);
        assert!(matches!(res, Err(RetryError::Offline { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_call_is_abandoned_when_offline() {
        let (monitor, exec) = executor();

        let flip = {
            let monitor = monitor.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                monitor.handle_platform_signal(PlatformSignal::Offline);
            }
        };

        let run = exec.run(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, RemoteError>(())
        });

        let (res, _) = tokio::join!(run, flip);
        assert_eq!(
            res.unwrap_err(),
            RetryError::Offline {
                attempts: 0,
                last: None
            }
        );
    }

    #[tokio::test]
    async fn offline_before_first_attempt_makes_no_call() {
        let (monitor, exec) = executor();
        monitor.handle_platform_signal(PlatformSignal::Offline);
        let calls = AtomicU32::new(0);

        let res: Result<(), _> = exec
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(res, Err(RetryError::Offline { attempts: 0, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
