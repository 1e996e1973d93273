//! Breaker-gated retry wrapper around external calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use crate::config::CircuitConfig;
use crate::error::DispatchResult;
use crate::monitoring::PerformanceMonitor;
use crate::resilience::circuit::CircuitBreakerTable;
use crate::stores::{topics, AuditSink};

/// Runs operations under a circuit breaker with measured, linearly delayed
/// retries.
///
/// Each attempt is wrapped in the performance meter. Attempts that observe
/// an open circuit fail fast without consuming the retry budget;
/// non-retryable errors rethrow immediately without counting toward the
/// breaker.
pub struct ResilientExecutor {
    config: CircuitConfig,
    breakers: Arc<CircuitBreakerTable>,
    monitor: Arc<PerformanceMonitor>,
    sink: Arc<dyn AuditSink>,
}

impl ResilientExecutor {
    /// Create an executor over an existing breaker table.
    pub fn new(
        config: CircuitConfig,
        breakers: Arc<CircuitBreakerTable>,
        monitor: Arc<PerformanceMonitor>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            breakers,
            monitor,
            sink,
        }
    }

    /// Run `f` under the breaker keyed (`op`, `id`), retrying retryable
    /// failures up to the configured budget with a delay of
    /// `base_delay · attempt` between attempts.
    pub async fn run<T, F, Fut>(&self, op: &str, id: &str, f: F) -> DispatchResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.config.retries.max(1) {
            self.breakers.check(op, id)?;

            match self.monitor.measure(op, || f()).await {
                Ok(value) => {
                    self.breakers.record_success(op, id);
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    self.breakers.record_failure(op, id, &err);
                    tracing::warn!(
                        op,
                        id,
                        attempt,
                        retries = self.config.retries,
                        error = %err,
                        "attempt failed"
                    );
                    last_error = Some(err);

                    if attempt < self.config.retries {
                        sleep(Duration::from_millis(
                            self.config.base_delay_ms * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }

        let err = last_error.expect("retry loop always records an error before exiting");
        tracing::error!(op, id, error = %err, "all attempts exhausted");
        let record = serde_json::json!({
            "subject": format!("{op}:{id}"),
            "action": "retries_exhausted",
            "metadata": { "op": op, "id": id, "error": err.to_string() },
            "instant": Utc::now(),
        });
        if let Err(log_err) = self.sink.append(topics::SECURITY_LOGS, record).await {
            tracing::warn!(error = %log_err, "failed to persist critical action");
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PerformanceConfig, ResourceLimits};
    use crate::domain::Recipient;
    use crate::error::DispatchError;
    use crate::notify::Notifier;
    use crate::resilience::circuit::CircuitState;
    use crate::stores::MemoryAuditSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(config: CircuitConfig) -> (ResilientExecutor, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        let notifier = Arc::new(Notifier::new(sink.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(
            PerformanceConfig::default(),
            ResourceLimits::default().heap_bytes,
            notifier,
            sink.clone(),
            Recipient::admin("ops", "ops@example.com"),
        ));
        let breakers = Arc::new(CircuitBreakerTable::new(config.clone()));
        (
            ResilientExecutor::new(config, breakers, monitor, sink.clone()),
            sink,
        )
    }

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            base_delay_ms: 1,
            ..CircuitConfig::default()
        }
    }

    #[tokio::test]
    async fn first_attempt_success_needs_no_retry() {
        let (executor, _) = executor(fast_config());
        let calls = AtomicU32::new(0);
        let value = executor
            .run("op", "k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            })
            .await
            .unwrap();
        assert_eq!(value, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_to_success() {
        let (executor, _) = executor(fast_config());
        let calls = AtomicU32::new(0);
        let value = executor
            .run("op", "k", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DispatchError::transient("flaky"))
                } else {
                    Ok(1)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_rethrow_immediately() {
        let (executor, _) = executor(fast_config());
        let calls = AtomicU32::new(0);
        let result: DispatchResult<()> = executor
            .run("op", "k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DispatchError::NotFound {
                    what: "drivers".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(DispatchError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Missing entities do not trip the breaker.
        assert_eq!(executor.breakers.state("op", "k"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn exhausted_retries_log_a_critical_action() {
        let (executor, sink) = executor(fast_config());
        let result: DispatchResult<()> = executor
            .run("op", "k", || async {
                Err(DispatchError::transient("always down"))
            })
            .await;

        assert!(result.is_err());
        let logs = sink.records_for(topics::SECURITY_LOGS);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].record["action"], "retries_exhausted");
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_invoking_work() {
        let (executor, _) = executor(CircuitConfig {
            max_failures: 2,
            base_delay_ms: 1,
            retries: 2,
            ..CircuitConfig::default()
        });

        // Two failed runs of one attempt each trip the breaker.
        for _ in 0..2 {
            let _ = executor
                .run("op", "k", || async {
                    Err::<(), _>(DispatchError::transient("down"))
                })
                .await;
        }
        assert_eq!(executor.breakers.state("op", "k"), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: DispatchResult<()> = executor
            .run("op", "k", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(DispatchError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
