//! Per-operation performance measurement and alerting.
//!
//! Every measured operation records duration, memory delta, and outcome
//! into a bounded per-operation ring buffer. Operations that blow past the
//! configured thresholds emit a typed alert that is persisted and forwarded
//! to operators. Reports aggregate the buffers into per-operation stats and
//! a coarse system-health bucket.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::config::PerformanceConfig;
use crate::domain::Recipient;
use crate::error::DispatchResult;
use crate::notify::{Channel, Message, Notifier, Severity};
use crate::stores::{topics, AuditSink};

const SERIES_MAX: usize = 200;
const SERIES_KEEP: usize = 100;

/// Error detail stored per failed sample is truncated to this many chars.
const ERROR_DETAIL_MAX: usize = 500;

/// Resident-set size of this process in bytes; 0 where unavailable.
pub fn memory_snapshot() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = resident.parse::<u64>() {
                    return pages * 4096;
                }
            }
        }
    }
    0
}

/// Approximate machine CPU utilization percent from the 1-minute load
/// average, normalized by core count; 0 where unavailable.
pub fn cpu_snapshot() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
            if let Some(load1) = loadavg.split_whitespace().next() {
                if let Ok(load) = load1.parse::<f64>() {
                    return ((load / cores) * 100.0).min(100.0) as u64;
                }
            }
        }
    }
    0
}

/// One recorded measurement.
#[derive(Debug, Clone, Serialize)]
pub struct OperationSample {
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,

    /// Resident memory growth during the operation, in bytes.
    pub mem_delta_bytes: i64,

    /// Whether the operation succeeded.
    pub success: bool,

    /// Error message for failed operations.
    pub error: Option<String>,

    /// Truncated error detail for failed operations.
    pub detail: Option<String>,

    /// When the sample was recorded.
    pub at: DateTime<Utc>,
}

/// Aggregate for one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    /// Samples recorded (bounded by the ring buffer).
    pub count: usize,

    /// Fraction of samples that succeeded.
    pub success_rate: f64,

    /// Mean duration in ms.
    pub avg_duration_ms: f64,

    /// Fastest sample in ms.
    pub min_duration_ms: u64,

    /// Slowest sample in ms.
    pub max_duration_ms: u64,

    /// Mean memory delta in bytes.
    pub avg_mem_delta_bytes: f64,

    /// Up to the last five error messages.
    pub recent_errors: Vec<String>,
}

/// Coarse system-health bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemHealth {
    /// Operating normally.
    Good,
    /// Degraded but acceptable.
    Fair,
    /// Needs operator attention.
    Warning,
    /// Actively failing.
    Critical,
}

/// Full performance report.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    /// When the report was generated.
    pub generated_at: DateTime<Utc>,

    /// Health bucket from the last hour of samples.
    pub system_health: SystemHealth,

    /// Current resident memory in bytes.
    pub memory_bytes: u64,

    /// Per-operation aggregates.
    pub operations: std::collections::HashMap<String, OperationReport>,
}

/// Measures operations and raises threshold alerts.
pub struct PerformanceMonitor {
    config: PerformanceConfig,
    memory_limit_bytes: u64,
    series: DashMap<String, Vec<OperationSample>>,
    notifier: Arc<Notifier>,
    sink: Arc<dyn AuditSink>,
    ops_recipient: Recipient,
}

impl PerformanceMonitor {
    /// Create a monitor alerting `ops_recipient` through `notifier`.
    pub fn new(
        config: PerformanceConfig,
        memory_limit_bytes: u64,
        notifier: Arc<Notifier>,
        sink: Arc<dyn AuditSink>,
        ops_recipient: Recipient,
    ) -> Self {
        Self {
            config,
            memory_limit_bytes,
            series: DashMap::new(),
            notifier,
            sink,
            ops_recipient,
        }
    }

    /// Run `f`, recording duration, memory delta, and outcome under `op`.
    /// Failures are recorded and propagated unchanged.
    pub async fn measure<T, F, Fut>(&self, op: &str, f: F) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        let started = Instant::now();
        let mem_before = memory_snapshot();

        let outcome = f().await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let mem_delta = memory_snapshot() as i64 - mem_before as i64;

        match &outcome {
            Ok(_) => {
                self.record(op, OperationSample {
                    duration_ms,
                    mem_delta_bytes: mem_delta,
                    success: true,
                    error: None,
                    detail: None,
                    at: Utc::now(),
                });
                self.check_thresholds(op, duration_ms, mem_delta).await;
            }
            Err(err) => {
                let mut detail = format!("{err:?}");
                detail.truncate(ERROR_DETAIL_MAX);
                self.record(op, OperationSample {
                    duration_ms,
                    mem_delta_bytes: mem_delta,
                    success: false,
                    error: Some(err.to_string()),
                    detail: Some(detail),
                    at: Utc::now(),
                });
            }
        }
        outcome
    }

    /// Aggregate the ring buffers into a report.
    pub fn report(&self) -> PerformanceReport {
        let mut operations = std::collections::HashMap::new();

        for entry in self.series.iter() {
            let samples = entry.value();
            if samples.is_empty() {
                continue;
            }
            let count = samples.len();
            let successes = samples.iter().filter(|s| s.success).count();
            let total_ms: u64 = samples.iter().map(|s| s.duration_ms).sum();
            let recent_errors: Vec<String> = samples
                .iter()
                .rev()
                .filter_map(|s| s.error.clone())
                .take(5)
                .collect();

            operations.insert(
                entry.key().clone(),
                OperationReport {
                    count,
                    success_rate: successes as f64 / count as f64,
                    avg_duration_ms: total_ms as f64 / count as f64,
                    min_duration_ms: samples.iter().map(|s| s.duration_ms).min().unwrap_or(0),
                    max_duration_ms: samples.iter().map(|s| s.duration_ms).max().unwrap_or(0),
                    avg_mem_delta_bytes: samples.iter().map(|s| s.mem_delta_bytes).sum::<i64>()
                        as f64
                        / count as f64,
                    recent_errors,
                },
            );
        }

        let memory_bytes = memory_snapshot();
        PerformanceReport {
            generated_at: Utc::now(),
            system_health: self.health_bucket(memory_bytes),
            memory_bytes,
            operations,
        }
    }

    fn health_bucket(&self, memory_bytes: u64) -> SystemHealth {
        let hour_ago = Utc::now() - Duration::hours(1);
        let mut recent = 0usize;
        let mut failures = 0usize;
        let mut total_ms = 0u64;

        for entry in self.series.iter() {
            for sample in entry.value().iter().filter(|s| s.at >= hour_ago) {
                recent += 1;
                total_ms += sample.duration_ms;
                if !sample.success {
                    failures += 1;
                }
            }
        }

        let error_rate = if recent == 0 {
            0.0
        } else {
            failures as f64 / recent as f64
        };
        let avg_ms = if recent == 0 {
            0.0
        } else {
            total_ms as f64 / recent as f64
        };
        let alert_ms = self.config.response_time_alert_ms as f64;

        if error_rate > 0.5 || memory_bytes > self.memory_limit_bytes {
            SystemHealth::Critical
        } else if error_rate > 0.25
            || avg_ms > alert_ms
            || memory_bytes as f64 > self.memory_limit_bytes as f64 * 0.9
        {
            SystemHealth::Warning
        } else if error_rate > 0.1 || avg_ms > alert_ms / 2.0 {
            SystemHealth::Fair
        } else {
            SystemHealth::Good
        }
    }

    fn record(&self, op: &str, sample: OperationSample) {
        let mut series = self.series.entry(op.to_string()).or_default();
        series.push(sample);
        if series.len() > SERIES_MAX {
            let excess = series.len() - SERIES_KEEP;
            series.drain(0..excess);
        }
    }

    async fn check_thresholds(&self, op: &str, duration_ms: u64, mem_delta: i64) {
        let slow = duration_ms > self.config.response_time_alert_ms;
        let hungry = mem_delta > self.config.memory_alert_bytes as i64;
        if !slow && !hungry {
            return;
        }

        let alert_type = if slow { "slow_operation" } else { "memory_spike" };
        tracing::warn!(op, duration_ms, mem_delta, alert_type, "performance threshold exceeded");

        let record = serde_json::json!({
            "id": Uuid::new_v4().to_string(),
            "type": alert_type,
            "op": op,
            "details": {
                "duration_ms": duration_ms,
                "mem_delta_bytes": mem_delta,
                "response_time_alert_ms": self.config.response_time_alert_ms,
                "memory_alert_bytes": self.config.memory_alert_bytes,
            },
            "instant": Utc::now(),
        });
        if let Err(err) = self.sink.append(topics::PERFORMANCE_ALERTS, record).await {
            tracing::warn!(error = %err, "failed to persist performance alert");
        }

        // Alert forwarding is fire-and-forget: a failing notifier must not
        // take down the measurement path.
        let message = Message::new(
            format!("Performance alert: {op}"),
            format!("{alert_type}: {duration_ms} ms, mem delta {mem_delta} bytes"),
        );
        self.notifier
            .send(
                &self.ops_recipient,
                &message,
                Severity::Normal,
                &[Channel::Email, Channel::Chat],
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::notify::MemoryAdapter;
    use crate::stores::MemoryAuditSink;

    fn monitor_with(
        config: PerformanceConfig,
    ) -> (Arc<PerformanceMonitor>, Arc<MemoryAuditSink>, Arc<MemoryAdapter>) {
        let sink = Arc::new(MemoryAuditSink::default());
        let email = Arc::new(MemoryAdapter::new(Channel::Email));
        let mut notifier = Notifier::new(sink.clone());
        notifier.register_adapter(email.clone());
        notifier.register_adapter(Arc::new(MemoryAdapter::new(Channel::Chat)));

        let monitor = Arc::new(PerformanceMonitor::new(
            config,
            536_870_912,
            Arc::new(notifier),
            sink.clone(),
            Recipient::admin("ops", "ops@example.com"),
        ));
        (monitor, sink, email)
    }

    #[tokio::test]
    async fn success_records_a_sample() {
        let (monitor, _, _) = monitor_with(PerformanceConfig::default());
        let value = monitor.measure("op", || async { Ok(5) }).await.unwrap();
        assert_eq!(value, 5);

        let report = monitor.report();
        let op = &report.operations["op"];
        assert_eq!(op.count, 1);
        assert_eq!(op.success_rate, 1.0);
    }

    #[tokio::test]
    async fn failure_records_and_propagates() {
        let (monitor, _, _) = monitor_with(PerformanceConfig::default());
        let result: DispatchResult<()> = monitor
            .measure("op", || async {
                Err(DispatchError::transient("backend down"))
            })
            .await;
        assert!(result.is_err());

        let report = monitor.report();
        let op = &report.operations["op"];
        assert_eq!(op.success_rate, 0.0);
        assert_eq!(op.recent_errors.len(), 1);
        assert!(op.recent_errors[0].contains("backend down"));
    }

    #[tokio::test]
    async fn slow_operation_raises_alert() {
        let (monitor, sink, email) = monitor_with(PerformanceConfig {
            response_time_alert_ms: 0,
            ..PerformanceConfig::default()
        });
        monitor
            .measure("slow", || async {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(sink.records_for(topics::PERFORMANCE_ALERTS).len(), 1);
        assert_eq!(email.delivered().len(), 1);
    }

    #[tokio::test]
    async fn fast_operation_raises_nothing() {
        let (monitor, sink, _) = monitor_with(PerformanceConfig::default());
        monitor.measure("fast", || async { Ok(()) }).await.unwrap();
        assert!(sink.records_for(topics::PERFORMANCE_ALERTS).is_empty());
    }

    #[tokio::test]
    async fn ring_buffer_trims_at_bound() {
        let (monitor, _, _) = monitor_with(PerformanceConfig::default());
        for _ in 0..201 {
            monitor.measure("op", || async { Ok(()) }).await.unwrap();
        }
        assert_eq!(monitor.report().operations["op"].count, 100);
    }

    #[tokio::test]
    async fn healthy_series_reports_good() {
        let (monitor, _, _) = monitor_with(PerformanceConfig::default());
        for _ in 0..10 {
            monitor.measure("op", || async { Ok(()) }).await.unwrap();
        }
        assert_eq!(monitor.report().system_health, SystemHealth::Good);
    }

    #[tokio::test]
    async fn heavy_failures_degrade_health() {
        let (monitor, _, _) = monitor_with(PerformanceConfig::default());
        for _ in 0..10 {
            let _ = monitor
                .measure("op", || async {
                    Err::<(), _>(DispatchError::transient("x"))
                })
                .await;
        }
        assert_eq!(monitor.report().system_health, SystemHealth::Critical);
    }
}
