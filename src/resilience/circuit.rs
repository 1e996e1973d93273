//! Failure-counted circuit breakers keyed by (operation, identifier).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::CircuitConfig;
use crate::error::{DispatchError, DispatchResult};

const ERROR_LOG_MAX: usize = 50;
const ERROR_LOG_KEEP: usize = 25;

/// Detail stored per error fingerprint is truncated to this many chars.
const ERROR_DETAIL_MAX: usize = 500;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Requests pass through.
    Closed,
    /// Requests fail fast until the reset deadline.
    Open,
    /// One trial request probes recovery.
    HalfOpen,
}

/// Fingerprint of one recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPattern {
    /// Error message.
    pub message: String,

    /// Truncated error detail.
    pub detail: String,

    /// When the failure happened.
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failures: u32,
    reset_at: Option<Instant>,
    errors: Vec<ErrorPattern>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            reset_at: None,
            errors: Vec::new(),
        }
    }
}

/// Operator-facing view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker key (`operation:id`).
    pub key: String,

    /// Current state.
    pub state: CircuitState,

    /// Consecutive failure count.
    pub failures: u32,

    /// Recorded error fingerprints.
    pub recorded_errors: usize,
}

/// Table of circuit breakers, one per (operation, identifier) pair.
///
/// State transitions for a given key are serialized by the underlying
/// map's per-entry locking; two concurrent failures on one key either both
/// count toward the open threshold or the second observes the open state.
pub struct CircuitBreakerTable {
    config: CircuitConfig,
    breakers: DashMap<String, BreakerEntry>,
}

impl CircuitBreakerTable {
    /// Create an empty table.
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn key(op: &str, id: &str) -> String {
        format!("{op}:{id}")
    }

    /// Gate a request. Open breakers reject until their reset deadline,
    /// then admit one half-open trial.
    pub fn check(&self, op: &str, id: &str) -> DispatchResult<()> {
        let mut entry = self
            .breakers
            .entry(Self::key(op, id))
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let reset_due = entry
                    .reset_at
                    .map(|at| Instant::now() > at)
                    .unwrap_or(true);
                if reset_due {
                    tracing::info!(op, id, "circuit half-open, admitting trial");
                    entry.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(DispatchError::CircuitOpen {
                        operation: op.to_string(),
                    })
                }
            }
        }
    }

    /// Record a successful call: closed breakers reset their failure count,
    /// a half-open trial closes the circuit.
    pub fn record_success(&self, op: &str, id: &str) {
        let mut entry = self
            .breakers
            .entry(Self::key(op, id))
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            CircuitState::Closed => entry.failures = 0,
            CircuitState::HalfOpen => {
                tracing::info!(op, id, "circuit closed after successful trial");
                entry.state = CircuitState::Closed;
                entry.failures = 0;
                entry.reset_at = None;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call, opening the circuit when the consecutive
    /// failure count reaches the threshold. A half-open failure reopens
    /// immediately.
    pub fn record_failure(&self, op: &str, id: &str, error: &DispatchError) {
        let reset_timeout = Duration::from_millis(self.config.reset_timeout_ms);
        let mut entry = self
            .breakers
            .entry(Self::key(op, id))
            .or_insert_with(BreakerEntry::new);

        let mut detail = format!("{error:?}");
        detail.truncate(ERROR_DETAIL_MAX);
        entry.errors.push(ErrorPattern {
            message: error.to_string(),
            detail,
            at: Utc::now(),
        });
        if entry.errors.len() > ERROR_LOG_MAX {
            let excess = entry.errors.len() - ERROR_LOG_KEEP;
            entry.errors.drain(0..excess);
        }

        match entry.state {
            CircuitState::Closed => {
                entry.failures += 1;
                if entry.failures >= self.config.max_failures {
                    tracing::warn!(op, id, failures = entry.failures, "circuit opened");
                    entry.state = CircuitState::Open;
                    entry.reset_at = Some(Instant::now() + reset_timeout);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(op, id, "circuit reopened after failed trial");
                entry.state = CircuitState::Open;
                entry.reset_at = Some(Instant::now() + reset_timeout);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of the breaker for (op, id).
    pub fn state(&self, op: &str, id: &str) -> CircuitState {
        self.breakers
            .get(&Self::key(op, id))
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Consecutive failure count for (op, id).
    pub fn failures(&self, op: &str, id: &str) -> u32 {
        self.breakers
            .get(&Self::key(op, id))
            .map(|entry| entry.failures)
            .unwrap_or(0)
    }

    /// Recent error fingerprints for (op, id), oldest first.
    pub fn error_patterns(&self, op: &str, id: &str) -> Vec<ErrorPattern> {
        self.breakers
            .get(&Self::key(op, id))
            .map(|entry| entry.errors.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every breaker for the operator surface.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                key: entry.key().clone(),
                state: entry.state,
                failures: entry.failures,
                recorded_errors: entry.errors.len(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(max_failures: u32, reset_timeout_ms: u64) -> CircuitBreakerTable {
        CircuitBreakerTable::new(CircuitConfig {
            max_failures,
            reset_timeout_ms,
            ..CircuitConfig::default()
        })
    }

    fn failure() -> DispatchError {
        DispatchError::transient("backend down")
    }

    #[test]
    fn closed_breaker_admits_requests() {
        let breakers = table(5, 30_000);
        assert!(breakers.check("dispatch", "v1").is_ok());
        assert_eq!(breakers.state("dispatch", "v1"), CircuitState::Closed);
    }

    #[test]
    fn opens_at_failure_threshold() {
        let breakers = table(2, 30_000);
        breakers.record_failure("dispatch", "v1", &failure());
        assert_eq!(breakers.state("dispatch", "v1"), CircuitState::Closed);

        breakers.record_failure("dispatch", "v1", &failure());
        assert_eq!(breakers.state("dispatch", "v1"), CircuitState::Open);
        assert!(matches!(
            breakers.check("dispatch", "v1"),
            Err(DispatchError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn single_failure_threshold_opens_immediately() {
        let breakers = table(1, 30_000);
        breakers.record_failure("dispatch", "v1", &failure());
        assert_eq!(breakers.state("dispatch", "v1"), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count_while_closed() {
        let breakers = table(3, 30_000);
        breakers.record_failure("dispatch", "v1", &failure());
        breakers.record_failure("dispatch", "v1", &failure());
        breakers.record_success("dispatch", "v1");
        assert_eq!(breakers.failures("dispatch", "v1"), 0);
        assert_eq!(breakers.state("dispatch", "v1"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_half_open_closed_walk() {
        let breakers = table(2, 100);
        breakers.record_failure("dispatch", "k", &failure());
        breakers.record_failure("dispatch", "k", &failure());
        assert_eq!(breakers.state("dispatch", "k"), CircuitState::Open);

        // Within the reset window the breaker fails fast.
        assert!(breakers.check("dispatch", "k").is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breakers.check("dispatch", "k").is_ok());
        assert_eq!(breakers.state("dispatch", "k"), CircuitState::HalfOpen);

        breakers.record_success("dispatch", "k");
        assert_eq!(breakers.state("dispatch", "k"), CircuitState::Closed);
        assert_eq!(breakers.failures("dispatch", "k"), 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breakers = table(1, 50);
        breakers.record_failure("dispatch", "k", &failure());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(breakers.check("dispatch", "k").is_ok());

        breakers.record_failure("dispatch", "k", &failure());
        assert_eq!(breakers.state("dispatch", "k"), CircuitState::Open);
        assert!(breakers.check("dispatch", "k").is_err());
    }

    #[test]
    fn keys_are_independent() {
        let breakers = table(1, 30_000);
        breakers.record_failure("dispatch", "v1", &failure());
        assert_eq!(breakers.state("dispatch", "v1"), CircuitState::Open);
        assert_eq!(breakers.state("dispatch", "v2"), CircuitState::Closed);
        assert!(breakers.check("dispatch", "v2").is_ok());
    }

    #[test]
    fn error_log_trims_at_bound() {
        let breakers = table(100, 30_000);
        for _ in 0..51 {
            breakers.record_failure("dispatch", "k", &failure());
        }
        assert_eq!(breakers.error_patterns("dispatch", "k").len(), 25);
    }
}
