//! Failure containment for calls that leave the process.
//!
//! - `circuit`: per-key failure-counted circuit breakers
//! - `retry`: the breaker-gated, measured retry wrapper
//!
//! # Circuit Breaker Pattern
//!
//! 1. **Closed**: normal operation, requests pass through
//! 2. **Open**: too many failures, requests fail fast
//! 3. **Half-Open**: a single trial probes whether the target recovered

pub mod circuit;
pub mod retry;

pub use circuit::{BreakerSnapshot, CircuitBreakerTable, CircuitState, ErrorPattern};
pub use retry::ResilientExecutor;
