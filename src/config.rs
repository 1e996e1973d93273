//! Platform configuration.
//!
//! One serde-derived tree of knobs with defaults matching production
//! behavior. Loading from files or the environment is the embedding
//! service's concern; the core only defines the shape and the defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the dispatch core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Performance measurement and alerting thresholds.
    pub performance: PerformanceConfig,

    /// Cache behavior.
    pub cache: CacheConfig,

    /// Spatial index geometry and liveness.
    pub spatial: SpatialConfig,

    /// Matcher scoring knobs.
    pub matcher: MatcherConfig,

    /// Dispatch orchestration knobs.
    pub dispatch: DispatchConfig,

    /// Counted resource limits.
    pub resources: ResourceLimits,

    /// Circuit breaker and retry behavior.
    pub circuit: CircuitConfig,

    /// Background job scheduler behavior.
    pub scheduler: SchedulerConfig,

    /// Threat scoring thresholds.
    pub threat: ThreatConfig,
}

/// Performance meter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Operations slower than this emit an alert.
    pub response_time_alert_ms: u64,

    /// Memory growth above this during one operation emits an alert.
    pub memory_alert_bytes: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            response_time_alert_ms: 5_000,
            memory_alert_bytes: 134_217_728,
        }
    }
}

/// Cache defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Base TTL in minutes before adaptive adjustment.
    pub base_ttl_minutes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { base_ttl_minutes: 5 }
    }
}

/// Spatial index geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialConfig {
    /// Grid cell size in degrees.
    pub grid_degrees: f64,

    /// Maximum heartbeat age for a driver to stay indexed, in minutes.
    pub driver_liveness_minutes: i64,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            grid_degrees: 0.01,
            driver_liveness_minutes: 10,
        }
    }
}

/// Matcher scoring knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Heartbeat age in minutes beyond which availability decays.
    pub availability_heartbeat_minutes: i64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            availability_heartbeat_minutes: 5,
        }
    }
}

/// Dispatch orchestration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Radius in miles searched around the vendor.
    pub search_radius_miles: f64,

    /// Base TTL in minutes for the cached candidate driver set.
    pub driver_set_ttl_minutes: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_radius_miles: 10.0,
            driver_set_ttl_minutes: 2,
        }
    }
}

/// Limits for the counted resources guarding expensive operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Concurrent dispatch operations.
    pub active_dispatch: u64,

    /// Resident heap bytes before emergency cleanup.
    pub heap_bytes: u64,

    /// CPU utilization percent.
    pub cpu_pct: u64,

    /// Concurrent database connections.
    pub db_conns: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            active_dispatch: 100,
            heap_bytes: 536_870_912,
            cpu_pct: 80,
            db_conns: 50,
        }
    }
}

/// Circuit breaker and retry wrapper behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens.
    pub max_failures: u32,

    /// How long an open circuit rejects before a half-open trial, in ms.
    pub reset_timeout_ms: u64,

    /// Attempt budget for the retry wrapper.
    pub retries: u32,

    /// Base inter-attempt delay in ms; attempt n sleeps `base · n`.
    pub base_delay_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout_ms: 30_000,
            retries: 3,
            base_delay_ms: 1_000,
        }
    }
}

/// Background job scheduler behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum jobs running concurrently.
    pub max_concurrent_jobs: usize,

    /// Tick interval in ms.
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 5,
            tick_ms: 1_000,
        }
    }
}

/// Threat score thresholds driving automatic actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatConfig {
    /// At or above this, a low-threat counter ticks.
    pub low: f64,

    /// At or above this, a medium incident is recorded.
    pub medium: f64,

    /// At or above this, the subject is marked high-threat.
    pub high: f64,

    /// At or above this, the subject is suspended.
    pub suspend: f64,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            low: 30.0,
            medium: 50.0,
            high: 75.0,
            suspend: 95.0,
        }
    }
}
