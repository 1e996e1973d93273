//! Counted resource admission.
//!
//! A fixed set of counted resources guards the expensive paths. Admission
//! is a deterministic accept/reject: acquiring beyond a limit fails rather
//! than blocks. Handles release on drop, and `with_resources` scopes an
//! acquire-all/release-reverse pair around a future so every exit path,
//! including panics and cancellation, gives the counts back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::config::ResourceLimits;
use crate::error::{DispatchError, DispatchResult};
use crate::monitoring::memory_snapshot;
use crate::stores::{topics, AuditSink};

/// The counted resource types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResourceKind {
    /// Concurrent dispatch operations.
    ActiveDispatch,
    /// Resident heap bytes.
    HeapBytes,
    /// CPU utilization percent.
    CpuPercent,
    /// Database connections.
    DbConnections,
}

impl ResourceKind {
    /// Stable name used in alerts and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveDispatch => "active_dispatch",
            Self::HeapBytes => "heap_bytes",
            Self::CpuPercent => "cpu_pct",
            Self::DbConnections => "db_conns",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    current: u64,
    limit: u64,
}

/// Operator-facing view of one counter.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    /// Resource type.
    pub kind: ResourceKind,

    /// Current count.
    pub current: u64,

    /// Configured limit.
    pub limit: u64,
}

/// RAII grant of `n` units of one resource. Releases on drop; releasing
/// twice is harmless.
pub struct ResourceHandle {
    governor: Arc<ResourceGovernor>,
    kind: ResourceKind,
    n: u64,
    released: AtomicBool,
}

impl ResourceHandle {
    /// Give the units back now instead of at drop.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.governor.give_back(self.kind, self.n);
        }
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Counted semaphores with limits and pressure reactions.
pub struct ResourceGovernor {
    counters: Mutex<HashMap<ResourceKind, Counter>>,
    sink: Arc<dyn AuditSink>,
    on_dispatch_pressure: RwLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl ResourceGovernor {
    /// Create a governor with the configured limits and zeroed counts.
    pub fn new(limits: ResourceLimits, sink: Arc<dyn AuditSink>) -> Arc<Self> {
        let mut counters = HashMap::new();
        for (kind, limit) in [
            (ResourceKind::ActiveDispatch, limits.active_dispatch),
            (ResourceKind::HeapBytes, limits.heap_bytes),
            (ResourceKind::CpuPercent, limits.cpu_pct),
            (ResourceKind::DbConnections, limits.db_conns),
        ] {
            counters.insert(kind, Counter { current: 0, limit });
        }

        Arc::new(Self {
            counters: Mutex::new(counters),
            sink,
            on_dispatch_pressure: RwLock::new(None),
        })
    }

    /// Install the reaction fired when dispatch admission is exhausted
    /// (prioritize high-value pending orders).
    pub fn set_dispatch_pressure_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_dispatch_pressure.write() = Some(Box::new(callback));
    }

    /// Atomically claim `n` units of `kind`, failing deterministically when
    /// the limit would be exceeded.
    pub async fn acquire(
        self: &Arc<Self>,
        kind: ResourceKind,
        n: u64,
    ) -> DispatchResult<ResourceHandle> {
        let (current, limit) = {
            let mut counters = self.counters.lock();
            let counter = counters
                .get_mut(&kind)
                .expect("all resource kinds are registered at construction");
            if counter.current + n <= counter.limit {
                counter.current += n;
                return Ok(ResourceHandle {
                    governor: Arc::clone(self),
                    kind,
                    n,
                    released: AtomicBool::new(false),
                });
            }
            (counter.current, counter.limit)
        };

        tracing::error!(
            resource = kind.as_str(),
            current,
            limit,
            requested = n,
            "resource exhausted"
        );
        let record = serde_json::json!({
            "id": Uuid::new_v4().to_string(),
            "type": "exhausted",
            "resourceType": kind.as_str(),
            "current": current,
            "limit": limit,
            "requested": n,
            "instant": Utc::now(),
        });
        if let Err(err) = self.sink.append(topics::RESOURCE_ALERTS, record).await {
            tracing::warn!(error = %err, "failed to persist resource alert");
        }

        if kind == ResourceKind::ActiveDispatch {
            if let Some(callback) = self.on_dispatch_pressure.read().as_ref() {
                callback();
            }
        }

        Err(DispatchError::ResourceExhausted {
            resource: kind.as_str().to_string(),
        })
    }

    /// Acquire every request in declaration order, run `f`, and release in
    /// reverse order on every exit path.
    pub async fn with_resources<T, F, Fut>(
        self: &Arc<Self>,
        requests: &[(ResourceKind, u64)],
        f: F,
    ) -> DispatchResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DispatchResult<T>>,
    {
        let mut handles = Vec::with_capacity(requests.len());
        for (kind, n) in requests {
            match self.acquire(*kind, *n).await {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    while let Some(handle) = handles.pop() {
                        handle.release();
                    }
                    return Err(err);
                }
            }
        }

        let result = f().await;
        while let Some(handle) = handles.pop() {
            handle.release();
        }
        result
    }

    /// Overwrite a sampled gauge (heap, CPU, connections).
    pub fn set_gauge(&self, kind: ResourceKind, value: u64) {
        let mut counters = self.counters.lock();
        if let Some(counter) = counters.get_mut(&kind) {
            counter.current = value;
        }
    }

    /// Refresh the heap gauge from the process and report whether it is
    /// over its limit (the emergency-cleanup trigger).
    pub fn sample_heap(&self) -> (u64, bool) {
        let heap = memory_snapshot();
        let over = {
            let mut counters = self.counters.lock();
            let counter = counters
                .get_mut(&ResourceKind::HeapBytes)
                .expect("heap counter registered at construction");
            counter.current = heap;
            heap > counter.limit
        };
        (heap, over)
    }

    /// Snapshot of every counter.
    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        let counters = self.counters.lock();
        let mut all: Vec<CounterSnapshot> = counters
            .iter()
            .map(|(kind, counter)| CounterSnapshot {
                kind: *kind,
                current: counter.current,
                limit: counter.limit,
            })
            .collect();
        all.sort_by_key(|c| c.kind.as_str());
        all
    }

    /// Current count for `kind`.
    pub fn current(&self, kind: ResourceKind) -> u64 {
        self.counters.lock().get(&kind).map(|c| c.current).unwrap_or(0)
    }

    fn give_back(&self, kind: ResourceKind, n: u64) {
        let mut counters = self.counters.lock();
        if let Some(counter) = counters.get_mut(&kind) {
            counter.current = counter.current.saturating_sub(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryAuditSink;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;

    fn governor(limits: ResourceLimits) -> (Arc<ResourceGovernor>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        (ResourceGovernor::new(limits, sink.clone()), sink)
    }

    fn small_limits() -> ResourceLimits {
        ResourceLimits {
            active_dispatch: 2,
            ..ResourceLimits::default()
        }
    }

    #[tokio::test]
    async fn acquire_and_release_round_trip() {
        let (governor, _) = governor(small_limits());
        let handle = governor
            .acquire(ResourceKind::ActiveDispatch, 1)
            .await
            .unwrap();
        assert_eq!(governor.current(ResourceKind::ActiveDispatch), 1);
        handle.release();
        assert_eq!(governor.current(ResourceKind::ActiveDispatch), 0);
    }

    #[tokio::test]
    async fn drop_releases_implicitly() {
        let (governor, _) = governor(small_limits());
        {
            let _handle = governor
                .acquire(ResourceKind::ActiveDispatch, 2)
                .await
                .unwrap();
            assert_eq!(governor.current(ResourceKind::ActiveDispatch), 2);
        }
        assert_eq!(governor.current(ResourceKind::ActiveDispatch), 0);
    }

    #[tokio::test]
    async fn exhaustion_fails_fast_and_alerts() {
        let (governor, sink) = governor(small_limits());
        let fired = Arc::new(AtomicU32::new(0));
        let fired_in_callback = Arc::clone(&fired);
        governor.set_dispatch_pressure_callback(move || {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        let _held = governor
            .acquire(ResourceKind::ActiveDispatch, 2)
            .await
            .unwrap();
        let denied = governor.acquire(ResourceKind::ActiveDispatch, 1).await;

        assert!(matches!(
            denied,
            Err(DispatchError::ResourceExhausted { .. })
        ));
        assert_eq!(sink.records_for(topics::RESOURCE_ALERTS).len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // The denied request did not change the count.
        assert_eq!(governor.current(ResourceKind::ActiveDispatch), 2);
    }

    #[tokio::test]
    async fn with_resources_releases_on_success_and_failure() {
        let (governor, _) = governor(small_limits());

        let ok: DispatchResult<u32> = governor
            .with_resources(&[(ResourceKind::ActiveDispatch, 1)], || async { Ok(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);
        assert_eq!(governor.current(ResourceKind::ActiveDispatch), 0);

        let err: DispatchResult<u32> = governor
            .with_resources(&[(ResourceKind::ActiveDispatch, 1)], || async {
                Err(DispatchError::transient("inner failure"))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(governor.current(ResourceKind::ActiveDispatch), 0);
    }

    #[tokio::test]
    async fn with_resources_rolls_back_partial_acquisition() {
        let (governor, _) = governor(ResourceLimits {
            active_dispatch: 5,
            db_conns: 0,
            ..ResourceLimits::default()
        });

        let result: DispatchResult<()> = governor
            .with_resources(
                &[
                    (ResourceKind::ActiveDispatch, 1),
                    (ResourceKind::DbConnections, 1),
                ],
                || async { Ok(()) },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(governor.current(ResourceKind::ActiveDispatch), 0);
        assert_eq!(governor.current(ResourceKind::DbConnections), 0);
    }

    #[tokio::test]
    async fn gauges_overwrite_counts() {
        let (governor, _) = governor(ResourceLimits::default());
        governor.set_gauge(ResourceKind::CpuPercent, 42);
        assert_eq!(governor.current(ResourceKind::CpuPercent), 42);
    }

    proptest! {
        #[test]
        fn counts_never_exceed_limit_or_go_negative(ops in prop::collection::vec(1u64..4, 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (governor, _) = governor(ResourceLimits {
                    active_dispatch: 10,
                    ..ResourceLimits::default()
                });
                let mut handles = Vec::new();

                for (i, n) in ops.iter().enumerate() {
                    if i % 3 == 2 {
                        handles.pop();
                    } else if let Ok(handle) =
                        governor.acquire(ResourceKind::ActiveDispatch, *n).await
                    {
                        handles.push(handle);
                    }
                    let current = governor.current(ResourceKind::ActiveDispatch);
                    prop_assert!(current <= 10);
                }
                drop(handles);
                prop_assert_eq!(governor.current(ResourceKind::ActiveDispatch), 0);
                Ok(())
            }).unwrap();
        }
    }
}
