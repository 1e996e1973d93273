//! Dispatch orchestration.
//!
//! [`DispatchPlatform`] owns every stateful subsystem and composes them to
//! dispatch one order: admission → circuit-breaker-wrapped attempt →
//! cached driver set → radius query → ranking → notification, with threat
//! scoring recorded for the ordering customer afterwards. It also exposes
//! the operator status snapshot and the maintenance entry points the
//! system jobs call.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::{AdaptiveCache, AdaptiveCacheStats, PreloadEntry};
use crate::config::PlatformConfig;
use crate::domain::{Driver, Order, Recipient, RequestContext};
use crate::error::{DispatchError, DispatchResult};
use crate::geo;
use crate::matching::{DriverMatcher, MatchSnapshot};
use crate::monitoring::{PerformanceMonitor, PerformanceReport};
use crate::notify::{Channel, Message, Notifier, Severity};
use crate::resilience::{BreakerSnapshot, CircuitBreakerTable, ResilientExecutor};
use crate::resources::{CounterSnapshot, ResourceGovernor, ResourceKind};
use crate::scheduling::{Job, JobScheduler};
use crate::security::{FraudScorer, ThreatMetrics, ThreatMonitor};
use crate::spatial::{DriverGrid, GridStats};
use crate::stores::{
    topics, ActivityStore, AuditSink, DeviceStore, DriverSource, IpReputation, PerformanceStore,
    PreferenceStore,
};

/// How many recently dispatched orders the preload job re-warms.
const PRELOAD_VENDOR_LIMIT: usize = 20;

/// The external systems the platform talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Candidate driver population.
    pub drivers: Arc<dyn DriverSource>,

    /// 30-day driver performance rollups.
    pub performance: Arc<dyn PerformanceStore>,

    /// Customer matching preferences.
    pub preferences: Arc<dyn PreferenceStore>,

    /// Devices recently seen per subject.
    pub devices: Arc<dyn DeviceStore>,

    /// Actions recently performed per subject.
    pub activity: Arc<dyn ActivityStore>,

    /// External IP reputation.
    pub ip_reputation: Arc<dyn IpReputation>,

    /// Append-only audit log.
    pub sink: Arc<dyn AuditSink>,
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    /// The dispatched order.
    pub order_id: String,

    /// The chosen driver.
    pub driver_id: String,

    /// The driver's match score.
    pub score: f64,
}

/// Read-only operator snapshot across every subsystem.
#[derive(Serialize)]
pub struct PlatformStatus {
    /// Performance report.
    pub performance: PerformanceReport,

    /// Spatial index stats.
    pub spatial: GridStats,

    /// Resource counters.
    pub resources: Vec<CounterSnapshot>,

    /// Circuit breaker table.
    pub breakers: Vec<BreakerSnapshot>,

    /// Scheduler job table.
    pub jobs: Vec<Job>,

    /// Driver-set cache stats.
    pub cache: AdaptiveCacheStats,

    /// Threat metrics.
    pub threat: ThreatMetrics,
}

/// The dispatch core: owns all process-local state, composes the
/// subsystems, and exposes the one request-driven operation.
pub struct DispatchPlatform {
    config: PlatformConfig,
    collaborators: Collaborators,
    driver_sets: Arc<AdaptiveCache<Vec<Driver>>>,
    grid: Arc<DriverGrid>,
    matcher: DriverMatcher,
    monitor: Arc<PerformanceMonitor>,
    breakers: Arc<CircuitBreakerTable>,
    executor: ResilientExecutor,
    governor: Arc<ResourceGovernor>,
    threat: Arc<ThreatMonitor>,
    scheduler: Arc<JobScheduler>,
    notifier: Arc<Notifier>,
    recent_orders: Mutex<Vec<Order>>,
}

impl DispatchPlatform {
    /// Assemble the platform. `notifier` should already have its channel
    /// adapters registered; `ops_recipient` receives performance and threat
    /// pages.
    pub fn new(
        config: PlatformConfig,
        collaborators: Collaborators,
        notifier: Notifier,
        ops_recipient: Recipient,
    ) -> Arc<Self> {
        let notifier = Arc::new(notifier);
        let sink = Arc::clone(&collaborators.sink);

        let monitor = Arc::new(PerformanceMonitor::new(
            config.performance.clone(),
            config.resources.heap_bytes,
            Arc::clone(&notifier),
            Arc::clone(&sink),
            ops_recipient.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerTable::new(config.circuit.clone()));
        let executor = ResilientExecutor::new(
            config.circuit.clone(),
            Arc::clone(&breakers),
            Arc::clone(&monitor),
            Arc::clone(&sink),
        );
        let governor = ResourceGovernor::new(config.resources.clone(), Arc::clone(&sink));
        let fraud = FraudScorer::new(
            Arc::clone(&collaborators.devices),
            Arc::clone(&collaborators.activity),
            Arc::clone(&sink),
        );
        let threat = Arc::new(ThreatMonitor::new(
            config.threat.clone(),
            Arc::clone(&collaborators.ip_reputation),
            fraud,
            Arc::clone(&notifier),
            Arc::clone(&sink),
            ops_recipient,
        ));
        let scheduler = JobScheduler::new(config.scheduler.clone(), Arc::clone(&sink));

        let platform = Arc::new(Self {
            grid: Arc::new(DriverGrid::new(config.spatial.clone())),
            matcher: DriverMatcher::new(config.matcher.clone()),
            driver_sets: Arc::new(AdaptiveCache::new()),
            monitor,
            breakers,
            executor,
            governor: Arc::clone(&governor),
            threat,
            scheduler,
            notifier,
            recent_orders: Mutex::new(Vec::new()),
            collaborators,
            config,
        });

        governor.set_dispatch_pressure_callback({
            let platform = Arc::downgrade(&platform);
            move || {
                if let Some(platform) = platform.upgrade() {
                    platform.prioritize_pending();
                }
            }
        });

        platform
    }

    /// Dispatch one order: find, rank, and notify the best live driver.
    pub async fn dispatch(
        &self,
        order: &Order,
        ctx: &RequestContext,
    ) -> DispatchResult<DispatchOutcome> {
        let result = self
            .governor
            .with_resources(&[(ResourceKind::ActiveDispatch, 1)], || async {
                self.executor
                    .run("dispatch", &order.vendor_id, || {
                        self.attempt_dispatch(order, ctx)
                    })
                    .await
            })
            .await;

        self.threat
            .score(&order.author_id, "dispatch_order", ctx)
            .await;

        result.map_err(|err| self.classify(order, err))
    }

    async fn attempt_dispatch(
        &self,
        order: &Order,
        ctx: &RequestContext,
    ) -> DispatchResult<DispatchOutcome> {
        let key = self.driver_set_key(order);
        let drivers = Arc::clone(&self.collaborators.drivers);
        let grid = Arc::clone(&self.grid);
        let loader_order = order.clone();
        self.driver_sets
            .get_or_load(
                &key,
                self.config.dispatch.driver_set_ttl_minutes,
                move || async move {
                    let candidates = drivers.list_candidates(&loader_order).await?;
                    grid.upsert_drivers(&candidates);
                    Ok(candidates)
                },
            )
            .await?;

        let vendor = order.vendor_position;
        let candidates = self.grid.near(
            vendor.lat,
            vendor.lon,
            self.config.dispatch.search_radius_miles,
        );
        if candidates.is_empty() {
            return Err(DispatchError::NotFound {
                what: "available drivers".into(),
            });
        }

        let snapshot = self.load_snapshot(order, &candidates).await?;
        let ranked = self.matcher.rank(order, &candidates, &snapshot, ctx);
        let top = ranked
            .into_iter()
            .next()
            .expect("candidates checked non-empty");

        tracing::info!(
            order = %order.id,
            driver = %top.driver.id,
            score = top.match_score,
            "driver matched"
        );
        self.notify_assignment(order, &top.driver.id).await;
        self.remember_order(order);

        Ok(DispatchOutcome {
            order_id: order.id.clone(),
            driver_id: top.driver.id,
            score: top.match_score,
        })
    }

    async fn load_snapshot(
        &self,
        order: &Order,
        candidates: &[Driver],
    ) -> DispatchResult<MatchSnapshot> {
        let from = Utc::now() - Duration::days(30);
        let mut snapshot = MatchSnapshot {
            preferences: self
                .collaborators
                .preferences
                .customer(&order.author_id)
                .await?,
            ..MatchSnapshot::default()
        };
        for driver in candidates {
            if let Some(window) = self
                .collaborators
                .performance
                .fetch_window(&driver.id, from)
                .await?
            {
                snapshot.performance.insert(driver.id.clone(), window);
            }
        }
        Ok(snapshot)
    }

    async fn notify_assignment(&self, order: &Order, driver_id: &str) {
        let recipient = Recipient::driver(driver_id);
        let message = Message::new(
            "New delivery assignment",
            format!("Order {} from vendor {}", order.id, order.vendor_id),
        );
        self.notifier
            .send(
                &recipient,
                &message,
                Severity::Normal,
                &[Channel::Push, Channel::Chat],
            )
            .await;
    }

    fn classify(&self, order: &Order, err: DispatchError) -> DispatchError {
        match err {
            DispatchError::NotFound { .. }
            | DispatchError::ResourceExhausted { .. }
            | DispatchError::CircuitOpen { .. }
            | DispatchError::Unauthenticated { .. }
            | DispatchError::PermissionDenied { .. }
            | DispatchError::InvalidArgument { .. } => err,
            other => {
                tracing::error!(order = %order.id, error = %other, "dispatch failed");
                DispatchError::internal("dispatch failed")
            }
        }
    }

    fn driver_set_key(&self, order: &Order) -> String {
        // Zone is one coarse grid cell; the round rotates the key so a
        // stale set can never outlive two refresh windows.
        let zone = geo::grid_key(
            order.vendor_position.lat,
            order.vendor_position.lon,
            self.config.spatial.grid_degrees * 10.0,
        );
        let round = Utc::now().timestamp()
            / (self.config.dispatch.driver_set_ttl_minutes as i64 * 60);
        format!("drivers:{}:{}:{}", order.vendor_id, zone, round)
    }

    fn remember_order(&self, order: &Order) {
        let mut recent = self.recent_orders.lock();
        recent.retain(|o| o.vendor_id != order.vendor_id);
        recent.push(order.clone());
        if recent.len() > PRELOAD_VENDOR_LIMIT {
            recent.remove(0);
        }
    }

    fn prioritize_pending(&self) {
        // Admission pressure reaction: flag the backlog for high-value
        // ordering. The surrounding service owns the actual reorder.
        tracing::warn!("dispatch admission exhausted, prioritizing high-value pending orders");
    }

    // ------------------------------------------------------------------
    // Maintenance entry points, called by the system jobs
    // ------------------------------------------------------------------

    /// Clear the caches and the spatial index. Triggered under memory
    /// pressure.
    pub fn emergency_cleanup(&self) {
        tracing::error!("emergency cleanup: clearing caches and spatial index");
        self.driver_sets.clear();
        self.grid.clear();
    }

    /// Refresh resource gauges; on heap pressure run emergency cleanup.
    pub async fn sample_resources(&self) {
        self.governor.set_gauge(
            ResourceKind::CpuPercent,
            crate::monitoring::cpu_snapshot(),
        );
        let (heap, over_limit) = self.governor.sample_heap();
        if over_limit {
            let record = serde_json::json!({
                "type": "memory_pressure",
                "resourceType": ResourceKind::HeapBytes.as_str(),
                "current": heap,
                "limit": self.config.resources.heap_bytes,
                "instant": Utc::now(),
            });
            if let Err(err) = self
                .collaborators
                .sink
                .append(topics::RESOURCE_ALERTS, record)
                .await
            {
                tracing::warn!(error = %err, "failed to persist memory pressure alert");
            }
            self.emergency_cleanup();
        }
    }

    /// Re-warm driver sets for recently dispatched vendors.
    pub async fn preload_critical(&self) -> (usize, usize) {
        let orders = self.recent_orders.lock().clone();
        let ttl = self.config.dispatch.driver_set_ttl_minutes;
        let entries: Vec<PreloadEntry<Vec<Driver>>> = orders
            .into_iter()
            .map(|order| {
                let key = self.driver_set_key(&order);
                let drivers = Arc::clone(&self.collaborators.drivers);
                let grid = Arc::clone(&self.grid);
                PreloadEntry {
                    key,
                    base_minutes: ttl,
                    loader: Arc::new(
                        move || -> BoxFuture<'static, DispatchResult<Vec<Driver>>> {
                            let drivers = Arc::clone(&drivers);
                            let grid = Arc::clone(&grid);
                            let order = order.clone();
                            Box::pin(async move {
                                let candidates = drivers.list_candidates(&order).await?;
                                grid.upsert_drivers(&candidates);
                                Ok(candidates)
                            })
                        },
                    ),
                }
            })
            .collect();
        self.driver_sets.preload(entries).await
    }

    /// Drop expired cache entries and idle threat windows.
    pub fn cleanup_sweep(&self) -> (usize, usize) {
        let purged = self.driver_sets.purge_expired();
        let pruned = self.threat.prune_idle_windows();
        tracing::debug!(purged, pruned, "cleanup sweep finished");
        (purged, pruned)
    }

    /// Sweep stale drivers out of the spatial index.
    pub fn spatial_gc(&self) -> usize {
        self.grid.gc_stale()
    }

    /// Persist the aggregated performance report.
    pub async fn publish_performance_report(&self) -> DispatchResult<()> {
        let report = self.monitor.report();
        let record = serde_json::to_value(&report)
            .map_err(|err| DispatchError::internal(format!("report serialization: {err}")))?;
        self.collaborators
            .sink
            .append(topics::PERFORMANCE_REPORTS, record)
            .await
    }

    /// Persist current threat metrics.
    pub async fn publish_threat_report(&self) -> DispatchResult<()> {
        let metrics = self.threat.metrics();
        let record = serde_json::json!({
            "subject": "system",
            "action": "threat_report",
            "metadata": metrics,
            "instant": Utc::now(),
        });
        self.collaborators
            .sink
            .append(topics::SECURITY_LOGS, record)
            .await
    }

    /// Persist a demand prediction from current spatial density.
    pub async fn publish_demand_prediction(&self) -> DispatchResult<()> {
        let stats = self.grid.stats();
        let record = serde_json::json!({
            "type": "demand",
            "payload": {
                "occupied_cells": stats.cells,
                "live_drivers": stats.drivers,
                "avg_per_cell": stats.avg_per_cell,
                "active_vendors": self.recent_orders.lock().len(),
            },
            "timeframe": "next_hour",
            "location": null,
            "instant": Utc::now(),
        });
        self.collaborators
            .sink
            .append(topics::PREDICTIONS, record)
            .await
    }

    /// Persist a utilization prediction from current resource counters.
    pub async fn publish_utilization_prediction(&self) -> DispatchResult<()> {
        let utilization: Vec<serde_json::Value> = self
            .governor
            .snapshot()
            .into_iter()
            .map(|counter| {
                let pct = if counter.limit == 0 {
                    0.0
                } else {
                    counter.current as f64 / counter.limit as f64 * 100.0
                };
                serde_json::json!({
                    "resource": counter.kind.as_str(),
                    "current": counter.current,
                    "limit": counter.limit,
                    "pct": pct,
                })
            })
            .collect();
        let record = serde_json::json!({
            "type": "utilization",
            "payload": utilization,
            "timeframe": "next_30m",
            "location": null,
            "instant": Utc::now(),
        });
        self.collaborators
            .sink
            .append(topics::PREDICTIONS, record)
            .await
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// The scheduler, for installing jobs and running the tick loop.
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// The threat monitor.
    pub fn threat(&self) -> &Arc<ThreatMonitor> {
        &self.threat
    }

    /// The resource governor.
    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.governor
    }

    /// Read-only status snapshot for operators.
    pub fn status(&self) -> PlatformStatus {
        PlatformStatus {
            performance: self.monitor.report(),
            spatial: self.grid.stats(),
            resources: self.governor.snapshot(),
            breakers: self.breakers.snapshot(),
            jobs: self.scheduler.jobs(),
            cache: self.driver_sets.stats(),
            threat: self.threat.metrics(),
        }
    }
}
