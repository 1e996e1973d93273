//! Collaborator interfaces to the systems the core does not own.
//!
//! Each external dependency is a thin async trait; the core never reaches
//! past these seams. In-memory implementations ship here for tests and
//! local runs.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::domain::{CustomerPreferences, Driver, Order, PerformanceWindow};
use crate::error::DispatchResult;

/// Append-only audit topics the core persists to.
pub mod topics {
    /// Per-subject scoring audit trail.
    pub const SECURITY_LOGS: &str = "security_logs";
    /// Recorded threat incidents.
    pub const SECURITY_INCIDENTS: &str = "security_incidents";
    /// Slow-operation and memory alerts.
    pub const PERFORMANCE_ALERTS: &str = "performance_alerts";
    /// Periodic aggregated performance reports.
    pub const PERFORMANCE_REPORTS: &str = "performance_reports";
    /// Fraud assessments.
    pub const FRAUD_SCORES: &str = "fraud_scores";
    /// Resource exhaustion and pressure alerts.
    pub const RESOURCE_ALERTS: &str = "resource_alerts";
    /// Notification delivery outcomes.
    pub const NOTIFICATION_LOGS: &str = "notification_logs";
    /// Demand and utilization predictions.
    pub const PREDICTIONS: &str = "predictions";
}

/// A device observed for a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Client IP address.
    pub ip: String,

    /// User agent string.
    pub user_agent: String,

    /// Device fingerprint.
    pub fingerprint: String,

    /// When the device was last seen.
    pub last_seen: DateTime<Utc>,
}

/// One recorded subject action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Action tag.
    pub action: String,

    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Source of candidate drivers for an order.
#[async_trait]
pub trait DriverSource: Send + Sync {
    /// Candidate drivers for `order`, with position, heartbeat,
    /// assignments, and vendor preferences populated.
    async fn list_candidates(&self, order: &Order) -> DispatchResult<Vec<Driver>>;
}

/// 30-day performance rollups.
#[async_trait]
pub trait PerformanceStore: Send + Sync {
    /// The aggregate window for `driver_id` starting at `from`.
    async fn fetch_window(
        &self,
        driver_id: &str,
        from: DateTime<Utc>,
    ) -> DispatchResult<Option<PerformanceWindow>>;
}

/// Customer matching preferences.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Preferred and blocked driver lists for a customer.
    async fn customer(&self, uid: &str) -> DispatchResult<CustomerPreferences>;
}

/// Devices recently seen for a subject.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Recent device records, newest last.
    async fn recent(&self, subject: &str) -> DispatchResult<Vec<DeviceRecord>>;
}

/// Actions recently performed by a subject.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Actions since `from`, oldest first.
    async fn recent(
        &self,
        subject: &str,
        from: DateTime<Utc>,
    ) -> DispatchResult<Vec<ActivityRecord>>;
}

/// External IP reputation list.
#[async_trait]
pub trait IpReputation: Send + Sync {
    /// Whether `ip` appears on the blacklist.
    async fn is_blacklisted(&self, ip: &str) -> DispatchResult<bool>;
}

/// Append-only sink for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append `record` under `topic`.
    async fn append(&self, topic: &str, record: serde_json::Value) -> DispatchResult<()>;
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// Driver source backed by a mutable in-memory roster.
#[derive(Default)]
pub struct MemoryDriverSource {
    drivers: RwLock<Vec<Driver>>,
}

impl MemoryDriverSource {
    /// Create a source with an initial roster.
    pub fn new(drivers: Vec<Driver>) -> Self {
        Self {
            drivers: RwLock::new(drivers),
        }
    }

    /// Replace the roster.
    pub fn set_drivers(&self, drivers: Vec<Driver>) {
        *self.drivers.write() = drivers;
    }
}

#[async_trait]
impl DriverSource for MemoryDriverSource {
    async fn list_candidates(&self, _order: &Order) -> DispatchResult<Vec<Driver>> {
        Ok(self.drivers.read().clone())
    }
}

/// Performance store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryPerformanceStore {
    windows: DashMap<String, PerformanceWindow>,
}

impl MemoryPerformanceStore {
    /// Store a window for a driver.
    pub fn set_window(&self, driver_id: impl Into<String>, window: PerformanceWindow) {
        self.windows.insert(driver_id.into(), window);
    }
}

#[async_trait]
impl PerformanceStore for MemoryPerformanceStore {
    async fn fetch_window(
        &self,
        driver_id: &str,
        _from: DateTime<Utc>,
    ) -> DispatchResult<Option<PerformanceWindow>> {
        Ok(self.windows.get(driver_id).map(|w| w.clone()))
    }
}

/// Preference store backed by a concurrent map. Unknown customers get
/// empty preferences.
#[derive(Default)]
pub struct MemoryPreferenceStore {
    preferences: DashMap<String, CustomerPreferences>,
}

impl MemoryPreferenceStore {
    /// Store preferences for a customer.
    pub fn set_preferences(&self, uid: impl Into<String>, preferences: CustomerPreferences) {
        self.preferences.insert(uid.into(), preferences);
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn customer(&self, uid: &str) -> DispatchResult<CustomerPreferences> {
        Ok(self
            .preferences
            .get(uid)
            .map(|p| p.clone())
            .unwrap_or_default())
    }
}

/// Device store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: DashMap<String, Vec<DeviceRecord>>,
}

impl MemoryDeviceStore {
    /// Record a device sighting for a subject.
    pub fn record(&self, subject: impl Into<String>, device: DeviceRecord) {
        self.devices.entry(subject.into()).or_default().push(device);
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn recent(&self, subject: &str) -> DispatchResult<Vec<DeviceRecord>> {
        Ok(self
            .devices
            .get(subject)
            .map(|d| d.clone())
            .unwrap_or_default())
    }
}

/// Activity store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryActivityStore {
    activity: DashMap<String, Vec<ActivityRecord>>,
}

impl MemoryActivityStore {
    /// Record an action for a subject.
    pub fn record(&self, subject: impl Into<String>, action: impl Into<String>, at: DateTime<Utc>) {
        self.activity.entry(subject.into()).or_default().push(ActivityRecord {
            action: action.into(),
            at,
        });
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn recent(
        &self,
        subject: &str,
        from: DateTime<Utc>,
    ) -> DispatchResult<Vec<ActivityRecord>> {
        Ok(self
            .activity
            .get(subject)
            .map(|records| records.iter().filter(|r| r.at >= from).cloned().collect())
            .unwrap_or_default())
    }
}

/// IP reputation backed by a local set.
#[derive(Default)]
pub struct MemoryIpReputation {
    blacklist: RwLock<HashSet<String>>,
}

impl MemoryIpReputation {
    /// Add an IP to the blacklist.
    pub fn blacklist(&self, ip: impl Into<String>) {
        self.blacklist.write().insert(ip.into());
    }
}

#[async_trait]
impl IpReputation for MemoryIpReputation {
    async fn is_blacklisted(&self, ip: &str) -> DispatchResult<bool> {
        Ok(self.blacklist.read().contains(ip))
    }
}

/// One appended audit record.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Topic appended to.
    pub topic: String,

    /// The record payload.
    pub record: serde_json::Value,

    /// When it was appended.
    pub at: DateTime<Utc>,
}

/// Audit sink that keeps records in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// All records appended under `topic`.
    pub fn records_for(&self, topic: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    /// Total appended records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether anything was appended.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, topic: &str, record: serde_json::Value) -> DispatchResult<()> {
        self.records.lock().push(AuditRecord {
            topic: topic.to_string(),
            record,
            at: Utc::now(),
        });
        Ok(())
    }
}
