//! Core domain entities shared across the dispatch subsystems.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A geographic position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude.
    pub lat: f64,

    /// Longitude.
    pub lon: f64,
}

impl GeoPoint {
    /// Create a point from latitude and longitude.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A courier as ingested from the external driver source.
///
/// Records inside the spatial index are copies of these, never aliases into
/// the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    /// Stable identifier.
    pub id: String,

    /// Last known position; absent when the source has no fix.
    pub position: Option<GeoPoint>,

    /// Whether the driver is accepting work.
    pub active: bool,

    /// Most recent online timestamp from the source.
    pub last_heartbeat: DateTime<Utc>,

    /// Orders currently assigned to this driver.
    pub active_assignments: Vec<String>,

    /// Vendors this driver prefers to serve.
    pub preferred_vendors: HashSet<String>,
}

impl Driver {
    /// Liveness predicate: active and heartbeat within the window.
    pub fn is_live(&self, now: DateTime<Utc>, liveness_minutes: i64) -> bool {
        self.active && now - self.last_heartbeat <= Duration::minutes(liveness_minutes)
    }
}

/// Order lifecycle status. Persistence of orders is external; the core only
/// reads these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Placed by the customer.
    Placed,
    /// Accepted by the vendor.
    Accepted,
    /// Waiting for a courier.
    DriverPending,
    /// Courier assigned.
    Dispatched,
    /// Handed to the customer.
    Delivered,
    /// Cancelled before completion.
    Cancelled,
}

/// An order being dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier.
    pub id: String,

    /// Vendor fulfilling the order.
    pub vendor_id: String,

    /// Pickup position.
    pub vendor_position: GeoPoint,

    /// Customer who placed the order.
    pub author_id: String,

    /// Total amount in the platform currency.
    pub total_amount: f64,

    /// Current lifecycle status.
    pub status: OrderStatus,
}

/// 30-day rolling performance aggregate for one driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceWindow {
    /// Successfully completed deliveries.
    pub success_count: u64,

    /// Total deliveries attempted.
    pub total_count: u64,

    /// Sum of customer ratings received.
    pub rating_sum: f64,

    /// Number of ratings received.
    pub rating_count: u64,

    /// Sum of delivery durations in minutes.
    pub delivery_minutes_sum: f64,

    /// Number of timed deliveries.
    pub delivery_minutes_count: u64,
}

impl PerformanceWindow {
    /// Success rate as a percentage, if any deliveries were attempted.
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_count > 0).then(|| self.success_count as f64 / self.total_count as f64 * 100.0)
    }

    /// Mean rating, if any ratings were received.
    pub fn avg_rating(&self) -> Option<f64> {
        (self.rating_count > 0).then(|| self.rating_sum / self.rating_count as f64)
    }

    /// Mean delivery minutes, if any deliveries were timed.
    pub fn avg_minutes(&self) -> Option<f64> {
        (self.delivery_minutes_count > 0)
            .then(|| self.delivery_minutes_sum / self.delivery_minutes_count as f64)
    }
}

/// Customer matching preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerPreferences {
    /// Drivers the customer prefers.
    pub preferred: Vec<String>,

    /// Drivers the customer has blocked.
    pub blocked: Vec<String>,
}

/// Current weather around the vendor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Weather {
    /// No precipitation.
    #[default]
    Clear,
    /// Raining.
    Rain,
    /// Snowing.
    Snow,
}

/// Current traffic around the vendor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Traffic {
    /// Free-flowing.
    #[default]
    Light,
    /// Slower than usual.
    Moderate,
    /// Congested.
    Heavy,
}

/// Per-request context: realtime conditions plus the enumerated threat
/// signals the surrounding service has already derived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// Session was seen from multiple devices.
    pub multiple_devices: bool,

    /// Position jumped implausibly fast.
    pub rapid_location_changes: bool,

    /// User agent differs from the subject's usual ones.
    pub unusual_user_agent: bool,

    /// Repeated failed logins preceded this request.
    pub excessive_failed_logins: bool,

    /// Client appears to connect through a VPN.
    pub vpn_detected: bool,

    /// Client appears to connect through Tor.
    pub tor_detected: bool,

    /// Interaction cadence looks scripted.
    pub automated_behavior_detected: bool,

    /// Transaction deviates from the subject's pattern.
    pub unusual_transaction_pattern: bool,

    /// Client IP address.
    pub client_ip: Option<String>,

    /// Client user agent.
    pub user_agent: Option<String>,

    /// Client device fingerprint.
    pub device_fingerprint: Option<String>,

    /// Weather around the vendor.
    pub weather: Weather,

    /// Traffic around the vendor.
    pub traffic: Traffic,

    /// Local hour override; derived from the wall clock when absent.
    pub local_hour: Option<u32>,
}

impl RequestContext {
    /// Local hour in 0..24, preferring the explicit override.
    pub fn hour(&self) -> u32 {
        use chrono::Timelike;
        self.local_hour
            .unwrap_or_else(|| chrono::Local::now().hour())
    }
}

/// Role of a notification recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecipientRole {
    /// A customer.
    Customer,
    /// A courier.
    Driver,
    /// A platform operator.
    Admin,
}

/// Someone notifications can be delivered to, with whatever addresses are
/// on file. A channel is only attempted when its address is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    /// Stable identifier.
    pub id: String,

    /// Role, used for channel selection.
    pub role: RecipientRole,

    /// Mobile push token.
    pub push_token: Option<String>,

    /// Phone number for SMS.
    pub phone: Option<String>,

    /// Email address.
    pub email: Option<String>,

    /// Webhook URL.
    pub webhook_url: Option<String>,

    /// In-app chat identifier.
    pub chat_id: Option<String>,
}

impl Recipient {
    /// A driver recipient reachable over in-app chat.
    pub fn driver(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            chat_id: Some(id.clone()),
            id,
            role: RecipientRole::Driver,
            push_token: None,
            phone: None,
            email: None,
            webhook_url: None,
        }
    }

    /// An operator recipient with email and chat addresses.
    pub fn admin(id: impl Into<String>, email: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            chat_id: Some(id.clone()),
            email: Some(email.into()),
            id,
            role: RecipientRole::Admin,
            push_token: None,
            phone: None,
            webhook_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(heartbeat_minutes_ago: i64, active: bool) -> Driver {
        Driver {
            id: "d1".into(),
            position: Some(GeoPoint::new(34.05, -118.25)),
            active,
            last_heartbeat: Utc::now() - Duration::minutes(heartbeat_minutes_ago),
            active_assignments: vec![],
            preferred_vendors: HashSet::new(),
        }
    }

    #[test]
    fn liveness_respects_window_and_active_flag() {
        let now = Utc::now();
        assert!(driver(5, true).is_live(now, 10));
        assert!(!driver(11, true).is_live(now, 10));
        assert!(!driver(5, false).is_live(now, 10));
    }

    #[test]
    fn performance_window_averages() {
        let window = PerformanceWindow {
            success_count: 90,
            total_count: 100,
            rating_sum: 45.0,
            rating_count: 10,
            delivery_minutes_sum: 250.0,
            delivery_minutes_count: 10,
        };
        assert_eq!(window.success_rate(), Some(90.0));
        assert_eq!(window.avg_rating(), Some(4.5));
        assert_eq!(window.avg_minutes(), Some(25.0));
        assert_eq!(PerformanceWindow::default().success_rate(), None);
    }
}
