//! Rolling per-subject threat scoring with threshold actions.
//!
//! Every scored activity lands in a bounded per-subject window. The score
//! sums four analyses: session signals, network reputation, temporal
//! patterns, and behavior (which folds in the fraud subscore at 0.8
//! weight). Crossing a threshold records an incident, notifies operators,
//! and can flag or suspend the subject. The scripted-behavior and
//! unusual-transaction flags are counted once here at full weight; the
//! fraud subscore contributes only its own factors.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ThreatConfig;
use crate::domain::{Recipient, RequestContext};
use crate::notify::{Channel, Message, Notifier, Severity};
use crate::security::fraud::FraudScorer;
use crate::stores::{topics, AuditSink, IpReputation};

const WINDOW_MAX: usize = 200;
const WINDOW_KEEP: usize = 100;

/// Activity windows older than this are pruned by the cleanup sweep.
const WINDOW_IDLE_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
struct ActivityEvent {
    tag: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default)]
struct SubjectStanding {
    high_threat: bool,
    suspended: bool,
}

/// Threat bucket for one assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ThreatLevel {
    /// Below every threshold.
    None,
    /// Counted, no incident.
    Low,
    /// Incident recorded.
    Medium,
    /// Subject flagged, operators paged.
    High,
}

/// Outcome of one scoring pass.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatAssessment {
    /// Aggregate score, clamped to 0..=100.
    pub score: f64,

    /// Bucket the score landed in.
    pub level: ThreatLevel,

    /// Automatic actions taken during this pass.
    pub auto_actions: Vec<String>,
}

/// Aggregate threat metrics for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatMetrics {
    /// Subjects with recorded activity windows.
    pub tracked_subjects: usize,

    /// Subjects currently flagged high-threat.
    pub high_threat_subjects: usize,

    /// Subjects currently suspended.
    pub suspended_subjects: usize,

    /// Low-threat events counted since startup.
    pub low_threat_events: u64,

    /// Incidents recorded since startup.
    pub incidents: u64,
}

/// Scores subject activity and reacts to thresholds.
pub struct ThreatMonitor {
    config: ThreatConfig,
    windows: DashMap<String, Vec<ActivityEvent>>,
    standings: DashMap<String, SubjectStanding>,
    suspicious_ips: RwLock<HashSet<String>>,
    ip_reputation: Arc<dyn IpReputation>,
    fraud: FraudScorer,
    notifier: Arc<Notifier>,
    sink: Arc<dyn AuditSink>,
    ops_recipient: Recipient,
    low_threats: AtomicU64,
    incidents: AtomicU64,
}

impl ThreatMonitor {
    /// Create a monitor.
    pub fn new(
        config: ThreatConfig,
        ip_reputation: Arc<dyn IpReputation>,
        fraud: FraudScorer,
        notifier: Arc<Notifier>,
        sink: Arc<dyn AuditSink>,
        ops_recipient: Recipient,
    ) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            standings: DashMap::new(),
            suspicious_ips: RwLock::new(HashSet::new()),
            ip_reputation,
            fraud,
            notifier,
            sink,
            ops_recipient,
            low_threats: AtomicU64::new(0),
            incidents: AtomicU64::new(0),
        }
    }

    /// Add an IP to the local suspicious set.
    pub fn mark_suspicious_ip(&self, ip: impl Into<String>) {
        self.suspicious_ips.write().insert(ip.into());
    }

    /// Whether `subject` has been suspended by a threshold action.
    pub fn is_suspended(&self, subject: &str) -> bool {
        self.standings
            .get(subject)
            .map(|s| s.suspended)
            .unwrap_or(false)
    }

    /// Whether `subject` is flagged high-threat.
    pub fn is_high_threat(&self, subject: &str) -> bool {
        self.standings
            .get(subject)
            .map(|s| s.high_threat)
            .unwrap_or(false)
    }

    /// Score `subject` performing `activity`, record the activity in the
    /// subject's window, apply threshold actions, and persist an audit
    /// record.
    pub async fn score(
        &self,
        subject: &str,
        activity: &str,
        ctx: &RequestContext,
    ) -> ThreatAssessment {
        self.record_activity(subject, activity);

        let mut score = 0.0;
        score += self.session_analysis(ctx);
        score += self.network_analysis(ctx).await;
        score += self.temporal_analysis(subject, activity, ctx);
        score += self.behavioral_analysis(subject, activity, ctx).await;
        let score = score.min(100.0);

        let (level, auto_actions) = self.apply_thresholds(subject, activity, score, ctx).await;

        let audit = serde_json::json!({
            "subject": subject,
            "action": activity,
            "metadata": { "score": score, "level": level },
            "instant": Utc::now(),
        });
        if let Err(err) = self.sink.append(topics::SECURITY_LOGS, audit).await {
            tracing::warn!(error = %err, "failed to persist threat audit record");
        }

        ThreatAssessment {
            score,
            level,
            auto_actions,
        }
    }

    /// Drop activity windows idle for longer than the retention horizon.
    pub fn prune_idle_windows(&self) -> usize {
        let cutoff = Utc::now() - Duration::minutes(WINDOW_IDLE_MINUTES);
        let before = self.windows.len();
        self.windows
            .retain(|_, events| events.iter().any(|e| e.at >= cutoff));
        before - self.windows.len()
    }

    /// Aggregate metrics for the operator surface.
    pub fn metrics(&self) -> ThreatMetrics {
        let high = self
            .standings
            .iter()
            .filter(|s| s.value().high_threat)
            .count();
        let suspended = self
            .standings
            .iter()
            .filter(|s| s.value().suspended)
            .count();
        ThreatMetrics {
            tracked_subjects: self.windows.len(),
            high_threat_subjects: high,
            suspended_subjects: suspended,
            low_threat_events: self.low_threats.load(Ordering::Relaxed),
            incidents: self.incidents.load(Ordering::Relaxed),
        }
    }

    fn record_activity(&self, subject: &str, activity: &str) {
        let mut window = self.windows.entry(subject.to_string()).or_default();
        window.push(ActivityEvent {
            tag: activity.to_string(),
            at: Utc::now(),
        });
        if window.len() > WINDOW_MAX {
            let excess = window.len() - WINDOW_KEEP;
            window.drain(0..excess);
        }
    }

    fn session_analysis(&self, ctx: &RequestContext) -> f64 {
        let mut points = 0.0;
        if ctx.multiple_devices {
            points += 20.0;
        }
        if ctx.rapid_location_changes {
            points += 30.0;
        }
        if ctx.unusual_user_agent {
            points += 15.0;
        }
        if ctx.excessive_failed_logins {
            points += 25.0;
        }
        points
    }

    async fn network_analysis(&self, ctx: &RequestContext) -> f64 {
        let mut points = 0.0;
        if let Some(ip) = &ctx.client_ip {
            if self.suspicious_ips.read().contains(ip) {
                points += 40.0;
            }
            match self.ip_reputation.is_blacklisted(ip).await {
                Ok(true) => points += 60.0,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "ip reputation lookup failed");
                }
            }
        }
        if ctx.vpn_detected {
            points += 10.0;
        }
        if ctx.tor_detected {
            points += 35.0;
        }
        points
    }

    fn temporal_analysis(&self, subject: &str, activity: &str, ctx: &RequestContext) -> f64 {
        let mut points = 0.0;
        if (0..=5).contains(&ctx.hour()) {
            points += 15.0;
        }

        if let Some(window) = self.windows.get(subject) {
            let minute_ago = Utc::now() - Duration::minutes(1);
            let recent: Vec<&ActivityEvent> =
                window.iter().filter(|e| e.at >= minute_ago).collect();
            let same_tag = recent.iter().filter(|e| e.tag == activity).count();
            if same_tag > 5 || recent.len() > 15 {
                points += 25.0;
            }
        }
        points
    }

    async fn behavioral_analysis(
        &self,
        subject: &str,
        activity: &str,
        ctx: &RequestContext,
    ) -> f64 {
        let mut points = 0.0;
        if ctx.automated_behavior_detected {
            points += 40.0;
        }
        if ctx.unusual_transaction_pattern {
            points += 30.0;
        }
        let fraud = self.fraud.assess(subject, activity, ctx).await;
        points + fraud.score * 0.8
    }

    async fn apply_thresholds(
        &self,
        subject: &str,
        activity: &str,
        score: f64,
        ctx: &RequestContext,
    ) -> (ThreatLevel, Vec<String>) {
        let mut auto_actions = Vec::new();

        if score >= self.config.high {
            let mut standing = self.standings.entry(subject.to_string()).or_default();
            standing.high_threat = true;
            auto_actions.push("flagged_high_threat".to_string());
            if score >= self.config.suspend {
                standing.suspended = true;
                auto_actions.push("suspended".to_string());
            }
            drop(standing);

            tracing::error!(subject, score, "high threat detected");
            self.record_incident(subject, activity, score, "HIGH", ctx, &auto_actions)
                .await;
            self.page_operators(subject, score, Severity::Critical).await;
            (ThreatLevel::High, auto_actions)
        } else if score >= self.config.medium {
            tracing::warn!(subject, score, "medium threat detected");
            self.record_incident(subject, activity, score, "MEDIUM", ctx, &auto_actions)
                .await;
            self.page_operators(subject, score, Severity::Urgent).await;
            (ThreatLevel::Medium, auto_actions)
        } else if score >= self.config.low {
            self.low_threats.fetch_add(1, Ordering::Relaxed);
            (ThreatLevel::Low, auto_actions)
        } else {
            (ThreatLevel::None, auto_actions)
        }
    }

    async fn record_incident(
        &self,
        subject: &str,
        activity: &str,
        score: f64,
        severity: &str,
        ctx: &RequestContext,
        auto_actions: &[String],
    ) {
        self.incidents.fetch_add(1, Ordering::Relaxed);
        let record = serde_json::json!({
            "id": Uuid::new_v4().to_string(),
            "subject": subject,
            "activity": activity,
            "threatScore": score,
            "severity": severity,
            "context": ctx,
            "instant": Utc::now(),
            "autoActions": auto_actions,
        });
        if let Err(err) = self.sink.append(topics::SECURITY_INCIDENTS, record).await {
            tracing::warn!(error = %err, "failed to persist incident");
        }
    }

    async fn page_operators(&self, subject: &str, score: f64, severity: Severity) {
        let message = Message::new(
            format!("Threat detected: {subject}"),
            format!("Activity scored {score:.0} for subject {subject}"),
        );
        self.notifier
            .send(
                &self.ops_recipient,
                &message,
                severity,
                &[Channel::Email, Channel::Chat],
            )
            .await;
    }
}
