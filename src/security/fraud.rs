//! Heuristic fraud scoring.
//!
//! Aggregates four factor groups: action velocity over the last five
//! minutes, device novelty against the subject's known devices, time-of-day
//! risk, and location anomaly. Collaborator read failures degrade to empty
//! data; a flaky device store must not block scoring.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::domain::RequestContext;
use crate::stores::{topics, ActivityStore, AuditSink, DeviceStore};

/// Velocity window consulted for per-subject action counts.
const VELOCITY_WINDOW_MINUTES: i64 = 5;

/// Fraud severity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FraudLevel {
    /// Nothing notable.
    Minimal,
    /// Worth keeping an eye on.
    Low,
    /// Elevated risk.
    Medium,
    /// Likely abusive.
    High,
}

impl FraudLevel {
    fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            Self::High
        } else if score >= 50.0 {
            Self::Medium
        } else if score >= 25.0 {
            Self::Low
        } else {
            Self::Minimal
        }
    }
}

/// Outcome of one fraud assessment.
#[derive(Debug, Clone, Serialize)]
pub struct FraudAssessment {
    /// Aggregate score, clamped to 0..=100.
    pub score: f64,

    /// The factors that contributed.
    pub factors: Vec<String>,

    /// Severity bucket.
    pub level: FraudLevel,
}

/// Scores subjects for fraud signals.
pub struct FraudScorer {
    devices: Arc<dyn DeviceStore>,
    activity: Arc<dyn ActivityStore>,
    sink: Arc<dyn AuditSink>,
}

impl FraudScorer {
    /// Create a scorer over the collaborator stores.
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        activity: Arc<dyn ActivityStore>,
        sink: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            devices,
            activity,
            sink,
        }
    }

    /// Assess `subject` performing `activity`, persisting the score.
    pub async fn assess(
        &self,
        subject: &str,
        activity: &str,
        ctx: &RequestContext,
    ) -> FraudAssessment {
        let mut score = 0.0;
        let mut factors = Vec::new();

        self.velocity(subject, &mut score, &mut factors).await;
        self.device_novelty(subject, ctx, &mut score, &mut factors)
            .await;

        if (0..=5).contains(&ctx.hour()) {
            score += 10.0;
            factors.push("late_night_activity".into());
        }
        if ctx.rapid_location_changes {
            score += 20.0;
            factors.push("location_anomaly".into());
        }

        let assessment = FraudAssessment {
            score: score.min(100.0),
            level: FraudLevel::from_score(score),
            factors,
        };

        let record = serde_json::json!({
            "subject": subject,
            "activity": activity,
            "score": assessment.score,
            "factors": assessment.factors,
            "level": assessment.level,
            "instant": Utc::now(),
        });
        if let Err(err) = self.sink.append(topics::FRAUD_SCORES, record).await {
            tracing::warn!(error = %err, "failed to persist fraud score");
        }

        assessment
    }

    async fn velocity(&self, subject: &str, score: &mut f64, factors: &mut Vec<String>) {
        let from = Utc::now() - Duration::minutes(VELOCITY_WINDOW_MINUTES);
        let recent = match self.activity.recent(subject, from).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(subject, error = %err, "activity store unavailable for velocity");
                return;
            }
        };

        if recent.len() > 10 {
            *score += 40.0;
            factors.push("high_action_velocity".into());
        } else if recent.len() > 5 {
            *score += 20.0;
            factors.push("elevated_action_velocity".into());
        }

        let distinct: HashSet<&str> = recent.iter().map(|r| r.action.as_str()).collect();
        if distinct.len() > 8 {
            *score += 30.0;
            factors.push("scattered_action_kinds".into());
        }
    }

    async fn device_novelty(
        &self,
        subject: &str,
        ctx: &RequestContext,
        score: &mut f64,
        factors: &mut Vec<String>,
    ) {
        let known = match self.devices.recent(subject).await {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(subject, error = %err, "device store unavailable for novelty");
                return;
            }
        };
        // A subject with no device history has nothing to be novel against.
        if known.is_empty() {
            return;
        }

        if let Some(ip) = &ctx.client_ip {
            if !known.iter().any(|d| d.ip == *ip) {
                *score += 20.0;
                factors.push("new_ip".into());
            }
        }
        if let Some(ua) = &ctx.user_agent {
            if !known.iter().any(|d| d.user_agent == *ua) {
                *score += 15.0;
                factors.push("new_user_agent".into());
            }
        }
        if let Some(fingerprint) = &ctx.device_fingerprint {
            if !known.iter().any(|d| d.fingerprint == *fingerprint) {
                *score += 25.0;
                factors.push("new_fingerprint".into());
            }
        }
    }
}
