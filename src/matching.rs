//! Weighted multi-factor driver matching.
//!
//! Candidates are scored by blending five factors in a fixed order:
//! distance (0.30), 30-day performance (0.25), availability (0.20),
//! preference (0.15), and realtime conditions (0.10). Each factor folds
//! into the running score with `score · (1 − w) + sub · w`, starting from a
//! base of 100. Scoring is pure relative to a snapshot of historical data
//! loaded before ranking begins; ties preserve input order.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

use crate::config::MatcherConfig;
use crate::domain::{
    CustomerPreferences, Driver, Order, PerformanceWindow, RequestContext, Traffic, Weather,
};
use crate::geo;

const W_DISTANCE: f64 = 0.30;
const W_PERFORMANCE: f64 = 0.25;
const W_AVAILABILITY: f64 = 0.20;
const W_PREFERENCE: f64 = 0.15;
const W_REALTIME: f64 = 0.10;

/// Default rating assumed when a driver has deliveries but no ratings.
const DEFAULT_RATING: f64 = 4.5;

/// Default delivery minutes assumed when none are recorded.
const DEFAULT_MINUTES: f64 = 30.0;

/// Historical data the matcher reads, loaded once before ranking.
#[derive(Debug, Clone, Default)]
pub struct MatchSnapshot {
    /// 30-day performance windows by driver id.
    pub performance: HashMap<String, PerformanceWindow>,

    /// The ordering customer's preferences.
    pub preferences: CustomerPreferences,
}

/// A candidate annotated with its match score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredDriver {
    /// The candidate.
    pub driver: Driver,

    /// Blended score, rounded to 2 decimals.
    pub match_score: f64,
}

/// Scores and ranks dispatch candidates.
pub struct DriverMatcher {
    config: MatcherConfig,
}

impl DriverMatcher {
    /// Create a matcher.
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Rank `candidates` for `order`, best first. Equal scores keep their
    /// input order.
    pub fn rank(
        &self,
        order: &Order,
        candidates: &[Driver],
        snapshot: &MatchSnapshot,
        ctx: &RequestContext,
    ) -> Vec<ScoredDriver> {
        let mut scored: Vec<ScoredDriver> = candidates
            .iter()
            .map(|driver| ScoredDriver {
                match_score: self.score(order, driver, snapshot, ctx),
                driver: driver.clone(),
            })
            .collect();

        // Stable sort keeps input order for ties.
        scored.sort_by(|a, b| {
            b.match_score
                .partial_cmp(&a.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored
    }

    fn score(
        &self,
        order: &Order,
        driver: &Driver,
        snapshot: &MatchSnapshot,
        ctx: &RequestContext,
    ) -> f64 {
        let factors = [
            (self.distance_score(order, driver), W_DISTANCE),
            (
                self.performance_score(snapshot.performance.get(&driver.id)),
                W_PERFORMANCE,
            ),
            (self.availability_score(driver), W_AVAILABILITY),
            (
                self.preference_score(order, driver, &snapshot.preferences),
                W_PREFERENCE,
            ),
            (self.realtime_score(ctx), W_REALTIME),
        ];

        let mut score = 100.0;
        for (sub, weight) in factors {
            score = score * (1.0 - weight) + sub * weight;
        }
        (score * 100.0).round() / 100.0
    }

    fn distance_score(&self, order: &Order, driver: &Driver) -> f64 {
        let Some(position) = driver.position else {
            return 50.0;
        };
        let miles = geo::distance_miles(
            position.lat,
            position.lon,
            order.vendor_position.lat,
            order.vendor_position.lon,
        );
        if miles <= 5.0 {
            100.0
        } else {
            (100.0 - 10.0 * (miles - 5.0)).max(0.0)
        }
    }

    fn performance_score(&self, window: Option<&PerformanceWindow>) -> f64 {
        let Some(window) = window else {
            return 75.0;
        };
        let Some(success_rate) = window.success_rate() else {
            return 75.0;
        };

        let rating = window.avg_rating().unwrap_or(DEFAULT_RATING);
        let minutes = window.avg_minutes().unwrap_or(DEFAULT_MINUTES);
        let speed = (100.0 - 2.0 * (minutes - 20.0)).max(0.0);

        let score = success_rate * 0.4 + (rating / 5.0) * 100.0 * 0.3 + speed * 0.3;
        score.clamp(0.0, 100.0)
    }

    fn availability_score(&self, driver: &Driver) -> f64 {
        if !driver.active {
            return 0.0;
        }

        let load = 30.0 * driver.active_assignments.len() as f64;
        let mut score = (100.0 - load.min(100.0)).max(0.0);

        let heartbeat_minutes =
            (Utc::now() - driver.last_heartbeat).num_seconds() as f64 / 60.0;
        let grace = self.config.availability_heartbeat_minutes as f64;
        if heartbeat_minutes > grace {
            score = (score - 5.0 * (heartbeat_minutes - grace)).max(0.0);
        }
        score
    }

    fn preference_score(
        &self,
        order: &Order,
        driver: &Driver,
        preferences: &CustomerPreferences,
    ) -> f64 {
        if preferences.preferred.contains(&driver.id) {
            100.0
        } else if preferences.blocked.contains(&driver.id) {
            0.0
        } else if driver.preferred_vendors.contains(&order.vendor_id) {
            90.0
        } else {
            80.0
        }
    }

    fn realtime_score(&self, ctx: &RequestContext) -> f64 {
        let mut score: f64 = 100.0;
        if matches!(ctx.weather, Weather::Rain | Weather::Snow) {
            score -= 10.0;
        }
        if ctx.traffic == Traffic::Heavy {
            score -= 15.0;
        }
        let hour = ctx.hour();
        if (11..=14).contains(&hour) || (17..=21).contains(&hour) {
            score += 10.0;
        }
        score.max(0.0)
    }
}
