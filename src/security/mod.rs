//! Threat-aware activity scoring.
//!
//! - `fraud`: heuristic fraud subscore from velocity, device novelty, and
//!   contextual risk
//! - `threat`: rolling per-subject activity scoring with threshold actions
//!
//! The fraud score is a heuristic signal feeding the threat score, never an
//! authorization control.

pub mod fraud;
pub mod threat;

pub use fraud::{FraudAssessment, FraudLevel, FraudScorer};
pub use threat::{ThreatAssessment, ThreatLevel, ThreatMetrics, ThreatMonitor};
