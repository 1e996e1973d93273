//! Job metadata: triggers, priorities, statuses, and retry bookkeeping.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};

/// Linear backoff step after a failed run, in seconds.
pub const FAILURE_BACKOFF_SECS: i64 = 30;

/// Linear backoff step after a timed-out run, in seconds.
pub const TIMEOUT_BACKOFF_SECS: i64 = 60;

/// Job priority. Higher priorities dispatch first within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPriority {
    /// Dispatched before everything else.
    High,
    /// The default.
    Normal,
    /// Dispatched last.
    Low,
}

impl JobPriority {
    /// Sort rank; lower dispatches first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for its next run.
    Scheduled,
    /// Currently executing.
    Running,
    /// Last run succeeded.
    Completed,
    /// Last run failed and no retries remain.
    Failed,
    /// Last run timed out and no retries remain.
    TimedOut,
}

/// Fixed recurrence intervals. The token set is closed; anything else is
/// rejected at schedule time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    /// Every second.
    Second,
    /// Every 5 seconds.
    FiveSeconds,
    /// Every 10 seconds.
    TenSeconds,
    /// Every 30 seconds.
    ThirtySeconds,
    /// Every minute.
    Minute,
    /// Every 5 minutes.
    FiveMinutes,
    /// Every 10 minutes.
    TenMinutes,
    /// Every 15 minutes.
    FifteenMinutes,
    /// Every 30 minutes.
    ThirtyMinutes,
    /// Every hour.
    Hour,
    /// Every day.
    Day,
}

impl Interval {
    /// The interval's duration.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Second => Duration::seconds(1),
            Self::FiveSeconds => Duration::seconds(5),
            Self::TenSeconds => Duration::seconds(10),
            Self::ThirtySeconds => Duration::seconds(30),
            Self::Minute => Duration::minutes(1),
            Self::FiveMinutes => Duration::minutes(5),
            Self::TenMinutes => Duration::minutes(10),
            Self::FifteenMinutes => Duration::minutes(15),
            Self::ThirtyMinutes => Duration::minutes(30),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
        }
    }
}

/// When a job runs: once at a fixed instant, or repeatedly at an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobTrigger {
    /// One-shot at the given instant.
    At(DateTime<Utc>),
    /// Periodic at the given interval.
    Every(Interval),
}

impl JobTrigger {
    /// Parse an `every …` token into a periodic trigger. Unknown tokens
    /// fail fast rather than defaulting.
    pub fn from_token(token: &str) -> DispatchResult<Self> {
        let interval = match token {
            "every second" => Interval::Second,
            "every 5s" => Interval::FiveSeconds,
            "every 10s" => Interval::TenSeconds,
            "every 30s" => Interval::ThirtySeconds,
            "every minute" => Interval::Minute,
            "every 5m" => Interval::FiveMinutes,
            "every 10m" => Interval::TenMinutes,
            "every 15m" => Interval::FifteenMinutes,
            "every 30m" => Interval::ThirtyMinutes,
            "every hour" => Interval::Hour,
            "every day" => Interval::Day,
            other => {
                return Err(DispatchError::InvalidArgument {
                    message: format!("unknown schedule token '{other}'"),
                })
            }
        };
        Ok(Self::Every(interval))
    }

    /// Whether this trigger repeats.
    pub fn is_periodic(&self) -> bool {
        matches!(self, Self::Every(_))
    }
}

/// Options applied when scheduling a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobOptions {
    /// Dispatch priority.
    pub priority: JobPriority,

    /// Retries after failures or timeouts.
    pub max_retries: u32,

    /// Per-run timeout in ms.
    pub timeout_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: JobPriority::Normal,
            max_retries: 3,
            timeout_ms: 300_000,
        }
    }
}

/// One scheduled job's bookkeeping. The executable body lives in the
/// scheduler's handler table, keyed by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: String,

    /// When the job runs.
    pub trigger: JobTrigger,

    /// Dispatch priority.
    pub priority: JobPriority,

    /// Retries after failures or timeouts.
    pub max_retries: u32,

    /// Per-run timeout in ms.
    pub timeout_ms: u64,

    /// Retries consumed since the last success.
    pub retry_count: u32,

    /// Current status.
    pub status: JobStatus,

    /// Next eligible run instant.
    pub next_run: DateTime<Utc>,

    /// When the job last ran.
    pub last_run: Option<DateTime<Utc>>,

    /// Error from the last failed run.
    pub last_error: Option<String>,

    /// When the job was scheduled.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a scheduled job. One-shots run at their instant; periodic
    /// jobs first run one interval from now.
    pub fn new(id: impl Into<String>, trigger: JobTrigger, options: JobOptions) -> Self {
        let now = Utc::now();
        let next_run = match trigger {
            JobTrigger::At(at) => at,
            JobTrigger::Every(interval) => now + interval.duration(),
        };
        Self {
            id: id.into(),
            trigger,
            priority: options.priority,
            max_retries: options.max_retries,
            timeout_ms: options.timeout_ms,
            retry_count: 0,
            status: JobStatus::Scheduled,
            next_run,
            last_run: None,
            last_error: None,
            created_at: now,
        }
    }

    /// Whether the job is eligible to dispatch at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        let runnable = match self.status {
            JobStatus::Scheduled => true,
            JobStatus::Failed | JobStatus::TimedOut => self.retry_count < self.max_retries,
            JobStatus::Running | JobStatus::Completed => false,
        };
        runnable && self.next_run <= now
    }
}
