//! Background job scheduling.
//!
//! This module provides:
//! - One-shot and fixed-interval job triggers
//! - Priority-ordered dispatch with a concurrency cap
//! - Per-job timeouts with independent retry backoff
//! - The system-job registry installed at boot

pub mod job;
pub mod scheduler;
pub mod system_jobs;

pub use job::{Interval, Job, JobOptions, JobPriority, JobStatus, JobTrigger};
pub use scheduler::{JobFn, JobScheduler};
pub use system_jobs::install_system_jobs;
