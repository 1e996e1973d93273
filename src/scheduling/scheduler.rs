//! Cooperative tick-loop scheduler with priority dispatch and retries.
//!
//! The tick loop is a single task. Once per tick it collects every job
//! whose next run is due, orders them by priority then next-run instant,
//! and dispatches as many as the concurrency cap allows; dispatched jobs
//! run as independent tasks racing their configured timeout. Failures and
//! timeouts back off linearly and retry on later ticks.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::time::timeout;

use crate::config::SchedulerConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::scheduling::job::{
    Job, JobOptions, JobStatus, JobTrigger, FAILURE_BACKOFF_SECS, TIMEOUT_BACKOFF_SECS,
};
use crate::stores::{topics, AuditSink};

/// The executable body of a job.
pub type JobFn = Arc<dyn Fn() -> BoxFuture<'static, DispatchResult<()>> + Send + Sync>;

enum RunOutcome {
    Success,
    Failure(DispatchError),
    Timeout,
}

/// Periodic job scheduler.
pub struct JobScheduler {
    config: SchedulerConfig,
    jobs: RwLock<HashMap<String, Job>>,
    handlers: RwLock<HashMap<String, JobFn>>,
    running: RwLock<HashSet<String>>,
    sink: Arc<dyn AuditSink>,
    shutdown: AtomicBool,
}

impl JobScheduler {
    /// Create a scheduler. Call [`Self::run`] to start the tick loop.
    pub fn new(config: SchedulerConfig, sink: Arc<dyn AuditSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            jobs: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            running: RwLock::new(HashSet::new()),
            sink,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Schedule `f` under `id`, replacing any job with the same id.
    pub fn schedule(
        &self,
        id: impl Into<String>,
        trigger: JobTrigger,
        options: JobOptions,
        f: JobFn,
    ) -> DispatchResult<()> {
        let id = id.into();
        let job = Job::new(id.clone(), trigger, options);
        tracing::debug!(job = %id, next_run = %job.next_run, "job scheduled");
        self.handlers.write().insert(id.clone(), f);
        self.jobs.write().insert(id, job);
        Ok(())
    }

    /// Remove a job. Returns whether it existed. A running instance is not
    /// interrupted; its completion is simply discarded.
    pub fn cancel(&self, id: &str) -> bool {
        self.handlers.write().remove(id);
        self.jobs.write().remove(id).is_some()
    }

    /// Snapshot of one job.
    pub fn job(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    /// Snapshot of every job, ordered by id.
    pub fn jobs(&self) -> Vec<Job> {
        let mut all: Vec<Job> = self.jobs.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Ids of currently running jobs.
    pub fn running(&self) -> usize {
        self.running.read().len()
    }

    /// Stop the tick loop after the current iteration.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run the tick loop until [`Self::stop`] is called.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(tick_ms = self.config.tick_ms, "scheduler started");
        while !self.shutdown.load(Ordering::SeqCst) {
            self.tick();
            tokio::time::sleep(std::time::Duration::from_millis(self.config.tick_ms)).await;
        }
        tracing::info!("scheduler stopped");
    }

    /// One scheduler iteration: dispatch every due job the concurrency cap
    /// allows, highest priority first, ties broken by earlier next-run.
    pub fn tick(self: &Arc<Self>) {
        let now = Utc::now();

        let mut due: Vec<(String, u8, chrono::DateTime<Utc>)> = {
            let jobs = self.jobs.read();
            let running = self.running.read();
            jobs.values()
                .filter(|job| job.is_ready(now) && !running.contains(&job.id))
                .map(|job| (job.id.clone(), job.priority.rank(), job.next_run))
                .collect()
        };
        due.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        for (id, _, _) in due {
            if self.running.read().len() >= self.config.max_concurrent_jobs {
                break;
            }
            self.dispatch(id);
        }
    }

    fn dispatch(self: &Arc<Self>, id: String) {
        let Some(handler) = self.handlers.read().get(&id).cloned() else {
            tracing::error!(job = %id, "job has no handler, removing");
            self.jobs.write().remove(&id);
            return;
        };

        let timeout_ms = {
            let mut jobs = self.jobs.write();
            let Some(job) = jobs.get_mut(&id) else {
                return;
            };
            job.status = JobStatus::Running;
            job.last_run = Some(Utc::now());
            job.timeout_ms
        };
        self.running.write().insert(id.clone());

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match timeout(
                std::time::Duration::from_millis(timeout_ms),
                handler(),
            )
            .await
            {
                Ok(Ok(())) => RunOutcome::Success,
                Ok(Err(err)) => RunOutcome::Failure(err),
                Err(_) => RunOutcome::Timeout,
            };
            scheduler.on_complete(&id, outcome).await;
        });
    }

    async fn on_complete(&self, id: &str, outcome: RunOutcome) {
        self.running.write().remove(id);

        // Mutate bookkeeping under the lock, then persist outside it.
        let mut exhausted_error: Option<String> = None;
        let mut remove_job = false;
        {
            let mut jobs = self.jobs.write();
            let Some(job) = jobs.get_mut(id) else {
                return; // cancelled while running
            };
            let now = Utc::now();

            match outcome {
                RunOutcome::Success => {
                    job.retry_count = 0;
                    job.last_error = None;
                    match job.trigger {
                        JobTrigger::Every(interval) => {
                            job.status = JobStatus::Scheduled;
                            job.next_run = now + interval.duration();
                        }
                        JobTrigger::At(_) => {
                            job.status = JobStatus::Completed;
                            remove_job = true;
                        }
                    }
                }
                RunOutcome::Failure(err) => {
                    job.last_error = Some(err.to_string());
                    if job.retry_count < job.max_retries {
                        job.retry_count += 1;
                        job.next_run =
                            now + Duration::seconds(FAILURE_BACKOFF_SECS * job.retry_count as i64);
                        job.status = JobStatus::Scheduled;
                        tracing::warn!(job = %id, retry = job.retry_count, error = %err, "job failed, retrying");
                    } else {
                        job.status = JobStatus::Failed;
                        exhausted_error = Some(err.to_string());
                        remove_job = !job.trigger.is_periodic();
                    }
                }
                RunOutcome::Timeout => {
                    job.last_error = Some("job execution timeout".to_string());
                    if job.retry_count < job.max_retries {
                        job.retry_count += 1;
                        job.next_run =
                            now + Duration::seconds(TIMEOUT_BACKOFF_SECS * job.retry_count as i64);
                        job.status = JobStatus::Scheduled;
                        tracing::warn!(job = %id, retry = job.retry_count, "job timed out, retrying");
                    } else {
                        job.status = JobStatus::TimedOut;
                        exhausted_error = Some("job execution timeout".to_string());
                        remove_job = !job.trigger.is_periodic();
                    }
                }
            }

            if remove_job {
                jobs.remove(id);
            }
        }
        if remove_job {
            self.handlers.write().remove(id);
        }

        if let Some(error) = exhausted_error {
            tracing::error!(job = %id, error = %error, "job retries exhausted");
            let record = serde_json::json!({
                "subject": id,
                "action": "job_retries_exhausted",
                "metadata": { "error": error },
                "instant": Utc::now(),
            });
            if let Err(err) = self.sink.append(topics::SECURITY_LOGS, record).await {
                tracing::warn!(error = %err, "failed to persist critical action");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduling::job::{Interval, JobPriority};
    use crate::stores::MemoryAuditSink;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    fn scheduler(max_concurrent: usize) -> (Arc<JobScheduler>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::default());
        let scheduler = JobScheduler::new(
            SchedulerConfig {
                max_concurrent_jobs: max_concurrent,
                tick_ms: 10,
            },
            sink.clone(),
        );
        (scheduler, sink)
    }

    fn due_now() -> JobTrigger {
        JobTrigger::At(Utc::now() - Duration::seconds(1))
    }

    async fn settle(scheduler: &Arc<JobScheduler>) {
        for _ in 0..50 {
            if scheduler.running() == 0 {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("jobs did not settle");
    }

    #[tokio::test]
    async fn one_shot_runs_and_is_removed() {
        let (scheduler, _) = scheduler(5);
        let runs = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&runs);
        scheduler
            .schedule(
                "once",
                due_now(),
                JobOptions::default(),
                Arc::new(move || {
                    let counted = Arc::clone(&counted);
                    Box::pin(async move {
                        counted.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .unwrap();

        scheduler.tick();
        settle(&scheduler).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.job("once").is_none());
        assert!(scheduler.handlers.read().is_empty());
    }

    #[tokio::test]
    async fn periodic_job_rearms_after_success() {
        let (scheduler, _) = scheduler(5);
        scheduler
            .schedule(
                "heartbeat",
                JobTrigger::Every(Interval::Second),
                JobOptions::default(),
                Arc::new(|| Box::pin(async { Ok(()) })),
            )
            .unwrap();

        // Force the first run to be due now.
        scheduler.jobs.write().get_mut("heartbeat").unwrap().next_run = Utc::now();
        scheduler.tick();
        settle(&scheduler).await;

        let job = scheduler.job("heartbeat").unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.next_run > Utc::now() - Duration::seconds(1));
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn priority_orders_dispatch_under_a_cap_of_one() {
        let (scheduler, _) = scheduler(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for (id, priority) in [
            ("low", JobPriority::Low),
            ("high", JobPriority::High),
            ("normal", JobPriority::Normal),
        ] {
            let order = Arc::clone(&order);
            scheduler
                .schedule(
                    id,
                    due_now(),
                    JobOptions {
                        priority,
                        ..JobOptions::default()
                    },
                    Arc::new(move || {
                        let order = Arc::clone(&order);
                        let id = id.to_string();
                        Box::pin(async move {
                            order.lock().push(id);
                            Ok(())
                        })
                    }),
                )
                .unwrap();
        }

        // Strictly sequential: one dispatch per tick.
        for _ in 0..3 {
            scheduler.tick();
            settle(&scheduler).await;
        }

        assert_eq!(*order.lock(), vec!["high", "normal", "low"]);
    }

    #[tokio::test]
    async fn failing_job_walks_the_retry_ladder_then_is_removed() {
        let (scheduler, sink) = scheduler(5);
        scheduler
            .schedule(
                "doomed",
                due_now(),
                JobOptions {
                    max_retries: 2,
                    ..JobOptions::default()
                },
                Arc::new(|| {
                    Box::pin(async { Err(DispatchError::transient("always fails")) })
                }),
            )
            .unwrap();

        // Failure 1: 30 s backoff, one retry consumed.
        scheduler.tick();
        settle(&scheduler).await;
        let job = scheduler.job("doomed").unwrap();
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.status, JobStatus::Scheduled);
        let backoff = (job.next_run - Utc::now()).num_seconds();
        assert!((25..=30).contains(&backoff), "got {backoff}");

        // Failure 2: 60 s backoff.
        scheduler.jobs.write().get_mut("doomed").unwrap().next_run = Utc::now();
        scheduler.tick();
        settle(&scheduler).await;
        let job = scheduler.job("doomed").unwrap();
        assert_eq!(job.retry_count, 2);
        let backoff = (job.next_run - Utc::now()).num_seconds();
        assert!((55..=60).contains(&backoff), "got {backoff}");

        // Failure 3: retries exhausted, job removed, critical action logged.
        scheduler.jobs.write().get_mut("doomed").unwrap().next_run = Utc::now();
        scheduler.tick();
        settle(&scheduler).await;
        assert!(scheduler.job("doomed").is_none());

        let logs = sink.records_for(topics::SECURITY_LOGS);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].record["action"], "job_retries_exhausted");
    }

    #[tokio::test]
    async fn timed_out_job_backs_off_longer() {
        let (scheduler, _) = scheduler(5);
        scheduler
            .schedule(
                "slow",
                due_now(),
                JobOptions {
                    max_retries: 1,
                    timeout_ms: 10,
                    ..JobOptions::default()
                },
                Arc::new(|| {
                    Box::pin(async {
                        tokio::time::sleep(StdDuration::from_millis(200)).await;
                        Ok(())
                    })
                }),
            )
            .unwrap();

        scheduler.tick();
        settle(&scheduler).await;

        let job = scheduler.job("slow").unwrap();
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.last_error.as_deref(), Some("job execution timeout"));
        let backoff = (job.next_run - Utc::now()).num_seconds();
        assert!((55..=60).contains(&backoff), "got {backoff}");
    }

    #[tokio::test]
    async fn concurrency_cap_limits_in_flight_jobs() {
        let (scheduler, _) = scheduler(2);
        for i in 0..3 {
            scheduler
                .schedule(
                    format!("job{i}"),
                    due_now(),
                    JobOptions::default(),
                    Arc::new(|| {
                        Box::pin(async {
                            tokio::time::sleep(StdDuration::from_millis(100)).await;
                            Ok(())
                        })
                    }),
                )
                .unwrap();
        }

        scheduler.tick();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(scheduler.running(), 2);

        settle(&scheduler).await;
        scheduler.tick();
        settle(&scheduler).await;
        assert!(scheduler.jobs().is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_job_and_handler() {
        let (scheduler, _) = scheduler(5);
        scheduler
            .schedule(
                "gone",
                JobTrigger::Every(Interval::Hour),
                JobOptions::default(),
                Arc::new(|| Box::pin(async { Ok(()) })),
            )
            .unwrap();

        assert!(scheduler.cancel("gone"));
        assert!(!scheduler.cancel("gone"));
        assert!(scheduler.jobs().is_empty());
    }
}
