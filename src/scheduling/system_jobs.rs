//! The periodic system-job registry installed at boot.

use std::future::Future;
use std::sync::Arc;

use crate::dispatch::DispatchPlatform;
use crate::error::DispatchResult;
use crate::scheduling::job::{Interval, JobOptions, JobPriority, JobTrigger};
use crate::scheduling::scheduler::JobFn;

fn platform_job<F, Fut>(platform: &Arc<DispatchPlatform>, f: F) -> JobFn
where
    F: Fn(Arc<DispatchPlatform>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult<()>> + Send + 'static,
{
    // Jobs hold a weak reference so the registry never keeps a torn-down
    // platform alive; a job that outlives it becomes a no-op.
    let platform = Arc::downgrade(platform);
    Arc::new(
        move || -> futures::future::BoxFuture<'static, DispatchResult<()>> {
            match platform.upgrade() {
                Some(platform) => Box::pin(f(platform)),
                None => Box::pin(async { Ok(()) }),
            }
        },
    )
}

/// Install the full periodic registry on the platform's scheduler:
/// cleanup sweeps, reports, cache preload, resource sampling, spatial GC,
/// and demand/utilization prediction.
pub fn install_system_jobs(platform: &Arc<DispatchPlatform>) -> DispatchResult<()> {
    let scheduler = Arc::clone(platform.scheduler());

    let with_priority = |priority: JobPriority| JobOptions {
        priority,
        ..JobOptions::default()
    };

    scheduler.schedule(
        "cleanup-sweeper",
        JobTrigger::Every(Interval::ThirtyMinutes),
        with_priority(JobPriority::Normal),
        platform_job(platform, |platform| async move {
            platform.cleanup_sweep();
            Ok(())
        }),
    )?;

    scheduler.schedule(
        "performance-report",
        JobTrigger::Every(Interval::TenMinutes),
        with_priority(JobPriority::Normal),
        platform_job(platform, |platform| async move {
            platform.publish_performance_report().await
        }),
    )?;

    scheduler.schedule(
        "cache-preload",
        JobTrigger::Every(Interval::Hour),
        with_priority(JobPriority::Low),
        platform_job(platform, |platform| async move {
            platform.preload_critical().await;
            Ok(())
        }),
    )?;

    scheduler.schedule(
        "threat-report",
        JobTrigger::Every(Interval::ThirtyMinutes),
        with_priority(JobPriority::Normal),
        platform_job(platform, |platform| async move {
            platform.publish_threat_report().await
        }),
    )?;

    scheduler.schedule(
        "resource-sampler",
        JobTrigger::Every(Interval::FiveMinutes),
        with_priority(JobPriority::High),
        platform_job(platform, |platform| async move {
            platform.sample_resources().await;
            Ok(())
        }),
    )?;

    scheduler.schedule(
        "spatial-gc",
        JobTrigger::Every(Interval::TenMinutes),
        with_priority(JobPriority::Normal),
        platform_job(platform, |platform| async move {
            platform.spatial_gc();
            Ok(())
        }),
    )?;

    scheduler.schedule(
        "demand-prediction",
        JobTrigger::Every(Interval::FifteenMinutes),
        with_priority(JobPriority::Low),
        platform_job(platform, |platform| async move {
            platform.publish_demand_prediction().await
        }),
    )?;

    scheduler.schedule(
        "utilization-prediction",
        JobTrigger::Every(Interval::ThirtyMinutes),
        with_priority(JobPriority::Low),
        platform_job(platform, |platform| async move {
            platform.publish_utilization_prediction().await
        }),
    )?;

    tracing::info!("system jobs installed");
    Ok(())
}
