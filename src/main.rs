//! DISPATCHD - Delivery Dispatch Platform Core
//!
//! Service entry point: builds the platform against in-memory
//! collaborators, installs the system-job registry, and runs the
//! scheduler's tick loop. Production deployments swap the collaborators
//! for the real driver source, stores, and notification backends.

use std::sync::Arc;

use dispatchd::dispatch::Collaborators;
use dispatchd::notify::{Channel, ConsoleAdapter, Notifier};
use dispatchd::scheduling::install_system_jobs;
use dispatchd::stores::{
    MemoryActivityStore, MemoryAuditSink, MemoryDeviceStore, MemoryDriverSource,
    MemoryIpReputation, MemoryPerformanceStore, MemoryPreferenceStore,
};
use dispatchd::{DispatchPlatform, PlatformConfig, Recipient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    tracing::info!(
        version = dispatchd::VERSION,
        "starting {} dispatch core",
        dispatchd::NAME
    );

    let sink = Arc::new(MemoryAuditSink::default());
    let collaborators = Collaborators {
        drivers: Arc::new(MemoryDriverSource::default()),
        performance: Arc::new(MemoryPerformanceStore::default()),
        preferences: Arc::new(MemoryPreferenceStore::default()),
        devices: Arc::new(MemoryDeviceStore::default()),
        activity: Arc::new(MemoryActivityStore::default()),
        ip_reputation: Arc::new(MemoryIpReputation::default()),
        sink: sink.clone(),
    };

    let mut notifier = Notifier::new(sink);
    for channel in [
        Channel::Push,
        Channel::Sms,
        Channel::Email,
        Channel::Webhook,
        Channel::Chat,
    ] {
        notifier.register_adapter(Arc::new(ConsoleAdapter::new(channel)));
    }

    let platform = DispatchPlatform::new(
        PlatformConfig::default(),
        collaborators,
        notifier,
        Recipient::admin("ops", "ops@dispatchd.dev"),
    );
    install_system_jobs(&platform)?;

    let scheduler = Arc::clone(platform.scheduler());
    let ticker = tokio::spawn(scheduler.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    platform.scheduler().stop();
    ticker.await?;

    Ok(())
}
