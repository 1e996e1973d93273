// Integration tests for the dispatch core: full dispatch flow, the
// scheduler tick loop, and memory-pressure cleanup working together.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};

use dispatchd::config::{CircuitConfig, PlatformConfig};
use dispatchd::dispatch::Collaborators;
use dispatchd::domain::{
    CustomerPreferences, Driver, GeoPoint, Order, OrderStatus, PerformanceWindow, Recipient,
    RequestContext,
};
use dispatchd::notify::{Channel, MemoryAdapter, Notifier};
use dispatchd::scheduling::{install_system_jobs, JobOptions, JobTrigger};
use dispatchd::stores::{
    topics, MemoryActivityStore, MemoryAuditSink, MemoryDeviceStore, MemoryDriverSource,
    MemoryIpReputation, MemoryPerformanceStore, MemoryPreferenceStore,
};
use dispatchd::{DispatchError, DispatchPlatform};

struct Harness {
    platform: Arc<DispatchPlatform>,
    drivers: Arc<MemoryDriverSource>,
    performance: Arc<MemoryPerformanceStore>,
    preferences: Arc<MemoryPreferenceStore>,
    sink: Arc<MemoryAuditSink>,
    chat: Arc<MemoryAdapter>,
}

fn harness() -> Harness {
    let sink = Arc::new(MemoryAuditSink::default());
    let drivers = Arc::new(MemoryDriverSource::default());
    let performance = Arc::new(MemoryPerformanceStore::default());
    let preferences = Arc::new(MemoryPreferenceStore::default());
    let chat = Arc::new(MemoryAdapter::new(Channel::Chat));

    let mut notifier = Notifier::new(sink.clone());
    notifier.register_adapter(chat.clone());
    notifier.register_adapter(Arc::new(MemoryAdapter::new(Channel::Email)));

    let collaborators = Collaborators {
        drivers: drivers.clone(),
        performance: performance.clone(),
        preferences: preferences.clone(),
        devices: Arc::new(MemoryDeviceStore::default()),
        activity: Arc::new(MemoryActivityStore::default()),
        ip_reputation: Arc::new(MemoryIpReputation::default()),
        sink: sink.clone(),
    };
    let platform = DispatchPlatform::new(
        PlatformConfig {
            circuit: CircuitConfig {
                base_delay_ms: 1,
                ..CircuitConfig::default()
            },
            ..PlatformConfig::default()
        },
        collaborators,
        notifier,
        Recipient::admin("ops", "ops@example.com"),
    );

    Harness {
        platform,
        drivers,
        performance,
        preferences,
        sink,
        chat,
    }
}

fn driver(id: &str, lat: f64, lon: f64, heartbeat_minutes_ago: i64) -> Driver {
    Driver {
        id: id.into(),
        position: Some(GeoPoint::new(lat, lon)),
        active: true,
        last_heartbeat: Utc::now() - Duration::minutes(heartbeat_minutes_ago),
        active_assignments: vec![],
        preferred_vendors: HashSet::new(),
    }
}

fn order(id: &str) -> Order {
    Order {
        id: id.into(),
        vendor_id: "vendor-1".into(),
        vendor_position: GeoPoint::new(34.05, -118.25),
        author_id: "customer-1".into(),
        total_amount: 29.5,
        status: OrderStatus::DriverPending,
    }
}

fn noon() -> RequestContext {
    RequestContext {
        local_hour: Some(12),
        ..RequestContext::default()
    }
}

#[tokio::test]
async fn full_dispatch_flow_prefers_the_strongest_candidate() {
    let h = harness();
    h.drivers.set_drivers(vec![
        driver("steady", 34.051, -118.25, 0),
        driver("stale", 34.05, -118.25, 11), // outside the liveness window
        driver("remote", 35.2, -119.5, 0),   // outside the search radius
    ]);
    h.performance.set_window(
        "steady",
        PerformanceWindow {
            success_count: 95,
            total_count: 100,
            rating_sum: 48.0,
            rating_count: 10,
            delivery_minutes_sum: 220.0,
            delivery_minutes_count: 10,
        },
    );

    let outcome = h.platform.dispatch(&order("o-1"), &noon()).await.unwrap();
    assert_eq!(outcome.driver_id, "steady");
    assert!(outcome.score > 80.0);

    // The winning driver was notified over in-app chat.
    let delivered = h.chat.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, "steady");

    // The dispatch left an audit trail: threat scoring plus a fraud score.
    assert!(!h.sink.records_for(topics::SECURITY_LOGS).is_empty());
    assert!(!h.sink.records_for(topics::FRAUD_SCORES).is_empty());
    // The delivery itself was logged.
    assert_eq!(h.sink.records_for(topics::NOTIFICATION_LOGS).len(), 1);
}

#[tokio::test]
async fn blocked_driver_loses_to_an_unlisted_one() {
    let h = harness();
    h.drivers.set_drivers(vec![
        driver("blocked", 34.05, -118.25, 0),
        driver("neutral", 34.05, -118.25, 0),
    ]);
    h.preferences.set_preferences(
        "customer-1",
        CustomerPreferences {
            preferred: vec![],
            blocked: vec!["blocked".into()],
        },
    );

    let outcome = h.platform.dispatch(&order("o-2"), &noon()).await.unwrap();
    assert_eq!(outcome.driver_id, "neutral");
}

#[tokio::test]
async fn no_drivers_surfaces_a_typed_error() {
    let h = harness();
    h.drivers.set_drivers(vec![]);

    let err = h.platform.dispatch(&order("o-3"), &noon()).await.unwrap_err();
    assert!(matches!(err, DispatchError::NotFound { .. }));
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn scheduler_tick_loop_runs_installed_jobs() {
    let h = harness();
    install_system_jobs(&h.platform).unwrap();
    assert_eq!(h.platform.scheduler().jobs().len(), 8);

    // A one-shot job rides the same loop the system jobs use.
    let runs = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&runs);
    h.platform
        .scheduler()
        .schedule(
            "probe",
            JobTrigger::At(Utc::now()),
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

    let scheduler = Arc::clone(h.platform.scheduler());
    let ticker = tokio::spawn(Arc::clone(&scheduler).run());

    // Wait for the probe to complete and be removed.
    for _ in 0..100 {
        if runs.load(Ordering::SeqCst) > 0 && scheduler.job("probe").is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    scheduler.stop();
    ticker.await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(scheduler.job("probe").is_none());
    // The periodic registry is still armed.
    assert_eq!(scheduler.jobs().len(), 8);
}

#[tokio::test]
async fn memory_pressure_path_clears_state_and_preload_restores_it() {
    let h = harness();
    h.drivers.set_drivers(vec![driver("steady", 34.05, -118.25, 0)]);
    h.platform.dispatch(&order("o-4"), &noon()).await.unwrap();
    assert!(h.platform.status().spatial.drivers > 0);

    h.platform.emergency_cleanup();
    let status = h.platform.status();
    assert_eq!(status.spatial.drivers, 0);
    assert_eq!(status.cache.store.entries, 0);

    let (loaded, failed) = h.platform.preload_critical().await;
    assert_eq!((loaded, failed), (1, 0));
    assert!(h.platform.status().spatial.drivers > 0);
}

#[tokio::test]
async fn repeated_dispatches_keep_admission_balanced() {
    let h = harness();
    h.drivers.set_drivers(vec![driver("steady", 34.05, -118.25, 0)]);

    for i in 0..5 {
        h.platform
            .dispatch(&order(&format!("o-{i}")), &noon())
            .await
            .unwrap();
    }

    let status = h.platform.status();
    let dispatch_counter = status
        .resources
        .iter()
        .find(|c| matches!(c.kind, dispatchd::resources::ResourceKind::ActiveDispatch))
        .unwrap();
    assert_eq!(dispatch_counter.current, 0);
    assert!(status.performance.operations["dispatch"].count >= 5);
}
