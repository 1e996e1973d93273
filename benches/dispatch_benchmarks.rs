use std::collections::HashSet;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use dispatchd::config::{MatcherConfig, SpatialConfig};
use dispatchd::domain::{Driver, GeoPoint, Order, OrderStatus, RequestContext};
use dispatchd::matching::{DriverMatcher, MatchSnapshot};
use dispatchd::spatial::DriverGrid;

fn drivers(count: usize) -> Vec<Driver> {
    (0..count)
        .map(|i| Driver {
            id: format!("d{i}"),
            position: Some(GeoPoint::new(
                34.00 + (i % 100) as f64 * 0.001,
                -118.30 + (i / 100) as f64 * 0.001,
            )),
            active: true,
            last_heartbeat: Utc::now(),
            active_assignments: vec![],
            preferred_vendors: HashSet::new(),
        })
        .collect()
}

fn order() -> Order {
    Order {
        id: "o1".into(),
        vendor_id: "v1".into(),
        vendor_position: GeoPoint::new(34.05, -118.25),
        author_id: "u1".into(),
        total_amount: 42.0,
        status: OrderStatus::DriverPending,
    }
}

fn bench_radius_query(c: &mut Criterion) {
    let grid = DriverGrid::new(SpatialConfig::default());
    grid.upsert_drivers(&drivers(5_000));

    c.bench_function("spatial_near_5k_drivers", |b| {
        b.iter(|| black_box(grid.near(34.05, -118.25, 5.0)))
    });
}

fn bench_matcher_rank(c: &mut Criterion) {
    let matcher = DriverMatcher::new(MatcherConfig::default());
    let candidates = drivers(500);
    let order = order();
    let snapshot = MatchSnapshot::default();
    let ctx = RequestContext {
        local_hour: Some(12),
        ..RequestContext::default()
    };

    c.bench_function("matcher_rank_500_candidates", |b| {
        b.iter(|| black_box(matcher.rank(&order, &candidates, &snapshot, &ctx)))
    });
}

criterion_group!(benches, bench_radius_query, bench_matcher_rank);
criterion_main!(benches);
