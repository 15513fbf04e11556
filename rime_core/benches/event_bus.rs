//! Event Bus and Shared State Benchmarks
//!
//! Measures the hot paths a control cycle hits:
//! - publish + process with a growing number of subscriptions
//! - shared state set/get/increment
//!
//! Run with: cargo bench --bench event_bus

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rime_core::config::SharedStateConfig;
use rime_core::{EventBus, EventPriority, SharedState};
use serde_json::json;
use std::time::Duration;

/// Subscription counts to test
const SUBSCRIPTIONS: &[usize] = &[1, 8, 32];

const BATCH: usize = 16;

fn bench_publish_process(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_bus_dispatch");
    group.measurement_time(Duration::from_secs(3));

    for &subs in SUBSCRIPTIONS {
        group.bench_with_input(BenchmarkId::new("batch_16", subs), &subs, |b, &subs| {
            let bus = EventBus::new(BATCH);
            for i in 0..subs {
                // Half the subscriptions land in a different bucket
                let pattern = if i % 2 == 0 { "sensor.*" } else { "door.*" };
                bus.subscribe(pattern, |e| {
                    black_box(&e.payload);
                })
                .unwrap();
            }

            b.iter(|| {
                for i in 0..BATCH {
                    bus.publish_with_priority(
                        "sensor.temp",
                        json!(i),
                        if i % 4 == 0 {
                            EventPriority::High
                        } else {
                            EventPriority::Normal
                        },
                    )
                    .unwrap();
                }
                black_box(bus.process(Duration::from_millis(10)));
            });
        });
    }

    group.finish();
}

fn bench_shared_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_state");

    let state = SharedState::new(&SharedStateConfig::default());
    for i in 0..32 {
        state.set(&format!("sensor.{}", i), i as f64).unwrap();
    }

    group.bench_function("set_changed", |b| {
        let mut v = 0.0;
        b.iter(|| {
            v += 0.1;
            state.set("sensor.7", black_box(v)).unwrap();
        });
    });

    group.bench_function("get_f64", |b| {
        b.iter(|| black_box(state.get::<f64>("sensor.7")));
    });

    group.bench_function("increment", |b| {
        b.iter(|| black_box(state.increment("cycles", 1.0).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_publish_process, bench_shared_state);
criterion_main!(benches);
