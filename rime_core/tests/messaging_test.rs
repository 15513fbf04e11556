// Event bus and shared state exercised through the public API
use approx::assert_relative_eq;
use parking_lot::Mutex;
use rime_core::config::SharedStateConfig;
use rime_core::{EventBus, EventPriority, RimeError, SharedState, StateValue};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const BUDGET: Duration = Duration::from_millis(50);

fn recorder(bus: &EventBus, pattern: &str) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(pattern, move |e| sink.lock().push(e.event_type.clone()))
        .unwrap();
    seen
}

#[test]
fn test_dispatch_by_priority_then_fifo() {
    let bus = EventBus::new(16);
    let seen = recorder(&bus, "*");

    bus.publish_with_priority("low", json!(null), EventPriority::Low).unwrap();
    bus.publish("normal.1", json!(null)).unwrap();
    bus.publish_with_priority("critical", json!(null), EventPriority::Critical)
        .unwrap();
    bus.publish("normal.2", json!(null)).unwrap();
    bus.publish_with_priority("high", json!(null), EventPriority::High).unwrap();

    assert_eq!(bus.process(BUDGET), 5);
    assert_eq!(
        *seen.lock(),
        vec!["critical", "high", "normal.1", "normal.2", "low"]
    );
}

#[test]
fn test_overflow_drops_and_counts() {
    let bus = EventBus::new(5);
    let mut rejected = 0;
    for i in 0..10 {
        match bus.publish("alarm.raised", json!({ "seq": i })) {
            Ok(()) => {}
            Err(RimeError::QueueFull { capacity, .. }) => {
                assert_eq!(capacity, 5);
                rejected += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(rejected, 5);
    assert!(bus.is_queue_full());

    let stats = bus.stats();
    assert_eq!(stats.published, 5);
    assert_eq!(stats.dropped, 5);

    // The five that made it are the oldest ones
    let seqs = Arc::new(Mutex::new(Vec::new()));
    let sink = seqs.clone();
    bus.subscribe("alarm.*", move |e| sink.lock().push(e.payload["seq"].as_i64().unwrap()))
        .unwrap();
    bus.process(BUDGET);
    assert_eq!(*seqs.lock(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_subscription_patterns() {
    let bus = EventBus::new(16);
    let all = recorder(&bus, "*");
    let sensors = recorder(&bus, "sensor.*");
    let exact = recorder(&bus, "sensor.temp");
    let door = recorder(&bus, "door*");

    for t in ["sensor.temp", "sensor.humidity", "sensors.temp", "door.open", "defrost.start"] {
        bus.publish(t, json!(null)).unwrap();
    }
    bus.process(BUDGET);

    assert_eq!(all.lock().len(), 5);
    assert_eq!(*sensors.lock(), vec!["sensor.temp", "sensor.humidity"]);
    assert_eq!(*exact.lock(), vec!["sensor.temp"]);
    assert_eq!(*door.lock(), vec!["door.open"]);
}

#[test]
fn test_panicking_handler_is_isolated() {
    let bus = EventBus::new(8);
    bus.subscribe("fault", |_| panic!("handler bug")).unwrap();
    let seen = recorder(&bus, "fault");

    bus.publish("fault", json!(null)).unwrap();
    assert_eq!(bus.process(BUDGET), 1);
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(bus.stats().handler_failures, 1);
}

#[test]
fn test_publish_from_many_threads() {
    let bus = Arc::new(EventBus::new(400));
    let seen = recorder(&bus, "worker.*");

    let handles: Vec<_> = (0..4)
        .map(|w| {
            let bus = bus.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    bus.publish(format!("worker.{}", w), json!(i)).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(bus.process(BUDGET), 400);
    assert_eq!(seen.lock().len(), 400);
}

#[test]
fn test_subscribe_from_foreign_thread_rejected() {
    let bus = Arc::new(EventBus::new(8));
    bus.subscribe("*", |_| {}).unwrap();

    let remote = bus.clone();
    let result = thread::spawn(move || remote.subscribe("*", |_| {}))
        .join()
        .unwrap();
    assert!(matches!(result, Err(RimeError::ForeignContext(_))));
}

#[test]
fn test_typed_round_trip() {
    let state = SharedState::new(&SharedStateConfig::default());

    state.set("temp.cabinet", 3.5).unwrap();
    state.set("door.open", false).unwrap();
    state.set("compressor.starts", 12i64).unwrap();
    state.set("display.mode", "eco").unwrap();
    state
        .set("alarm.config", json!({ "high": 8.0, "low": -2.0 }))
        .unwrap();

    assert_eq!(state.get::<f64>("temp.cabinet"), Some(3.5));
    assert_eq!(state.get::<bool>("door.open"), Some(false));
    assert_eq!(state.get::<i64>("compressor.starts"), Some(12));
    assert_eq!(state.get::<String>("display.mode"), Some("eco".to_string()));
    assert_eq!(
        state.get::<serde_json::Value>("alarm.config"),
        Some(json!({ "high": 8.0, "low": -2.0 }))
    );

    // No coercion between kinds
    assert_eq!(state.get::<i64>("temp.cabinet"), None);
    assert_eq!(state.get::<f64>("compressor.starts"), None);
    assert_eq!(state.get_or::<bool>("missing", true), true);
}

#[test]
fn test_concurrent_increments() {
    let state = Arc::new(SharedState::new(&SharedStateConfig::default()));
    state.set("cycles", StateValue::Int(0)).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = state.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    state.increment("cycles", 1.0).unwrap();
                    state.increment("runtime", 0.5).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(state.get::<StateValue>("cycles"), Some(StateValue::Int(8000)));
    // Created on first increment, so it is a Float
    let runtime = state.get::<f64>("runtime").unwrap();
    assert_relative_eq!(runtime, 4000.0);
    assert_eq!(state.update_count("cycles"), Some(8001));
}

#[test]
fn test_increment_non_numeric_is_rejected() {
    let state = SharedState::new(&SharedStateConfig::default());
    state.set("display.mode", "eco").unwrap();
    match state.increment("display.mode", 1.0) {
        Err(RimeError::TypeMismatch { found, .. }) => assert_eq!(found, "string"),
        other => panic!("expected type mismatch, got {:?}", other),
    }
    assert_eq!(state.get::<String>("display.mode"), Some("eco".to_string()));
}

#[test]
fn test_state_subscription_sees_changes_only() {
    let state = SharedState::new(&SharedStateConfig::default());
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    state
        .subscribe("temp.*", move |key, value| {
            sink.lock().push((key.to_string(), value.clone()))
        })
        .unwrap();

    state.set("temp.cabinet", 4.0).unwrap();
    state.set("temp.cabinet", 4.0).unwrap();
    state.set("temp.cabinet", 4.5).unwrap();
    state.set("door.open", true).unwrap();

    assert_eq!(
        *changes.lock(),
        vec![
            ("temp.cabinet".to_string(), StateValue::Float(4.0)),
            ("temp.cabinet".to_string(), StateValue::Float(4.5)),
        ]
    );
}

#[test]
fn test_capacity_and_key_limits() {
    let config = SharedStateConfig {
        max_entries: 2,
        max_key_len: 8,
    };
    let state = SharedState::new(&config);
    state.set("a", 1i64).unwrap();
    state.set("b", 2i64).unwrap();
    assert!(matches!(
        state.set("c", 3i64),
        Err(RimeError::StateFull { capacity: 2 })
    ));
    // Overwriting an existing key still works at capacity
    state.set("a", 10i64).unwrap();
    assert!(matches!(
        state.set("much.too.long", 1i64),
        Err(RimeError::KeyTooLong { max: 8, .. })
    ));
    assert!(matches!(state.set("", 1i64), Err(RimeError::InvalidInput(_))));
}
