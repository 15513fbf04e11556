// The shipped demo configuration drives the demo modules end to end
use rime::modules::{counter, event_log};
use rime::prelude::*;
use rime::{loader, modules, ManualClock};
use std::path::Path;

fn demo_tree() -> Value {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/rime.toml");
    loader::load_tree(path).unwrap()
}

#[test]
fn test_demo_config_is_valid() {
    let tree = demo_tree();
    let config = KernelConfig::from_tree(&tree).unwrap();
    assert_eq!(config.timing.period_ms, 10);
    assert_eq!(config.heartbeat.check_interval_ms, 1000);
    // Fields left out fall back to defaults
    assert_eq!(config.heartbeat.background_timeout_ms, 300_000);
}

#[test]
fn test_demo_modules_run() {
    let tree = demo_tree();
    let clock = Arc::new(ManualClock::new());
    let mut kernel =
        Kernel::with_clock(KernelConfig::from_tree(&tree).unwrap(), clock.clone()).unwrap();

    assert_eq!(kernel.register_listed(&modules::factory(), &tree).unwrap(), 2);
    assert_eq!(
        kernel.scheduler().module_names(),
        vec!["CounterModule", "EventLogModule"]
    );
    kernel.start(&tree).unwrap();

    // 100ms counter interval, 1s event log interval
    for _ in 0..100 {
        kernel.cycle();
        clock.advance(Duration::from_millis(10));
    }

    let state = kernel.state().clone();
    assert_eq!(state.get::<StateValue>(counter::COUNTER_KEY), Some(StateValue::Int(10)));
    // event_log updated at t=0 before any dispatch
    assert_eq!(state.get::<i64>(event_log::SEEN_KEY), Some(0));
    kernel.cycle();
    // system.started, modules.initialized and ten demo.tick
    assert_eq!(state.get::<i64>(event_log::SEEN_KEY), Some(12));

    assert_eq!(kernel.shutdown(), 0);
    assert_eq!(kernel.events().subscription_count(), 0);
}
