// Scheduler and heartbeat behaviour driven through a manual clock
use parking_lot::Mutex;
use rime_core::config::{HeartbeatConfig, SharedStateConfig};
use rime_core::error::RimeResult;
use rime_core::{
    Clock, EventBus, HeartbeatMonitor, ManualClock, Module, ModuleContext, ModulePriority,
    ModuleState, RimeError, Scheduler, SharedState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Test module that records its updates and burns manual-clock time
struct Stage {
    name: String,
    cost: Duration,
    clock: Arc<ManualClock>,
    log: Arc<Mutex<Vec<String>>>,
    fail_init: bool,
}

impl Stage {
    fn new(name: &str, clock: &Arc<ManualClock>, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            cost: Duration::ZERO,
            clock: clock.clone(),
            log: log.clone(),
            fail_init: false,
        }
    }

    fn costing(mut self, cost: Duration) -> Self {
        self.cost = cost;
        self
    }

    fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }
}

impl Module for Stage {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, _ctx: &ModuleContext) -> RimeResult<()> {
        if self.fail_init {
            return Err(RimeError::module(&self.name, "hardware not present"));
        }
        self.log.lock().push(format!("init:{}", self.name));
        Ok(())
    }

    fn update(&mut self) -> RimeResult<()> {
        self.log.lock().push(format!("update:{}", self.name));
        self.clock.advance(self.cost);
        Ok(())
    }

    fn stop(&mut self) -> RimeResult<()> {
        self.log.lock().push(format!("stop:{}", self.name));
        Ok(())
    }
}

struct Rig {
    clock: Arc<ManualClock>,
    log: Arc<Mutex<Vec<String>>>,
    events: Arc<EventBus>,
    scheduler: Scheduler,
}

fn rig() -> Rig {
    let clock = Arc::new(ManualClock::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let events = Arc::new(EventBus::with_clock(32, dyn_clock.clone()));
    let state = Arc::new(SharedState::with_clock(
        &SharedStateConfig::default(),
        dyn_clock.clone(),
    ));
    let heartbeat = Arc::new(
        HeartbeatMonitor::new(HeartbeatConfig::default(), dyn_clock.clone())
            .with_events(events.clone()),
    );
    let ctx = ModuleContext::new(events.clone(), state, dyn_clock);
    Rig {
        clock,
        log: Arc::new(Mutex::new(Vec::new())),
        events,
        scheduler: Scheduler::new(ctx).with_heartbeat(heartbeat),
    }
}

fn tree(sections: &[&str]) -> Value {
    let mut map = serde_json::Map::new();
    for s in sections {
        map.insert(s.to_string(), json!({}));
    }
    Value::Object(map)
}

#[test]
fn test_priority_order_is_stable() {
    let mut rig = rig();
    let a = Stage::new("a", &rig.clock, &rig.log);
    let b = Stage::new("b", &rig.clock, &rig.log);
    let c = Stage::new("c", &rig.clock, &rig.log);

    rig.scheduler.register(Box::new(a), ModulePriority::Critical).unwrap();
    rig.scheduler.register(Box::new(b), ModulePriority::Standard).unwrap();
    rig.scheduler.register(Box::new(c), ModulePriority::Critical).unwrap();

    rig.scheduler.configure_all(&tree(&["a", "b", "c"]));
    rig.scheduler.init_all().unwrap();
    rig.log.lock().clear();

    let report = rig.scheduler.tick(Duration::from_millis(8));
    assert_eq!(report.executed, 3);
    assert_eq!(
        *rig.log.lock(),
        vec!["update:a", "update:c", "update:b"]
    );
    assert_eq!(rig.scheduler.module_names(), vec!["a", "c", "b"]);
}

#[test]
fn test_budget_checked_between_modules() {
    let mut rig = rig();
    let cost = Duration::from_millis(3);
    for name in ["first", "second", "third"] {
        let stage = Stage::new(name, &rig.clock, &rig.log).costing(cost);
        rig.scheduler
            .register(Box::new(stage), ModulePriority::Standard)
            .unwrap();
    }
    rig.scheduler.configure_all(&tree(&["first", "second", "third"]));
    rig.scheduler.init_all().unwrap();
    rig.log.lock().clear();

    // 0ms < 5ms: first runs; 3ms < 5ms: second runs and overshoots to 6ms
    let report = rig.scheduler.tick(Duration::from_millis(5));
    assert_eq!(report.executed, 2);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.elapsed, Duration::from_millis(6));
    assert_eq!(*rig.log.lock(), vec!["update:first", "update:second"]);

    // Every first/second update overran the 2ms Standard deadline
    assert_eq!(report.deadline_misses, 2);
}

#[test]
fn test_critical_init_failure_does_not_stop_others() {
    let mut rig = rig();
    let broken = Stage::new("probe", &rig.clock, &rig.log).failing_init();
    let display = Stage::new("display", &rig.clock, &rig.log);
    rig.scheduler
        .register(Box::new(broken), ModulePriority::Critical)
        .unwrap();
    rig.scheduler
        .register(Box::new(display), ModulePriority::Low)
        .unwrap();
    rig.scheduler.configure_all(&tree(&["probe", "display"]));

    match rig.scheduler.init_all() {
        Err(RimeError::CriticalInitFailure { modules }) => assert_eq!(modules, vec!["probe"]),
        other => panic!("expected critical failure, got {:?}", other),
    }
    assert_eq!(rig.scheduler.module_state("probe"), Some(ModuleState::Error));
    assert_eq!(
        rig.scheduler.module_state("display"),
        Some(ModuleState::Initialized)
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    rig.events
        .subscribe("modules.*", move |e| sink.lock().push(e.payload.clone()))
        .unwrap();
    rig.events.process(Duration::from_millis(10));
    assert_eq!(
        *seen.lock(),
        vec![json!({ "total": 2, "initialized": 1, "critical_failed": true })]
    );
}

#[test]
fn test_shutdown_runs_in_reverse_priority() {
    let mut rig = rig();
    for (name, priority) in [
        ("sensors", ModulePriority::Critical),
        ("control", ModulePriority::High),
        ("display", ModulePriority::Low),
    ] {
        let stage = Stage::new(name, &rig.clock, &rig.log);
        rig.scheduler.register(Box::new(stage), priority).unwrap();
    }
    rig.scheduler
        .configure_all(&tree(&["sensors", "control", "display"]));
    rig.scheduler.init_all().unwrap();
    rig.log.lock().clear();

    assert_eq!(rig.scheduler.shutdown_all(), 0);
    assert_eq!(
        *rig.log.lock(),
        vec!["stop:display", "stop:control", "stop:sensors"]
    );
}

#[test]
fn test_heartbeat_escalation_to_disabled() {
    let clock = Arc::new(ManualClock::new());
    let monitor = HeartbeatMonitor::new(HeartbeatConfig::default(), clock.clone());
    monitor.register("sensors", ModulePriority::Critical).unwrap();

    let attempts = Arc::new(Mutex::new(0u32));
    let counter = attempts.clone();
    monitor.set_restart_callback(move |_| {
        *counter.lock() += 1;
        false
    });

    for round in 1..=2u32 {
        clock.advance(Duration::from_millis(5_001));
        let check = monitor.check_all();
        assert_eq!(check.unresponsive, vec!["sensors"]);
        assert_eq!(check.restart_failed, vec!["sensors"]);
        assert!(check.disabled.is_empty());
        assert_eq!(monitor.restart_count("sensors"), Some(round));
    }

    clock.advance(Duration::from_millis(5_001));
    let check = monitor.check_all();
    assert_eq!(check.disabled, vec!["sensors"]);
    assert_eq!(*attempts.lock(), 3);

    let record = monitor.record("sensors").unwrap();
    assert!(!record.is_active);
    assert_eq!(record.restart_count, 3);

    // Retired records are no longer checked or restarted
    clock.advance(Duration::from_millis(60_000));
    assert!(monitor.check_all().is_clean());
    assert_eq!(*attempts.lock(), 3);
    assert_eq!(monitor.system_health_score(), 100);
}

#[test]
fn test_touch_keeps_module_alive() {
    let clock = Arc::new(ManualClock::new());
    let monitor = HeartbeatMonitor::new(HeartbeatConfig::default(), clock.clone());
    monitor.register("compressor", ModulePriority::High).unwrap();

    // High defaults to twice the Critical timeout
    for _ in 0..5 {
        clock.advance(Duration::from_millis(9_000));
        assert!(monitor.touch("compressor"));
        assert!(monitor.check_all().is_clean());
    }
    assert_eq!(monitor.restart_count("compressor"), Some(0));
    assert!(monitor.is_alive("compressor"));
}
