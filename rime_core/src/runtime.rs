//! The kernel context: one object owning the scheduler, heartbeat monitor,
//! event bus and shared state, and driving them once per control period.

use crate::clock::{mean_duration, Clock, SystemClock};
use crate::communication::{EventBus, EventPriority};
use crate::config::KernelConfig;
use crate::core::{Module, ModuleContext, ModuleFactory, ModulePriority};
use crate::error::{RimeError, RimeResult};
use crate::scheduling::{HeartbeatCheck, HeartbeatMonitor, Scheduler, TickReport};
use crate::state::SharedState;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const SYSTEM_STARTED_EVENT: &str = "system.started";
pub const SYSTEM_STOPPING_EVENT: &str = "system.stopping";

/// Cloneable handle that asks a running kernel to stop.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Main-loop statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStats {
    pub cycles: u64,
    /// Cycles that took longer than the period
    pub overruns: u64,
    pub last_cycle_time: Duration,
    pub min_cycle_time: Duration,
    pub max_cycle_time: Duration,
    pub avg_cycle_time: Duration,
    pub modules_executed: u64,
    pub events_processed: u64,
}

/// What one control cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub tick: TickReport,
    pub events_processed: usize,
    /// Present when the heartbeat check interval elapsed this cycle
    pub heartbeat: Option<HeartbeatCheck>,
    pub elapsed: Duration,
}

/// One entry of the `system.modules` list in an application tree.
#[derive(Debug, Clone, Deserialize)]
struct ModuleEntry {
    id: String,
    #[serde(default = "default_priority")]
    priority: ModulePriority,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_priority() -> ModulePriority {
    ModulePriority::Standard
}

fn default_enabled() -> bool {
    true
}

/// The real-time kernel.
pub struct Kernel {
    instance_id: Uuid,
    config: KernelConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    state: Arc<SharedState>,
    heartbeat: Arc<HeartbeatMonitor>,
    scheduler: Scheduler,
    running: Arc<AtomicBool>,
    started: bool,
    stats: CycleStats,
    total_cycle_time: Duration,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> RimeResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: KernelConfig, clock: Arc<dyn Clock>) -> RimeResult<Self> {
        config.validate()?;

        let events = Arc::new(EventBus::with_clock(
            config.event_bus.queue_capacity,
            clock.clone(),
        ));
        let state = Arc::new(SharedState::with_clock(&config.state, clock.clone()));
        let heartbeat = Arc::new(
            HeartbeatMonitor::new(config.heartbeat.clone(), clock.clone())
                .with_events(events.clone()),
        );
        let context = ModuleContext::new(events.clone(), state.clone(), clock.clone());
        let mut scheduler = Scheduler::new(context)
            .with_name("rime")
            .with_config(config.scheduler.clone())
            .with_heartbeat(heartbeat.clone());
        for (module, section) in &config.config_sections {
            scheduler.map_config_section(module, section);
        }

        let instance_id = Uuid::new_v4();
        debug!(target: "rime::kernel", "kernel {} created", instance_id);
        Ok(Self {
            instance_id,
            config,
            clock,
            events,
            state,
            heartbeat,
            scheduler,
            running: Arc::new(AtomicBool::new(false)),
            started: false,
            stats: CycleStats::default(),
            total_cycle_time: Duration::ZERO,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.running.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    pub fn register(&mut self, module: Box<dyn Module>, priority: ModulePriority) -> RimeResult<()> {
        self.scheduler.register(module, priority)
    }

    pub fn register_from_factory(
        &mut self,
        factory: &ModuleFactory,
        id: &str,
        priority: ModulePriority,
    ) -> RimeResult<()> {
        self.scheduler.register_from_factory(factory, id, priority)
    }

    /// Register every module listed under `system.modules` in `tree`.
    ///
    /// Entries look like `{ "id": "compressor", "priority": "critical" }`.
    /// Ids the factory does not know are skipped with a warning. Returns the
    /// number of modules registered.
    pub fn register_listed(&mut self, factory: &ModuleFactory, tree: &Value) -> RimeResult<usize> {
        let Some(list) = tree.get("system").and_then(|s| s.get("modules")) else {
            return Ok(0);
        };
        let entries: Vec<ModuleEntry> = serde_json::from_value(list.clone())
            .map_err(|e| RimeError::config(format!("system.modules: {}", e)))?;

        let mut registered = 0;
        for entry in entries {
            if !entry.enabled {
                debug!(target: "rime::kernel", "'{}' disabled in config", entry.id);
                continue;
            }
            if !factory.contains(&entry.id) {
                warn!(target: "rime::kernel", "no constructor for '{}', skipping", entry.id);
                continue;
            }
            self.register_from_factory(factory, &entry.id, entry.priority)?;
            registered += 1;
        }
        info!(target: "rime::kernel", "{} modules registered from config", registered);
        Ok(registered)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Configure and initialize all modules, then announce `system.started`.
    ///
    /// Fails if a Critical module could not be initialized.
    pub fn start(&mut self, tree: &Value) -> RimeResult<()> {
        if self.started {
            return Err(RimeError::InvalidInput("kernel already started".into()));
        }
        info!(
            target: "rime::kernel",
            "starting kernel {} with {} modules",
            self.instance_id,
            self.scheduler.len()
        );
        self.scheduler.configure_all(tree);
        if let Err(e) = self.scheduler.init_all() {
            error!(target: "rime::kernel", "startup aborted: {}", e);
            return Err(e);
        }

        self.started = true;
        self.running.store(true, Ordering::SeqCst);
        let payload = json!({
            "instance_id": self.instance_id.to_string(),
            "modules": self.scheduler.module_names(),
        });
        if let Err(e) = self
            .events
            .publish_with_priority(SYSTEM_STARTED_EVENT, payload, EventPriority::High)
        {
            warn!(target: "rime::kernel", "start event not queued: {}", e);
        }
        Ok(())
    }

    /// One control cycle: module tick, event dispatch, heartbeat poll.
    pub fn cycle(&mut self) -> CycleReport {
        let start = self.clock.now();
        let timing = &self.config.timing;

        let tick = self.scheduler.tick(timing.module_budget());
        let events_processed = self.events.process(timing.event_budget());

        let scheduler = &mut self.scheduler;
        let heartbeat = self.heartbeat.poll_with(&mut |name| match scheduler.reload_module(name) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "rime::kernel", "restart of {} failed: {}", name, e);
                false
            }
        });

        let elapsed = self.clock.now().saturating_sub(start);
        self.record_cycle(elapsed, &tick, events_processed);
        CycleReport {
            tick,
            events_processed,
            heartbeat,
            elapsed,
        }
    }

    fn record_cycle(&mut self, elapsed: Duration, tick: &TickReport, events: usize) {
        let s = &mut self.stats;
        s.cycles += 1;
        s.last_cycle_time = elapsed;
        s.max_cycle_time = s.max_cycle_time.max(elapsed);
        s.min_cycle_time = if s.cycles == 1 {
            elapsed
        } else {
            s.min_cycle_time.min(elapsed)
        };
        self.total_cycle_time += elapsed;
        s.avg_cycle_time = mean_duration(self.total_cycle_time, s.cycles);
        s.modules_executed += tick.executed as u64;
        s.events_processed += events as u64;
        if elapsed > self.config.timing.period() {
            s.overruns += 1;
            debug!(
                target: "rime::kernel",
                "cycle overrun: {:?} > {:?}",
                elapsed,
                self.config.timing.period()
            );
        }
    }

    /// Cycle at the configured period until `duration` has passed or a stop
    /// is requested.
    pub fn run_for(&mut self, duration: Duration) -> RimeResult<()> {
        self.run_loop(Some(duration))
    }

    /// Cycle at the configured period until a stop is requested.
    pub fn run_until_stopped(&mut self) -> RimeResult<()> {
        self.run_loop(None)
    }

    fn run_loop(&mut self, duration: Option<Duration>) -> RimeResult<()> {
        if !self.started {
            return Err(RimeError::InvalidInput("kernel not started".into()));
        }
        let period = self.config.timing.period();
        let begin = self.clock.now();
        while self.is_running() {
            if let Some(limit) = duration {
                if self.clock.now().saturating_sub(begin) >= limit {
                    info!(target: "rime::kernel", "reached time limit of {:?}", limit);
                    break;
                }
            }
            let report = self.cycle();
            let rest = period.saturating_sub(report.elapsed);
            if !rest.is_zero() {
                std::thread::sleep(rest);
            }
        }
        Ok(())
    }

    /// Announce `system.stopping`, deliver it, and stop every module.
    /// Returns the number of modules whose `stop` failed.
    pub fn shutdown(&mut self) -> usize {
        info!(target: "rime::kernel", "shutting down kernel {}", self.instance_id);
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.events.publish_with_priority(
            SYSTEM_STOPPING_EVENT,
            json!({ "instance_id": self.instance_id.to_string() }),
            EventPriority::Critical,
        ) {
            warn!(target: "rime::kernel", "stop event not queued: {}", e);
        }
        self.events.process(self.config.timing.event_budget());
        let failures = self.scheduler.shutdown_all();
        self.started = false;

        let s = &self.stats;
        info!(
            target: "rime::kernel",
            "{} cycles, {} overruns, avg {:?}, max {:?}",
            s.cycles,
            s.overruns,
            s.avg_cycle_time,
            s.max_cycle_time
        );
        failures
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("instance_id", &self.instance_id)
            .field("scheduler", &self.scheduler)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::communication::Event;
    use parking_lot::Mutex;

    struct Blinker {
        ctx: Option<ModuleContext>,
    }

    impl Module for Blinker {
        fn name(&self) -> &str {
            "Blinker"
        }

        fn init(&mut self, ctx: &ModuleContext) -> RimeResult<()> {
            self.ctx = Some(ctx.clone());
            Ok(())
        }

        fn update(&mut self) -> RimeResult<()> {
            if let Some(ctx) = &self.ctx {
                ctx.state().increment("blinks", 1.0)?;
            }
            Ok(())
        }
    }

    fn factory() -> ModuleFactory {
        let mut factory = ModuleFactory::new();
        factory
            .register("blinker", || Box::new(Blinker { ctx: None }))
            .unwrap();
        factory
    }

    #[test]
    fn test_start_cycle_shutdown() {
        let clock = Arc::new(ManualClock::new());
        let mut kernel = Kernel::with_clock(KernelConfig::default(), clock.clone()).unwrap();
        let tree = json!({
            "system": { "modules": [ { "id": "blinker", "priority": "high" } ] },
            "blinker": {}
        });
        assert_eq!(kernel.register_listed(&factory(), &tree).unwrap(), 1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        kernel
            .events()
            .subscribe("system.*", move |e: &Event| sink.lock().push(e.event_type.clone()))
            .unwrap();

        kernel.start(&tree).unwrap();
        assert!(kernel.is_running());
        for _ in 0..3 {
            kernel.cycle();
            clock.advance(Duration::from_millis(10));
        }
        assert_eq!(kernel.state().get::<f64>("blinks"), Some(3.0));
        assert_eq!(kernel.stats().cycles, 3);
        assert_eq!(kernel.stats().modules_executed, 3);

        assert_eq!(kernel.shutdown(), 0);
        assert!(!kernel.is_running());
        assert_eq!(*seen.lock(), vec![SYSTEM_STARTED_EVENT, SYSTEM_STOPPING_EVENT]);
    }

    #[test]
    fn test_cycle_average_past_u32_cycles() {
        let clock = Arc::new(ManualClock::new());
        let mut kernel = Kernel::with_clock(KernelConfig::default(), clock.clone()).unwrap();
        kernel.start(&json!({})).unwrap();
        kernel.stats.cycles = u64::from(u32::MAX);

        kernel.cycle();
        assert_eq!(kernel.stats().cycles, u64::from(u32::MAX) + 1);
        assert_eq!(kernel.stats().avg_cycle_time, Duration::ZERO);
        kernel.shutdown();
    }

    #[test]
    fn test_unknown_and_disabled_entries_skipped() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        let tree = json!({
            "system": { "modules": [
                { "id": "blinker", "enabled": false },
                { "id": "ghost" }
            ] }
        });
        assert_eq!(kernel.register_listed(&factory(), &tree).unwrap(), 0);
        assert!(kernel.scheduler().is_empty());
    }

    #[test]
    fn test_run_requires_start() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        assert!(kernel.run_for(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_stop_handle_ends_run() {
        let mut kernel = Kernel::new(KernelConfig::default()).unwrap();
        kernel.start(&json!({})).unwrap();
        let handle = kernel.stop_handle();
        assert!(handle.is_running());
        handle.stop();
        kernel.run_until_stopped().unwrap();
        assert_eq!(kernel.stats().cycles, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = KernelConfig::default();
        config.event_bus.queue_capacity = 0;
        assert!(Kernel::new(config).is_err());
    }
}
