use crate::clock::mean_duration;
use crate::communication::EventPriority;
use crate::config::SchedulerConfig;
use crate::core::{
    config_section_name, Module, ModuleContext, ModuleFactory, ModulePriority, ModuleState,
    RpcRegistrar,
};
use crate::error::{panic_message, RimeError, RimeResult};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::heartbeat::HeartbeatMonitor;

/// Event published once `init_all` has run.
pub const MODULES_INITIALIZED_EVENT: &str = "modules.initialized";

/// Execution statistics for one module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleStats {
    pub name: String,
    pub priority: ModulePriority,
    pub state: ModuleState,
    pub enabled: bool,
    pub update_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_execution_time: Duration,
    pub avg_execution_time: Duration,
    pub max_execution_time: Duration,
    pub total_execution_time: Duration,
    pub deadline_misses: u64,
    pub health_score: u8,
    pub update_interval: Duration,
    pub reload_count: u32,
}

/// What one `tick` did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Modules whose `update` ran
    pub executed: usize,
    /// Modules skipped because their update interval had not elapsed
    pub skipped_interval: usize,
    /// Eligible modules left for the next tick because the budget ran out
    pub deferred: usize,
    /// Updates that returned an error or panicked
    pub failures: usize,
    pub deadline_misses: usize,
    pub elapsed: Duration,
}

/// System-wide health summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub modules: Vec<ModuleStats>,
    pub healthy: usize,
    pub degraded: usize,
    pub error: usize,
    pub disabled: usize,
    /// Mean module health score, 100 with no modules
    pub system_score: u8,
}

pub type PerformanceCallback = Box<dyn FnMut(&str, Duration) + Send>;

/// Module registration with lifecycle and timing bookkeeping
struct RegisteredModule {
    module: Box<dyn Module>,
    name: String,
    priority: ModulePriority,
    state: ModuleState,
    enabled: bool,
    interval_override: Option<Duration>,
    last_update_time: Option<Duration>,
    update_count: u64,
    error_count: u64,
    last_error: Option<String>,
    last_execution_time: Duration,
    max_execution_time: Duration,
    total_execution_time: Duration,
    deadline_misses: u64,
    health_score: u8,
    reload_count: u32,
}

impl RegisteredModule {
    fn new(module: Box<dyn Module>, priority: ModulePriority) -> Self {
        Self {
            name: module.name().to_string(),
            module,
            priority,
            state: ModuleState::Created,
            enabled: true,
            interval_override: None,
            last_update_time: None,
            update_count: 0,
            error_count: 0,
            last_error: None,
            last_execution_time: Duration::ZERO,
            max_execution_time: Duration::ZERO,
            total_execution_time: Duration::ZERO,
            deadline_misses: 0,
            health_score: 100,
            reload_count: 0,
        }
    }

    fn update_interval(&self) -> Duration {
        self.interval_override
            .unwrap_or_else(|| self.module.update_interval())
    }

    fn record_error(&mut self, message: String) {
        self.error_count += 1;
        warn!(target: "rime::scheduler", "{} failed: {}", self.name, message);
        self.last_error = Some(message);
    }

    fn record_execution(&mut self, elapsed: Duration) {
        self.update_count += 1;
        self.last_execution_time = elapsed;
        self.max_execution_time = self.max_execution_time.max(elapsed);
        self.total_execution_time += elapsed;
    }

    /// 100, minus penalties for self-reported trouble, errors, frequent
    /// deadline misses and the module's own score.
    fn compute_health(&self) -> u8 {
        let mut score: i64 = 100;
        if !self.module.is_healthy() {
            score -= 10;
        }
        score -= (self.error_count.min(5) * 10) as i64;
        if self.update_count > 0 {
            let miss_rate = self.deadline_misses as f64 / self.update_count as f64;
            if miss_rate > 0.1 {
                score -= (miss_rate * 100.0).min(20.0) as i64;
            }
        }
        score -= 100 - i64::from(self.module.health_score().min(100));
        score.clamp(0, 100) as u8
    }

    fn stats(&self) -> ModuleStats {
        ModuleStats {
            name: self.name.clone(),
            priority: self.priority,
            state: self.state,
            enabled: self.enabled,
            update_count: self.update_count,
            error_count: self.error_count,
            last_error: self.last_error.clone(),
            last_execution_time: self.last_execution_time,
            avg_execution_time: mean_duration(self.total_execution_time, self.update_count),
            max_execution_time: self.max_execution_time,
            total_execution_time: self.total_execution_time,
            deadline_misses: self.deadline_misses,
            health_score: self.health_score,
            update_interval: self.update_interval(),
            reload_count: self.reload_count,
        }
    }
}

/// Run a lifecycle hook, turning a panic into a module error.
fn guarded<F>(module: &str, hook: &str, f: F) -> RimeResult<()>
where
    F: FnOnce() -> RimeResult<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(RimeError::module(
            module,
            format!("{} {}", hook, panic_message(payload.as_ref())),
        )),
    }
}

/// Priority-ordered module scheduler.
///
/// Modules run in priority order, ties in registration order. Scheduling is
/// cooperative: per-class deadlines are measured and reported, never
/// enforced, so a module that overruns delays everything after it.
pub struct Scheduler {
    modules: Vec<RegisteredModule>,
    scheduler_name: String,
    config: SchedulerConfig,
    context: ModuleContext,
    heartbeat: Option<Arc<HeartbeatMonitor>>,
    section_overrides: BTreeMap<String, String>,
    config_tree: Option<Value>,
    performance_callback: Option<PerformanceCallback>,
    tick_count: u64,
}

impl Scheduler {
    /// Create an empty scheduler whose modules will receive `context`.
    pub fn new(context: ModuleContext) -> Self {
        Self {
            modules: Vec::new(),
            scheduler_name: "Scheduler".to_string(),
            config: SchedulerConfig::default(),
            context,
            heartbeat: None,
            section_overrides: BTreeMap::new(),
            config_tree: None,
            performance_callback: None,
            tick_count: 0,
        }
    }

    /// Set deadline configuration (builder pattern)
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Touch and register modules with `heartbeat`.
    pub fn with_heartbeat(mut self, heartbeat: Arc<HeartbeatMonitor>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Pre-allocate module capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.modules.reserve(capacity);
        self
    }

    /// Set scheduler name (for logging)
    pub fn with_name(mut self, name: &str) -> Self {
        self.scheduler_name = name.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.scheduler_name
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn context(&self) -> &ModuleContext {
        &self.context
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Take ownership of `module` and slot it into priority order.
    pub fn register(&mut self, module: Box<dyn Module>, priority: ModulePriority) -> RimeResult<()> {
        let name = module.name().to_string();
        if name.is_empty() {
            return Err(RimeError::InvalidInput("module name is empty".into()));
        }
        if self.find(&name).is_some() {
            return Err(RimeError::AlreadyRegistered(format!("module '{}'", name)));
        }
        if let Some(hb) = &self.heartbeat {
            hb.register(&name, priority)?;
        }

        self.modules.push(RegisteredModule::new(module, priority));
        // Stable: equal priorities keep registration order
        self.modules.sort_by_key(|m| m.priority);

        info!(target: "rime::scheduler", "registered '{}' ({})", name, priority);
        Ok(())
    }

    /// Build module `id` from `factory` and register it.
    pub fn register_from_factory(
        &mut self,
        factory: &ModuleFactory,
        id: &str,
        priority: ModulePriority,
    ) -> RimeResult<()> {
        let module = factory.create(id)?;
        self.register(module, priority)
    }

    /// Configure `module` from `section` instead of its conventional one.
    pub fn map_config_section(&mut self, module: &str, section: &str) {
        self.section_overrides
            .insert(module.to_string(), section.to_string());
    }

    fn section_for(&self, module: &str) -> String {
        self.section_overrides
            .get(module)
            .cloned()
            .unwrap_or_else(|| config_section_name(module))
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name == name)
    }

    fn find_or_err(&self, name: &str) -> RimeResult<usize> {
        self.find(name)
            .ok_or_else(|| RimeError::not_found(format!("module '{}'", name)))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Hand every module its configuration section.
    ///
    /// A module without a section stays `Created` and is skipped by
    /// `init_all`. A failing `configure` puts the module in `Error`.
    pub fn configure_all(&mut self, tree: &Value) {
        info!(target: "rime::scheduler", "configuring {} modules", self.modules.len());
        self.config_tree = Some(tree.clone());

        for i in 0..self.modules.len() {
            if self.modules[i].state == ModuleState::Initialized {
                debug!(target: "rime::scheduler", "{} already initialized", self.modules[i].name);
                continue;
            }
            let section_name = self.section_for(&self.modules[i].name);
            let m = &mut self.modules[i];
            let Some(section) = tree.get(&section_name) else {
                warn!(
                    target: "rime::scheduler",
                    "no config section '{}' for module {}",
                    section_name, m.name
                );
                continue;
            };
            match guarded(&m.name, "configure", || m.module.configure(section)) {
                Ok(()) => {
                    m.state = ModuleState::Configured;
                    debug!(target: "rime::scheduler", "{} configured from '{}'", m.name, section_name);
                }
                Err(e) => {
                    m.state = ModuleState::Error;
                    m.record_error(e.to_string());
                }
            }
        }
    }

    /// Initialize every `Configured` module in priority order.
    ///
    /// Failures are recorded and initialization carries on. The call fails
    /// only if a Critical module failed.
    pub fn init_all(&mut self) -> RimeResult<()> {
        info!(target: "rime::scheduler", "initializing {} modules by priority", self.modules.len());
        let mut initialized = 0usize;
        let mut critical_failed = Vec::new();

        for m in self.modules.iter_mut() {
            if m.state != ModuleState::Configured {
                warn!(target: "rime::scheduler", "skipping {} - {}", m.name, m.state);
                if m.state == ModuleState::Created {
                    // Never going to run; nothing to watch
                    if let Some(hb) = &self.heartbeat {
                        hb.unregister(&m.name);
                    }
                }
                continue;
            }
            let ctx = &self.context;
            match guarded(&m.name, "init", || m.module.init(ctx)) {
                Ok(()) => {
                    m.state = ModuleState::Initialized;
                    m.last_update_time = None;
                    initialized += 1;
                    if let Some(hb) = &self.heartbeat {
                        hb.touch(&m.name);
                    }
                    info!(target: "rime::scheduler", "{} initialized", m.name);
                }
                Err(e) => {
                    m.state = ModuleState::Error;
                    m.record_error(e.to_string());
                    if m.priority == ModulePriority::Critical {
                        error!(target: "rime::scheduler", "critical module {} failed to initialize", m.name);
                        critical_failed.push(m.name.clone());
                    }
                }
            }
        }

        let payload = json!({
            "total": self.modules.len(),
            "initialized": initialized,
            "critical_failed": !critical_failed.is_empty(),
        });
        if let Err(e) = self.context.events().publish_with_priority(
            MODULES_INITIALIZED_EVENT,
            payload,
            EventPriority::High,
        ) {
            debug!(target: "rime::scheduler", "init event not queued: {}", e);
        }

        if critical_failed.is_empty() {
            info!(
                target: "rime::scheduler",
                "{}/{} modules initialized",
                initialized,
                self.modules.len()
            );
            Ok(())
        } else {
            Err(RimeError::CriticalInitFailure {
                modules: critical_failed,
            })
        }
    }

    /// Stop initialized modules in reverse priority order. Returns the number
    /// of modules whose `stop` failed.
    pub fn shutdown_all(&mut self) -> usize {
        info!(target: "rime::scheduler", "shutting down {} modules", self.modules.len());
        let mut failures = 0;
        for m in self.modules.iter_mut().rev() {
            if m.state != ModuleState::Initialized {
                continue;
            }
            match guarded(&m.name, "stop", || m.module.stop()) {
                Ok(()) => {
                    m.state = ModuleState::Configured;
                    debug!(target: "rime::scheduler", "{} stopped", m.name);
                }
                Err(e) => {
                    m.state = ModuleState::Error;
                    m.record_error(e.to_string());
                    failures += 1;
                }
            }
        }
        failures
    }

    /// Stop, reconfigure and reinitialize one module. Used as the restart
    /// path for unresponsive modules.
    pub fn reload_module(&mut self, name: &str) -> RimeResult<()> {
        let idx = self.find_or_err(name)?;
        let section_name = self.section_for(name);
        let tree = self.config_tree.clone();
        let m = &mut self.modules[idx];
        info!(target: "rime::scheduler", "reloading {}", name);

        if m.state == ModuleState::Initialized {
            if let Err(e) = guarded(name, "stop", || m.module.stop()) {
                m.record_error(e.to_string());
            }
        }
        m.state = ModuleState::Created;
        m.reload_count += 1;

        match &tree {
            Some(tree) => {
                let section = tree.get(&section_name).ok_or_else(|| {
                    RimeError::config(format!("no config section '{}' for {}", section_name, name))
                })?;
                if let Err(e) = guarded(name, "configure", || m.module.configure(section)) {
                    m.state = ModuleState::Error;
                    m.record_error(e.to_string());
                    return Err(e);
                }
            }
            None => debug!(target: "rime::scheduler", "{} reloaded without configuration", name),
        }
        m.state = ModuleState::Configured;

        let ctx = &self.context;
        if let Err(e) = guarded(name, "init", || m.module.init(ctx)) {
            m.state = ModuleState::Error;
            m.record_error(e.to_string());
            return Err(e);
        }
        m.state = ModuleState::Initialized;
        m.last_update_time = None;
        if let Some(hb) = &self.heartbeat {
            hb.touch(name);
        }
        Ok(())
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Run one pass over the modules within `time_budget`.
    ///
    /// The budget is checked between modules, so a tick can overrun by at
    /// most the duration of the last module it started.
    pub fn tick(&mut self, time_budget: Duration) -> TickReport {
        let clock = self.context.clock().clone();
        let start = clock.now();
        let mut report = TickReport::default();
        self.tick_count += 1;

        for i in 0..self.modules.len() {
            {
                let m = &self.modules[i];
                if !m.enabled || m.state != ModuleState::Initialized {
                    continue;
                }
            }

            let now = clock.now();
            if now.saturating_sub(start) >= time_budget {
                report.deferred = self.modules[i..]
                    .iter()
                    .filter(|m| m.enabled && m.state == ModuleState::Initialized)
                    .count();
                debug!(
                    target: "rime::scheduler",
                    "tick budget {:?} spent, {} modules deferred",
                    time_budget, report.deferred
                );
                break;
            }

            let m = &mut self.modules[i];
            let interval = m.update_interval();
            if !interval.is_zero() {
                if let Some(last) = m.last_update_time {
                    if now.saturating_sub(last) < interval {
                        report.skipped_interval += 1;
                        continue;
                    }
                }
            }

            let tick_start = clock.now();
            let result = catch_unwind(AssertUnwindSafe(|| m.module.update()));
            let elapsed = clock.now().saturating_sub(tick_start);

            m.last_update_time = Some(tick_start);
            m.record_execution(elapsed);
            report.executed += 1;

            match result {
                Ok(Ok(())) => {
                    if let Some(hb) = &self.heartbeat {
                        hb.touch(&m.name);
                    }
                }
                Ok(Err(e)) => {
                    m.record_error(e.to_string());
                    report.failures += 1;
                }
                Err(payload) => {
                    m.record_error(panic_message(payload.as_ref()));
                    report.failures += 1;
                }
            }

            let deadline = m
                .module
                .max_update_time()
                .unwrap_or_else(|| self.config.deadline_for(m.priority));
            if elapsed > deadline {
                m.deadline_misses += 1;
                report.deadline_misses += 1;
                warn!(
                    target: "rime::scheduler",
                    "deadline miss in {}: {:?} > {:?}",
                    m.name, elapsed, deadline
                );
            }

            m.health_score = m.compute_health();

            if let Some(cb) = self.performance_callback.as_mut() {
                cb(&m.name, elapsed);
            }
        }

        report.elapsed = clock.now().saturating_sub(start);
        report
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Resume ticking `name`. Its silence is counted from now, but a module
    /// the heartbeat monitor has retired stays retired.
    pub fn enable(&mut self, name: &str) -> RimeResult<()> {
        let idx = self.find_or_err(name)?;
        let m = &mut self.modules[idx];
        if !m.enabled {
            m.enabled = true;
            if let Some(hb) = &self.heartbeat {
                hb.resume(name);
            }
            info!(target: "rime::scheduler", "{} enabled", name);
        }
        Ok(())
    }

    /// Stop ticking `name`. A disabled module is not watched for liveness.
    pub fn disable(&mut self, name: &str) -> RimeResult<()> {
        let idx = self.find_or_err(name)?;
        let m = &mut self.modules[idx];
        if m.enabled {
            m.enabled = false;
            if let Some(hb) = &self.heartbeat {
                hb.pause(name);
            }
            info!(target: "rime::scheduler", "{} disabled", name);
        }
        Ok(())
    }

    pub fn is_enabled(&self, name: &str) -> RimeResult<bool> {
        Ok(self.modules[self.find_or_err(name)?].enabled)
    }

    /// Override the module's own update interval.
    pub fn set_update_interval(&mut self, name: &str, interval: Duration) -> RimeResult<()> {
        let idx = self.find_or_err(name)?;
        self.modules[idx].interval_override = Some(interval);
        Ok(())
    }

    /// Called after every module update with the measured duration.
    pub fn set_performance_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&str, Duration) + Send + 'static,
    {
        self.performance_callback = Some(Box::new(callback));
    }

    /// Let every module expose its methods to the external API.
    pub fn register_all_rpc(&mut self, registrar: &mut dyn RpcRegistrar) {
        for m in self.modules.iter_mut() {
            m.module.register_rpc(registrar);
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Module names in tick order.
    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }

    pub fn modules_by_priority(&self, priority: ModulePriority) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| m.priority == priority)
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn module_state(&self, name: &str) -> Option<ModuleState> {
        self.find(name).map(|i| self.modules[i].state)
    }

    pub fn module_stats(&self, name: &str) -> Option<ModuleStats> {
        self.find(name).map(|i| self.modules[i].stats())
    }

    pub fn all_stats(&self) -> Vec<ModuleStats> {
        self.modules.iter().map(RegisteredModule::stats).collect()
    }

    pub fn health_report(&self) -> HealthReport {
        let modules = self.all_stats();
        let (mut healthy, mut degraded, mut error, mut disabled) = (0, 0, 0, 0);
        for s in &modules {
            if !s.enabled {
                disabled += 1;
            } else if s.state != ModuleState::Initialized || s.health_score < 50 {
                error += 1;
            } else if s.health_score >= 80 {
                healthy += 1;
            } else {
                degraded += 1;
            }
        }
        let system_score = if modules.is_empty() {
            100
        } else {
            let sum: u64 = modules.iter().map(|s| u64::from(s.health_score)).sum();
            (sum / modules.len() as u64) as u8
        };
        HealthReport {
            modules,
            healthy,
            degraded,
            error,
            disabled,
            system_score,
        }
    }

    /// Log one line per module.
    pub fn dump_modules(&self) {
        info!(
            target: "rime::scheduler",
            "=== {}: {} modules, {} ticks ===",
            self.scheduler_name,
            self.modules.len(),
            self.tick_count
        );
        for m in &self.modules {
            let s = m.stats();
            info!(
                target: "rime::scheduler",
                "{:<24} {:<10} {:<11} {} updates={} errors={} misses={} avg={:?} max={:?} health={}",
                s.name,
                s.priority,
                s.state,
                if s.enabled { "on " } else { "off" },
                s.update_count,
                s.error_count,
                s.deadline_misses,
                s.avg_execution_time,
                s.max_execution_time,
                s.health_score
            );
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.scheduler_name)
            .field("modules", &self.module_names())
            .field("tick_count", &self.tick_count)
            .finish()
    }
}
