use rime_core::core::{Module, ModuleContext, RpcRegistrar};
use rime_core::error::{RimeError, RimeResult};
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

/// State key holding the running count
pub const COUNTER_KEY: &str = "demo.counter";
/// Event published after every step
pub const TICK_EVENT: &str = "demo.tick";

/// Counter Module - heartbeat-friendly demo workload
///
/// Adds `step` to `demo.counter` in shared state on every update and
/// announces the new value as a `demo.tick` event.
///
/// Configuration section `counter`:
/// - `step` (integer, default 1)
/// - `interval_ms` (integer, default 0 = every cycle)
pub struct CounterModule {
    step: i64,
    interval: Duration,
    ctx: Option<ModuleContext>,
    updates: Arc<AtomicU64>,
}

impl CounterModule {
    pub fn new() -> Self {
        Self {
            step: 1,
            interval: Duration::ZERO,
            ctx: None,
            updates: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of completed updates since construction
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl Default for CounterModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for CounterModule {
    fn name(&self) -> &str {
        "CounterModule"
    }

    fn configure(&mut self, section: &Value) -> RimeResult<()> {
        if let Some(step) = section.get("step") {
            self.step = step
                .as_i64()
                .ok_or_else(|| RimeError::config("counter.step must be an integer"))?;
        }
        if let Some(ms) = section.get("interval_ms") {
            let ms = ms
                .as_u64()
                .ok_or_else(|| RimeError::config("counter.interval_ms must be a positive integer"))?;
            self.interval = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn init(&mut self, ctx: &ModuleContext) -> RimeResult<()> {
        // Int so the count stays integral under increment
        if !ctx.state().exists(COUNTER_KEY) {
            ctx.state().set(COUNTER_KEY, 0i64)?;
        }
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn update(&mut self) -> RimeResult<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| RimeError::module(self.name(), "updated before init"))?;

        let count = ctx.state().increment(COUNTER_KEY, self.step as f64)?;
        self.updates.fetch_add(1, Ordering::Relaxed);

        // A full queue only costs this tick's announcement
        if let Err(e) = ctx.events().publish(TICK_EVENT, json!({ "count": count as i64 })) {
            log::debug!(target: "rime::demo", "tick not announced: {}", e);
        }
        Ok(())
    }

    fn update_interval(&self) -> Duration {
        self.interval
    }

    fn register_rpc(&mut self, registrar: &mut dyn RpcRegistrar) {
        let updates = self.updates.clone();
        registrar.register_method(
            "counter",
            "updates",
            Box::new(move |_params| Ok(json!(updates.load(Ordering::Relaxed)))),
        );
    }
}
