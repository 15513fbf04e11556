use rime_core::communication::{Event, SubscriptionId};
use rime_core::core::{Module, ModuleContext};
use rime_core::error::{RimeError, RimeResult};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

/// State key holding the number of events seen
pub const SEEN_KEY: &str = "event_log.seen";

/// Event Log Module - traces bus traffic at debug level
///
/// Configuration section `event_log`:
/// - `pattern` (string, default `*`)
pub struct EventLogModule {
    pattern: String,
    seen: Arc<AtomicU64>,
    subscription: Option<SubscriptionId>,
    ctx: Option<ModuleContext>,
}

impl EventLogModule {
    pub fn new() -> Self {
        Self::new_with_pattern("*")
    }

    pub fn new_with_pattern(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            seen: Arc::new(AtomicU64::new(0)),
            subscription: None,
            ctx: None,
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

impl Default for EventLogModule {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for EventLogModule {
    fn name(&self) -> &str {
        "EventLogModule"
    }

    fn configure(&mut self, section: &Value) -> RimeResult<()> {
        if let Some(pattern) = section.get("pattern") {
            self.pattern = pattern
                .as_str()
                .ok_or_else(|| RimeError::config("event_log.pattern must be a string"))?
                .to_string();
        }
        Ok(())
    }

    fn init(&mut self, ctx: &ModuleContext) -> RimeResult<()> {
        // A reload must not leave the old subscription behind
        if let Some(old) = self.subscription.take() {
            ctx.events().unsubscribe(old)?;
        }
        let seen = self.seen.clone();
        let id = ctx.events().subscribe(&self.pattern, move |event: &Event| {
            seen.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                target: "rime::demo",
                "[{:?}] {} {}",
                event.priority,
                event.event_type,
                event.payload
            );
        })?;
        self.subscription = Some(id);
        self.ctx = Some(ctx.clone());
        Ok(())
    }

    fn update(&mut self) -> RimeResult<()> {
        if let Some(ctx) = &self.ctx {
            ctx.state().set(SEEN_KEY, self.seen() as i64)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> RimeResult<()> {
        if let (Some(id), Some(ctx)) = (self.subscription.take(), &self.ctx) {
            ctx.events().unsubscribe(id)?;
        }
        Ok(())
    }

    /// Low-priority tracing; once a second is plenty
    fn update_interval(&self) -> Duration {
        Duration::from_secs(1)
    }
}
