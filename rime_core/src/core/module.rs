use crate::clock::Clock;
use crate::communication::EventBus;
use crate::error::RimeResult;
use crate::state::SharedState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Priority classes for module execution. Lower ordinal runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModulePriority {
    Critical = 0,
    High = 1,
    Standard = 2,
    Low = 3,
    Background = 4,
}

impl ModulePriority {
    pub const ALL: [ModulePriority; 5] = [
        ModulePriority::Critical,
        ModulePriority::High,
        ModulePriority::Standard,
        ModulePriority::Low,
        ModulePriority::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Standard => "standard",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for ModulePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModulePriority {
    type Err = crate::error::RimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "standard" | "normal" => Ok(Self::Standard),
            "low" => Ok(Self::Low),
            "background" => Ok(Self::Background),
            other => Err(crate::error::RimeError::InvalidInput(format!(
                "unknown module priority '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle state, owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModuleState {
    Created,
    Configured,
    Initialized,
    Error,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleState::Created => write!(f, "Created"),
            ModuleState::Configured => write!(f, "Configured"),
            ModuleState::Initialized => write!(f, "Initialized"),
            ModuleState::Error => write!(f, "Error"),
        }
    }
}

/// Handle to an externally visible method.
pub type RpcHandler = Box<dyn Fn(&Value) -> RimeResult<Value> + Send + Sync>;

/// Call-out point for whatever serves the external API.
pub trait RpcRegistrar {
    fn register_method(&mut self, module: &str, method: &str, handler: RpcHandler);
}

/// In-process method table keyed by `module.method`.
#[derive(Default)]
pub struct RpcTable {
    methods: BTreeMap<String, RpcHandler>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call(&self, method: &str, params: &Value) -> RimeResult<Value> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| crate::error::RimeError::not_found(format!("method '{}'", method)))?;
        handler(params)
    }

    pub fn methods(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }
}

impl RpcRegistrar for RpcTable {
    fn register_method(&mut self, module: &str, method: &str, handler: RpcHandler) {
        self.methods.insert(format!("{}.{}", module, method), handler);
    }
}

/// Everything a module gets from the kernel at `init`.
#[derive(Clone)]
pub struct ModuleContext {
    events: Arc<EventBus>,
    state: Arc<SharedState>,
    clock: Arc<dyn Clock>,
}

impl ModuleContext {
    pub fn new(events: Arc<EventBus>, state: Arc<SharedState>, clock: Arc<dyn Clock>) -> Self {
        Self {
            events,
            state,
            clock,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("events", &self.events)
            .field("state", &self.state)
            .finish()
    }
}

/// Contract every controller module implements.
///
/// The scheduler owns the module and drives it through
/// `configure` → `init` → `update`* → `stop`. All hooks run on the kernel
/// thread. `update` is cooperative: the scheduler measures it but cannot
/// interrupt it.
pub trait Module: Send {
    /// Unique name; also selects the configuration section.
    fn name(&self) -> &str;

    /// Apply this module's configuration section.
    fn configure(&mut self, _section: &Value) -> RimeResult<()> {
        Ok(())
    }

    /// Acquire resources and subscribe to events/state.
    fn init(&mut self, ctx: &ModuleContext) -> RimeResult<()>;

    /// One unit of work.
    fn update(&mut self) -> RimeResult<()>;

    /// Release resources.
    fn stop(&mut self) -> RimeResult<()> {
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }

    /// Self-assessed health, 0..=100.
    fn health_score(&self) -> u8 {
        100
    }

    /// Per-call deadline; `None` uses the priority class deadline.
    fn max_update_time(&self) -> Option<Duration> {
        None
    }

    /// Minimum time between updates; zero means every cycle.
    fn update_interval(&self) -> Duration {
        Duration::ZERO
    }

    /// Expose methods to the external API.
    fn register_rpc(&mut self, _registrar: &mut dyn RpcRegistrar) {}
}

/// Configuration section for a module name: a trailing `Module` is dropped
/// and CamelCase becomes snake_case (`ClimateControlModule` → `climate_control`).
pub fn config_section_name(module_name: &str) -> String {
    let base = module_name
        .strip_suffix("Module")
        .filter(|b| !b.is_empty())
        .unwrap_or(module_name);

    let chars: Vec<char> = base.chars().collect();
    let mut out = String::with_capacity(base.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = if i > 0 { Some(chars[i - 1]) } else { None };
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
