//! Kernel configuration.
//!
//! The kernel never reads files. Callers hand it either a kernel document
//! (TOML/YAML text) or an already-parsed application tree, whose `system`
//! section holds the kernel settings and whose other sections belong to
//! modules. Every field has a default, so an empty document is valid.

use crate::core::ModulePriority;
use crate::error::{RimeError, RimeResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main-loop timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Control period
    pub period_ms: u64,
    /// Slice of the period given to module updates
    pub module_budget_ms: u64,
    /// Slice of the period given to event dispatch
    pub event_budget_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            period_ms: 10,
            module_budget_ms: 8,
            event_budget_ms: 2,
        }
    }
}

impl TimingConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn module_budget(&self) -> Duration {
        Duration::from_millis(self.module_budget_ms)
    }

    pub fn event_budget(&self) -> Duration {
        Duration::from_millis(self.event_budget_ms)
    }
}

/// Per-class update deadlines in microseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineTable {
    pub critical: u64,
    pub high: u64,
    pub standard: u64,
    pub low: u64,
    pub background: u64,
}

impl Default for DeadlineTable {
    fn default() -> Self {
        Self {
            critical: 100,
            high: 500,
            standard: 2_000,
            low: 5_000,
            background: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub deadlines_us: DeadlineTable,
}

impl SchedulerConfig {
    pub fn deadline_for(&self, priority: ModulePriority) -> Duration {
        let d = &self.deadlines_us;
        Duration::from_micros(match priority {
            ModulePriority::Critical => d.critical,
            ModulePriority::High => d.high,
            ModulePriority::Standard => d.standard,
            ModulePriority::Low => d.low,
            ModulePriority::Background => d.background,
        })
    }
}

/// Liveness policy for the heartbeat monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// How often `check_all` runs when polled from the main loop
    pub check_interval_ms: u64,
    pub critical_timeout_ms: u64,
    /// Defaults to twice the critical timeout
    pub high_timeout_ms: Option<u64>,
    pub standard_timeout_ms: u64,
    /// Defaults to twice the standard timeout
    pub low_timeout_ms: Option<u64>,
    pub background_timeout_ms: u64,
    pub auto_restart: bool,
    pub max_restart_attempts: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_ms: 5_000,
            critical_timeout_ms: 5_000,
            high_timeout_ms: None,
            standard_timeout_ms: 30_000,
            low_timeout_ms: None,
            background_timeout_ms: 300_000,
            auto_restart: true,
            max_restart_attempts: 3,
        }
    }
}

impl HeartbeatConfig {
    pub fn timeout_for(&self, priority: ModulePriority) -> Duration {
        let ms = match priority {
            ModulePriority::Critical => self.critical_timeout_ms,
            ModulePriority::High => self
                .high_timeout_ms
                .unwrap_or(self.critical_timeout_ms.saturating_mul(2)),
            ModulePriority::Standard => self.standard_timeout_ms,
            ModulePriority::Low => self
                .low_timeout_ms
                .unwrap_or(self.standard_timeout_ms.saturating_mul(2)),
            ModulePriority::Background => self.background_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Timeouts must be non-zero and never shorter for a lower class.
    pub fn validate(&self) -> RimeResult<()> {
        if self.check_interval_ms == 0 {
            return Err(RimeError::config("heartbeat.check_interval_ms must be > 0"));
        }
        let mut previous: Option<(ModulePriority, Duration)> = None;
        for priority in ModulePriority::ALL {
            let timeout = self.timeout_for(priority);
            if timeout.is_zero() {
                return Err(RimeError::config(format!(
                    "heartbeat timeout for {} must be > 0",
                    priority
                )));
            }
            if let Some((higher, higher_timeout)) = previous {
                if timeout < higher_timeout {
                    return Err(RimeError::config(format!(
                        "heartbeat timeout for {} ({:?}) is shorter than for {} ({:?})",
                        priority, timeout, higher, higher_timeout
                    )));
                }
            }
            previous = Some((priority, timeout));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::communication::event_bus::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedStateConfig {
    pub max_entries: usize,
    pub max_key_len: usize,
}

impl Default for SharedStateConfig {
    fn default() -> Self {
        Self {
            max_entries: 64,
            max_key_len: 32,
        }
    }
}

/// Complete kernel configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub timing: TimingConfig,
    pub scheduler: SchedulerConfig,
    pub heartbeat: HeartbeatConfig,
    pub event_bus: EventBusConfig,
    pub state: SharedStateConfig,
    /// Explicit module name → configuration section overrides
    pub config_sections: BTreeMap<String, String>,
}

impl KernelConfig {
    pub fn from_toml_str(text: &str) -> RimeResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> RimeResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Kernel settings from a parsed kernel document.
    pub fn from_value(value: Value) -> RimeResult<Self> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| RimeError::config(format!("invalid kernel config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Kernel settings from the `system` section of an application tree.
    /// A tree without one yields the defaults.
    pub fn from_tree(tree: &Value) -> RimeResult<Self> {
        match tree.get("system") {
            Some(section) => Self::from_value(section.clone()),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> RimeResult<()> {
        let t = &self.timing;
        if t.period_ms == 0 {
            return Err(RimeError::config("timing.period_ms must be > 0"));
        }
        if t.module_budget_ms == 0 || t.event_budget_ms == 0 {
            return Err(RimeError::config(
                "timing.module_budget_ms and timing.event_budget_ms must be > 0",
            ));
        }
        if t.module_budget_ms + t.event_budget_ms > t.period_ms {
            return Err(RimeError::config(format!(
                "module budget ({}ms) + event budget ({}ms) exceed the period ({}ms)",
                t.module_budget_ms, t.event_budget_ms, t.period_ms
            )));
        }
        if self.event_bus.queue_capacity == 0 {
            return Err(RimeError::config("event_bus.queue_capacity must be > 0"));
        }
        if self.state.max_entries == 0 || self.state.max_key_len == 0 {
            return Err(RimeError::config("state limits must be > 0"));
        }
        self.heartbeat.validate()
    }
}
