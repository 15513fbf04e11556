//! # RIME Core
//!
//! The real-time kernel for RIME refrigeration controllers.
//!
//! A controller is a set of independently developed modules (sensors,
//! compressor control, defrost, display, ...) that must share one CPU under
//! tight timing. This crate provides:
//!
//! - **Scheduling**: priority-ordered module lifecycle and tick execution with time budgets
//! - **Heartbeat**: per-module liveness tracking with automatic restart
//! - **Communication**: a bounded, prioritized event bus
//! - **State**: a typed key/value store with change notification
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rime_core::{Kernel, KernelConfig, Module, ModuleContext, ModulePriority, RimeResult};
//! use serde_json::json;
//!
//! struct Thermometer {
//!     ctx: Option<ModuleContext>,
//! }
//!
//! impl Module for Thermometer {
//!     fn name(&self) -> &str { "Thermometer" }
//!
//!     fn init(&mut self, ctx: &ModuleContext) -> RimeResult<()> {
//!         self.ctx = Some(ctx.clone());
//!         Ok(())
//!     }
//!
//!     fn update(&mut self) -> RimeResult<()> {
//!         if let Some(ctx) = &self.ctx {
//!             ctx.state().set("sensor.cabinet", 3.8)?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let mut kernel = Kernel::new(KernelConfig::default())?;
//! kernel.register(Box::new(Thermometer { ctx: None }), ModulePriority::Critical)?;
//! kernel.start(&json!({ "thermometer": {} }))?;
//! kernel.run_for(std::time::Duration::from_secs(1))?;
//! kernel.shutdown();
//! # Ok::<(), rime_core::RimeError>(())
//! ```

pub mod clock;
pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod runtime;
pub mod scheduling;
pub mod state;

// Re-export commonly used types for easy access
pub use clock::{Clock, ManualClock, SystemClock};
pub use communication::{Event, EventBus, EventBusStats, EventPriority, SubscriptionId};
pub use config::KernelConfig;
pub use core::{Module, ModuleContext, ModuleFactory, ModulePriority, ModuleState};
pub use error::{RimeError, RimeResult};
pub use runtime::{CycleReport, CycleStats, Kernel, StopHandle};
pub use scheduling::{HealthReport, HeartbeatMonitor, ModuleStats, Scheduler, TickReport};
pub use state::{SharedState, StateStats, StateValue};
