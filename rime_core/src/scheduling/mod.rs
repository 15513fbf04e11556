//! # RIME Scheduling System
//!
//! - **Scheduler**: priority-ordered lifecycle and tick execution with time budgets
//! - **HeartbeatMonitor**: per-module liveness with restart escalation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rime_core::scheduling::Scheduler;
//!
//! let mut scheduler = Scheduler::new(ctx).with_heartbeat(heartbeat);
//! scheduler.register(Box::new(sensors), ModulePriority::Critical)?;
//! scheduler.register(Box::new(display), ModulePriority::Low)?;
//! scheduler.configure_all(&tree);
//! scheduler.init_all()?;
//! loop {
//!     scheduler.tick(Duration::from_millis(8));
//! }
//! ```
//!
//! ## Priority Classes
//!
//! - **Critical**: sensors, safety interlocks (deadline 100µs)
//! - **High**: control loops (500µs)
//! - **Standard**: regular logic (2ms)
//! - **Low**: UI, reporting (5ms)
//! - **Background**: logging, housekeeping (10ms)

pub mod heartbeat;
pub mod scheduler;

pub use heartbeat::{
    HeartbeatCheck, HeartbeatMonitor, HeartbeatRecord, HeartbeatStats, MODULE_HEALTH_EVENT,
};
pub use scheduler::{HealthReport, ModuleStats, Scheduler, TickReport, MODULES_INITIALIZED_EVENT};
