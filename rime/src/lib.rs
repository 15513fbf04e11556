//! # RIME - Refrigeration Integrated Module Engine
//!
//! Umbrella crate over [`rime_core`] plus the pieces the `rime` driver needs:
//! configuration file loading and a small set of demo modules.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rime::prelude::*;
//!
//! let tree = rime::loader::load_tree("config/rime.toml")?;
//! let mut kernel = Kernel::new(KernelConfig::from_tree(&tree)?)?;
//! kernel.register_listed(&rime::modules::factory(), &tree)?;
//! kernel.start(&tree)?;
//! kernel.run_for(Duration::from_secs(5))?;
//! kernel.shutdown();
//! # Ok::<(), anyhow::Error>(())
//! ```

// Re-export core components
pub use rime_core::{self, *};

pub mod loader;
pub mod modules;

/// The RIME prelude - everything a module author needs
pub mod prelude {
    pub use rime_core::core::{Module, ModuleContext, ModuleFactory, ModulePriority, ModuleState};

    pub use rime_core::communication::{Event, EventBus, EventPriority, SubscriptionId};
    pub use rime_core::state::{SharedState, StateValue};

    pub use rime_core::runtime::{Kernel, StopHandle};
    pub use rime_core::scheduling::{HeartbeatMonitor, Scheduler};
    pub use rime_core::KernelConfig;

    pub use rime_core::error::{RimeError, RimeResult};
    pub type Result<T> = RimeResult<T>;

    pub use std::sync::Arc;
    pub use std::time::Duration;

    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Value};

    pub use anyhow::{anyhow, bail, Context, Result as AnyResult};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get RIME version
pub fn version() -> &'static str {
    VERSION
}
