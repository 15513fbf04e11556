//! # Core types and traits for RIME
//!
//! - **Module**: the contract every controller component implements
//! - **ModuleContext**: handles to the event bus, shared state and clock given to modules at init
//! - **ModuleFactory**: startup-time registry of module constructors
//!
//! ## Module Lifecycle
//!
//! 1. **Registration** - the scheduler takes ownership, state `Created`
//! 2. **Configuration** - `configure()` receives the module's section, state `Configured`
//! 3. **Initialization** - `init()` acquires resources, state `Initialized`
//! 4. **Execution** - `update()` is called from the scheduler tick
//! 5. **Stop** - `stop()` in reverse priority order, state back to `Configured`

pub mod module;
pub mod registry;

pub use module::{
    config_section_name, Module, ModuleContext, ModulePriority, ModuleState, RpcHandler,
    RpcRegistrar, RpcTable,
};
pub use registry::{ModuleConstructor, ModuleFactory};
