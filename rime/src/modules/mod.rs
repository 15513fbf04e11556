//! RIME demo modules
//!
//! Small modules that exercise the module contract end to end. Controllers
//! register their own modules the same way.
//!
//! - `counter` - `CounterModule`, counts in shared state and publishes `demo.tick`
//! - `event_log` - `EventLogModule`, traces bus traffic at debug level
//!
//! ```rust,ignore
//! let factory = rime::modules::factory();
//! kernel.register_from_factory(&factory, "counter", ModulePriority::Standard)?;
//! ```

pub mod counter;
pub mod event_log;

pub use counter::CounterModule;
pub use event_log::EventLogModule;

use rime_core::core::ModuleFactory;

/// Factory holding every demo module under its configuration id.
pub fn factory() -> ModuleFactory {
    let mut factory = ModuleFactory::new();
    let builtins: [(&str, fn() -> Box<dyn rime_core::Module>); 2] = [
        ("counter", || Box::new(CounterModule::new())),
        ("event_log", || Box::new(EventLogModule::new())),
    ];
    for (id, ctor) in builtins {
        if let Err(e) = factory.register(id, ctor) {
            log::warn!(target: "rime::demo", "{}", e);
        }
    }
    factory
}
