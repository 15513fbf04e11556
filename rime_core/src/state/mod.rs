//! Shared state store used by modules to publish readings and settings.

pub mod shared_state;

pub use shared_state::{FromStateValue, SharedState, StateCallback, StateStats, StateValue};
