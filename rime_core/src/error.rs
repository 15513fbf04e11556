//! Unified error handling for RIME
//!
//! One error type for the whole kernel. Most failures are contained where
//! they happen (a failed module update is recorded, a full event queue is a
//! counted drop); the variants here are what callers actually see.

use thiserror::Error;

/// Main error type for RIME operations
#[derive(Debug, Error)]
pub enum RimeError {
    /// A module or record with this name is already registered
    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A module hook (configure/init/update/stop) reported a failure
    #[error("Module '{module}' failed: {message}")]
    ModuleFailed { module: String, message: String },

    /// At least one Critical module failed to initialize
    #[error("Critical module initialization failed: {}", modules.join(", "))]
    CriticalInitFailure { modules: Vec<String> },

    /// The event queue is at capacity; the event was dropped
    #[error("Event queue full ({capacity}), dropped '{event_type}'")]
    QueueFull { event_type: String, capacity: usize },

    /// A state value has a different type than the operation requires
    #[error("Type mismatch for '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// The state store holds its maximum number of entries
    #[error("Shared state full ({capacity} entries)")]
    StateFull { capacity: usize },

    /// State key exceeds the configured maximum length
    #[error("Key '{key}' longer than {max} bytes")]
    KeyTooLong { key: String, max: usize },

    /// Subscription or dispatch attempted outside the owning thread
    #[error("Called from a foreign context: {0}")]
    ForeignContext(String),

    /// Serialization/Deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RimeError {
    pub fn config(msg: impl Into<String>) -> Self {
        RimeError::Config(msg.into())
    }

    pub fn module(module: impl Into<String>, message: impl Into<String>) -> Self {
        RimeError::ModuleFailed {
            module: module.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        RimeError::NotFound(what.into())
    }
}

/// Convenience type alias for Results using RimeError
pub type RimeResult<T> = std::result::Result<T, RimeError>;

// ============================================
// From implementations for common error types
// ============================================

impl From<serde_json::Error> for RimeError {
    fn from(err: serde_json::Error) -> Self {
        RimeError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RimeError {
    fn from(err: toml::de::Error) -> Self {
        RimeError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<serde_yaml::Error> for RimeError {
    fn from(err: serde_yaml::Error) -> Self {
        RimeError::Config(format!("YAML parse error: {}", err))
    }
}

impl From<anyhow::Error> for RimeError {
    fn from(err: anyhow::Error) -> Self {
        RimeError::Internal(format!("{:#}", err))
    }
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked with unknown payload".to_string()
    }
}
