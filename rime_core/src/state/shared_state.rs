//! Shared state store: a bounded, typed key/value map that any module can
//! read or write, with change notification by key pattern.
//!
//! Every mutation is serialized by one lock. Subscribers are called after the
//! lock is released, and only when a key is new or its value changed.

use crate::clock::{Clock, SystemClock};
use crate::communication::pattern::{matches, SubscriptionIndex};
use crate::communication::{IdAllocator, OwnerContext, SubscriptionId};
use crate::config::SharedStateConfig;
use crate::error::{panic_message, RimeError, RimeResult};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// A typed state value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Structured(Value),
}

impl StateValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Int(_) => "int",
            StateValue::Float(_) => "float",
            StateValue::Bool(_) => "bool",
            StateValue::Str(_) => "string",
            StateValue::Structured(_) => "structured",
        }
    }

    fn heap_size(&self) -> usize {
        match self {
            StateValue::Str(s) => s.capacity(),
            StateValue::Structured(v) => v.to_string().len(),
            _ => 0,
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Int(v) => write!(f, "{}", v),
            StateValue::Float(v) => write!(f, "{}", v),
            StateValue::Bool(v) => write!(f, "{}", v),
            StateValue::Str(v) => write!(f, "{:?}", v),
            StateValue::Structured(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Int(v)
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int(v.into())
    }
}

impl From<u32> for StateValue {
    fn from(v: u32) -> Self {
        StateValue::Int(v.into())
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Float(v)
    }
}

impl From<f32> for StateValue {
    fn from(v: f32) -> Self {
        StateValue::Float(v.into())
    }
}

impl From<bool> for StateValue {
    fn from(v: bool) -> Self {
        StateValue::Bool(v)
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::Str(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::Str(v.to_string())
    }
}

impl From<Value> for StateValue {
    fn from(v: Value) -> Self {
        StateValue::Structured(v)
    }
}

/// Typed extraction from a [`StateValue`]. Never coerces between variants.
pub trait FromStateValue: Sized {
    fn from_state_value(value: &StateValue) -> Option<Self>;
}

impl FromStateValue for i64 {
    fn from_state_value(value: &StateValue) -> Option<Self> {
        match value {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromStateValue for f64 {
    fn from_state_value(value: &StateValue) -> Option<Self> {
        match value {
            StateValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromStateValue for bool {
    fn from_state_value(value: &StateValue) -> Option<Self> {
        match value {
            StateValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromStateValue for String {
    fn from_state_value(value: &StateValue) -> Option<Self> {
        match value {
            StateValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromStateValue for Value {
    fn from_state_value(value: &StateValue) -> Option<Self> {
        match value {
            StateValue::Structured(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromStateValue for StateValue {
    fn from_state_value(value: &StateValue) -> Option<Self> {
        Some(value.clone())
    }
}

pub type StateCallback = Arc<dyn Fn(&str, &StateValue) + Send + Sync>;

#[derive(Debug, Clone)]
struct Entry {
    value: StateValue,
    /// Last time the value changed.
    last_update: Duration,
    /// Writes, including ones that stored an equal value.
    update_count: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    peak_entries: usize,
    total_sets: u64,
    total_gets: u64,
}

/// Store statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateStats {
    pub entry_count: usize,
    pub capacity: usize,
    pub peak_entries: usize,
    pub subscription_count: usize,
    pub total_sets: u64,
    pub total_gets: u64,
    /// Rough byte count of keys, entries and heap payloads
    pub memory_used_estimate: usize,
}

/// Thread-safe key/value store shared by all modules.
pub struct SharedState {
    max_entries: usize,
    max_key_len: usize,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    subscriptions: Mutex<SubscriptionIndex<StateCallback>>,
    ids: IdAllocator,
    owner: OwnerContext,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new(&SharedStateConfig::default())
    }
}

impl SharedState {
    pub fn new(config: &SharedStateConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: &SharedStateConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_entries: config.max_entries,
            max_key_len: config.max_key_len,
            clock,
            inner: Mutex::new(Inner::default()),
            subscriptions: Mutex::new(SubscriptionIndex::default()),
            ids: IdAllocator::new(),
            owner: OwnerContext::default(),
        }
    }

    fn check_key(&self, key: &str) -> RimeResult<()> {
        if key.is_empty() {
            return Err(RimeError::InvalidInput("empty state key".into()));
        }
        if key.len() > self.max_key_len {
            return Err(RimeError::KeyTooLong {
                key: key.to_string(),
                max: self.max_key_len,
            });
        }
        Ok(())
    }

    /// Insert a fresh entry, respecting capacity. Caller holds the lock.
    fn insert_new(&self, inner: &mut Inner, key: &str, value: StateValue) -> RimeResult<()> {
        if inner.entries.len() >= self.max_entries {
            return Err(RimeError::StateFull {
                capacity: self.max_entries,
            });
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                last_update: self.clock.now(),
                update_count: 1,
            },
        );
        inner.peak_entries = inner.peak_entries.max(inner.entries.len());
        Ok(())
    }

    fn notify(&self, key: &str, value: &StateValue) {
        let callbacks = self.subscriptions.lock().matching(key);
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(key, value))) {
                warn!(
                    target: "rime::state",
                    "subscriber for '{}' {}",
                    key,
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store `value` under `key`. Subscribers are notified when the key is new
    /// or the value differs from what was stored.
    pub fn set(&self, key: &str, value: impl Into<StateValue>) -> RimeResult<()> {
        self.check_key(key)?;
        let value = value.into();
        let changed = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            let changed = match inner.entries.get_mut(key) {
                Some(entry) => {
                    entry.update_count += 1;
                    if entry.value != value {
                        entry.value = value.clone();
                        entry.last_update = now;
                        true
                    } else {
                        false
                    }
                }
                None => {
                    self.insert_new(&mut inner, key, value.clone())?;
                    true
                }
            };
            inner.total_sets += 1;
            changed
        };
        if changed {
            self.notify(key, &value);
        }
        Ok(())
    }

    /// Atomically add `delta` and return the new value.
    ///
    /// An absent key is created as `Float(delta)`. An `Int` stays an `Int` when
    /// `delta` is integral and the sum fits in an `i64`, otherwise it becomes a
    /// `Float`. Non-numeric values are left alone and reported as
    /// [`RimeError::TypeMismatch`].
    pub fn increment(&self, key: &str, delta: f64) -> RimeResult<f64> {
        self.check_key(key)?;
        let (result, stored, created) = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            let (result, stored, created) = match inner.entries.get_mut(key) {
                None => {
                    let value = StateValue::Float(delta);
                    self.insert_new(&mut inner, key, value.clone())?;
                    (delta, value, true)
                }
                Some(entry) => {
                    let (result, next) = match entry.value {
                        StateValue::Int(i) if delta.fract() == 0.0 => {
                            match integral_delta(delta).and_then(|d| i.checked_add(d)) {
                                Some(sum) => (sum as f64, StateValue::Int(sum)),
                                None => (i as f64 + delta, StateValue::Float(i as f64 + delta)),
                            }
                        }
                        StateValue::Int(i) => (i as f64 + delta, StateValue::Float(i as f64 + delta)),
                        StateValue::Float(f) => (f + delta, StateValue::Float(f + delta)),
                        ref other => {
                            return Err(RimeError::TypeMismatch {
                                key: key.to_string(),
                                expected: "numeric",
                                found: other.type_name(),
                            })
                        }
                    };
                    entry.update_count += 1;
                    if delta != 0.0 {
                        entry.last_update = now;
                    }
                    entry.value = next.clone();
                    (result, next, false)
                }
            };
            inner.total_sets += 1;
            (result, stored, created)
        };
        if created || delta != 0.0 {
            self.notify(key, &stored);
        }
        Ok(result)
    }

    /// Replace the value only if it currently equals `expected`.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected: impl Into<StateValue>,
        new: impl Into<StateValue>,
    ) -> bool {
        let expected = expected.into();
        let new = new.into();
        let swapped = {
            let mut inner = self.inner.lock();
            let now = self.clock.now();
            match inner.entries.get_mut(key) {
                Some(entry) if entry.value == expected => {
                    entry.update_count += 1;
                    let changed = entry.value != new;
                    if changed {
                        entry.value = new.clone();
                        entry.last_update = now;
                    }
                    inner.total_sets += 1;
                    Some(changed)
                }
                _ => None,
            }
        };
        match swapped {
            Some(true) => {
                self.notify(key, &new);
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Remove every entry. Counters and subscriptions survive.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
        debug!(target: "rime::state", "cleared");
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Typed read. `None` when absent or stored as a different type.
    pub fn get<T: FromStateValue>(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        inner.total_gets += 1;
        inner
            .entries
            .get(key)
            .and_then(|e| T::from_state_value(&e.value))
    }

    pub fn get_or<T: FromStateValue>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Keys matching `pattern`, sorted.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|k| matches(pattern, k))
            .cloned()
            .collect()
    }

    pub fn last_update_time(&self, key: &str) -> Option<Duration> {
        self.inner.lock().entries.get(key).map(|e| e.last_update)
    }

    pub fn update_count(&self, key: &str) -> Option<u64> {
        self.inner.lock().entries.get(key).map(|e| e.update_count)
    }

    /// Has any key matching `pattern` changed after `since`?
    pub fn has_changed(&self, pattern: &str, since: Duration) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|(k, e)| e.last_update > since && matches(pattern, k))
    }

    /// Copy of every entry, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, StateValue> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Subscriptions (owning context only)
    // ========================================================================

    /// Call `callback` whenever a key matching `pattern` is created or changed.
    pub fn subscribe<F>(&self, pattern: &str, callback: F) -> RimeResult<SubscriptionId>
    where
        F: Fn(&str, &StateValue) + Send + Sync + 'static,
    {
        self.owner.claim("state subscribe")?;
        let id = self.ids.next();
        self.subscriptions.lock().insert(id, pattern, Arc::new(callback));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> RimeResult<bool> {
        self.owner.claim("state unsubscribe")?;
        Ok(self.subscriptions.lock().remove(id))
    }

    pub fn statistics(&self) -> StateStats {
        let subscription_count = self.subscriptions.lock().len();
        let inner = self.inner.lock();
        let memory_used_estimate = inner
            .entries
            .iter()
            .map(|(k, e)| k.capacity() + std::mem::size_of::<Entry>() + e.value.heap_size())
            .sum();
        StateStats {
            entry_count: inner.entries.len(),
            capacity: self.max_entries,
            peak_entries: inner.peak_entries,
            subscription_count,
            total_sets: inner.total_sets,
            total_gets: inner.total_gets,
            memory_used_estimate,
        }
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("entries", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

/// `delta` as an `i64` when it converts exactly.
fn integral_delta(delta: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, which is out of range
    if delta >= i64::MIN as f64 && delta < i64::MAX as f64 {
        Some(delta as i64)
    } else {
        None
    }
}
