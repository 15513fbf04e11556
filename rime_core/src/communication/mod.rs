//! # RIME Communication
//!
//! Modules never call each other directly. They talk through:
//!
//! - **EventBus**: prioritized, pattern-matched publish/subscribe with a bounded queue
//! - **SharedState** (in [`crate::state`]): the key/value side of the same substrate
//!
//! Both use the same pattern syntax (see [`pattern::matches`]) and the same
//! single-owner rule for subscription management.

pub mod event_bus;
pub mod pattern;

pub use event_bus::{Event, EventBus, EventBusStats, EventPriority};
pub use pattern::matches;

use crate::error::{RimeError, RimeResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

/// Opaque handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Monotonic id source, one per bus/store.
#[derive(Debug)]
pub(crate) struct IdAllocator(AtomicU64);

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub(crate) fn next(&self) -> SubscriptionId {
        SubscriptionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// The thread allowed to manage subscriptions and run dispatch.
///
/// The first caller claims ownership; later calls from any other thread are
/// rejected with [`RimeError::ForeignContext`].
#[derive(Debug, Default)]
pub(crate) struct OwnerContext {
    owner: Mutex<Option<ThreadId>>,
}

impl OwnerContext {
    pub(crate) fn claim(&self, operation: &str) -> RimeResult<()> {
        let current = thread::current().id();
        let mut owner = self.owner.lock();
        match *owner {
            None => {
                *owner = Some(current);
                Ok(())
            }
            Some(id) if id == current => Ok(()),
            Some(id) => Err(RimeError::ForeignContext(format!(
                "{} from {:?}, owner is {:?}",
                operation, current, id
            ))),
        }
    }
}
