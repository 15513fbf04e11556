//! Priority-aware publish/subscribe bus with a bounded pending queue.
//!
//! Publishing is cheap and never waits on subscribers: the event is stamped,
//! pushed onto its priority lane and left there until the owning context
//! calls [`EventBus::process`]. When the lanes together hold `capacity`
//! events, new events are dropped and counted.
//!
//! Dispatch order is Critical, High, Normal, Low; FIFO inside a lane.

use super::pattern::SubscriptionIndex;
use super::{IdAllocator, OwnerContext, SubscriptionId};
use crate::clock::{Clock, SystemClock};
use crate::error::{panic_message, RimeError, RimeResult};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default number of pending events the bus will hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Event priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl EventPriority {
    pub const ALL: [EventPriority; 4] = [
        EventPriority::Critical,
        EventPriority::High,
        EventPriority::Normal,
        EventPriority::Low,
    ];

    fn lane(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPriority::Critical => write!(f, "critical"),
            EventPriority::High => write!(f, "high"),
            EventPriority::Normal => write!(f, "normal"),
            EventPriority::Low => write!(f, "low"),
        }
    }
}

/// A published event. Immutable once on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
    /// Publish time on the bus clock.
    pub timestamp: Duration,
    pub priority: EventPriority,
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Snapshot of bus counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventBusStats {
    /// Events accepted onto the queue
    pub published: u64,
    /// Events handed to subscribers
    pub processed: u64,
    /// Events rejected because the queue was full
    pub dropped: u64,
    /// Events consumed by the filter without dispatch
    pub filtered: u64,
    /// Handler invocations that panicked
    pub handler_failures: u64,
    pub subscription_count: usize,
    pub queue_len: usize,
    pub capacity: usize,
    /// Mean dispatch time per processed event
    pub avg_process_time: Duration,
}

#[derive(Default)]
struct PendingQueue {
    lanes: [VecDeque<Event>; 4],
}

impl PendingQueue {
    fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn push(&mut self, event: Event) {
        self.lanes[event.priority.lane()].push_back(event);
    }

    /// Take everything, highest lane first.
    fn drain(&mut self) -> Vec<Event> {
        let mut out = Vec::with_capacity(self.len());
        for lane in self.lanes.iter_mut() {
            out.extend(lane.drain(..));
        }
        out
    }

    /// Put undispatched events back ahead of anything published meanwhile.
    fn requeue_front(&mut self, events: Vec<Event>) {
        for event in events.into_iter().rev() {
            self.lanes[event.priority.lane()].push_front(event);
        }
    }

    fn clear(&mut self) -> usize {
        let n = self.len();
        for lane in self.lanes.iter_mut() {
            lane.clear();
        }
        n
    }
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
    handler_failures: AtomicU64,
    process_nanos: AtomicU64,
}

/// Bounded, priority-ordered event bus.
pub struct EventBus {
    capacity: usize,
    clock: Arc<dyn Clock>,
    queue: Mutex<PendingQueue>,
    subscriptions: Mutex<SubscriptionIndex<EventHandler>>,
    filter: Mutex<Option<EventFilter>>,
    paused: AtomicBool,
    ids: IdAllocator,
    owner: OwnerContext,
    counters: Counters,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            clock,
            queue: Mutex::new(PendingQueue::default()),
            subscriptions: Mutex::new(SubscriptionIndex::default()),
            filter: Mutex::new(None),
            paused: AtomicBool::new(false),
            ids: IdAllocator::new(),
            owner: OwnerContext::default(),
            counters: Counters::default(),
        }
    }

    // ========================================================================
    // Publishing (any thread)
    // ========================================================================

    /// Publish at [`EventPriority::Normal`].
    pub fn publish(&self, event_type: impl Into<String>, payload: Value) -> RimeResult<()> {
        self.publish_with_priority(event_type, payload, EventPriority::Normal)
    }

    /// Queue an event. Fails with [`RimeError::QueueFull`] when the queue is at
    /// capacity; the event is then dropped and counted.
    pub fn publish_with_priority(
        &self,
        event_type: impl Into<String>,
        payload: Value,
        priority: EventPriority,
    ) -> RimeResult<()> {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return Err(RimeError::InvalidInput("empty event type".into()));
        }
        let event = Event {
            event_type,
            payload,
            timestamp: self.clock.now(),
            priority,
        };

        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            drop(queue);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(target: "rime::event_bus", "queue full, dropped '{}'", event.event_type);
            return Err(RimeError::QueueFull {
                event_type: event.event_type,
                capacity: self.capacity,
            });
        }
        queue.push(event);
        drop(queue);
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ========================================================================
    // Subscriptions (owning context only)
    // ========================================================================

    /// Register `handler` for every event type matching `pattern`.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> RimeResult<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.owner.claim("subscribe")?;
        let id = self.ids.next();
        self.subscriptions.lock().insert(id, pattern, Arc::new(handler));
        debug!(target: "rime::event_bus", "{} subscribed to '{}'", id, pattern);
        Ok(id)
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> RimeResult<bool> {
        self.owner.claim("unsubscribe")?;
        Ok(self.subscriptions.lock().remove(id))
    }

    // ========================================================================
    // Dispatch (owning context only)
    // ========================================================================

    /// Dispatch pending events until the queue is empty or `budget` is spent.
    ///
    /// The budget is checked before each event; a handler is never cut short.
    /// Events left over go back to the front of their lanes. Returns the
    /// number of events handed to subscribers.
    pub fn process(&self, budget: Duration) -> usize {
        if let Err(e) = self.owner.claim("process") {
            warn!(target: "rime::event_bus", "{}", e);
            return 0;
        }
        if self.is_paused() {
            return 0;
        }

        let start = self.clock.now();
        let batch = self.queue.lock().drain();
        if batch.is_empty() {
            return 0;
        }

        let mut processed = 0usize;
        let mut pending = batch.into_iter();
        while let Some(event) = pending.next() {
            if self.clock.now().saturating_sub(start) >= budget {
                let mut rest = vec![event];
                rest.extend(pending);
                debug!(target: "rime::event_bus", "budget spent, {} events deferred", rest.len());
                self.queue.lock().requeue_front(rest);
                break;
            }
            if self.dispatch(&event) {
                processed += 1;
            }
        }

        let spent = self.clock.now().saturating_sub(start);
        self.counters
            .process_nanos
            .fetch_add(spent.as_nanos() as u64, Ordering::Relaxed);
        processed
    }

    /// Run one event through the filter and its subscribers. Returns false if
    /// the filter consumed it.
    fn dispatch(&self, event: &Event) -> bool {
        let filter = self.filter.lock().clone();
        if let Some(filter) = filter {
            if !filter(event) {
                self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        // Handlers run without any bus lock held so they may publish or
        // manage subscriptions themselves.
        let handlers = self.subscriptions.lock().matching(&event.event_type);
        for handler in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                self.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "rime::event_bus",
                    "handler for '{}' {}",
                    event.event_type,
                    panic_message(payload.as_ref())
                );
            }
        }
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        true
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Stop dispatching. Publishing still queues.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Install a predicate; rejected events are consumed and counted as filtered.
    pub fn set_filter<F>(&self, filter: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        *self.filter.lock() = Some(Arc::new(filter));
    }

    pub fn clear_filter(&self) {
        *self.filter.lock() = None;
    }

    /// Discard all pending events. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        self.queue.lock().clear()
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.published,
            &c.processed,
            &c.dropped,
            &c.filtered,
            &c.handler_failures,
            &c.process_nanos,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.queue_len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn stats(&self) -> EventBusStats {
        let c = &self.counters;
        let processed = c.processed.load(Ordering::Relaxed);
        let nanos = c.process_nanos.load(Ordering::Relaxed);
        EventBusStats {
            published: c.published.load(Ordering::Relaxed),
            processed,
            dropped: c.dropped.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            subscription_count: self.subscription_count(),
            queue_len: self.queue_len(),
            capacity: self.capacity,
            avg_process_time: if processed > 0 {
                Duration::from_nanos(nanos / processed)
            } else {
                Duration::ZERO
            },
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("queue_len", &self.queue_len())
            .field("subscriptions", &self.subscription_count())
            .field("paused", &self.is_paused())
            .finish()
    }
}
