//! Heartbeat monitor: per-module liveness with restart escalation.
//!
//! The scheduler touches a module's record after every successful update.
//! [`HeartbeatMonitor::check_all`] looks for records that went quiet for
//! longer than their class timeout, reports them on the event bus and asks
//! the restart callback to bring them back. A module that keeps going quiet
//! is retired after `max_restart_attempts` and never checked again.

use crate::clock::Clock;
use crate::communication::{EventBus, EventPriority};
use crate::config::HeartbeatConfig;
use crate::core::ModulePriority;
use crate::error::{RimeError, RimeResult};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Event type published for every liveness transition.
pub const MODULE_HEALTH_EVENT: &str = "system.module_health";

pub type RestartCallback = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Liveness record for one module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    pub priority: ModulePriority,
    pub last_update: Duration,
    /// Expirations seen so far; never exceeds `max_restart_attempts`
    pub restart_count: u32,
    /// False once the module has been retired
    pub is_active: bool,
    /// Not checked while paused; retirement is kept
    pub paused: bool,
}

impl HeartbeatRecord {
    fn is_watched(&self) -> bool {
        self.is_active && !self.paused
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeartbeatStats {
    pub total_checks: u64,
    pub total_restarts: u64,
    pub failed_restarts: u64,
    /// Longest silence observed at an expiry
    pub longest_silence: Duration,
}

/// What one `check_all` pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatCheck {
    pub unresponsive: Vec<String>,
    pub restarted: Vec<String>,
    pub restart_failed: Vec<String>,
    pub disabled: Vec<String>,
}

impl HeartbeatCheck {
    pub fn is_clean(&self) -> bool {
        self.unresponsive.is_empty()
    }
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    clock: Arc<dyn Clock>,
    events: Option<Arc<EventBus>>,
    records: Mutex<HashMap<String, HeartbeatRecord>>,
    restart_callback: Mutex<Option<RestartCallback>>,
    last_check: Mutex<Duration>,
    stats: Mutex<HeartbeatStats>,
    system_health: AtomicU8,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            events: None,
            records: Mutex::new(HashMap::new()),
            restart_callback: Mutex::new(None),
            last_check: Mutex::new(now),
            stats: Mutex::new(HeartbeatStats::default()),
            system_health: AtomicU8::new(100),
        }
    }

    /// Publish liveness events on `events`.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn timeout_for(&self, priority: ModulePriority) -> Duration {
        self.config.timeout_for(priority)
    }

    pub fn set_restart_callback<F>(&self, callback: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self.restart_callback.lock() = Some(Arc::new(callback));
    }

    pub fn clear_restart_callback(&self) {
        *self.restart_callback.lock() = None;
    }

    // ========================================================================
    // Records
    // ========================================================================

    pub fn register(&self, name: &str, priority: ModulePriority) -> RimeResult<()> {
        if name.is_empty() {
            return Err(RimeError::InvalidInput("empty module name".into()));
        }
        let mut records = self.records.lock();
        if records.contains_key(name) {
            return Err(RimeError::AlreadyRegistered(format!("heartbeat '{}'", name)));
        }
        records.insert(
            name.to_string(),
            HeartbeatRecord {
                priority,
                last_update: self.clock.now(),
                restart_count: 0,
                is_active: true,
                paused: false,
            },
        );
        debug!(
            target: "rime::heartbeat",
            "registered '{}' ({}, timeout {:?})",
            name,
            priority,
            self.timeout_for(priority)
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.records.lock().remove(name).is_some()
    }

    /// Stop checking `name` without forgetting its restart history.
    pub fn pause(&self, name: &str) -> bool {
        match self.records.lock().get_mut(name) {
            Some(record) => {
                record.paused = true;
                true
            }
            None => false,
        }
    }

    /// Check `name` again, counting its silence from now. A retired record
    /// stays retired.
    pub fn resume(&self, name: &str) -> bool {
        match self.records.lock().get_mut(name) {
            Some(record) => {
                record.paused = false;
                record.last_update = self.clock.now();
                true
            }
            None => false,
        }
    }

    /// Mark `name` alive now. Returns false for unknown names.
    pub fn touch(&self, name: &str) -> bool {
        match self.records.lock().get_mut(name) {
            Some(record) => {
                record.last_update = self.clock.now();
                true
            }
            None => false,
        }
    }

    /// Active, not paused, and heard from within its timeout.
    pub fn is_alive(&self, name: &str) -> bool {
        let now = self.clock.now();
        self.records
            .lock()
            .get(name)
            .is_some_and(|r| r.is_watched() && !self.expired(r, now))
    }

    pub fn restart_count(&self, name: &str) -> Option<u32> {
        self.records.lock().get(name).map(|r| r.restart_count)
    }

    pub fn record(&self, name: &str) -> Option<HeartbeatRecord> {
        self.records.lock().get(name).cloned()
    }

    /// Snapshot of all records, sorted by name.
    pub fn records(&self) -> Vec<(String, HeartbeatRecord)> {
        let mut all: Vec<_> = self
            .records
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn expired(&self, record: &HeartbeatRecord, now: Duration) -> bool {
        now.saturating_sub(record.last_update) > self.timeout_for(record.priority)
    }

    // ========================================================================
    // Checking
    // ========================================================================

    /// Run [`check_all`](Self::check_all) if the check interval has elapsed
    /// since the last pass.
    pub fn poll(&self) -> Option<HeartbeatCheck> {
        if self.due() {
            Some(self.check_all())
        } else {
            None
        }
    }

    /// Like [`poll`](Self::poll) with an explicit restart path.
    pub fn poll_with(&self, restart: &mut dyn FnMut(&str) -> bool) -> Option<HeartbeatCheck> {
        if self.due() {
            Some(self.check_all_with(restart))
        } else {
            None
        }
    }

    fn due(&self) -> bool {
        let now = self.clock.now();
        let mut last = self.last_check.lock();
        if now.saturating_sub(*last) >= self.config.check_interval() {
            *last = now;
            true
        } else {
            false
        }
    }

    /// Check every active record, restarting through the registered callback.
    pub fn check_all(&self) -> HeartbeatCheck {
        let callback = self.restart_callback.lock().clone();
        match callback {
            Some(cb) => self.run_check(Some(&mut |name: &str| cb(name))),
            None => self.run_check(None),
        }
    }

    /// Check every active record, restarting through `restart`.
    pub fn check_all_with(&self, restart: &mut dyn FnMut(&str) -> bool) -> HeartbeatCheck {
        self.run_check(Some(restart))
    }

    fn run_check(&self, mut restart: Option<&mut dyn FnMut(&str) -> bool>) -> HeartbeatCheck {
        let mut report = HeartbeatCheck::default();
        if !self.config.enabled {
            return report;
        }
        let max = self.config.max_restart_attempts;
        let now = self.clock.now();

        // Collect expiries under the lock; act on them without it.
        let mut expired: Vec<(String, u32, Duration)> = {
            let mut records = self.records.lock();
            let mut expired = Vec::new();
            for (name, record) in records.iter_mut() {
                if !record.is_watched() || !self.expired(record, now) {
                    continue;
                }
                record.restart_count += 1;
                let silence = now.saturating_sub(record.last_update);
                expired.push((name.clone(), record.restart_count, silence));
            }
            expired
        };
        expired.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        {
            let mut stats = self.stats.lock();
            stats.total_checks += 1;
            if let Some(longest) = expired.iter().map(|e| e.2).max() {
                stats.longest_silence = stats.longest_silence.max(longest);
            }
        }

        for (name, count, silence) in expired {
            warn!(
                target: "rime::heartbeat",
                "module '{}' unresponsive for {:?} (expiry {}/{})",
                name, silence, count, max
            );
            self.publish(&name, "unresponsive", count);
            report.unresponsive.push(name.clone());

            let restart_fn = match restart.as_deref_mut() {
                Some(f) if self.config.auto_restart && count <= max => Some(f),
                _ => None,
            };

            match restart_fn {
                Some(restart_fn) => {
                    if restart_fn(&name) {
                        if let Some(record) = self.records.lock().get_mut(&name) {
                            record.last_update = self.clock.now();
                        }
                        self.stats.lock().total_restarts += 1;
                        info!(target: "rime::heartbeat", "module '{}' restarted ({}/{})", name, count, max);
                        self.publish(&name, "restarted", count);
                        report.restarted.push(name);
                    } else {
                        self.stats.lock().failed_restarts += 1;
                        error!(target: "rime::heartbeat", "restart of '{}' failed ({}/{})", name, count, max);
                        self.publish(&name, "restart_failed", count);
                        if count >= max {
                            self.retire(&name, max);
                            report.disabled.push(name.clone());
                        }
                        report.restart_failed.push(name);
                    }
                }
                None if count > max => {
                    self.retire(&name, max);
                    report.disabled.push(name);
                }
                None => {}
            }
        }

        self.system_health
            .store(self.compute_system_health(), Ordering::Relaxed);
        report
    }

    fn retire(&self, name: &str, max: u32) {
        if let Some(record) = self.records.lock().get_mut(name) {
            record.is_active = false;
            record.restart_count = record.restart_count.min(max);
        }
        error!(target: "rime::heartbeat", "module '{}' disabled after {} attempts", name, max);
        self.publish(name, "disabled", max);
    }

    fn publish(&self, module: &str, event: &str, restart_count: u32) {
        let Some(bus) = &self.events else {
            return;
        };
        let payload = json!({
            "source": "heartbeat",
            "module": module,
            "event": event,
            "restart_count": restart_count,
            "timestamp_ms": self.clock.now().as_millis() as u64,
        });
        if let Err(e) = bus.publish_with_priority(MODULE_HEALTH_EVENT, payload, EventPriority::High) {
            debug!(target: "rime::heartbeat", "health event not queued: {}", e);
        }
    }

    fn compute_system_health(&self) -> u8 {
        let now = self.clock.now();
        let records = self.records.lock();
        let active = records.values().filter(|r| r.is_watched()).count();
        if active == 0 {
            return 100;
        }
        let alive = records
            .values()
            .filter(|r| r.is_watched() && !self.expired(r, now))
            .count();
        (alive * 100 / active) as u8
    }

    /// Share of active modules that were alive at the last check, 0..=100.
    pub fn system_health_score(&self) -> u8 {
        self.system_health.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> HeartbeatStats {
        self.stats.lock().clone()
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("records", &self.records.lock().len())
            .field("enabled", &self.config.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::communication::Event;
    use std::sync::atomic::AtomicUsize;

    fn monitor() -> (Arc<ManualClock>, HeartbeatMonitor) {
        let clock = Arc::new(ManualClock::new());
        let hb = HeartbeatMonitor::new(HeartbeatConfig::default(), clock.clone());
        (clock, hb)
    }

    #[test]
    fn test_alive_until_timeout() {
        let (clock, hb) = monitor();
        hb.register("Compressor", ModulePriority::Critical).unwrap();
        assert!(hb.is_alive("Compressor"));

        clock.advance(Duration::from_secs(5));
        assert!(hb.is_alive("Compressor"));
        clock.advance(Duration::from_millis(1));
        assert!(!hb.is_alive("Compressor"));

        assert!(hb.touch("Compressor"));
        assert!(hb.is_alive("Compressor"));
        assert!(!hb.touch("Unknown"));
        assert!(!hb.is_alive("Unknown"));
    }

    #[test]
    fn test_duplicate_registration() {
        let (_, hb) = monitor();
        hb.register("Fan", ModulePriority::Low).unwrap();
        assert!(matches!(
            hb.register("Fan", ModulePriority::Low),
            Err(RimeError::AlreadyRegistered(_))
        ));
        assert!(hb.unregister("Fan"));
        assert!(!hb.unregister("Fan"));
    }

    #[test]
    fn test_failed_restarts_retire_module() {
        let (clock, hb) = monitor();
        hb.register("Sensor", ModulePriority::Critical).unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        hb.set_restart_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        });

        for expiry in 1..=3u32 {
            clock.advance(Duration::from_secs(6));
            let report = hb.check_all();
            assert_eq!(report.unresponsive, vec!["Sensor"]);
            assert_eq!(hb.restart_count("Sensor"), Some(expiry));
        }
        let record = hb.record("Sensor").unwrap();
        assert!(!record.is_active);
        assert_eq!(record.restart_count, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // Retired modules are never checked again
        clock.advance(Duration::from_secs(60));
        assert!(hb.check_all().is_clean());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(hb.stats().failed_restarts, 3);
    }

    #[test]
    fn test_pause_keeps_history() {
        let (clock, hb) = monitor();
        hb.register("Defrost", ModulePriority::Critical).unwrap();
        clock.advance(Duration::from_secs(6));
        hb.check_all();
        assert_eq!(hb.restart_count("Defrost"), Some(1));

        assert!(hb.pause("Defrost"));
        clock.advance(Duration::from_secs(60));
        assert!(hb.check_all().is_clean());
        assert!(hb.resume("Defrost"));
        assert!(hb.is_alive("Defrost"));
        assert_eq!(hb.restart_count("Defrost"), Some(1));
        assert!(!hb.pause("Unknown"));
    }

    #[test]
    fn test_successful_restart_refreshes_liveness() {
        let (clock, hb) = monitor();
        hb.register("Display", ModulePriority::Standard).unwrap();
        hb.set_restart_callback(|_| true);

        clock.advance(Duration::from_secs(31));
        let report = hb.check_all();
        assert_eq!(report.restarted, vec!["Display"]);
        assert!(hb.is_alive("Display"));
        assert_eq!(hb.stats().total_restarts, 1);
        assert_eq!(hb.system_health_score(), 100);
    }

    #[test]
    fn test_without_callback_retired_after_max_plus_one() {
        let (clock, hb) = monitor();
        hb.register("Logger", ModulePriority::Background).unwrap();

        for _ in 0..3 {
            clock.advance(Duration::from_secs(301));
            let report = hb.check_all();
            assert!(report.disabled.is_empty());
        }
        assert!(hb.record("Logger").unwrap().is_active);
        assert_eq!(hb.system_health_score(), 0);

        clock.advance(Duration::from_secs(301));
        let report = hb.check_all();
        assert_eq!(report.disabled, vec!["Logger"]);
        assert_eq!(hb.record("Logger").unwrap().restart_count, 3);
        assert_eq!(hb.system_health_score(), 100);
    }

    #[test]
    fn test_auto_restart_disabled() {
        let clock = Arc::new(ManualClock::new());
        let config = HeartbeatConfig {
            auto_restart: false,
            ..Default::default()
        };
        let hb = HeartbeatMonitor::new(config, clock.clone());
        hb.register("Door", ModulePriority::Critical).unwrap();
        let called = Arc::new(AtomicUsize::new(0));
        let c = called.clone();
        hb.set_restart_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            true
        });

        clock.advance(Duration::from_secs(6));
        hb.check_all();
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_system_health_score() {
        let (clock, hb) = monitor();
        hb.register("Fast", ModulePriority::Critical).unwrap();
        hb.register("Slow", ModulePriority::Background).unwrap();
        clock.advance(Duration::from_secs(10));
        hb.check_all();
        assert_eq!(hb.system_health_score(), 50);
    }

    #[test]
    fn test_poll_respects_check_interval() {
        let (clock, hb) = monitor();
        assert!(hb.poll().is_none());
        clock.advance(Duration::from_secs(5));
        assert!(hb.poll().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(hb.poll().is_none());
        assert_eq!(hb.stats().total_checks, 1);
    }

    #[test]
    fn test_publishes_health_events() {
        let clock = Arc::new(ManualClock::new());
        let bus = Arc::new(EventBus::with_clock(16, clock.clone()));
        let hb = HeartbeatMonitor::new(HeartbeatConfig::default(), clock.clone())
            .with_events(bus.clone());
        hb.register("Valve", ModulePriority::Critical).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(MODULE_HEALTH_EVENT, move |e: &Event| {
            sink.lock().push(e.payload["event"].as_str().unwrap_or("").to_string())
        })
        .unwrap();

        clock.advance(Duration::from_secs(6));
        hb.check_all_with(&mut |_| true);
        bus.process(Duration::from_secs(1));
        assert_eq!(*seen.lock(), vec!["unresponsive", "restarted"]);
    }

    #[test]
    fn test_callback_may_touch_without_deadlock() {
        let clock = Arc::new(ManualClock::new());
        let hb = Arc::new(HeartbeatMonitor::new(HeartbeatConfig::default(), clock.clone()));
        hb.register("Pump", ModulePriority::Critical).unwrap();
        let inner = hb.clone();
        clock.advance(Duration::from_secs(6));
        let report = hb.check_all_with(&mut |name| inner.touch(name));
        assert_eq!(report.restarted, vec!["Pump"]);
    }
}
