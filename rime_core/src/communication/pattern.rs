//! Key pattern matching and the subscription index built on it.
//!
//! Patterns are shared by the event bus (event types) and the shared state
//! store (state keys):
//!
//! - `""` or `"*"` matches everything
//! - `"prefix*"` matches every key starting with `prefix`
//! - anything else matches exactly
//!
//! A `*` anywhere but the end is a literal character.

use super::SubscriptionId;
use std::collections::HashMap;

/// Does `pattern` match `key`?
pub fn matches(pattern: &str, key: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => pattern == key,
    }
}

/// Bucket a key falls into: its first dot-separated segment.
fn key_bucket(key: &str) -> &str {
    key.split('.').next().unwrap_or(key)
}

/// Bucket a pattern lives in, or `None` when its wildcard can reach past the
/// first segment (`""`, `"*"`, `"sens*"`).
fn pattern_bucket(pattern: &str) -> Option<&str> {
    if pattern.is_empty() {
        return None;
    }
    let first = key_bucket(pattern);
    // No dot: a trailing wildcard spans the whole first segment
    if first.len() == pattern.len() && pattern.ends_with('*') {
        return None;
    }
    Some(first)
}

struct Subscription<H> {
    id: SubscriptionId,
    pattern: String,
    handler: H,
}

/// Subscriptions indexed by the first segment of their pattern, so a
/// dispatch only scans its own bucket plus the catch-all list.
pub(crate) struct SubscriptionIndex<H> {
    buckets: HashMap<String, Vec<Subscription<H>>>,
    wildcard: Vec<Subscription<H>>,
    len: usize,
}

impl<H> Default for SubscriptionIndex<H> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            wildcard: Vec::new(),
            len: 0,
        }
    }
}

impl<H: Clone> SubscriptionIndex<H> {
    pub(crate) fn insert(&mut self, id: SubscriptionId, pattern: &str, handler: H) {
        let sub = Subscription {
            id,
            pattern: pattern.to_string(),
            handler,
        };
        match pattern_bucket(pattern) {
            Some(bucket) => self.buckets.entry(bucket.to_string()).or_default().push(sub),
            None => self.wildcard.push(sub),
        }
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        if let Some(pos) = self.wildcard.iter().position(|s| s.id == id) {
            self.wildcard.remove(pos);
            self.len -= 1;
            return true;
        }
        let mut emptied = None;
        let mut found = false;
        for (bucket, subs) in self.buckets.iter_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                found = true;
                if subs.is_empty() {
                    emptied = Some(bucket.clone());
                }
                break;
            }
        }
        if let Some(bucket) = emptied {
            self.buckets.remove(&bucket);
        }
        if found {
            self.len -= 1;
        }
        found
    }

    /// Handlers whose pattern matches `key`, in subscription order.
    pub(crate) fn matching(&self, key: &str) -> Vec<H> {
        let bucket = self
            .buckets
            .get(key_bucket(key))
            .map(|v| v.as_slice())
            .unwrap_or(&[]);
        let mut hits: Vec<&Subscription<H>> = bucket
            .iter()
            .chain(self.wildcard.iter())
            .filter(|s| matches(&s.pattern, key))
            .collect();
        hits.sort_by_key(|s| s.id);
        hits.into_iter().map(|s| s.handler.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
        self.wildcard.clear();
        self.len = 0;
    }
}
