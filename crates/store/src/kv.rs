//! Key-value store trait and the in-process implementation
//!
//! The coordinator assumes a key-value store with configurable persistence,
//! TTL expiry, and an atomic set-if-absent. `MemoryStore` satisfies the
//! contract in-process: a DashMap for the entries plus a BTreeMap expiry
//! index so expired keys are found in O(expired) rather than by scanning
//! everything.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tandem_core::TandemResult;

/// Contract every backing store must satisfy.
///
/// All operations are keyed by flat string keys (see the `keys` module for
/// the reserved prefixes). TTL-carrying writes expire server-side; a read
/// of an expired key behaves as a miss.
pub trait KeyValueStore: Send + Sync {
    /// Write a value, replacing any previous one. `ttl` of `None` means the
    /// key does not expire.
    fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> TandemResult<()>;

    /// Read a value. Expired keys read as `None`.
    fn get(&self, key: &str) -> TandemResult<Option<String>>;

    /// Remove a key. Returns whether a live value was removed.
    fn delete(&self, key: &str) -> TandemResult<bool>;

    /// Atomically write only if the key is absent (or expired). Returns
    /// whether the write happened.
    fn put_if_absent(&self, key: &str, value: String, ttl: Option<Duration>)
        -> TandemResult<bool>;

    /// Atomically delete only if the current value equals `expected`.
    /// Returns whether the delete happened. Used for fenced lock release.
    fn compare_and_delete(&self, key: &str, expected: &str) -> TandemResult<bool>;

    /// All live keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> TandemResult<Vec<String>>;

    /// Attach or replace a TTL on an existing key. Returns whether the key
    /// existed.
    fn expire(&self, key: &str, ttl: Duration) -> TandemResult<bool>;

    /// Remove any TTL from an existing key. Returns whether the key existed.
    fn persist(&self, key: &str) -> TandemResult<bool>;

    /// Whether the store is currently reachable. Facades consult this to
    /// degrade gracefully instead of failing the business call.
    fn is_healthy(&self) -> bool;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Expiry index: expiry instant to the keys expiring then.
///
/// BTreeMap keeps instants sorted so a range query finds everything due
/// without touching live entries.
#[derive(Debug, Default)]
struct TtlIndex {
    index: BTreeMap<Instant, HashSet<String>>,
}

impl TtlIndex {
    fn insert(&mut self, at: Instant, key: &str) {
        self.index.entry(at).or_default().insert(key.to_string());
    }

    fn remove(&mut self, at: Instant, key: &str) {
        if let Some(keys) = self.index.get_mut(&at) {
            keys.remove(key);
            if keys.is_empty() {
                self.index.remove(&at);
            }
        }
    }

    fn drain_due(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<Instant> = self.index.range(..=now).map(|(at, _)| *at).collect();
        let mut keys = Vec::new();
        for at in due {
            if let Some(set) = self.index.remove(&at) {
                keys.extend(set);
            }
        }
        keys
    }
}

/// In-process key-value store with TTL expiry.
///
/// Reads are lock-free through the DashMap; the expiry index sits behind a
/// Mutex touched only on TTL-carrying writes and sweeps. Expired entries
/// are dropped lazily on read and eagerly by `sweep_expired`.
#[derive(Default)]
pub struct MemoryStore {
    entries: dashmap::DashMap<String, Entry>,
    ttl_index: Mutex<TtlIndex>,
}

impl MemoryStore {
    /// Fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry whose TTL has passed. Returns how many were
    /// removed. Safe to call from a background task at any cadence.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let due = self.ttl_index.lock().drain_due(now);
        let mut removed = 0;
        for key in due {
            // Re-check: the key may have been rewritten with a later TTL
            let expired = self
                .entries
                .get(&key)
                .map(|e| e.is_expired(now))
                .unwrap_or(false);
            if expired && self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Whether no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_put(&self, key: &str, old: Option<Instant>, new: Option<Instant>) {
        if old.is_none() && new.is_none() {
            return;
        }
        let mut index = self.ttl_index.lock();
        if let Some(at) = old {
            index.remove(at, key);
        }
        if let Some(at) = new {
            index.insert(at, key);
        }
    }

    fn drop_if_expired(&self, key: &str) {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .map(|e| e.is_expired(now))
            .unwrap_or(false);
        if expired {
            self.entries.remove(key);
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> TandemResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        let old = self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
            },
        );
        self.index_put(key, old.and_then(|e| e.expires_at), expires_at);
        Ok(())
    }

    fn get(&self, key: &str) -> TandemResult<Option<String>> {
        self.drop_if_expired(key);
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    fn delete(&self, key: &str) -> TandemResult<bool> {
        self.drop_if_expired(key);
        Ok(self.entries.remove(key).is_some())
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> TandemResult<bool> {
        let now = Instant::now();
        let expires_at = ttl.map(|d| now + d);
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    let old = occupied.get().expires_at;
                    occupied.insert(Entry { value, expires_at });
                    self.index_put(key, old, expires_at);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry { value, expires_at });
                self.index_put(key, None, expires_at);
                Ok(true)
            }
        }
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> TandemResult<bool> {
        self.drop_if_expired(key);
        Ok(self
            .entries
            .remove_if(key, |_, entry| entry.value == expected)
            .is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> TandemResult<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn expire(&self, key: &str, ttl: Duration) -> TandemResult<bool> {
        self.drop_if_expired(key);
        let new_at = Instant::now() + ttl;
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                let old = entry.expires_at;
                entry.expires_at = Some(new_at);
                drop(entry);
                self.index_put(key, old, Some(new_at));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn persist(&self, key: &str) -> TandemResult<bool> {
        self.drop_if_expired(key);
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                let old = entry.expires_at;
                entry.expires_at = None;
                drop(entry);
                self.index_put(key, old, None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
