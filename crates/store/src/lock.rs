//! Distributed lock facade
//!
//! Locks are store entries under `lock:<name>` holding a fencing token,
//! with the lease enforced by the entry's TTL. Acquisition polls
//! `put_if_absent` within a bounded wait; release deletes the entry only
//! if the token still matches, so a handle whose lease already expired
//! cannot free a lock someone else now holds.
//!
//! The handle releases on drop, which is what guarantees release on every
//! exit path of the coordinator.

use crate::keys;
use crate::kv::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::TandemResult;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default lock timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long `try_lock` waits for a contended lock.
    #[serde(default = "default_wait_time_ms")]
    pub wait_time_ms: u64,
    /// How long an acquired lease lasts before the store reclaims it.
    #[serde(default = "default_lease_time_ms")]
    pub lease_time_ms: u64,
}

fn default_wait_time_ms() -> u64 {
    500
}

fn default_lease_time_ms() -> u64 {
    30_000
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            wait_time_ms: default_wait_time_ms(),
            lease_time_ms: default_lease_time_ms(),
        }
    }
}

/// An acquired lock. Scoped: dropping the handle releases the lease.
pub struct LockHandle {
    store: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockHandle {
    /// Full store key of the held lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock now instead of at drop.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.store.compare_and_delete(&self.key, &self.token) {
            Ok(true) => debug!(target: "tandem::lock", key = %self.key, "lock released"),
            Ok(false) => warn!(
                target: "tandem::lock",
                key = %self.key,
                "lock was not ours at release; lease likely expired"
            ),
            Err(e) => warn!(target: "tandem::lock", key = %self.key, error = %e, "lock release failed"),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.do_release();
    }
}

/// Acquires and releases named distributed locks.
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
}

impl LockManager {
    /// Build a manager over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        LockManager { store, config }
    }

    /// Whether the backing store is reachable. Callers degrade gracefully
    /// when it is not.
    pub fn is_healthy(&self) -> bool {
        self.store.is_healthy()
    }

    /// Configured default wait.
    pub fn default_wait(&self) -> Duration {
        Duration::from_millis(self.config.wait_time_ms)
    }

    /// Configured default lease.
    pub fn default_lease(&self) -> Duration {
        Duration::from_millis(self.config.lease_time_ms)
    }

    /// Acquire the named lock, waiting up to `wait`. `Ok(None)` means the
    /// lock stayed contended for the whole wait.
    pub fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease: Duration,
    ) -> TandemResult<Option<LockHandle>> {
        self.try_lock_at(keys::lock(name), wait, lease)
    }

    /// Acquire a lock at an exact store key. Used for reserved coordination
    /// keys that live outside the `lock:` namespace.
    pub fn try_lock_at(
        &self,
        key: String,
        wait: Duration,
        lease: Duration,
    ) -> TandemResult<Option<LockHandle>> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;
        loop {
            if self
                .store
                .put_if_absent(&key, token.clone(), Some(lease))?
            {
                debug!(target: "tandem::lock", key = %key, "lock acquired");
                return Ok(Some(LockHandle {
                    store: Arc::clone(&self.store),
                    key,
                    token,
                    released: false,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline - now;
            std::thread::sleep(remaining.min(Duration::from_millis(10)));
        }
    }
}
