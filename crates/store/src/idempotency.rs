//! Idempotency markers
//!
//! Maps an opaque request key to a `{processing, completed}` marker under
//! `idemp:<key>` with a TTL. A second request with the same key while a
//! marker exists is rejected as a duplicate. Markers are released on
//! business failure so the caller may retry, and flipped to `completed`
//! on success so replays keep being rejected until the TTL lapses.
//!
//! When the backing store is unhealthy the duplicate check is skipped
//! rather than failing the business call.

use crate::keys;
use crate::kv::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{TandemError, TandemResult};
use tracing::{debug, warn};

const MARKER_PROCESSING: &str = "processing";
const MARKER_COMPLETED: &str = "completed";

/// Idempotency settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Marker retention in seconds.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_ttl_seconds() -> u64 {
    86_400
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        IdempotencyConfig {
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

/// Duplicate-request protection keyed by caller-supplied idempotency keys.
pub struct IdempotencyGuard {
    store: Arc<dyn KeyValueStore>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    /// Build a guard over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>, config: IdempotencyConfig) -> Self {
        IdempotencyGuard { store, config }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_seconds)
    }

    /// Claim a key before any work happens.
    ///
    /// Returns `DuplicateRequest` if the key is already claimed. Skips the
    /// check (and logs) when the store is unhealthy.
    pub fn begin(&self, key: &str) -> TandemResult<()> {
        if !self.store.is_healthy() {
            warn!(target: "tandem::idempotency", key, "store unhealthy; duplicate check skipped");
            return Ok(());
        }
        let claimed = self.store.put_if_absent(
            &keys::idempotency(key),
            MARKER_PROCESSING.to_string(),
            Some(self.ttl()),
        )?;
        if claimed {
            debug!(target: "tandem::idempotency", key, "idempotency key claimed");
            Ok(())
        } else {
            Err(TandemError::DuplicateRequest {
                key: key.to_string(),
            })
        }
    }

    /// Mark a key completed after the transaction committed.
    ///
    /// Best-effort: a marker stuck at `processing` still rejects
    /// duplicates until the TTL lapses, so failures only log.
    pub fn complete(&self, key: &str) {
        if let Err(e) = self.store.put(
            &keys::idempotency(key),
            MARKER_COMPLETED.to_string(),
            Some(self.ttl()),
        ) {
            warn!(target: "tandem::idempotency", key, error = %e, "failed to mark completed");
        }
    }

    /// Release a key after a business failure so a retry is permitted.
    pub fn release(&self, key: &str) {
        if let Err(e) = self.store.delete(&keys::idempotency(key)) {
            warn!(target: "tandem::idempotency", key, error = %e, "failed to release key");
        }
    }

    /// The stored marker for a key, if any.
    pub fn marker(&self, key: &str) -> TandemResult<Option<String>> {
        self.store.get(&keys::idempotency(key))
    }
}
