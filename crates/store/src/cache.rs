//! Application cache facade
//!
//! A TTL cache under `cache:<key>` for the host application. The
//! transaction pipeline never consults it; it simply shares the store and
//! the degradation policy with the other facades. All operations are
//! best-effort: an unhealthy or failing store turns reads into misses and
//! writes into no-ops.

use crate::keys;
use crate::kv::KeyValueStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// TTL cache for host-application values.
pub struct CacheFacade {
    store: Arc<dyn KeyValueStore>,
}

impl CacheFacade {
    /// Build a cache over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        CacheFacade { store }
    }

    /// Read a cached value. Any failure is a miss.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.store.get(&keys::cache(key)) {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "tandem::cache", key, error = %e, "cache read failed");
                None
            }
        }
    }

    /// Write a value with a TTL. Failures log and are otherwise ignored.
    pub fn put(&self, key: &str, value: String, ttl: Duration) {
        if let Err(e) = self.store.put(&keys::cache(key), value, Some(ttl)) {
            warn!(target: "tandem::cache", key, error = %e, "cache write failed");
        }
    }

    /// Drop a cached value.
    pub fn invalidate(&self, key: &str) {
        if let Err(e) = self.store.delete(&keys::cache(key)) {
            warn!(target: "tandem::cache", key, error = %e, "cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    #[test]
    fn test_put_get_invalidate() {
        let cache = CacheFacade::new(Arc::new(MemoryStore::new()));
        cache.put("profile:1", "alice".into(), Duration::from_secs(60));
        assert_eq!(cache.get("profile:1").as_deref(), Some("alice"));
        cache.invalidate("profile:1");
        assert!(cache.get("profile:1").is_none());
    }

    #[test]
    fn test_expiry() {
        let cache = CacheFacade::new(Arc::new(MemoryStore::new()));
        cache.put("temp", "v".into(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("temp").is_none());
    }
}
