//! Reserved key namespaces
//!
//! All persisted keys are prefix-separated so log records, the failed
//! queue, and unrelated data can never collide. Nothing outside this module
//! builds a key by hand.

use tandem_core::TxId;

/// Prefix for active and terminal non-failed transaction records.
pub const TXLOG_PREFIX: &str = "txlog:";

/// Prefix for records parked for operator attention. Never expires.
pub const TXLOG_FAILED_PREFIX: &str = "txlog:failed:";

/// Prefix for idempotency state markers.
pub const IDEMPOTENCY_PREFIX: &str = "idemp:";

/// Prefix for distributed lock entries.
pub const LOCK_PREFIX: &str = "lock:";

/// Prefix for application cache entries.
pub const CACHE_PREFIX: &str = "cache:";

/// Coordination lock for the recovery sweep. One per cluster.
pub const RECOVERY_SCAN_LOCK: &str = "recovery:scan-lock";

/// Key of the primary record for a transaction.
pub fn txlog(tx_id: &TxId) -> String {
    format!("{}{}", TXLOG_PREFIX, tx_id)
}

/// Key of the failed-queue duplicate for a transaction.
pub fn txlog_failed(tx_id: &TxId) -> String {
    format!("{}{}", TXLOG_FAILED_PREFIX, tx_id)
}

/// Key of an idempotency marker.
pub fn idempotency(key: &str) -> String {
    format!("{}{}", IDEMPOTENCY_PREFIX, key)
}

/// Key of a named distributed lock.
pub fn lock(name: &str) -> String {
    format!("{}{}", LOCK_PREFIX, name)
}

/// Key of an application cache entry.
pub fn cache(key: &str) -> String {
    format!("{}{}", CACHE_PREFIX, key)
}

/// Whether a `txlog:`-prefixed key belongs to the failed queue.
pub fn is_failed_key(key: &str) -> bool {
    key.starts_with(TXLOG_FAILED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        let tx = TxId::new();
        assert_eq!(txlog(&tx), format!("txlog:{}", tx));
        assert_eq!(txlog_failed(&tx), format!("txlog:failed:{}", tx));
        assert_eq!(idempotency("req-1"), "idemp:req-1");
        assert_eq!(lock("acct:9"), "lock:acct:9");
        assert_eq!(cache("profile"), "cache:profile");
    }

    #[test]
    fn test_failed_keys_nest_under_txlog_prefix() {
        let tx = TxId::new();
        let failed = txlog_failed(&tx);
        // Failed keys share the txlog: prefix; listings must filter them
        assert!(failed.starts_with(TXLOG_PREFIX));
        assert!(is_failed_key(&failed));
        assert!(!is_failed_key(&txlog(&tx)));
    }
}
