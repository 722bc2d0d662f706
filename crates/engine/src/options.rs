//! Per-invocation execution options

use std::time::Duration;

/// Options for one `execute` call.
///
/// Only `business_key` is required. The lock key requests request-level
/// mutual exclusion, the idempotency key enables duplicate rejection, and
/// the timeout bounds lock acquisition and the overall time budget.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Human-readable label stored on the transaction record.
    pub business_key: String,
    /// Optional request-level lock to hold for the duration.
    pub lock_key: Option<String>,
    /// Optional idempotency key for duplicate rejection.
    pub idempotency_key: Option<String>,
    /// Optional time budget for the invocation.
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    /// Options with just a business key.
    pub fn new(business_key: impl Into<String>) -> Self {
        ExecuteOptions {
            business_key: business_key.into(),
            ..Default::default()
        }
    }

    /// Request a lock for the duration of the invocation.
    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = Some(key.into());
        self
    }

    /// Enable duplicate rejection under this key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Bound the invocation's time budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let options = ExecuteOptions::new("transfer")
            .with_lock_key("acct:1")
            .with_idempotency_key("req-1")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(options.business_key, "transfer");
        assert_eq!(options.lock_key.as_deref(), Some("acct:1"));
        assert_eq!(options.idempotency_key.as_deref(), Some("req-1"));
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
    }
}
