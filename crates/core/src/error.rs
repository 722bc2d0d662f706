//! Error types for the Tandem coordinator
//!
//! `TandemError` is the unified error type returned by every public API.
//! `thiserror` supplies `Display` and `Error`; constructor helpers and
//! classification predicates keep call sites terse.
//!
//! Two variants deserve care at call sites:
//!
//! - `TransactionFailed` is the composite the business caller sees: it
//!   carries the original cause, the transaction id, and whether rollback
//!   succeeded.
//! - `PostCommit` marks an error observed after the committed flag was set.
//!   It must never be treated as a rollback signal; the stores are
//!   authoritative at that point.

use crate::datasource::DataSourceError;
use crate::types::TxId;
use thiserror::Error;

/// Result alias used across the workspace.
pub type TandemResult<T> = std::result::Result<T, TandemError>;

/// Unified error type for all Tandem operations.
#[derive(Debug, Error)]
pub enum TandemError {
    /// Raised by business code inside the wrapped callable.
    #[error("business error: {message}")]
    Business {
        /// What the business callable reported.
        message: String,
    },

    /// Composite failure handed to the caller after the rollback path ran.
    #[error("transaction {tx_id} failed (rollback succeeded: {rollback_succeeded}): {source}")]
    TransactionFailed {
        /// Transaction whose record holds the full story.
        tx_id: TxId,
        /// Whether compensation fully restored the pre-transaction state.
        rollback_succeeded: bool,
        /// The original cause.
        #[source]
        source: Box<TandemError>,
    },

    /// The request-level lock could not be acquired within its wait budget.
    #[error("lock '{key}' unavailable after {waited_ms}ms")]
    LockUnavailable {
        /// Lock key that was contended.
        key: String,
        /// How long acquisition waited.
        waited_ms: u64,
    },

    /// The idempotency key is already being (or has been) processed.
    #[error("duplicate request for idempotency key '{key}'")]
    DuplicateRequest {
        /// The colliding idempotency key.
        key: String,
    },

    /// Pre-commit validation raised at least one blocking issue.
    #[error("transaction {tx_id} blocked by validation: {}", .issues.join("; "))]
    Validation {
        /// Transaction that was blocked.
        tx_id: TxId,
        /// Blocking issue descriptions.
        issues: Vec<String>,
    },

    /// A per-store commit threw before any store had committed.
    #[error("commit failed on datasource '{datasource}': {message}")]
    Commit {
        /// Store whose commit failed.
        datasource: String,
        /// Driver detail.
        message: String,
    },

    /// A per-store commit threw after an earlier store had committed.
    ///
    /// Consistency cannot be restored automatically; the record is parked
    /// as FAILED for operator attention.
    #[error(
        "partial commit in transaction {tx_id}: datasource '{datasource}' failed after {committed} store(s) committed: {message}"
    )]
    PartialCommit {
        /// Transaction left inconsistent.
        tx_id: TxId,
        /// Store whose commit failed.
        datasource: String,
        /// How many stores had already committed.
        committed: usize,
        /// Driver detail.
        message: String,
    },

    /// Compensation hit a fatal condition and stopped its sweep.
    #[error("compensation for transaction {tx_id} failed fatally at operation {sequence}: {message}")]
    CompensationFatal {
        /// Transaction being compensated.
        tx_id: TxId,
        /// Sequence number of the operation that could not be inverted.
        sequence: u32,
        /// Why inversion is impossible.
        message: String,
    },

    /// Compensation exhausted its attempts with operations still pending.
    #[error("compensation for transaction {tx_id} incomplete: {remaining} operation(s) uncompensated")]
    CompensationPartial {
        /// Transaction still rolling back.
        tx_id: TxId,
        /// Operations not yet compensated.
        remaining: usize,
    },

    /// An error observed after the committed flag was set.
    ///
    /// The data stores are authoritative; no compensation runs.
    #[error("post-commit error in transaction {tx_id} (data is authoritative): {source}")]
    PostCommit {
        /// Committed transaction the error surfaced in.
        tx_id: TxId,
        /// The underlying error.
        #[source]
        source: Box<TandemError>,
    },

    /// The transaction exceeded its configured time budget.
    #[error("transaction {tx_id} timed out after {elapsed_ms}ms (budget {budget_ms}ms)")]
    Timeout {
        /// Transaction that overran.
        tx_id: TxId,
        /// Observed elapsed time.
        elapsed_ms: u64,
        /// Configured budget.
        budget_ms: u64,
    },

    /// Key-value store failure (transaction log, locks, idempotency, cache).
    #[error("storage error: {message}")]
    Storage {
        /// What the store reported.
        message: String,
    },

    /// Datasource-level failure.
    #[error(transparent)]
    Datasource(#[from] DataSourceError),

    /// Serialization or deserialization failure.
    #[error("serialization error: {message}")]
    Serialization {
        /// What went wrong.
        message: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// Unexpected internal state; indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the inconsistency.
        message: String,
    },
}

impl TandemError {
    /// Create a `Business` error.
    pub fn business(message: impl Into<String>) -> Self {
        TandemError::Business {
            message: message.into(),
        }
    }

    /// Wrap a cause into the composite `TransactionFailed`.
    pub fn transaction_failed(tx_id: TxId, rollback_succeeded: bool, source: TandemError) -> Self {
        TandemError::TransactionFailed {
            tx_id,
            rollback_succeeded,
            source: Box::new(source),
        }
    }

    /// Wrap a cause into `PostCommit`.
    pub fn post_commit(tx_id: TxId, source: TandemError) -> Self {
        TandemError::PostCommit {
            tx_id,
            source: Box::new(source),
        }
    }

    /// Create a `Storage` error.
    pub fn storage(message: impl Into<String>) -> Self {
        TandemError::Storage {
            message: message.into(),
        }
    }

    /// Create a `Serialization` error.
    pub fn serialization(message: impl Into<String>) -> Self {
        TandemError::Serialization {
            message: message.into(),
        }
    }

    /// Create a `Config` error.
    pub fn config(message: impl Into<String>) -> Self {
        TandemError::Config {
            message: message.into(),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        TandemError::Internal {
            message: message.into(),
        }
    }

    /// Whether this is a duplicate-request rejection.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, TandemError::DuplicateRequest { .. })
    }

    /// Whether this error surfaced after the commit point.
    ///
    /// Post-commit errors must never trigger compensation.
    pub fn is_post_commit(&self) -> bool {
        matches!(self, TandemError::PostCommit { .. })
    }

    /// Whether this is a validation block.
    pub fn is_validation(&self) -> bool {
        matches!(self, TandemError::Validation { .. })
    }

    /// Whether retrying the whole business call may succeed.
    ///
    /// Lock contention and transient store failures qualify; validation
    /// blocks, duplicates, and partial commits do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            TandemError::LockUnavailable { .. } | TandemError::Timeout { .. } => true,
            TandemError::Datasource(e) => e.is_transient(),
            TandemError::TransactionFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The transaction id this failure is about, when one exists.
    ///
    /// Failures raised before a record is created (lock contention,
    /// duplicates, configuration) carry none.
    pub fn tx_id(&self) -> Option<TxId> {
        match self {
            TandemError::TransactionFailed { tx_id, .. }
            | TandemError::Validation { tx_id, .. }
            | TandemError::PartialCommit { tx_id, .. }
            | TandemError::CompensationFatal { tx_id, .. }
            | TandemError::CompensationPartial { tx_id, .. }
            | TandemError::PostCommit { tx_id, .. }
            | TandemError::Timeout { tx_id, .. } => Some(*tx_id),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(e: serde_json::Error) -> Self {
        TandemError::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::StoreErrorKind;

    #[test]
    fn test_business_constructor() {
        let e = TandemError::business("insufficient funds");
        assert!(e.to_string().contains("insufficient funds"));
        assert!(!e.is_retryable());
        assert!(e.tx_id().is_none());
    }

    #[test]
    fn test_transaction_failed_carries_cause_and_flag() {
        let tx = TxId::new();
        let e = TandemError::transaction_failed(tx, true, TandemError::business("boom"));
        let msg = e.to_string();
        assert!(msg.contains(&tx.to_string()));
        assert!(msg.contains("rollback succeeded: true"));
        assert!(msg.contains("boom"));
        assert_eq!(e.tx_id(), Some(tx));
    }

    #[test]
    fn test_post_commit_classification() {
        let tx = TxId::new();
        let e = TandemError::post_commit(tx, TandemError::storage("log write refused"));
        assert!(e.is_post_commit());
        assert!(e.to_string().contains("data is authoritative"));
        assert_eq!(e.tx_id(), Some(tx));
    }

    #[test]
    fn test_duplicate_request() {
        let e = TandemError::DuplicateRequest {
            key: "req-9".into(),
        };
        assert!(e.is_duplicate());
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_lock_unavailable_retryable() {
        let e = TandemError::LockUnavailable {
            key: "acct:1".into(),
            waited_ms: 500,
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn test_retryable_follows_composite_cause() {
        let tx = TxId::new();
        let transient = TandemError::Datasource(DataSourceError::new(
            "db",
            StoreErrorKind::Unavailable,
            "connection reset",
        ));
        let e = TandemError::transaction_failed(tx, true, transient);
        assert!(e.is_retryable());

        let hard = TandemError::transaction_failed(tx, true, TandemError::business("no"));
        assert!(!hard.is_retryable());
    }

    #[test]
    fn test_validation_display() {
        let tx = TxId::new();
        let e = TandemError::Validation {
            tx_id: tx,
            issues: vec!["triggers on orders".into(), "bulk delete".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("triggers on orders; bulk delete"));
        assert!(e.is_validation());
    }

    #[test]
    fn test_partial_commit_display() {
        let e = TandemError::PartialCommit {
            tx_id: TxId::new(),
            datasource: "ledger_db".into(),
            committed: 1,
            message: "io timeout".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("ledger_db"));
        assert!(msg.contains("1 store(s) committed"));
    }

    #[test]
    fn test_from_serde_json() {
        let bad: Result<crate::record::TransactionRecord, _> = serde_json::from_str("{not json");
        let e: TandemError = bad.unwrap_err().into();
        assert!(matches!(e, TandemError::Serialization { .. }));
    }
}
