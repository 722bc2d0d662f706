//! Risk flags raised against captured operations
//!
//! A risk flag marks an operation whose inverse may be unreliable. The
//! vocabulary is closed and each flag carries a static severity; the
//! pre-commit validator turns severities into blocking errors or warnings
//! and the transaction record keeps a per-flag count in `risk_metrics`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity attached to a risk flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational only.
    Low,
    /// Worth surfacing; compensation is still dependable.
    Medium,
    /// Compensation depends on caller-supplied inverse data.
    High,
    /// Side effects outside the capture engine's view are likely.
    Critical,
}

impl Severity {
    /// Numeric score used when aggregating risk across an operation set.
    pub fn score(&self) -> u32 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 5,
            Severity::High => 10,
            Severity::Critical => 20,
        }
    }
}

/// Closed vocabulary of observable compensation risks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskFlag {
    /// A native statement was captured; its effects are opaque.
    NativeSql,
    /// Set-based update without row-level capture by the store itself.
    BulkUpdate,
    /// Set-based delete; re-insertion depends on complete pre-images.
    BulkDelete,
    /// A stored procedure was invoked.
    StoredProcedure,
    /// The target table carries enabled triggers.
    TriggerSuspected,
    /// Related children are configured for cascading delete.
    CascadeDelete,
    /// Captured row count exceeds the configured threshold.
    LargeBatch,
    /// Transaction age exceeds the configured threshold.
    LongRunning,
    /// A pre-image deep copy failed; the operation cannot be compensated.
    SnapshotMissing,
}

impl RiskFlag {
    /// Static severity of this flag.
    pub fn severity(&self) -> Severity {
        match self {
            RiskFlag::NativeSql => Severity::High,
            RiskFlag::BulkUpdate => Severity::Medium,
            RiskFlag::BulkDelete => Severity::High,
            RiskFlag::StoredProcedure => Severity::High,
            RiskFlag::TriggerSuspected => Severity::Critical,
            RiskFlag::CascadeDelete => Severity::High,
            RiskFlag::LargeBatch => Severity::Medium,
            RiskFlag::LongRunning => Severity::Medium,
            RiskFlag::SnapshotMissing => Severity::High,
        }
    }
}

impl fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RiskFlag::NativeSql => "NATIVE_SQL",
            RiskFlag::BulkUpdate => "BULK_UPDATE",
            RiskFlag::BulkDelete => "BULK_DELETE",
            RiskFlag::StoredProcedure => "STORED_PROCEDURE",
            RiskFlag::TriggerSuspected => "TRIGGER_SUSPECTED",
            RiskFlag::CascadeDelete => "CASCADE_DELETE",
            RiskFlag::LargeBatch => "LARGE_BATCH",
            RiskFlag::LongRunning => "LONG_RUNNING",
            RiskFlag::SnapshotMissing => "SNAPSHOT_MISSING",
        };
        write!(f, "{}", name)
    }
}
