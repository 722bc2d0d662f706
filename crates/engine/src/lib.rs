//! Transaction engine for Tandem
//!
//! This crate orchestrates all lower layers:
//! - Coordinator: per-invocation lifecycle over every registered store
//! - Thread-bound context: nested-call joining and leak-proof cleanup
//! - Recovery worker: background sweep for stalled transactions
//! - Configuration: one TOML document covering every tunable
//! - Tandem facade: wiring, execute, and the admin surface
//!
//! The engine is the only crate that knows about cross-layer order: when
//! capture arms, when the log is written, when validation gates the
//! commit, and when compensation may and may not run.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod context;
pub mod coordinator;
pub mod handle;
pub mod options;
pub mod recovery;
pub mod tandem;

pub use config::TandemConfig;
pub use context::{current as current_context, BoundContext};
pub use coordinator::{Coordinator, CoordinatorMetrics};
pub use handle::TransactionHandle;
pub use options::ExecuteOptions;
pub use recovery::{CycleStats, RecoveryConfig, RecoveryMetrics, RecoveryWorker};
pub use tandem::{Tandem, TandemBuilder};

// Re-export the collaborating layers' public types for single-import use
pub use tandem_capture::{CaptureEngine, QueryInfo};
pub use tandem_compensation::{
    BreakerConfig, BreakerState, CircuitBreaker, CompensationConfig, Compensator, RollbackResult,
};
pub use tandem_core::{
    DataSource, DataSourceError, DataSourceRegistry, EntitySnapshot, OperationRecord,
    OperationType, RiskFlag, Severity, StoreErrorKind, StoreSession, TableSchema, TandemError,
    TandemResult, TransactionRecord, TxId, TxState,
};
pub use tandem_store::{
    CacheFacade, IdempotencyConfig, IdempotencyGuard, KeyValueStore, LockConfig, LockManager,
    LogStoreConfig, MemoryDataSource, MemoryStore, TransactionLog,
};
pub use tandem_validation::{
    IssueSeverity, PreCommitValidator, ValidationConfig, ValidationIssue, ValidationReport,
};
