//! Core types for the Tandem transaction coordinator
//!
//! This crate defines the foundational vocabulary shared by every layer:
//! - TxId: unique identifier for a logical transaction
//! - TxState: lifecycle state machine with enforced transitions
//! - TransactionRecord / OperationRecord: the persisted data model
//! - EntitySnapshot helpers: structural deep copies of row pre-images
//! - DataSource / StoreSession: the seam to the underlying stores
//! - TandemError: unified error type with classification predicates
//!
//! Nothing in this crate talks to a store or spawns a thread; it is pure
//! data model plus the trait seams the other crates implement.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod datasource;
pub mod error;
pub mod record;
pub mod risk;
pub mod snapshot;
pub mod state;
pub mod types;

pub use datasource::{
    DataSource, DataSourceError, DataSourceRegistry, StoreErrorKind, StoreSession, TableSchema,
};
pub use error::{TandemError, TandemResult};
pub use record::{OperationRecord, OperationType, TransactionRecord};
pub use risk::{RiskFlag, Severity};
pub use snapshot::{clear_version_field, entity_id_of, snapshot_of, EntitySnapshot};
pub use state::TxState;
pub use types::TxId;
