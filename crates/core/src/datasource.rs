//! Datastore seam
//!
//! The coordinator, capture engine, and compensator never talk to a concrete
//! database. They go through two traits: `DataSource` for direct, immediately
//! visible row operations (what the compensator and set-based statements
//! use), and `StoreSession` for a buffered local transaction (what business
//! code writes through). `tandem-store` ships an in-memory implementation;
//! production deployments implement these against their own drivers.

use crate::snapshot::EntitySnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Schema metadata for one entity class (table).
///
/// The validator uses `has_triggers` and `cascade_delete_children` for its
/// risk probes; the compensator uses `id_field` and `version_field` when
/// merging snapshots back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Name of the primary-key field. Defaults to `"id"`.
    pub id_field: String,
    /// Optimistic-concurrency version field, if the table carries one.
    pub version_field: Option<String>,
    /// Whether enabled triggers exist on the table.
    pub has_triggers: bool,
    /// Child entity classes configured for cascading delete.
    pub cascade_delete_children: Vec<String>,
}

impl Default for TableSchema {
    fn default() -> Self {
        TableSchema {
            id_field: "id".to_string(),
            version_field: None,
            has_triggers: false,
            cascade_delete_children: Vec::new(),
        }
    }
}

impl TableSchema {
    /// Schema with defaults and the given primary-key field.
    pub fn with_id_field(field: impl Into<String>) -> Self {
        TableSchema {
            id_field: field.into(),
            ..Default::default()
        }
    }

    /// Set the optimistic version field.
    pub fn versioned(mut self, field: impl Into<String>) -> Self {
        self.version_field = Some(field.into());
        self
    }

    /// Mark the table as carrying enabled triggers.
    pub fn with_triggers(mut self) -> Self {
        self.has_triggers = true;
        self
    }

    /// Add a child entity class with cascading delete.
    pub fn cascades_to(mut self, child: impl Into<String>) -> Self {
        self.cascade_delete_children.push(child.into());
        self
    }
}

/// What went wrong inside a datasource operation.
///
/// The compensator classifies outcomes by this kind, so implementations
/// must map their driver errors onto it faithfully. `Unavailable` is the
/// transient bucket; everything the driver cannot attribute goes to
/// `Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The addressed row does not exist.
    NotFound,
    /// A row with the same primary key already exists.
    AlreadyExists,
    /// Optimistic version comparison failed.
    VersionConflict,
    /// A foreign-key or other referential constraint was violated.
    ReferentialIntegrity,
    /// The entity class is not known to this datasource.
    UnknownEntity,
    /// The statement was refused before execution.
    RejectedStatement,
    /// Transient failure; the operation may succeed if retried.
    Unavailable,
    /// Unattributed driver failure.
    Internal,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreErrorKind::NotFound => "not found",
            StoreErrorKind::AlreadyExists => "already exists",
            StoreErrorKind::VersionConflict => "version conflict",
            StoreErrorKind::ReferentialIntegrity => "referential integrity violation",
            StoreErrorKind::UnknownEntity => "unknown entity class",
            StoreErrorKind::RejectedStatement => "statement rejected",
            StoreErrorKind::Unavailable => "store unavailable",
            StoreErrorKind::Internal => "internal store error",
        };
        write!(f, "{}", name)
    }
}

/// Error raised by `DataSource` and `StoreSession` operations.
#[derive(Debug, Clone, Error)]
#[error("datasource '{datasource}': {kind}: {message}")]
pub struct DataSourceError {
    /// Logical name of the datasource that raised the error.
    pub datasource: String,
    /// Classified kind; drives compensation outcome classification.
    pub kind: StoreErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DataSourceError {
    /// Build an error of the given kind.
    pub fn new(
        datasource: impl Into<String>,
        kind: StoreErrorKind,
        message: impl Into<String>,
    ) -> Self {
        DataSourceError {
            datasource: datasource.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a `NotFound` error.
    pub fn not_found(datasource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(datasource, StoreErrorKind::NotFound, message)
    }

    /// Shorthand for an `AlreadyExists` error.
    pub fn already_exists(datasource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(datasource, StoreErrorKind::AlreadyExists, message)
    }

    /// Shorthand for an `Unavailable` error.
    pub fn unavailable(datasource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(datasource, StoreErrorKind::Unavailable, message)
    }

    /// Whether the operation may succeed if simply retried.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, StoreErrorKind::Unavailable)
    }
}

/// One local transaction against a single datasource.
///
/// Mutations are staged in a session-private overlay with read-your-writes
/// visibility; nothing is observable to other sessions until `commit`.
/// `flush` materializes store-assigned keys and defaults into the overlay so
/// they can be captured before commit. After `commit` or `rollback` the
/// session is spent and further staging fails.
pub trait StoreSession: Send {
    /// Logical name of the owning datasource.
    fn datasource(&self) -> &str;

    /// Read a row as seen by this session (overlay first, then base).
    fn get(
        &self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, DataSourceError>;

    /// Stage an insert. Assigns a primary key if the row carries none and
    /// returns the key the row will have.
    fn stage_insert(
        &mut self,
        entity_class: &str,
        row: EntitySnapshot,
    ) -> Result<String, DataSourceError>;

    /// Stage a full-row update of an existing row.
    fn stage_update(
        &mut self,
        entity_class: &str,
        entity_id: &str,
        row: EntitySnapshot,
    ) -> Result<(), DataSourceError>;

    /// Stage deletion of an existing row.
    fn stage_delete(&mut self, entity_class: &str, entity_id: &str)
        -> Result<(), DataSourceError>;

    /// Materialize generated keys and defaults into the overlay without
    /// publishing anything.
    fn flush(&mut self) -> Result<(), DataSourceError>;

    /// Publish the overlay to the base store. Spends the session.
    fn commit(&mut self) -> Result<(), DataSourceError>;

    /// Discard the overlay. Spends the session. Never fails.
    fn rollback(&mut self);
}

/// One independent datastore.
///
/// Direct operations are auto-committed and immediately visible; the
/// compensator relies on that when replaying inverses, and set-based or
/// native statements run through here precisely because a session overlay
/// cannot represent them.
pub trait DataSource: Send + Sync {
    /// Logical name used in operation records and persisted keys.
    fn name(&self) -> &str;

    /// Schema metadata for an entity class, if known.
    fn schema(&self, entity_class: &str) -> Option<TableSchema>;

    /// Open a new local transaction.
    fn begin(&self) -> Box<dyn StoreSession>;

    /// Read one row directly.
    fn find_row(
        &self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, DataSourceError>;

    /// Insert one row directly. Fails with `AlreadyExists` if present.
    fn insert_row(
        &self,
        entity_class: &str,
        entity_id: &str,
        row: EntitySnapshot,
    ) -> Result<(), DataSourceError>;

    /// Merge a row state over an existing row.
    ///
    /// If the table is versioned and the incoming row carries a non-null
    /// version differing from the stored one, fails with `VersionConflict`.
    /// A null or absent version merges unconditionally.
    fn merge_row(
        &self,
        entity_class: &str,
        entity_id: &str,
        row: EntitySnapshot,
    ) -> Result<(), DataSourceError>;

    /// Delete one row directly. Fails with `NotFound` if absent.
    fn delete_row(&self, entity_class: &str, entity_id: &str) -> Result<(), DataSourceError>;

    /// Execute a native parameterized statement. Returns affected rows.
    fn execute_raw(
        &self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<u64, DataSourceError>;

    /// Invoke a stored procedure with positional parameters.
    fn call_procedure(
        &self,
        name: &str,
        params: &[serde_json::Value],
    ) -> Result<(), DataSourceError>;

    /// Enumerate all rows of an entity class as `(id, row)` pairs.
    fn scan(&self, entity_class: &str) -> Result<Vec<(String, EntitySnapshot)>, DataSourceError>;
}

/// Registry of every datasource known to the coordinator.
///
/// Iteration order is the sorted datasource name, which is what makes the
/// per-store commit sequence deterministic.
#[derive(Default)]
pub struct DataSourceRegistry {
    sources: BTreeMap<String, Arc<dyn DataSource>>,
}

impl DataSourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a datasource under its own name. Replaces any previous
    /// registration with the same name.
    pub fn register(&mut self, source: Arc<dyn DataSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    /// Look up a datasource by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.sources.get(name).cloned()
    }

    /// Iterate sources in deterministic (sorted-name) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn DataSource>)> {
        self.sources.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sorted datasource names.
    pub fn names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no source is registered.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceRegistry")
            .field("sources", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_builder() {
        let schema = TableSchema::with_id_field("order_id")
            .versioned("version")
            .with_triggers()
            .cascades_to("order_lines");
        assert_eq!(schema.id_field, "order_id");
        assert_eq!(schema.version_field.as_deref(), Some("version"));
        assert!(schema.has_triggers);
        assert_eq!(schema.cascade_delete_children, vec!["order_lines"]);
    }

    #[test]
    fn test_error_display() {
        let e = DataSourceError::not_found("orders_db", "orders/42 missing");
        let msg = e.to_string();
        assert!(msg.contains("orders_db"));
        assert!(msg.contains("not found"));
        assert!(msg.contains("orders/42"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DataSourceError::unavailable("db", "timeout").is_transient());
        assert!(!DataSourceError::not_found("db", "gone").is_transient());
    }
}
