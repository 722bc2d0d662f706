//! In-memory datasource with local transactions
//!
//! `MemoryDataSource` implements the `DataSource` seam for tests and
//! embedded deployments: tables of JSON rows keyed by primary key, schema
//! metadata per table, and sessions that buffer mutations in a private
//! overlay with read-your-writes until commit.
//!
//! Direct operations (`insert_row`, `merge_row`, `delete_row`) are
//! auto-committed and immediately visible, which is what the compensator
//! and set-based statements rely on. Native statements and procedure calls
//! cannot be interpreted by an in-memory table, so they are recorded in an
//! execution journal that tests can inspect.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tandem_core::{
    entity_id_of, DataSource, DataSourceError, EntitySnapshot, StoreErrorKind, StoreSession,
    TableSchema,
};
use tracing::debug;
use uuid::Uuid;

/// One native statement run through `execute_raw`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    /// The statement text as submitted.
    pub statement: String,
    /// Positional bound parameters.
    pub params: Vec<Value>,
}

/// One procedure invocation run through `call_procedure`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureCall {
    /// Procedure name.
    pub name: String,
    /// Positional parameters.
    pub params: Vec<Value>,
}

struct Table {
    schema: TableSchema,
    rows: FxHashMap<String, EntitySnapshot>,
}

struct Inner {
    name: String,
    tables: dashmap::DashMap<String, Table>,
    statements: Mutex<Vec<ExecutedStatement>>,
    procedure_calls: Mutex<Vec<ProcedureCall>>,
}

impl Inner {
    fn err(&self, kind: StoreErrorKind, message: impl Into<String>) -> DataSourceError {
        DataSourceError::new(&self.name, kind, message)
    }

    fn unknown_entity(&self, entity_class: &str) -> DataSourceError {
        self.err(
            StoreErrorKind::UnknownEntity,
            format!("entity class '{}' is not defined", entity_class),
        )
    }
}

/// In-memory implementation of `DataSource`.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct MemoryDataSource {
    inner: Arc<Inner>,
}

impl MemoryDataSource {
    /// Empty datasource with the given logical name.
    pub fn new(name: impl Into<String>) -> Self {
        MemoryDataSource {
            inner: Arc::new(Inner {
                name: name.into(),
                tables: dashmap::DashMap::new(),
                statements: Mutex::new(Vec::new()),
                procedure_calls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Define (or redefine) a table for an entity class.
    pub fn define_table(&self, entity_class: impl Into<String>, schema: TableSchema) {
        self.inner.tables.insert(
            entity_class.into(),
            Table {
                schema,
                rows: FxHashMap::default(),
            },
        );
    }

    /// Number of rows currently in a table. Zero for unknown tables.
    pub fn row_count(&self, entity_class: &str) -> usize {
        self.inner
            .tables
            .get(entity_class)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    /// Every native statement executed so far, in order.
    pub fn executed_statements(&self) -> Vec<ExecutedStatement> {
        self.inner.statements.lock().clone()
    }

    /// Every procedure call so far, in order.
    pub fn procedure_calls(&self) -> Vec<ProcedureCall> {
        self.inner.procedure_calls.lock().clone()
    }

    fn bump_version(schema: &TableSchema, current: Option<&EntitySnapshot>, row: &mut EntitySnapshot) {
        if let Some(vf) = &schema.version_field {
            let next = current
                .and_then(|c| c.get(vf))
                .and_then(Value::as_i64)
                .unwrap_or(0)
                + 1;
            row.insert(vf.clone(), Value::from(next));
        }
    }
}

impl DataSource for MemoryDataSource {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn schema(&self, entity_class: &str) -> Option<TableSchema> {
        self.inner.tables.get(entity_class).map(|t| t.schema.clone())
    }

    fn begin(&self) -> Box<dyn StoreSession> {
        Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            overlay: Vec::new(),
            view: FxHashMap::default(),
            spent: false,
        })
    }

    fn find_row(
        &self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, DataSourceError> {
        let table = self
            .inner
            .tables
            .get(entity_class)
            .ok_or_else(|| self.inner.unknown_entity(entity_class))?;
        Ok(table.rows.get(entity_id).cloned())
    }

    fn insert_row(
        &self,
        entity_class: &str,
        entity_id: &str,
        mut row: EntitySnapshot,
    ) -> Result<(), DataSourceError> {
        let mut table = self
            .inner
            .tables
            .get_mut(entity_class)
            .ok_or_else(|| self.inner.unknown_entity(entity_class))?;
        if table.rows.contains_key(entity_id) {
            return Err(self.inner.err(
                StoreErrorKind::AlreadyExists,
                format!("{}/{} already exists", entity_class, entity_id),
            ));
        }
        // A re-inserted pre-image may carry a cleared version; start fresh
        Self::bump_version(&table.schema, None, &mut row);
        table.rows.insert(entity_id.to_string(), row);
        Ok(())
    }

    fn merge_row(
        &self,
        entity_class: &str,
        entity_id: &str,
        mut row: EntitySnapshot,
    ) -> Result<(), DataSourceError> {
        let mut table = self
            .inner
            .tables
            .get_mut(entity_class)
            .ok_or_else(|| self.inner.unknown_entity(entity_class))?;
        let schema = table.schema.clone();
        let current = table.rows.get(entity_id).cloned().ok_or_else(|| {
            self.inner.err(
                StoreErrorKind::NotFound,
                format!("{}/{} does not exist", entity_class, entity_id),
            )
        })?;

        if let Some(vf) = &schema.version_field {
            let incoming = row.get(vf).filter(|v| !v.is_null());
            if let Some(incoming) = incoming {
                if current.get(vf) != Some(incoming) {
                    return Err(self.inner.err(
                        StoreErrorKind::VersionConflict,
                        format!(
                            "{}/{}: stored version {:?} differs from submitted {:?}",
                            entity_class,
                            entity_id,
                            current.get(vf),
                            incoming
                        ),
                    ));
                }
            }
        }

        Self::bump_version(&schema, Some(&current), &mut row);
        table.rows.insert(entity_id.to_string(), row);
        Ok(())
    }

    fn delete_row(&self, entity_class: &str, entity_id: &str) -> Result<(), DataSourceError> {
        let mut table = self
            .inner
            .tables
            .get_mut(entity_class)
            .ok_or_else(|| self.inner.unknown_entity(entity_class))?;
        if table.rows.remove(entity_id).is_none() {
            return Err(self.inner.err(
                StoreErrorKind::NotFound,
                format!("{}/{} does not exist", entity_class, entity_id),
            ));
        }
        Ok(())
    }

    fn execute_raw(
        &self,
        statement: &str,
        params: &[Value],
    ) -> Result<u64, DataSourceError> {
        debug!(target: "tandem::datasource", datasource = %self.inner.name, statement, "native statement recorded");
        self.inner.statements.lock().push(ExecutedStatement {
            statement: statement.to_string(),
            params: params.to_vec(),
        });
        Ok(0)
    }

    fn call_procedure(&self, name: &str, params: &[Value]) -> Result<(), DataSourceError> {
        debug!(target: "tandem::datasource", datasource = %self.inner.name, procedure = name, "procedure call recorded");
        self.inner.procedure_calls.lock().push(ProcedureCall {
            name: name.to_string(),
            params: params.to_vec(),
        });
        Ok(())
    }

    fn scan(&self, entity_class: &str) -> Result<Vec<(String, EntitySnapshot)>, DataSourceError> {
        let table = self
            .inner
            .tables
            .get(entity_class)
            .ok_or_else(|| self.inner.unknown_entity(entity_class))?;
        let mut rows: Vec<(String, EntitySnapshot)> = table
            .rows
            .iter()
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }
}

enum OverlayOp {
    Write {
        entity_class: String,
        entity_id: String,
        row: EntitySnapshot,
    },
    Delete {
        entity_class: String,
        entity_id: String,
    },
}

/// Session-private local transaction over a `MemoryDataSource`.
struct MemorySession {
    inner: Arc<Inner>,
    overlay: Vec<OverlayOp>,
    view: FxHashMap<(String, String), Option<EntitySnapshot>>,
    spent: bool,
}

impl MemorySession {
    fn ensure_live(&self) -> Result<(), DataSourceError> {
        if self.spent {
            return Err(self
                .inner
                .err(StoreErrorKind::Internal, "session already committed or rolled back"));
        }
        Ok(())
    }

    fn schema_for(&self, entity_class: &str) -> Result<TableSchema, DataSourceError> {
        self.inner
            .tables
            .get(entity_class)
            .map(|t| t.schema.clone())
            .ok_or_else(|| self.inner.unknown_entity(entity_class))
    }

    fn current(
        &self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, DataSourceError> {
        let key = (entity_class.to_string(), entity_id.to_string());
        if let Some(staged) = self.view.get(&key) {
            return Ok(staged.clone());
        }
        let table = self
            .inner
            .tables
            .get(entity_class)
            .ok_or_else(|| self.inner.unknown_entity(entity_class))?;
        Ok(table.rows.get(entity_id).cloned())
    }

    fn stage_write(&mut self, entity_class: &str, entity_id: &str, row: EntitySnapshot) {
        self.view.insert(
            (entity_class.to_string(), entity_id.to_string()),
            Some(row.clone()),
        );
        self.overlay.push(OverlayOp::Write {
            entity_class: entity_class.to_string(),
            entity_id: entity_id.to_string(),
            row,
        });
    }
}

impl StoreSession for MemorySession {
    fn datasource(&self) -> &str {
        &self.inner.name
    }

    fn get(
        &self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, DataSourceError> {
        self.current(entity_class, entity_id)
    }

    fn stage_insert(
        &mut self,
        entity_class: &str,
        mut row: EntitySnapshot,
    ) -> Result<String, DataSourceError> {
        self.ensure_live()?;
        let schema = self.schema_for(entity_class)?;

        let entity_id = match entity_id_of(&row, &schema.id_field) {
            Some(id) => id,
            None => {
                // Store-assigned key, available to capture after staging
                let id = Uuid::new_v4().to_string();
                row.insert(schema.id_field.clone(), Value::String(id.clone()));
                id
            }
        };

        if self.current(entity_class, &entity_id)?.is_some() {
            return Err(self.inner.err(
                StoreErrorKind::AlreadyExists,
                format!("{}/{} already exists", entity_class, entity_id),
            ));
        }

        MemoryDataSource::bump_version(&schema, None, &mut row);
        self.stage_write(entity_class, &entity_id, row);
        Ok(entity_id)
    }

    fn stage_update(
        &mut self,
        entity_class: &str,
        entity_id: &str,
        mut row: EntitySnapshot,
    ) -> Result<(), DataSourceError> {
        self.ensure_live()?;
        let schema = self.schema_for(entity_class)?;
        let current = self.current(entity_class, entity_id)?.ok_or_else(|| {
            self.inner.err(
                StoreErrorKind::NotFound,
                format!("{}/{} does not exist", entity_class, entity_id),
            )
        })?;
        MemoryDataSource::bump_version(&schema, Some(&current), &mut row);
        self.stage_write(entity_class, entity_id, row);
        Ok(())
    }

    fn stage_delete(
        &mut self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<(), DataSourceError> {
        self.ensure_live()?;
        if self.current(entity_class, entity_id)?.is_none() {
            return Err(self.inner.err(
                StoreErrorKind::NotFound,
                format!("{}/{} does not exist", entity_class, entity_id),
            ));
        }
        self.view.insert(
            (entity_class.to_string(), entity_id.to_string()),
            None,
        );
        self.overlay.push(OverlayOp::Delete {
            entity_class: entity_class.to_string(),
            entity_id: entity_id.to_string(),
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DataSourceError> {
        // Keys and versions materialize at stage time here; nothing to do
        self.ensure_live()
    }

    fn commit(&mut self) -> Result<(), DataSourceError> {
        self.ensure_live()?;
        self.spent = true;
        for op in self.overlay.drain(..) {
            match op {
                OverlayOp::Write {
                    entity_class,
                    entity_id,
                    row,
                } => {
                    let mut table = self
                        .inner
                        .tables
                        .get_mut(&entity_class)
                        .ok_or_else(|| self.inner.unknown_entity(&entity_class))?;
                    table.rows.insert(entity_id, row);
                }
                OverlayOp::Delete {
                    entity_class,
                    entity_id,
                } => {
                    if let Some(mut table) = self.inner.tables.get_mut(&entity_class) {
                        table.rows.remove(&entity_id);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.spent = true;
        self.overlay.clear();
        self.view.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(v: Value) -> EntitySnapshot {
        v.as_object().unwrap().clone()
    }

    fn source() -> MemoryDataSource {
        let ds = MemoryDataSource::new("orders_db");
        ds.define_table("orders", TableSchema::default());
        ds.define_table(
            "accounts",
            TableSchema::default().versioned("version"),
        );
        ds
    }

    #[test]
    fn test_session_isolation_until_commit() {
        let ds = source();
        let mut session = ds.begin();
        let id = session
            .stage_insert("orders", snap(json!({"id": "1", "total": 50})))
            .unwrap();
        assert_eq!(id, "1");

        // Visible inside the session, invisible outside
        assert!(session.get("orders", "1").unwrap().is_some());
        assert!(ds.find_row("orders", "1").unwrap().is_none());

        session.commit().unwrap();
        assert!(ds.find_row("orders", "1").unwrap().is_some());
    }

    #[test]
    fn test_rollback_discards_overlay() {
        let ds = source();
        let mut session = ds.begin();
        session
            .stage_insert("orders", snap(json!({"id": "1"})))
            .unwrap();
        session.rollback();
        assert!(ds.find_row("orders", "1").unwrap().is_none());
    }

    #[test]
    fn test_spent_session_refuses_work() {
        let ds = source();
        let mut session = ds.begin();
        session.commit().unwrap();
        assert!(session
            .stage_insert("orders", snap(json!({"id": "9"})))
            .is_err());
        assert!(session.commit().is_err());
    }

    #[test]
    fn test_insert_assigns_missing_id() {
        let ds = source();
        let mut session = ds.begin();
        let id = session
            .stage_insert("orders", snap(json!({"total": 10})))
            .unwrap();
        assert!(!id.is_empty());
        let staged = session.get("orders", &id).unwrap().unwrap();
        assert_eq!(staged.get("id"), Some(&Value::String(id.clone())));
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let ds = source();
        let mut session = ds.begin();
        session
            .stage_insert("orders", snap(json!({"id": "1"})))
            .unwrap();
        let err = session
            .stage_insert("orders", snap(json!({"id": "1"})))
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::AlreadyExists);
    }

    #[test]
    fn test_update_requires_existing_row() {
        let ds = source();
        let mut session = ds.begin();
        let err = session
            .stage_update("orders", "42", snap(json!({"id": "42"})))
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
    }

    #[test]
    fn test_read_your_writes_and_delete() {
        let ds = source();
        ds.insert_row("orders", "1", snap(json!({"id": "1", "total": 5})))
            .unwrap();
        let mut session = ds.begin();
        session.stage_delete("orders", "1").unwrap();
        assert!(session.get("orders", "1").unwrap().is_none());
        // Base still has it
        assert!(ds.find_row("orders", "1").unwrap().is_some());
        session.commit().unwrap();
        assert!(ds.find_row("orders", "1").unwrap().is_none());
    }

    #[test]
    fn test_version_assigned_and_bumped() {
        let ds = source();
        let mut session = ds.begin();
        session
            .stage_insert("accounts", snap(json!({"id": "a", "balance": 100})))
            .unwrap();
        session.commit().unwrap();
        let v1 = ds.find_row("accounts", "a").unwrap().unwrap();
        assert_eq!(v1.get("version"), Some(&json!(1)));

        let mut session = ds.begin();
        session
            .stage_update("accounts", "a", snap(json!({"id": "a", "balance": 50})))
            .unwrap();
        session.commit().unwrap();
        let v2 = ds.find_row("accounts", "a").unwrap().unwrap();
        assert_eq!(v2.get("version"), Some(&json!(2)));
    }

    #[test]
    fn test_merge_version_conflict() {
        let ds = source();
        ds.insert_row("accounts", "a", snap(json!({"id": "a", "balance": 100})))
            .unwrap();
        // Stored version is 1; submitting stale version 7 conflicts
        let err = ds
            .merge_row(
                "accounts",
                "a",
                snap(json!({"id": "a", "balance": 90, "version": 7})),
            )
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::VersionConflict);
    }

    #[test]
    fn test_merge_with_cleared_version_overwrites() {
        let ds = source();
        ds.insert_row("accounts", "a", snap(json!({"id": "a", "balance": 100})))
            .unwrap();
        ds.merge_row(
            "accounts",
            "a",
            snap(json!({"id": "a", "balance": 90, "version": null})),
        )
        .unwrap();
        let row = ds.find_row("accounts", "a").unwrap().unwrap();
        assert_eq!(row.get("balance"), Some(&json!(90)));
        assert_eq!(row.get("version"), Some(&json!(2)));
    }

    #[test]
    fn test_merge_missing_row_not_found() {
        let ds = source();
        let err = ds
            .merge_row("accounts", "ghost", snap(json!({"id": "ghost"})))
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
    }

    #[test]
    fn test_direct_delete_missing_not_found() {
        let ds = source();
        let err = ds.delete_row("orders", "ghost").unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
    }

    #[test]
    fn test_unknown_entity_class() {
        let ds = source();
        let err = ds.find_row("widgets", "1").unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::UnknownEntity);
    }

    #[test]
    fn test_statement_and_procedure_journal() {
        let ds = source();
        ds.execute_raw("UPDATE orders SET total = ?", &[json!(5)])
            .unwrap();
        ds.call_procedure("restock", &[json!("sku-1")]).unwrap();

        let statements = ds.executed_statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].statement, "UPDATE orders SET total = ?");
        assert_eq!(ds.procedure_calls()[0].name, "restock");
    }

    #[test]
    fn test_scan_sorted() {
        let ds = source();
        ds.insert_row("orders", "b", snap(json!({"id": "b"}))).unwrap();
        ds.insert_row("orders", "a", snap(json!({"id": "a"}))).unwrap();
        let rows = ds.scan("orders").unwrap();
        assert_eq!(rows[0].0, "a");
        assert_eq!(rows[1].0, "b");
    }
}
