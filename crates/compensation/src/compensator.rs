//! The compensator
//!
//! Replays a transaction record's operations as inverses, newest first.
//! One `sweep` walks the operations in reverse sequence order and applies
//! the inverse of each uncompensated one:
//!
//! | operation | inverse |
//! |-----------|---------|
//! | INSERT | delete the row by id |
//! | UPDATE | merge the snapshot back (version cleared first) |
//! | DELETE | re-insert the snapshot |
//! | BULK_UPDATE | merge every pre-image back |
//! | BULK_DELETE | re-insert every pre-image |
//! | NATIVE_QUERY | run the inverse query, else merge pre-images |
//! | STORED_PROCEDURE | call the inverse procedure, else merge pre-images |
//!
//! Inverses are idempotent where the target state already holds: deleting
//! an already-absent row and re-inserting an already-present row both count
//! as success. Retryable outcomes (conflicts, concurrent deletions,
//! transient store errors) leave the operation for the next attempt; fatal
//! outcomes stop the sweep at once.

use crate::breaker::CircuitBreaker;
use crate::guard;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    clear_version_field, entity_id_of, DataSource, DataSourceError, DataSourceRegistry,
    EntitySnapshot, OperationRecord, OperationType, StoreErrorKind, TransactionRecord,
};
use tracing::{debug, info, warn};

/// Retry tuning for compensation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    /// Attempts per `rollback` call.
    #[serde(default = "default_max_attempts")]
    pub max_rollback_retries: u32,
    /// Base backoff; attempt n sleeps `base * 2^(n-1)`.
    #[serde(default = "default_backoff_ms")]
    pub rollback_retry_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1_000
}

impl Default for CompensationConfig {
    fn default() -> Self {
        CompensationConfig {
            max_rollback_retries: default_max_attempts(),
            rollback_retry_backoff_ms: default_backoff_ms(),
        }
    }
}

/// Outcome of a `rollback` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackResult {
    /// Every operation is compensated.
    Completed,
    /// Attempts exhausted with operations still pending.
    Partial {
        /// Operations left uncompensated.
        remaining: usize,
    },
    /// A fatal condition stopped the sweep.
    Fatal {
        /// Sequence of the operation that cannot be inverted.
        sequence: u32,
        /// Why.
        message: String,
    },
    /// The circuit breaker refused the attempt; stores were not touched.
    CircuitOpen,
}

impl RollbackResult {
    /// Whether compensation finished cleanly.
    pub fn is_completed(&self) -> bool {
        matches!(self, RollbackResult::Completed)
    }
}

enum OpOutcome {
    Success,
    Retryable(String),
    Fatal(String),
}

enum SweepResult {
    Clean,
    Retryable { remaining: usize },
    Fatal { sequence: u32, message: String },
}

/// Applies inverse operations for transaction records.
pub struct Compensator {
    registry: Arc<DataSourceRegistry>,
    breaker: Arc<CircuitBreaker>,
    config: CompensationConfig,
}

impl Compensator {
    /// Build a compensator over the registered datasources.
    pub fn new(
        registry: Arc<DataSourceRegistry>,
        breaker: Arc<CircuitBreaker>,
        config: CompensationConfig,
    ) -> Self {
        Compensator {
            registry,
            breaker,
            config,
        }
    }

    /// Roll back with the configured attempt budget and backoff.
    pub fn rollback(&self, record: &mut TransactionRecord) -> RollbackResult {
        self.rollback_attempts(record, self.config.max_rollback_retries.max(1))
    }

    /// One attempt, no backoff. The recovery worker uses this and spreads
    /// its retries across sweep cycles instead.
    pub fn rollback_once(&self, record: &mut TransactionRecord) -> RollbackResult {
        self.rollback_attempts(record, 1)
    }

    fn rollback_attempts(&self, record: &mut TransactionRecord, attempts: u32) -> RollbackResult {
        if record.uncompensated_count() == 0 {
            return RollbackResult::Completed;
        }

        for attempt in 1..=attempts {
            if !self.breaker.try_acquire(record.tx_id) {
                warn!(
                    target: "tandem::compensation",
                    tx_id = %record.tx_id,
                    "circuit open; compensation attempt suppressed"
                );
                return RollbackResult::CircuitOpen;
            }

            match self.sweep(record) {
                SweepResult::Clean => {
                    self.breaker.record_success(record.tx_id);
                    info!(
                        target: "tandem::compensation",
                        tx_id = %record.tx_id,
                        attempt,
                        "compensation completed"
                    );
                    return RollbackResult::Completed;
                }
                SweepResult::Fatal { sequence, message } => {
                    self.breaker.record_failure(record.tx_id);
                    warn!(
                        target: "tandem::compensation",
                        tx_id = %record.tx_id,
                        sequence,
                        message = %message,
                        "fatal compensation error; sweep stopped"
                    );
                    return RollbackResult::Fatal { sequence, message };
                }
                SweepResult::Retryable { remaining } => {
                    self.breaker.record_failure(record.tx_id);
                    if attempt < attempts {
                        let backoff = self.backoff(attempt);
                        debug!(
                            target: "tandem::compensation",
                            tx_id = %record.tx_id,
                            attempt,
                            remaining,
                            backoff_ms = backoff.as_millis() as u64,
                            "retryable failures; backing off"
                        );
                        std::thread::sleep(backoff);
                    } else {
                        return RollbackResult::Partial { remaining };
                    }
                }
            }
        }

        RollbackResult::Partial {
            remaining: record.uncompensated_count(),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << (attempt - 1).min(16);
        Duration::from_millis(self.config.rollback_retry_backoff_ms.saturating_mul(factor))
    }

    /// One reverse pass over every uncompensated operation.
    fn sweep(&self, record: &mut TransactionRecord) -> SweepResult {
        let mut retryable = 0usize;
        for idx in (0..record.operations.len()).rev() {
            if record.operations[idx].compensated {
                continue;
            }
            let op = record.operations[idx].clone();
            match self.apply_inverse(&op) {
                OpOutcome::Success => {
                    let slot = &mut record.operations[idx];
                    slot.compensated = true;
                    slot.compensation_error = None;
                }
                OpOutcome::Retryable(message) => {
                    debug!(
                        target: "tandem::compensation",
                        tx_id = %record.tx_id,
                        sequence = op.sequence,
                        message = %message,
                        "inverse deferred"
                    );
                    record.operations[idx].compensation_error = Some(message);
                    retryable += 1;
                }
                OpOutcome::Fatal(message) => {
                    record.operations[idx].compensation_error = Some(message.clone());
                    return SweepResult::Fatal {
                        sequence: op.sequence,
                        message,
                    };
                }
            }
        }
        if retryable == 0 {
            SweepResult::Clean
        } else {
            SweepResult::Retryable {
                remaining: retryable,
            }
        }
    }

    fn apply_inverse(&self, op: &OperationRecord) -> OpOutcome {
        let Some(source) = self.registry.get(&op.datasource) else {
            return OpOutcome::Fatal(format!("unknown datasource '{}'", op.datasource));
        };

        match op.operation_type {
            OperationType::Insert => self.invert_insert(&source, op),
            OperationType::Update => self.invert_update(&source, op),
            OperationType::Delete => self.invert_delete(&source, op),
            OperationType::BulkUpdate => self.merge_pre_images(&source, op),
            OperationType::BulkDelete => self.reinsert_pre_images(&source, op),
            OperationType::NativeQuery => self.invert_native(&source, op),
            OperationType::StoredProcedure => self.invert_procedure(&source, op),
        }
    }

    fn invert_insert(&self, source: &Arc<dyn DataSource>, op: &OperationRecord) -> OpOutcome {
        let Some(entity_id) = op.entity_id.as_deref() else {
            return OpOutcome::Fatal("INSERT inverse requires an entity id".to_string());
        };
        match source.delete_row(&op.entity_class, entity_id) {
            Ok(()) => OpOutcome::Success,
            // Already gone: the post-inverse state already holds
            Err(e) if e.kind == StoreErrorKind::NotFound => OpOutcome::Success,
            Err(e) => classify(e),
        }
    }

    fn invert_update(&self, source: &Arc<dyn DataSource>, op: &OperationRecord) -> OpOutcome {
        let Some(entity_id) = op.entity_id.as_deref() else {
            return OpOutcome::Fatal("UPDATE inverse requires an entity id".to_string());
        };
        let Some(snapshot) = op.snapshot.clone() else {
            return OpOutcome::Fatal("UPDATE inverse requires a snapshot".to_string());
        };
        self.merge_back(source, &op.entity_class, entity_id, snapshot)
    }

    fn invert_delete(&self, source: &Arc<dyn DataSource>, op: &OperationRecord) -> OpOutcome {
        let Some(entity_id) = op.entity_id.as_deref() else {
            return OpOutcome::Fatal("DELETE inverse requires an entity id".to_string());
        };
        let Some(snapshot) = op.snapshot.clone() else {
            return OpOutcome::Fatal("DELETE inverse requires a snapshot".to_string());
        };
        match source.insert_row(&op.entity_class, entity_id, snapshot) {
            Ok(()) => OpOutcome::Success,
            // Already present: the post-inverse state already holds
            Err(e) if e.kind == StoreErrorKind::AlreadyExists => OpOutcome::Success,
            Err(e) => classify(e),
        }
    }

    /// Merge every captured pre-image back (BULK_UPDATE inverse and the
    /// snapshot-based fallback for native and procedure operations).
    fn merge_pre_images(&self, source: &Arc<dyn DataSource>, op: &OperationRecord) -> OpOutcome {
        if op.affected_entities.is_empty() {
            return OpOutcome::Fatal(format!(
                "{} inverse requires captured pre-images",
                op.operation_type
            ));
        }
        let id_field = self.id_field_for(source, &op.entity_class);
        let mut deferred: Option<String> = None;
        for pre_image in &op.affected_entities {
            let Some(entity_id) = entity_id_of(pre_image, &id_field) else {
                return OpOutcome::Fatal(format!(
                    "pre-image of {} lacks primary key '{}'",
                    op.entity_class, id_field
                ));
            };
            match self.merge_back(source, &op.entity_class, &entity_id, pre_image.clone()) {
                OpOutcome::Success => {}
                OpOutcome::Retryable(message) => deferred = Some(message),
                fatal @ OpOutcome::Fatal(_) => return fatal,
            }
        }
        match deferred {
            None => OpOutcome::Success,
            Some(message) => OpOutcome::Retryable(message),
        }
    }

    fn reinsert_pre_images(&self, source: &Arc<dyn DataSource>, op: &OperationRecord) -> OpOutcome {
        if op.affected_entities.is_empty() {
            return OpOutcome::Fatal("BULK_DELETE inverse requires captured pre-images".to_string());
        }
        let id_field = self.id_field_for(source, &op.entity_class);
        let mut deferred: Option<String> = None;
        for pre_image in &op.affected_entities {
            let Some(entity_id) = entity_id_of(pre_image, &id_field) else {
                return OpOutcome::Fatal(format!(
                    "pre-image of {} lacks primary key '{}'",
                    op.entity_class, id_field
                ));
            };
            match source.insert_row(&op.entity_class, &entity_id, pre_image.clone()) {
                Ok(()) => {}
                Err(e) if e.kind == StoreErrorKind::AlreadyExists => {}
                Err(e) => match classify(e) {
                    OpOutcome::Retryable(message) => deferred = Some(message),
                    fatal => return fatal,
                },
            }
        }
        match deferred {
            None => OpOutcome::Success,
            Some(message) => OpOutcome::Retryable(message),
        }
    }

    fn invert_native(&self, source: &Arc<dyn DataSource>, op: &OperationRecord) -> OpOutcome {
        if let Some(inverse) = op.inverse_query.as_deref() {
            if let Err(reason) = guard::validate_inverse_statement(inverse) {
                return OpOutcome::Fatal(format!("inverse query rejected: {}", reason));
            }
            match source.execute_raw(inverse, &op.query_parameters) {
                Ok(_) => OpOutcome::Success,
                Err(e) => classify(e),
            }
        } else if !op.affected_entities.is_empty() {
            self.merge_pre_images(source, op)
        } else {
            OpOutcome::Fatal(
                "NATIVE_QUERY inverse requires an inverse query or captured pre-images".to_string(),
            )
        }
    }

    fn invert_procedure(&self, source: &Arc<dyn DataSource>, op: &OperationRecord) -> OpOutcome {
        if let Some(procedure) = op.inverse_procedure.as_deref() {
            if let Err(reason) = guard::validate_procedure_name(procedure) {
                return OpOutcome::Fatal(format!("inverse procedure rejected: {}", reason));
            }
            match source.call_procedure(procedure, &op.query_parameters) {
                Ok(()) => OpOutcome::Success,
                Err(e) => classify(e),
            }
        } else if !op.affected_entities.is_empty() {
            self.merge_pre_images(source, op)
        } else {
            OpOutcome::Fatal(
                "STORED_PROCEDURE inverse requires an inverse procedure or captured pre-images"
                    .to_string(),
            )
        }
    }

    /// Merge one snapshot back with its version cleared so the store
    /// treats it as an unversioned overwrite.
    fn merge_back(
        &self,
        source: &Arc<dyn DataSource>,
        entity_class: &str,
        entity_id: &str,
        mut snapshot: EntitySnapshot,
    ) -> OpOutcome {
        if let Some(schema) = source.schema(entity_class) {
            if let Some(version_field) = &schema.version_field {
                clear_version_field(&mut snapshot, version_field);
            }
        }
        match source.merge_row(entity_class, entity_id, snapshot) {
            Ok(()) => OpOutcome::Success,
            Err(e) => classify(e),
        }
    }

    fn id_field_for(&self, source: &Arc<dyn DataSource>, entity_class: &str) -> String {
        source
            .schema(entity_class)
            .map(|s| s.id_field)
            .unwrap_or_else(|| "id".to_string())
    }
}

/// Map a datasource error onto the retryable/fatal split.
///
/// Optimistic conflicts, concurrent deletions, and transient store errors
/// may resolve on a later attempt. Integrity violations, unknown entities,
/// and refused statements never will.
fn classify(e: DataSourceError) -> OpOutcome {
    match e.kind {
        StoreErrorKind::NotFound
        | StoreErrorKind::AlreadyExists
        | StoreErrorKind::VersionConflict
        | StoreErrorKind::Unavailable => OpOutcome::Retryable(e.to_string()),
        StoreErrorKind::ReferentialIntegrity
        | StoreErrorKind::UnknownEntity
        | StoreErrorKind::RejectedStatement
        | StoreErrorKind::Internal => OpOutcome::Fatal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use serde_json::json;
    use tandem_core::{TableSchema, TxState};
    use tandem_store::{FaultyDataSource, MemoryDataSource};

    fn snap(v: serde_json::Value) -> EntitySnapshot {
        v.as_object().unwrap().clone()
    }

    fn fast_config() -> CompensationConfig {
        CompensationConfig {
            max_rollback_retries: 3,
            rollback_retry_backoff_ms: 1,
        }
    }

    fn compensator_over(sources: Vec<Arc<dyn DataSource>>) -> Compensator {
        let mut registry = DataSourceRegistry::new();
        for source in sources {
            registry.register(source);
        }
        Compensator::new(
            Arc::new(registry),
            Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            fast_config(),
        )
    }

    fn record_with(ops: Vec<OperationRecord>) -> TransactionRecord {
        let mut record = TransactionRecord::new("test");
        record.transition_to(TxState::Collecting).unwrap();
        for op in ops {
            record.append_operation(op).unwrap();
        }
        record.transition_to(TxState::RollingBack).unwrap();
        record
    }

    fn versioned_source() -> MemoryDataSource {
        let ds = MemoryDataSource::new("db");
        ds.define_table("accounts", TableSchema::default().versioned("version"));
        ds.define_table("orders", TableSchema::default());
        ds
    }

    #[test]
    fn test_insert_inverse_deletes_row() {
        let ds = versioned_source();
        ds.insert_row("orders", "1", snap(json!({"id": "1"}))).unwrap();
        let comp = compensator_over(vec![Arc::new(ds.clone())]);

        let mut op = OperationRecord::new(1, "db", OperationType::Insert, "orders");
        op.entity_id = Some("1".into());
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        assert!(record.operations[0].compensated);
        assert_eq!(ds.row_count("orders"), 0);
    }

    #[test]
    fn test_insert_inverse_idempotent_when_row_absent() {
        let ds = versioned_source();
        let comp = compensator_over(vec![Arc::new(ds)]);

        let mut op = OperationRecord::new(1, "db", OperationType::Insert, "orders");
        op.entity_id = Some("ghost".into());
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        assert!(record.operations[0].compensated);
    }

    #[test]
    fn test_update_inverse_merges_snapshot_with_version_cleared() {
        let ds = versioned_source();
        ds.insert_row("accounts", "a", snap(json!({"id": "a", "balance": 100})))
            .unwrap();
        // Concurrent-looking change bumped balance and version
        ds.merge_row(
            "accounts",
            "a",
            snap(json!({"id": "a", "balance": 40, "version": null})),
        )
        .unwrap();

        let comp = compensator_over(vec![Arc::new(ds.clone())]);
        let mut op = OperationRecord::new(1, "db", OperationType::Update, "accounts");
        op.entity_id = Some("a".into());
        // Snapshot carries the stale version 1; clearing lets it merge
        op.snapshot = Some(snap(json!({"id": "a", "balance": 100, "version": 1})));
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        let row = ds.find_row("accounts", "a").unwrap().unwrap();
        assert_eq!(row.get("balance"), Some(&json!(100)));
    }

    #[test]
    fn test_update_inverse_missing_snapshot_is_fatal() {
        let ds = versioned_source();
        let comp = compensator_over(vec![Arc::new(ds)]);

        let mut op = OperationRecord::new(1, "db", OperationType::Update, "accounts");
        op.entity_id = Some("a".into());
        let mut record = record_with(vec![op]);

        match comp.rollback(&mut record) {
            RollbackResult::Fatal { sequence, message } => {
                assert_eq!(sequence, 1);
                assert!(message.contains("snapshot"));
            }
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_inverse_reinserts_and_is_idempotent() {
        let ds = versioned_source();
        let comp = compensator_over(vec![Arc::new(ds.clone())]);

        let mut op = OperationRecord::new(1, "db", OperationType::Delete, "orders");
        op.entity_id = Some("1".into());
        op.snapshot = Some(snap(json!({"id": "1", "total": 5})));
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        assert!(ds.find_row("orders", "1").unwrap().is_some());

        // Second run: row already present, still success
        record.operations[0].compensated = false;
        assert!(comp.rollback(&mut record).is_completed());
    }

    #[test]
    fn test_reverse_order_sweep() {
        let ds = versioned_source();
        let comp = compensator_over(vec![Arc::new(ds.clone())]);

        // Three native ops whose inverses leave an observable trail
        let ops = (1..=3)
            .map(|i| {
                let mut op = OperationRecord::new(i, "db", OperationType::NativeQuery, "orders");
                op.inverse_query = Some(format!("UPDATE orders SET step = {}", i));
                op
            })
            .collect();
        let mut record = record_with(ops);

        assert!(comp.rollback(&mut record).is_completed());
        let executed: Vec<String> = ds
            .executed_statements()
            .into_iter()
            .map(|s| s.statement)
            .collect();
        assert_eq!(
            executed,
            vec![
                "UPDATE orders SET step = 3".to_string(),
                "UPDATE orders SET step = 2".to_string(),
                "UPDATE orders SET step = 1".to_string(),
            ]
        );
    }

    #[test]
    fn test_fatal_stops_sweep_immediately() {
        let ds = versioned_source();
        ds.insert_row("orders", "1", snap(json!({"id": "1"}))).unwrap();
        let comp = compensator_over(vec![Arc::new(ds.clone())]);

        // Sequence 1 would succeed, sequence 2 is fatal; reverse order
        // means 2 runs first and 1 must never be attempted
        let mut ok_op = OperationRecord::new(1, "db", OperationType::Insert, "orders");
        ok_op.entity_id = Some("1".into());
        let mut fatal_op = OperationRecord::new(2, "db", OperationType::Update, "accounts");
        fatal_op.entity_id = Some("a".into());
        // No snapshot: fatal
        let mut record = record_with(vec![ok_op, fatal_op]);

        match comp.rollback(&mut record) {
            RollbackResult::Fatal { sequence, .. } => assert_eq!(sequence, 2),
            other => panic!("expected fatal, got {:?}", other),
        }
        // The earlier operation was never compensated
        assert!(!record.operations[0].compensated);
        assert_eq!(ds.row_count("orders"), 1);
    }

    #[test]
    fn test_retryable_continues_sweep_and_retries() {
        let mem = versioned_source();
        mem.insert_row("orders", "1", snap(json!({"id": "1"}))).unwrap();
        mem.insert_row("orders", "2", snap(json!({"id": "2"}))).unwrap();
        let faulty = FaultyDataSource::new(Arc::new(mem.clone()));
        // First delete attempt transiently fails, then succeeds
        faulty.fail_next_deletes(1, StoreErrorKind::Unavailable);
        let comp = compensator_over(vec![faulty.clone() as Arc<dyn DataSource>]);

        let mut op1 = OperationRecord::new(1, "db", OperationType::Insert, "orders");
        op1.entity_id = Some("1".into());
        let mut op2 = OperationRecord::new(2, "db", OperationType::Insert, "orders");
        op2.entity_id = Some("2".into());
        let mut record = record_with(vec![op1, op2]);

        assert!(comp.rollback(&mut record).is_completed());
        // Reverse sweep hit op2 first (failed once), continued to op1,
        // then the retry finished op2
        assert!(record.operations.iter().all(|op| op.compensated));
        assert_eq!(mem.row_count("orders"), 0);
    }

    #[test]
    fn test_attempts_exhausted_leaves_partial() {
        let mem = versioned_source();
        mem.insert_row("orders", "1", snap(json!({"id": "1"}))).unwrap();
        let faulty = FaultyDataSource::new(Arc::new(mem));
        faulty.fail_next_deletes(100, StoreErrorKind::Unavailable);
        let comp = compensator_over(vec![faulty.clone() as Arc<dyn DataSource>]);

        let mut op = OperationRecord::new(1, "db", OperationType::Insert, "orders");
        op.entity_id = Some("1".into());
        let mut record = record_with(vec![op]);

        match comp.rollback(&mut record) {
            RollbackResult::Partial { remaining } => assert_eq!(remaining, 1),
            other => panic!("expected partial, got {:?}", other),
        }
        assert_eq!(faulty.delete_attempts(), 3);
        assert!(record.operations[0].compensation_error.is_some());
    }

    #[test]
    fn test_bulk_update_inverse_restores_all_pre_images() {
        let ds = versioned_source();
        ds.insert_row("accounts", "1", snap(json!({"id": "1", "balance": 100})))
            .unwrap();
        ds.insert_row("accounts", "2", snap(json!({"id": "2", "balance": 200})))
            .unwrap();
        // Zero both balances, as a bulk statement would
        ds.merge_row("accounts", "1", snap(json!({"id": "1", "balance": 0, "version": null})))
            .unwrap();
        ds.merge_row("accounts", "2", snap(json!({"id": "2", "balance": 0, "version": null})))
            .unwrap();

        let comp = compensator_over(vec![Arc::new(ds.clone())]);
        let mut op = OperationRecord::new(1, "db", OperationType::BulkUpdate, "accounts");
        op.affected_entities = vec![
            snap(json!({"id": "1", "balance": 100, "version": 1})),
            snap(json!({"id": "2", "balance": 200, "version": 1})),
        ];
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        assert_eq!(
            ds.find_row("accounts", "1").unwrap().unwrap().get("balance"),
            Some(&json!(100))
        );
        assert_eq!(
            ds.find_row("accounts", "2").unwrap().unwrap().get("balance"),
            Some(&json!(200))
        );
    }

    #[test]
    fn test_bulk_delete_inverse_reinserts_all() {
        let ds = versioned_source();
        let comp = compensator_over(vec![Arc::new(ds.clone())]);

        let mut op = OperationRecord::new(1, "db", OperationType::BulkDelete, "orders");
        op.affected_entities = vec![
            snap(json!({"id": "1", "total": 1})),
            snap(json!({"id": "2", "total": 2})),
        ];
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        assert_eq!(ds.row_count("orders"), 2);
    }

    #[test]
    fn test_native_inverse_rejected_statement_is_fatal() {
        let ds = versioned_source();
        let comp = compensator_over(vec![Arc::new(ds.clone())]);

        let mut op = OperationRecord::new(1, "db", OperationType::NativeQuery, "orders");
        op.inverse_query = Some("DROP TABLE orders".into());
        let mut record = record_with(vec![op]);

        match comp.rollback(&mut record) {
            RollbackResult::Fatal { message, .. } => assert!(message.contains("rejected")),
            other => panic!("expected fatal, got {:?}", other),
        }
        assert!(ds.executed_statements().is_empty());
    }

    #[test]
    fn test_native_inverse_falls_back_to_pre_images() {
        let ds = versioned_source();
        ds.insert_row("accounts", "1", snap(json!({"id": "1", "balance": 100})))
            .unwrap();
        ds.merge_row("accounts", "1", snap(json!({"id": "1", "balance": 0, "version": null})))
            .unwrap();

        let comp = compensator_over(vec![Arc::new(ds.clone())]);
        let mut op = OperationRecord::new(1, "db", OperationType::NativeQuery, "accounts");
        op.affected_entities = vec![snap(json!({"id": "1", "balance": 100, "version": 1}))];
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        assert_eq!(
            ds.find_row("accounts", "1").unwrap().unwrap().get("balance"),
            Some(&json!(100))
        );
    }

    #[test]
    fn test_procedure_inverse_called_with_parameters() {
        let ds = versioned_source();
        let comp = compensator_over(vec![Arc::new(ds.clone())]);

        let mut op = OperationRecord::new(1, "db", OperationType::StoredProcedure, "orders");
        op.inverse_procedure = Some("release_hold".into());
        op.query_parameters = vec![json!("order-1")];
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        let calls = ds.procedure_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "release_hold");
        assert_eq!(calls[0].params, vec![json!("order-1")]);
    }

    #[test]
    fn test_procedure_without_inverse_or_pre_images_is_fatal() {
        let ds = versioned_source();
        let comp = compensator_over(vec![Arc::new(ds)]);

        let op = OperationRecord::new(1, "db", OperationType::StoredProcedure, "orders");
        let mut record = record_with(vec![op]);

        assert!(matches!(
            comp.rollback(&mut record),
            RollbackResult::Fatal { .. }
        ));
    }

    #[test]
    fn test_unknown_datasource_is_fatal() {
        let comp = compensator_over(vec![]);
        let mut op = OperationRecord::new(1, "nowhere", OperationType::Insert, "orders");
        op.entity_id = Some("1".into());
        let mut record = record_with(vec![op]);

        assert!(matches!(
            comp.rollback(&mut record),
            RollbackResult::Fatal { .. }
        ));
    }

    #[test]
    fn test_rollback_twice_is_idempotent() {
        let ds = versioned_source();
        ds.insert_row("orders", "1", snap(json!({"id": "1"}))).unwrap();
        let comp = compensator_over(vec![Arc::new(ds.clone())]);

        let mut op = OperationRecord::new(1, "db", OperationType::Insert, "orders");
        op.entity_id = Some("1".into());
        let mut record = record_with(vec![op]);

        assert!(comp.rollback(&mut record).is_completed());
        let after_first = ds.scan("orders").unwrap();
        assert!(comp.rollback(&mut record).is_completed());
        assert_eq!(ds.scan("orders").unwrap(), after_first);
    }

    #[test]
    fn test_circuit_opens_after_threshold_and_admits_probe() {
        let mem = versioned_source();
        mem.insert_row("orders", "1", snap(json!({"id": "1"}))).unwrap();
        let faulty = FaultyDataSource::new(Arc::new(mem));
        faulty.fail_next_deletes(100, StoreErrorKind::Unavailable);

        let mut registry = DataSourceRegistry::new();
        registry.register(faulty.clone() as Arc<dyn DataSource>);
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            compensation_failure_threshold: 3,
            recovery_window_ms: 40,
        }));
        let comp = Compensator::new(
            Arc::new(registry),
            Arc::clone(&breaker),
            fast_config(),
        );

        let mut op = OperationRecord::new(1, "db", OperationType::Insert, "orders");
        op.entity_id = Some("1".into());
        let mut record = record_with(vec![op]);

        // Three failing attempts open the circuit
        assert!(matches!(
            comp.rollback(&mut record),
            RollbackResult::Partial { .. }
        ));
        assert_eq!(faulty.delete_attempts(), 3);
        assert_eq!(breaker.state(record.tx_id), crate::BreakerState::Open);

        // While open, attempts return without touching the store
        assert_eq!(comp.rollback(&mut record), RollbackResult::CircuitOpen);
        assert_eq!(faulty.delete_attempts(), 3);

        // After the window a probe goes through
        std::thread::sleep(Duration::from_millis(60));
        let _ = comp.rollback_once(&mut record);
        assert_eq!(faulty.delete_attempts(), 4);
    }
}
