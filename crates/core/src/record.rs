//! Persisted transaction data model
//!
//! A `TransactionRecord` is the durable story of one logical transaction:
//! its lifecycle state, the ordered operations captured during execution,
//! and the recovery bookkeeping the sweep worker relies on. Records travel
//! as JSON with camelCase field names and ISO-8601 timestamps; unknown
//! fields are ignored on read so the schema can grow without breaking old
//! readers.

use crate::error::{TandemError, TandemResult};
use crate::risk::RiskFlag;
use crate::snapshot::EntitySnapshot;
use crate::state::TxState;
use crate::types::TxId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of captured data mutation.
///
/// A closed tagged vocabulary; the compensator switches on it to pick the
/// inverse. Serialized in SCREAMING_SNAKE_CASE on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Single-row insert. Inverse: delete by id.
    Insert,
    /// Single-row update. Inverse: merge the pre-image back.
    Update,
    /// Single-row delete. Inverse: re-insert the pre-image.
    Delete,
    /// Set-based update. Inverse: merge every pre-image back.
    BulkUpdate,
    /// Set-based delete. Inverse: re-insert every pre-image.
    BulkDelete,
    /// Native parameterized statement. Inverse: caller-supplied query.
    NativeQuery,
    /// Stored procedure call. Inverse: caller-supplied procedure.
    StoredProcedure,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::BulkUpdate => "BULK_UPDATE",
            OperationType::BulkDelete => "BULK_DELETE",
            OperationType::NativeQuery => "NATIVE_QUERY",
            OperationType::StoredProcedure => "STORED_PROCEDURE",
        };
        write!(f, "{}", name)
    }
}

/// One captured mutation with enough information to invert it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// 1-based position in the transaction's operation sequence.
    pub sequence: u32,
    /// Logical name of the target store.
    pub datasource: String,
    /// Which mutation this is.
    pub operation_type: OperationType,
    /// Type tag of the affected entity.
    pub entity_class: String,
    /// Primary key of the single affected row (single-row variants).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Pre-image of the row (UPDATE and DELETE); absent for INSERT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<EntitySnapshot>,
    /// Pre-images of every row a set-based statement touched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_entities: Vec<EntitySnapshot>,
    /// Free-form detail (the captured statement text, for instance).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
    /// Caller-supplied inverse statement for NATIVE_QUERY.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_query: Option<String>,
    /// Caller-supplied inverse procedure for STORED_PROCEDURE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse_procedure: Option<String>,
    /// Positional parameters for the inverse statement or procedure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_parameters: Vec<serde_json::Value>,
    /// Set once the inverse has been applied successfully.
    #[serde(default)]
    pub compensated: bool,
    /// Last compensation failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_error: Option<String>,
}

impl OperationRecord {
    /// Bare record of the given type; optional fields start empty.
    pub fn new(
        sequence: u32,
        datasource: impl Into<String>,
        operation_type: OperationType,
        entity_class: impl Into<String>,
    ) -> Self {
        OperationRecord {
            sequence,
            datasource: datasource.into(),
            operation_type,
            entity_class: entity_class.into(),
            entity_id: None,
            snapshot: None,
            affected_entities: Vec::new(),
            additional_info: None,
            inverse_query: None,
            inverse_procedure: None,
            query_parameters: Vec::new(),
            compensated: false,
            compensation_error: None,
        }
    }

    /// Whether this is one of the set-based variants.
    pub fn is_bulk(&self) -> bool {
        matches!(
            self.operation_type,
            OperationType::BulkUpdate | OperationType::BulkDelete
        )
    }
}

/// The durable story of one logical transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Opaque unique identifier; immutable after creation.
    pub tx_id: TxId,
    /// Human-readable label for the invocation; immutable.
    pub business_key: String,
    /// Current lifecycle state.
    pub state: TxState,
    /// When the coordinator entered the wrapped call.
    pub start_time: DateTime<Utc>,
    /// Set exactly when the state becomes terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Ordered captured operations; append-only before COMMITTING.
    #[serde(default)]
    pub operations: Vec<OperationRecord>,
    /// How many recovery attempts have touched this record.
    #[serde(default)]
    pub retry_count: u32,
    /// When the last recovery attempt ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_time: Option<DateTime<Utc>>,
    /// Last failure reason; populated in ROLLING_BACK and FAILED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Per-flag risk counts collected before validation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub risk_metrics: BTreeMap<RiskFlag, u32>,
}

impl TransactionRecord {
    /// Fresh record in state CREATED with a new id and the current time.
    pub fn new(business_key: impl Into<String>) -> Self {
        TransactionRecord {
            tx_id: TxId::new(),
            business_key: business_key.into(),
            state: TxState::Created,
            start_time: Utc::now(),
            end_time: None,
            operations: Vec::new(),
            retry_count: 0,
            last_retry_time: None,
            error_message: None,
            risk_metrics: BTreeMap::new(),
        }
    }

    /// Move to a new lifecycle state, enforcing the state machine.
    ///
    /// Terminal targets stamp `end_time`. Refuses regressions, terminal
    /// rewrites, and self-transitions.
    pub fn transition_to(&mut self, to: TxState) -> TandemResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(TandemError::internal(format!(
                "illegal state transition {} -> {} for transaction {}",
                self.state, to, self.tx_id
            )));
        }
        self.state = to;
        if to.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        Ok(())
    }

    /// Append a captured operation.
    ///
    /// Sequences must arrive contiguous and strictly increasing, and
    /// nothing may be appended once the commit phase has begun.
    pub fn append_operation(&mut self, op: OperationRecord) -> TandemResult<()> {
        if matches!(self.state, TxState::Committing) || self.state.is_terminal() {
            return Err(TandemError::internal(format!(
                "cannot append operations in state {} for transaction {}",
                self.state, self.tx_id
            )));
        }
        let expected = self.operations.len() as u32 + 1;
        if op.sequence != expected {
            return Err(TandemError::internal(format!(
                "operation sequence gap in transaction {}: expected {}, got {}",
                self.tx_id, expected, op.sequence
            )));
        }
        self.operations.push(op);
        Ok(())
    }

    /// Count one occurrence of a risk flag. Counts only ever grow.
    pub fn record_risk(&mut self, flag: RiskFlag) {
        *self.risk_metrics.entry(flag).or_insert(0) += 1;
    }

    /// Whether the record has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the record is non-terminal and older than `stall_timeout`.
    pub fn is_stalled(&self, now: DateTime<Utc>, stall_timeout: Duration) -> bool {
        !self.is_terminal() && now - self.start_time > stall_timeout
    }

    /// Mutable access to an operation by its sequence number.
    pub fn operation_mut(&mut self, sequence: u32) -> Option<&mut OperationRecord> {
        self.operations.iter_mut().find(|op| op.sequence == sequence)
    }

    /// How many operations still await compensation.
    pub fn uncompensated_count(&self) -> usize {
        self.operations.iter().filter(|op| !op.compensated).count()
    }

    /// Note a recovery attempt: bump the counter and stamp the time.
    pub fn note_retry(&mut self) {
        self.retry_count += 1;
        self.last_retry_time = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(v: serde_json::Value) -> EntitySnapshot {
        v.as_object().unwrap().clone()
    }

    fn op(seq: u32) -> OperationRecord {
        OperationRecord::new(seq, "orders_db", OperationType::Insert, "orders")
    }

    #[test]
    fn test_new_record_state() {
        let rec = TransactionRecord::new("transfer");
        assert_eq!(rec.state, TxState::Created);
        assert!(rec.end_time.is_none());
        assert!(rec.operations.is_empty());
        assert_eq!(rec.retry_count, 0);
    }

    #[test]
    fn test_happy_path_transitions_and_end_time() {
        let mut rec = TransactionRecord::new("t");
        for s in [
            TxState::Collecting,
            TxState::Validating,
            TxState::Prepared,
            TxState::Committing,
        ] {
            rec.transition_to(s).unwrap();
            assert!(rec.end_time.is_none());
        }
        rec.transition_to(TxState::Committed).unwrap();
        assert!(rec.end_time.is_some());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut rec = TransactionRecord::new("t");
        rec.transition_to(TxState::Collecting).unwrap();
        rec.transition_to(TxState::RollingBack).unwrap();
        rec.transition_to(TxState::RolledBack).unwrap();
        assert!(rec.transition_to(TxState::Failed).is_err());
        assert!(rec.transition_to(TxState::Committed).is_err());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut rec = TransactionRecord::new("t");
        assert!(rec.transition_to(TxState::Committed).is_err());
        assert_eq!(rec.state, TxState::Created);
    }

    #[test]
    fn test_append_enforces_contiguity() {
        let mut rec = TransactionRecord::new("t");
        rec.transition_to(TxState::Collecting).unwrap();
        rec.append_operation(op(1)).unwrap();
        rec.append_operation(op(2)).unwrap();
        // Gap
        assert!(rec.append_operation(op(4)).is_err());
        // Duplicate
        assert!(rec.append_operation(op(2)).is_err());
        assert_eq!(rec.operations.len(), 2);
    }

    #[test]
    fn test_append_refused_after_commit_begins() {
        let mut rec = TransactionRecord::new("t");
        rec.transition_to(TxState::Collecting).unwrap();
        rec.append_operation(op(1)).unwrap();
        rec.transition_to(TxState::Validating).unwrap();
        rec.transition_to(TxState::Prepared).unwrap();
        rec.transition_to(TxState::Committing).unwrap();
        assert!(rec.append_operation(op(2)).is_err());
    }

    #[test]
    fn test_risk_metrics_monotonic() {
        let mut rec = TransactionRecord::new("t");
        rec.record_risk(RiskFlag::BulkUpdate);
        rec.record_risk(RiskFlag::BulkUpdate);
        rec.record_risk(RiskFlag::NativeSql);
        assert_eq!(rec.risk_metrics[&RiskFlag::BulkUpdate], 2);
        assert_eq!(rec.risk_metrics[&RiskFlag::NativeSql], 1);
    }

    #[test]
    fn test_stalled_detection() {
        let mut rec = TransactionRecord::new("t");
        rec.start_time = Utc::now() - Duration::minutes(10);
        assert!(rec.is_stalled(Utc::now(), Duration::minutes(5)));
        assert!(!rec.is_stalled(Utc::now(), Duration::minutes(30)));

        rec.transition_to(TxState::Collecting).unwrap();
        rec.transition_to(TxState::RollingBack).unwrap();
        rec.transition_to(TxState::RolledBack).unwrap();
        // Terminal records are never stalled
        assert!(!rec.is_stalled(Utc::now(), Duration::minutes(5)));
    }

    #[test]
    fn test_uncompensated_count() {
        let mut rec = TransactionRecord::new("t");
        rec.transition_to(TxState::Collecting).unwrap();
        rec.append_operation(op(1)).unwrap();
        rec.append_operation(op(2)).unwrap();
        assert_eq!(rec.uncompensated_count(), 2);
        rec.operation_mut(2).unwrap().compensated = true;
        assert_eq!(rec.uncompensated_count(), 1);
    }

    #[test]
    fn test_serde_round_trip_equality() {
        let mut rec = TransactionRecord::new("transfer");
        rec.transition_to(TxState::Collecting).unwrap();
        let mut update = OperationRecord::new(1, "a_db", OperationType::Update, "accounts");
        update.entity_id = Some("1".into());
        update.snapshot = Some(snap(json!({"id": 1, "balance": 100})));
        rec.append_operation(update).unwrap();
        rec.record_risk(RiskFlag::LongRunning);

        let json = serde_json::to_string(&rec).unwrap();
        let back: TransactionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(rec, back);
    }

    #[test]
    fn test_wire_format_shape() {
        let rec = TransactionRecord::new("transfer");
        let json = serde_json::to_string(&rec).unwrap();
        // camelCase field names
        assert!(json.contains("\"txId\""));
        assert!(json.contains("\"businessKey\""));
        assert!(json.contains("\"startTime\""));
        // Dates are ISO-8601 strings, never integer epochs
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let start = value["startTime"].as_str().expect("startTime is a string");
        assert!(start.contains('T'));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let rec = TransactionRecord::new("t");
        let mut value = serde_json::to_value(&rec).unwrap();
        value["futureField"] = json!({"nested": true});
        let back: TransactionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back.tx_id, rec.tx_id);
    }

    #[test]
    fn test_operation_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&OperationType::BulkDelete).unwrap(),
            "\"BULK_DELETE\""
        );
        assert_eq!(
            serde_json::to_string(&OperationType::NativeQuery).unwrap(),
            "\"NATIVE_QUERY\""
        );
    }

    #[test]
    fn test_note_retry() {
        let mut rec = TransactionRecord::new("t");
        rec.note_retry();
        rec.note_retry();
        assert_eq!(rec.retry_count, 2);
        assert!(rec.last_retry_time.is_some());
    }
}
