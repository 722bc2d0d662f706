//! Per-transaction capture state
//!
//! One `CaptureContext` exists per armed transaction. It owns the pending
//! (pre-captured, unconfirmed) entries and the confirmed operation list,
//! and assigns sequence numbers at confirmation time so the confirmed list
//! is contiguous regardless of how many pre entries were discarded.

use serde_json::Value;
use tandem_core::{snapshot_of, EntitySnapshot, OperationRecord, OperationType};
use tracing::warn;

/// Inverse and statement detail for native and procedure captures.
#[derive(Debug, Clone, Default)]
pub struct QueryInfo {
    /// The forward statement or procedure invocation, for the record.
    pub statement: Option<String>,
    /// Parameterized inverse statement (NATIVE_QUERY).
    pub inverse_query: Option<String>,
    /// Inverse procedure name (STORED_PROCEDURE).
    pub inverse_procedure: Option<String>,
    /// Positional parameters bound to the inverse.
    pub parameters: Vec<Value>,
    /// Pre-images of affected rows, for snapshot-based fallback.
    pub affected: Vec<EntitySnapshot>,
}

#[derive(Debug)]
pub(crate) struct PendingOperation {
    pub datasource: String,
    pub operation_type: OperationType,
    pub entity_class: String,
    pub entity_id: Option<String>,
    pub snapshot: Option<EntitySnapshot>,
}

/// Capture state for one transaction.
#[derive(Debug, Default)]
pub struct CaptureContext {
    pending: Vec<PendingOperation>,
    confirmed: Vec<OperationRecord>,
    snapshot_failures: u32,
}

impl CaptureContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stage a pre-capture entry. The before-image is deep-copied through
    /// structural serialization; a copy failure is counted and the entry
    /// proceeds without a snapshot so the validator can surface it.
    pub(crate) fn record_pre(
        &mut self,
        datasource: &str,
        operation_type: OperationType,
        entity_class: &str,
        entity_id: Option<String>,
        before: Option<&EntitySnapshot>,
    ) {
        let snapshot = match before {
            Some(row) => match snapshot_of(row) {
                Ok(copy) => Some(copy),
                Err(e) => {
                    warn!(
                        target: "tandem::capture",
                        entity_class,
                        error = %e,
                        "pre-image deep copy failed; operation will not be compensatable"
                    );
                    self.snapshot_failures += 1;
                    None
                }
            },
            None => None,
        };
        self.pending.push(PendingOperation {
            datasource: datasource.to_string(),
            operation_type,
            entity_class: entity_class.to_string(),
            entity_id,
            snapshot,
        });
    }

    /// Confirm the most recent matching pre entry, promoting it to an
    /// operation with the store-assigned key and the next sequence number.
    ///
    /// Returns false when no matching pre entry exists.
    pub(crate) fn confirm(
        &mut self,
        operation_type: OperationType,
        entity_class: &str,
        entity_id: &str,
    ) -> bool {
        let position = self.pending.iter().rposition(|p| {
            p.operation_type == operation_type
                && p.entity_class == entity_class
                && (p.entity_id.is_none() || p.entity_id.as_deref() == Some(entity_id))
        });
        let Some(position) = position else {
            return false;
        };
        let pending = self.pending.remove(position);

        let mut op = OperationRecord::new(
            self.next_sequence(),
            pending.datasource,
            operation_type,
            entity_class,
        );
        op.entity_id = Some(entity_id.to_string());
        op.snapshot = pending.snapshot;
        self.confirmed.push(op);
        true
    }

    /// Capture a set-based operation in one shot with all affected
    /// pre-images supplied by the caller.
    pub(crate) fn record_bulk(
        &mut self,
        datasource: &str,
        operation_type: OperationType,
        entity_class: &str,
        pre_images: Vec<EntitySnapshot>,
        info: QueryInfo,
    ) {
        let mut op = OperationRecord::new(
            self.next_sequence(),
            datasource,
            operation_type,
            entity_class,
        );
        op.affected_entities = pre_images;
        op.additional_info = info.statement;
        op.inverse_query = info.inverse_query;
        op.inverse_procedure = info.inverse_procedure;
        op.query_parameters = info.parameters;
        self.confirmed.push(op);
    }

    /// Drop all unconfirmed pre entries. Returns how many were dropped.
    pub(crate) fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub(crate) fn confirmed(&self) -> &[OperationRecord] {
        &self.confirmed
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn snapshot_failures(&self) -> u32 {
        self.snapshot_failures
    }

    pub(crate) fn note_snapshot_failure(&mut self) {
        self.snapshot_failures += 1;
    }

    fn next_sequence(&self) -> u32 {
        self.confirmed.len() as u32 + 1
    }
}
