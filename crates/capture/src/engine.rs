//! Capture engine
//!
//! Keeps one `CaptureContext` per armed transaction in a concurrent map.
//! A context is owned by exactly one logical execution; arming the same
//! transaction twice is a logic error and is logged at error level.
//! `disable` is idempotent and clears all state for the transaction.

use crate::context::{CaptureContext, QueryInfo};
use dashmap::DashMap;
use tandem_core::{EntitySnapshot, OperationRecord, OperationType, TxId};
use tracing::{debug, error};

/// Concurrent registry of capture state, keyed by transaction id.
#[derive(Default)]
pub struct CaptureEngine {
    contexts: DashMap<TxId, CaptureContext>,
}

impl CaptureEngine {
    /// Fresh engine with no armed transactions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm capture for a transaction.
    ///
    /// Returns false (and logs at error level) if the transaction is
    /// already armed; the existing context is left untouched.
    pub fn enable(&self, tx_id: TxId) -> bool {
        match self.contexts.entry(tx_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                error!(
                    target: "tandem::capture",
                    tx_id = %tx_id,
                    "capture already enabled for this transaction; second enable ignored"
                );
                false
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(CaptureContext::new());
                debug!(target: "tandem::capture", tx_id = %tx_id, "capture armed");
                true
            }
        }
    }

    /// Disarm capture and drop all state for a transaction. Idempotent.
    pub fn disable(&self, tx_id: TxId) {
        if self.contexts.remove(&tx_id).is_some() {
            debug!(target: "tandem::capture", tx_id = %tx_id, "capture disarmed");
        }
    }

    /// Whether capture is armed for a transaction.
    pub fn is_enabled(&self, tx_id: TxId) -> bool {
        self.contexts.contains_key(&tx_id)
    }

    /// Stage the pre half of a two-phase capture. No-op when not armed.
    pub fn record_pre(
        &self,
        tx_id: TxId,
        datasource: &str,
        operation_type: OperationType,
        entity_class: &str,
        entity_id: Option<String>,
        before: Option<&EntitySnapshot>,
    ) {
        if let Some(mut ctx) = self.contexts.get_mut(&tx_id) {
            ctx.record_pre(datasource, operation_type, entity_class, entity_id, before);
        }
    }

    /// Confirm the post half: attach the store-assigned key and promote
    /// the pending entry to a confirmed operation.
    pub fn confirm(
        &self,
        tx_id: TxId,
        operation_type: OperationType,
        entity_class: &str,
        entity_id: &str,
    ) {
        if let Some(mut ctx) = self.contexts.get_mut(&tx_id) {
            if !ctx.confirm(operation_type, entity_class, entity_id) {
                error!(
                    target: "tandem::capture",
                    tx_id = %tx_id,
                    entity_class,
                    entity_id,
                    op = %operation_type,
                    "post-capture with no matching pre entry"
                );
            }
        }
    }

    /// Capture a set-based or native operation in one shot.
    pub fn record_bulk(
        &self,
        tx_id: TxId,
        datasource: &str,
        operation_type: OperationType,
        entity_class: &str,
        pre_images: Vec<EntitySnapshot>,
        info: QueryInfo,
    ) {
        if let Some(mut ctx) = self.contexts.get_mut(&tx_id) {
            ctx.record_bulk(datasource, operation_type, entity_class, pre_images, info);
        }
    }

    /// Confirmed operations in stable capture order.
    pub fn confirmed_operations(&self, tx_id: TxId) -> Vec<OperationRecord> {
        self.contexts
            .get(&tx_id)
            .map(|ctx| ctx.confirmed().to_vec())
            .unwrap_or_default()
    }

    /// Drop unconfirmed pre entries after a per-store rollback. Returns
    /// how many entries were dropped.
    pub fn discard_pending(&self, tx_id: TxId) -> usize {
        self.contexts
            .get_mut(&tx_id)
            .map(|mut ctx| ctx.discard_pending())
            .unwrap_or(0)
    }

    /// How many deep-copy failures this transaction accumulated.
    pub fn snapshot_failures(&self, tx_id: TxId) -> u32 {
        self.contexts
            .get(&tx_id)
            .map(|ctx| ctx.snapshot_failures())
            .unwrap_or(0)
    }

    /// Count a deep-copy failure reported by an integration layer.
    pub fn note_snapshot_failure(&self, tx_id: TxId) {
        if let Some(mut ctx) = self.contexts.get_mut(&tx_id) {
            ctx.note_snapshot_failure();
        }
    }

    /// Drop every context. Used by process-shutdown cleanup.
    pub fn clear_all(&self) -> usize {
        let count = self.contexts.len();
        self.contexts.clear();
        count
    }
}
