//! Transaction handle
//!
//! What business code receives inside `execute`. The handle owns one
//! capturing session per registered datasource and exposes the mutation
//! API against them; the coordinator drives flush, commit, and rollback
//! through the same handle. Handles are cheap clones of shared state so
//! the ambient context can hold one for nested calls to attach to.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tandem_capture::{CapturingSession, QueryInfo};
use tandem_core::{EntitySnapshot, TandemError, TandemResult, TxId};

struct HandleInner {
    tx_id: TxId,
    business_key: String,
    sessions: BTreeMap<String, CapturingSession>,
}

/// Handle to the running transaction's per-store sessions.
#[derive(Clone)]
pub struct TransactionHandle {
    inner: Arc<Mutex<HandleInner>>,
}

impl TransactionHandle {
    /// Build a handle over already-opened sessions, keyed by datasource
    /// name. The BTreeMap keying fixes the commit order.
    pub(crate) fn new(
        tx_id: TxId,
        business_key: String,
        sessions: BTreeMap<String, CapturingSession>,
    ) -> Self {
        TransactionHandle {
            inner: Arc::new(Mutex::new(HandleInner {
                tx_id,
                business_key,
                sessions,
            })),
        }
    }

    /// Id of the transaction this handle belongs to.
    pub fn tx_id(&self) -> TxId {
        self.inner.lock().tx_id
    }

    /// Business label of the invocation.
    pub fn business_key(&self) -> String {
        self.inner.lock().business_key.clone()
    }

    /// Names of the stores this transaction spans, in commit order.
    pub fn datasource_names(&self) -> Vec<String> {
        self.inner.lock().sessions.keys().cloned().collect()
    }

    fn with_session<R>(
        &self,
        datasource: &str,
        f: impl FnOnce(&mut CapturingSession) -> TandemResult<R>,
    ) -> TandemResult<R> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.get_mut(datasource).ok_or_else(|| {
            TandemError::internal(format!(
                "datasource '{}' is not part of this transaction",
                datasource
            ))
        })?;
        f(session)
    }

    /// Read a row as this transaction sees it.
    pub fn get(
        &self,
        datasource: &str,
        entity_class: &str,
        entity_id: &str,
    ) -> TandemResult<Option<EntitySnapshot>> {
        self.with_session(datasource, |s| s.get(entity_class, entity_id))
    }

    /// Insert a row; returns its (possibly store-assigned) primary key.
    pub fn insert(
        &self,
        datasource: &str,
        entity_class: &str,
        row: EntitySnapshot,
    ) -> TandemResult<String> {
        self.with_session(datasource, |s| s.insert(entity_class, row))
    }

    /// Update a row in place.
    pub fn update(
        &self,
        datasource: &str,
        entity_class: &str,
        entity_id: &str,
        apply: impl FnOnce(&mut EntitySnapshot),
    ) -> TandemResult<()> {
        self.with_session(datasource, |s| s.update(entity_class, entity_id, apply))
    }

    /// Delete a row.
    pub fn delete(
        &self,
        datasource: &str,
        entity_class: &str,
        entity_id: &str,
    ) -> TandemResult<()> {
        self.with_session(datasource, |s| s.delete(entity_class, entity_id))
    }

    /// Set-based update of every row matching `filter`. Immediate.
    pub fn update_where(
        &self,
        datasource: &str,
        entity_class: &str,
        filter: impl Fn(&EntitySnapshot) -> bool,
        apply: impl Fn(&mut EntitySnapshot),
    ) -> TandemResult<u64> {
        self.with_session(datasource, |s| s.update_where(entity_class, filter, apply))
    }

    /// Set-based delete of every row matching `filter`. Immediate.
    pub fn delete_where(
        &self,
        datasource: &str,
        entity_class: &str,
        filter: impl Fn(&EntitySnapshot) -> bool,
    ) -> TandemResult<u64> {
        self.with_session(datasource, |s| s.delete_where(entity_class, filter))
    }

    /// Execute a native statement with capture detail.
    pub fn execute_native(
        &self,
        datasource: &str,
        entity_class: &str,
        statement: &str,
        params: &[Value],
        info: QueryInfo,
    ) -> TandemResult<u64> {
        self.with_session(datasource, |s| {
            s.execute_native(entity_class, statement, params, info)
        })
    }

    /// Invoke a stored procedure with capture detail.
    pub fn call_procedure(
        &self,
        datasource: &str,
        entity_class: &str,
        procedure: &str,
        params: &[Value],
        info: QueryInfo,
    ) -> TandemResult<()> {
        self.with_session(datasource, |s| {
            s.call_procedure(entity_class, procedure, params, info)
        })
    }

    /// Flush every session so generated state materializes for capture.
    pub(crate) fn flush_all(&self) -> TandemResult<()> {
        let mut inner = self.inner.lock();
        for session in inner.sessions.values_mut() {
            session.flush()?;
        }
        Ok(())
    }

    /// Commit sessions in deterministic order.
    ///
    /// Stops at the first failure and reports how many stores had already
    /// committed; the caller decides between the rollback path (zero) and
    /// the partial-commit path (nonzero).
    pub(crate) fn commit_in_order(&self) -> (usize, Option<(String, TandemError)>) {
        let mut inner = self.inner.lock();
        let mut committed = 0usize;
        for (name, session) in inner.sessions.iter_mut() {
            match session.commit() {
                Ok(()) => committed += 1,
                Err(e) => return (committed, Some((name.clone(), e))),
            }
        }
        (committed, None)
    }

    /// Roll back every session. Never fails.
    pub(crate) fn rollback_all(&self) {
        let mut inner = self.inner.lock();
        for session in inner.sessions.values_mut() {
            session.rollback();
        }
    }
}
