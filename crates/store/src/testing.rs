//! Fault-injection wrappers for resilience testing
//!
//! These wrappers let tests make a healthy store or datasource misbehave on
//! demand: refuse writes to chosen keys, report itself unhealthy, or fail
//! the next N row operations with a chosen error kind. They implement the
//! same traits as the real thing, so anything that takes a store or a
//! datasource can be exercised against failure without test-only hooks in
//! production code.

use crate::kv::KeyValueStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    DataSource, DataSourceError, EntitySnapshot, StoreErrorKind, StoreSession, TableSchema,
    TandemError, TandemResult,
};

/// Key-value store wrapper that can refuse writes and feign unhealthiness.
pub struct FlakyStore {
    inner: Arc<dyn KeyValueStore>,
    healthy: AtomicBool,
    fail_puts_containing: Mutex<Option<String>>,
    fail_values_containing: Mutex<Option<String>>,
}

impl FlakyStore {
    /// Wrap an inner store; starts fully healthy.
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        FlakyStore {
            inner,
            healthy: AtomicBool::new(true),
            fail_puts_containing: Mutex::new(None),
            fail_values_containing: Mutex::new(None),
        }
    }

    /// Make every `put` whose key contains `fragment` fail.
    pub fn fail_puts_containing(&self, fragment: impl Into<String>) {
        *self.fail_puts_containing.lock() = Some(fragment.into());
    }

    /// Make every `put` whose value contains `fragment` fail. Useful to
    /// target one specific write, such as the save of a record entering a
    /// particular state.
    pub fn fail_values_containing(&self, fragment: impl Into<String>) {
        *self.fail_values_containing.lock() = Some(fragment.into());
    }

    /// Stop injecting put failures.
    pub fn clear_put_failures(&self) {
        *self.fail_puts_containing.lock() = None;
        *self.fail_values_containing.lock() = None;
    }

    /// Toggle the health signal the facades consult.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn check_put(&self, key: &str, value: &str) -> TandemResult<()> {
        if let Some(fragment) = self.fail_puts_containing.lock().as_deref() {
            if key.contains(fragment) {
                return Err(TandemError::storage(format!(
                    "injected write failure for key '{}'",
                    key
                )));
            }
        }
        if let Some(fragment) = self.fail_values_containing.lock().as_deref() {
            if value.contains(fragment) {
                return Err(TandemError::storage(format!(
                    "injected write failure for value matching '{}'",
                    fragment
                )));
            }
        }
        Ok(())
    }
}

impl KeyValueStore for FlakyStore {
    fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> TandemResult<()> {
        self.check_put(key, &value)?;
        self.inner.put(key, value, ttl)
    }

    fn get(&self, key: &str) -> TandemResult<Option<String>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> TandemResult<bool> {
        self.inner.delete(key)
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> TandemResult<bool> {
        self.check_put(key, &value)?;
        self.inner.put_if_absent(key, value, ttl)
    }

    fn compare_and_delete(&self, key: &str, expected: &str) -> TandemResult<bool> {
        self.inner.compare_and_delete(key, expected)
    }

    fn keys_with_prefix(&self, prefix: &str) -> TandemResult<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }

    fn expire(&self, key: &str, ttl: Duration) -> TandemResult<bool> {
        self.inner.expire(key, ttl)
    }

    fn persist(&self, key: &str) -> TandemResult<bool> {
        self.inner.persist(key)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FaultPlan {
    merge_failures: u32,
    merge_kind: Option<StoreErrorKind>,
    insert_failures: u32,
    insert_kind: Option<StoreErrorKind>,
    delete_failures: u32,
    delete_kind: Option<StoreErrorKind>,
    commit_failures: u32,
}

/// Datasource wrapper that fails the next N operations of a chosen kind.
///
/// Row operations delegate to the wrapped datasource unless a fault is
/// armed; sessions delegate too, except `commit`, which can be armed to
/// fail. Attempt counters record how often each operation was tried,
/// injected failures included.
pub struct FaultyDataSource {
    inner: Arc<dyn DataSource>,
    plan: Mutex<FaultPlan>,
    merge_attempts: AtomicU32,
    insert_attempts: AtomicU32,
    delete_attempts: AtomicU32,
}

impl FaultyDataSource {
    /// Wrap an inner datasource with no faults armed.
    pub fn new(inner: Arc<dyn DataSource>) -> Arc<Self> {
        Arc::new(FaultyDataSource {
            inner,
            plan: Mutex::new(FaultPlan::default()),
            merge_attempts: AtomicU32::new(0),
            insert_attempts: AtomicU32::new(0),
            delete_attempts: AtomicU32::new(0),
        })
    }

    /// Fail the next `n` merges with the given kind.
    pub fn fail_next_merges(&self, n: u32, kind: StoreErrorKind) {
        let mut plan = self.plan.lock();
        plan.merge_failures = n;
        plan.merge_kind = Some(kind);
    }

    /// Fail the next `n` inserts with the given kind.
    pub fn fail_next_inserts(&self, n: u32, kind: StoreErrorKind) {
        let mut plan = self.plan.lock();
        plan.insert_failures = n;
        plan.insert_kind = Some(kind);
    }

    /// Fail the next `n` deletes with the given kind.
    pub fn fail_next_deletes(&self, n: u32, kind: StoreErrorKind) {
        let mut plan = self.plan.lock();
        plan.delete_failures = n;
        plan.delete_kind = Some(kind);
    }

    /// Fail the next `n` session commits.
    pub fn fail_next_commits(&self, n: u32) {
        self.plan.lock().commit_failures = n;
    }

    /// How many merges were attempted so far.
    pub fn merge_attempts(&self) -> u32 {
        self.merge_attempts.load(Ordering::SeqCst)
    }

    /// How many inserts were attempted so far.
    pub fn insert_attempts(&self) -> u32 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    /// How many deletes were attempted so far.
    pub fn delete_attempts(&self) -> u32 {
        self.delete_attempts.load(Ordering::SeqCst)
    }

    fn injected(&self, op: &str, kind: StoreErrorKind) -> DataSourceError {
        DataSourceError::new(
            self.inner.name(),
            kind,
            format!("injected {} failure", op),
        )
    }

    fn take_fault(remaining: &mut u32, kind: &Option<StoreErrorKind>) -> Option<StoreErrorKind> {
        if *remaining > 0 {
            *remaining -= 1;
            *kind
        } else {
            None
        }
    }
}

impl DataSource for FaultyDataSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn schema(&self, entity_class: &str) -> Option<TableSchema> {
        self.inner.schema(entity_class)
    }

    fn begin(&self) -> Box<dyn StoreSession> {
        let fail_commit = {
            let mut plan = self.plan.lock();
            if plan.commit_failures > 0 {
                plan.commit_failures -= 1;
                true
            } else {
                false
            }
        };
        Box::new(FaultySession {
            inner: self.inner.begin(),
            datasource: self.inner.name().to_string(),
            fail_commit,
        })
    }

    fn find_row(
        &self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, DataSourceError> {
        self.inner.find_row(entity_class, entity_id)
    }

    fn insert_row(
        &self,
        entity_class: &str,
        entity_id: &str,
        row: EntitySnapshot,
    ) -> Result<(), DataSourceError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        let fault = {
            let mut plan = self.plan.lock();
            let FaultPlan {
                insert_failures,
                insert_kind,
                ..
            } = &mut *plan;
            Self::take_fault(insert_failures, insert_kind)
        };
        if let Some(kind) = fault {
            return Err(self.injected("insert", kind));
        }
        self.inner.insert_row(entity_class, entity_id, row)
    }

    fn merge_row(
        &self,
        entity_class: &str,
        entity_id: &str,
        row: EntitySnapshot,
    ) -> Result<(), DataSourceError> {
        self.merge_attempts.fetch_add(1, Ordering::SeqCst);
        let fault = {
            let mut plan = self.plan.lock();
            let FaultPlan {
                merge_failures,
                merge_kind,
                ..
            } = &mut *plan;
            Self::take_fault(merge_failures, merge_kind)
        };
        if let Some(kind) = fault {
            return Err(self.injected("merge", kind));
        }
        self.inner.merge_row(entity_class, entity_id, row)
    }

    fn delete_row(&self, entity_class: &str, entity_id: &str) -> Result<(), DataSourceError> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        let fault = {
            let mut plan = self.plan.lock();
            let FaultPlan {
                delete_failures,
                delete_kind,
                ..
            } = &mut *plan;
            Self::take_fault(delete_failures, delete_kind)
        };
        if let Some(kind) = fault {
            return Err(self.injected("delete", kind));
        }
        self.inner.delete_row(entity_class, entity_id)
    }

    fn execute_raw(
        &self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<u64, DataSourceError> {
        self.inner.execute_raw(statement, params)
    }

    fn call_procedure(
        &self,
        name: &str,
        params: &[serde_json::Value],
    ) -> Result<(), DataSourceError> {
        self.inner.call_procedure(name, params)
    }

    fn scan(&self, entity_class: &str) -> Result<Vec<(String, EntitySnapshot)>, DataSourceError> {
        self.inner.scan(entity_class)
    }
}

struct FaultySession {
    inner: Box<dyn StoreSession>,
    datasource: String,
    fail_commit: bool,
}

impl StoreSession for FaultySession {
    fn datasource(&self) -> &str {
        self.inner.datasource()
    }

    fn get(
        &self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<Option<EntitySnapshot>, DataSourceError> {
        self.inner.get(entity_class, entity_id)
    }

    fn stage_insert(
        &mut self,
        entity_class: &str,
        row: EntitySnapshot,
    ) -> Result<String, DataSourceError> {
        self.inner.stage_insert(entity_class, row)
    }

    fn stage_update(
        &mut self,
        entity_class: &str,
        entity_id: &str,
        row: EntitySnapshot,
    ) -> Result<(), DataSourceError> {
        self.inner.stage_update(entity_class, entity_id, row)
    }

    fn stage_delete(
        &mut self,
        entity_class: &str,
        entity_id: &str,
    ) -> Result<(), DataSourceError> {
        self.inner.stage_delete(entity_class, entity_id)
    }

    fn flush(&mut self) -> Result<(), DataSourceError> {
        self.inner.flush()
    }

    fn commit(&mut self) -> Result<(), DataSourceError> {
        if self.fail_commit {
            self.inner.rollback();
            return Err(DataSourceError::new(
                &self.datasource,
                StoreErrorKind::Unavailable,
                "injected commit failure",
            ));
        }
        self.inner.commit()
    }

    fn rollback(&mut self) {
        self.inner.rollback();
    }
}
