//! Transaction coordinator
//!
//! Drives one logical transaction from entry to terminal state:
//!
//! 1. Join the enclosing transaction if one is bound to this thread.
//! 2. Claim the idempotency key and the request lock, when supplied.
//! 3. Create and persist the record, bind the context, arm capture.
//! 4. Open one local transaction per registered store and run the
//!    business callable against them.
//! 5. Flush, collect captured operations, persist, validate.
//! 6. Commit per-store transactions in deterministic order; set the
//!    atomic committed flag; mark the record COMMITTED.
//! 7. Clean up on every exit path: release lock, unbind context, disarm
//!    capture, close the observability span.
//!
//! The committed flag is the line every failure branch checks: once it is
//! set, no code path may invoke the compensator. The data stores are
//! authoritative past that point and an error is re-raised as
//! `PostCommit` instead.

use crate::config::TandemConfig;
use crate::context::{self, BoundContext};
use crate::handle::TransactionHandle;
use crate::options::ExecuteOptions;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tandem_capture::{CaptureEngine, CapturingSession};
use tandem_compensation::{Compensator, RollbackResult};
use tandem_core::{
    DataSourceRegistry, TandemError, TandemResult, TransactionRecord, TxId, TxState,
};
use tandem_store::{IdempotencyGuard, LockManager, TransactionLog};
use tandem_validation::PreCommitValidator;
use tracing::{debug, error, info, info_span, warn};

/// Snapshot of coordinator counters.
///
/// Counters use Relaxed ordering; they are observational and synchronize
/// nothing.
#[derive(Debug, Clone)]
pub struct CoordinatorMetrics {
    /// Transactions started (nested joins excluded).
    pub total_started: u64,
    /// Transactions that reached COMMITTED.
    pub total_committed: u64,
    /// Transactions that reached ROLLED_BACK.
    pub total_rolled_back: u64,
    /// Transactions that reached FAILED.
    pub total_failed: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    failed: AtomicU64,
}

/// Per-invocation coordinator over all registered stores.
pub struct Coordinator {
    config: TandemConfig,
    registry: Arc<DataSourceRegistry>,
    log: Arc<TransactionLog>,
    capture: Arc<CaptureEngine>,
    compensator: Arc<Compensator>,
    validator: Arc<PreCommitValidator>,
    locks: Arc<LockManager>,
    idempotency: Arc<IdempotencyGuard>,
    counters: Counters,
}

/// Disarmable cleanup for the panic path: the normal exits run the
/// ordered cleanup themselves and defuse this.
struct CleanupGuard<'a> {
    coordinator: &'a Coordinator,
    tx_id: TxId,
    armed: bool,
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            error!(
                target: "tandem::coordinator",
                tx_id = %self.tx_id,
                "business callable unwound; cleaning up context and capture"
            );
            context::unbind(self.tx_id);
            self.coordinator.capture.disable(self.tx_id);
        }
    }
}

impl Coordinator {
    /// Wire a coordinator over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TandemConfig,
        registry: Arc<DataSourceRegistry>,
        log: Arc<TransactionLog>,
        capture: Arc<CaptureEngine>,
        compensator: Arc<Compensator>,
        validator: Arc<PreCommitValidator>,
        locks: Arc<LockManager>,
        idempotency: Arc<IdempotencyGuard>,
    ) -> Self {
        Coordinator {
            config,
            registry,
            log,
            capture,
            compensator,
            validator,
            locks,
            idempotency,
            counters: Counters::default(),
        }
    }

    /// Run a business callable as one compensated transaction.
    ///
    /// On success the callable's value is returned and every per-store
    /// transaction has committed. On failure the error is the composite
    /// `TransactionFailed` (or one of the pre-work rejections), and the
    /// record under its tx id tells the full story.
    pub fn execute<T>(
        &self,
        options: ExecuteOptions,
        f: impl FnOnce(&mut TransactionHandle) -> TandemResult<T>,
    ) -> TandemResult<T> {
        if !self.config.enabled {
            return self.execute_passthrough(options, f);
        }

        // Nested invocation: attach to the enclosing transaction and let
        // the outer coordinator own the lifecycle
        if let Some(enclosing) = context::current() {
            debug!(
                target: "tandem::coordinator",
                tx_id = %enclosing.tx_id,
                business_key = %options.business_key,
                "joining enclosing transaction"
            );
            let mut handle = enclosing.handle.clone();
            return f(&mut handle);
        }

        // Duplicate rejection happens before any work or record exists
        if let Some(key) = &options.idempotency_key {
            self.idempotency.begin(key)?;
        }

        let lock_handle = match self.acquire_lock(&options) {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(key) = &options.idempotency_key {
                    self.idempotency.release(key);
                }
                return Err(e);
            }
        };

        // Record creation: a log store that cannot persist the record is
        // fatal, because later compensation depends on retrieving it
        let record = match self.log.create(&options.business_key) {
            Ok(record) => record,
            Err(e) => {
                if let Some(key) = &options.idempotency_key {
                    self.idempotency.release(key);
                }
                drop(lock_handle);
                return Err(e);
            }
        };
        let tx_id = record.tx_id;

        let span = info_span!(
            target: "tandem::coordinator",
            "tandem_tx",
            tx_id = %tx_id,
            business_key = %options.business_key
        );
        let span_guard = span.enter();
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        let committed = AtomicBool::new(false);
        let mut panic_guard = CleanupGuard {
            coordinator: self,
            tx_id,
            armed: true,
        };
        let result = self.run_transaction(record, &options, &committed, f);
        panic_guard.armed = false;
        drop(panic_guard);

        // Ordered cleanup, each step defended so an earlier failure
        // cannot prevent a later one: lock, context, capture, labels
        drop(lock_handle);
        context::unbind(tx_id);
        self.capture.disable(tx_id);
        drop(span_guard);

        if let Some(key) = &options.idempotency_key {
            match &result {
                // A post-commit error still committed; replays must keep
                // being rejected
                Ok(_) => self.idempotency.complete(key),
                Err(e) if e.is_post_commit() => self.idempotency.complete(key),
                Err(_) => self.idempotency.release(key),
            }
        }

        result
    }

    /// Current counter snapshot.
    pub fn metrics(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            total_started: self.counters.started.load(Ordering::Relaxed),
            total_committed: self.counters.committed.load(Ordering::Relaxed),
            total_rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            total_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn acquire_lock(
        &self,
        options: &ExecuteOptions,
    ) -> TandemResult<Option<tandem_store::LockHandle>> {
        let Some(key) = &options.lock_key else {
            return Ok(None);
        };
        if !self.locks.is_healthy() {
            warn!(
                target: "tandem::coordinator",
                lock_key = %key,
                "lock store unhealthy; proceeding without request lock"
            );
            return Ok(None);
        }
        let mut wait = self.locks.default_wait();
        if let Some(budget) = options.timeout {
            wait = wait.min(budget);
        }
        match self.locks.try_lock(key, wait, self.locks.default_lease())? {
            Some(handle) => Ok(Some(handle)),
            None => Err(TandemError::LockUnavailable {
                key: key.clone(),
                waited_ms: wait.as_millis() as u64,
            }),
        }
    }

    fn open_sessions(&self, tx_id: TxId, capture: bool) -> BTreeMap<String, CapturingSession> {
        if self.registry.is_empty() {
            warn!(
                target: "tandem::coordinator",
                tx_id = %tx_id,
                "no datasource registered; transaction runs with an empty resource set"
            );
        }
        let mut sessions = BTreeMap::new();
        for (name, source) in self.registry.iter() {
            sessions.insert(
                name.to_string(),
                CapturingSession::open(Arc::clone(&self.capture), tx_id, Arc::clone(source), capture),
            );
        }
        sessions
    }

    fn run_transaction<T>(
        &self,
        mut record: TransactionRecord,
        options: &ExecuteOptions,
        committed: &AtomicBool,
        f: impl FnOnce(&mut TransactionHandle) -> TandemResult<T>,
    ) -> TandemResult<T> {
        let tx_id = record.tx_id;
        let started_at = Instant::now();

        record.transition_to(TxState::Collecting)?;
        self.log.save(&record)?;

        self.capture.enable(tx_id);
        let handle = TransactionHandle::new(
            tx_id,
            options.business_key.clone(),
            self.open_sessions(tx_id, true),
        );
        context::bind(BoundContext {
            tx_id,
            business_key: options.business_key.clone(),
            handle: handle.clone(),
        })?;

        let business_result = f(&mut handle.clone());

        match business_result {
            Ok(value) => {
                if let Some(budget) = options.timeout {
                    let elapsed = started_at.elapsed();
                    if elapsed > budget {
                        let err = TandemError::Timeout {
                            tx_id,
                            elapsed_ms: elapsed.as_millis() as u64,
                            budget_ms: budget.as_millis() as u64,
                        };
                        return self.fail_and_compensate(record, &handle, err, committed);
                    }
                }
                self.finish_commit(record, &handle, value, committed)
            }
            Err(business_err) => {
                self.fail_and_compensate(record, &handle, business_err, committed)
            }
        }
    }

    fn finish_commit<T>(
        &self,
        mut record: TransactionRecord,
        handle: &TransactionHandle,
        value: T,
        committed: &AtomicBool,
    ) -> TandemResult<T> {
        let tx_id = record.tx_id;

        // Flush so triggers and defaults materialize into the capture,
        // then move the captured set onto the record
        if let Err(e) = handle.flush_all() {
            return self.fail_and_compensate(record, handle, e, committed);
        }
        for op in self.capture.confirmed_operations(tx_id) {
            if let Err(e) = record.append_operation(op) {
                return self.fail_and_compensate(record, handle, e, committed);
            }
        }
        if let Err(e) = record
            .transition_to(TxState::Validating)
            .and_then(|_| self.log.save(&record))
        {
            return self.fail_and_compensate(record, handle, e, committed);
        }

        let report = self.validator.validate(
            &mut record,
            self.capture.snapshot_failures(tx_id),
            Utc::now(),
        );
        for warning in report.warning_messages() {
            warn!(target: "tandem::validation", tx_id = %tx_id, %warning, "risk warning");
        }
        if !report.can_proceed() {
            return Err(self.block_on_validation(record, handle, report.error_messages()));
        }

        if let Err(e) = record
            .transition_to(TxState::Prepared)
            .and_then(|_| self.log.save(&record))
        {
            return self.fail_and_compensate(record, handle, e, committed);
        }
        if let Err(e) = record
            .transition_to(TxState::Committing)
            .and_then(|_| self.log.save(&record))
        {
            return self.fail_and_compensate(record, handle, e, committed);
        }

        let (committed_count, failure) = handle.commit_in_order();
        match failure {
            None => {
                // The authoritative line: from here on, no compensation
                committed.store(true, Ordering::SeqCst);
                match record
                    .transition_to(TxState::Committed)
                    .and_then(|_| self.log.save(&record))
                {
                    Ok(()) => {
                        self.counters.committed.fetch_add(1, Ordering::Relaxed);
                        info!(
                            target: "tandem::coordinator",
                            tx_id = %tx_id,
                            operations = record.operations.len(),
                            "transaction committed"
                        );
                        Ok(value)
                    }
                    Err(e) => {
                        // Data committed; surface the log failure without
                        // touching the stores
                        self.counters.committed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            target: "tandem::coordinator",
                            tx_id = %tx_id,
                            error = %e,
                            "record finalization failed after commit; data is authoritative"
                        );
                        Err(TandemError::post_commit(tx_id, e))
                    }
                }
            }
            Some((datasource, e)) if committed_count == 0 => {
                // Nothing durable yet: same path as a business error
                let err = TandemError::Commit {
                    datasource,
                    message: e.to_string(),
                };
                self.fail_and_compensate(record, handle, err, committed)
            }
            Some((datasource, e)) => {
                // A prior store committed; consistency cannot be restored
                // automatically
                let reason = format!(
                    "partial commit: '{}' failed after {} store(s) committed: {}",
                    datasource, committed_count, e
                );
                error!(target: "tandem::coordinator", tx_id = %tx_id, %reason, "transaction parked");
                handle.rollback_all();
                record.error_message = Some(reason);
                if let Err(save_err) = record
                    .transition_to(TxState::Failed)
                    .and_then(|_| self.log.save(&record))
                {
                    error!(
                        target: "tandem::coordinator",
                        tx_id = %tx_id,
                        error = %save_err,
                        "failed to park partially committed record"
                    );
                }
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(TandemError::PartialCommit {
                    tx_id,
                    datasource,
                    committed: committed_count,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Validation refused the commit: per-store transactions roll back
    /// and, because nothing committed, compensation is skipped entirely.
    fn block_on_validation(
        &self,
        mut record: TransactionRecord,
        handle: &TransactionHandle,
        issues: Vec<String>,
    ) -> TandemError {
        let tx_id = record.tx_id;
        warn!(
            target: "tandem::coordinator",
            tx_id = %tx_id,
            issues = issues.len(),
            "validation blocked the commit"
        );
        handle.rollback_all();
        record.error_message = Some(issues.join("; "));
        if let Err(e) = record
            .transition_to(TxState::RollingBack)
            .and_then(|_| self.log.save(&record))
            .and_then(|_| record.transition_to(TxState::RolledBack))
            .and_then(|_| self.log.save(&record))
        {
            error!(
                target: "tandem::coordinator",
                tx_id = %tx_id,
                error = %e,
                "failed to persist validation rollback"
            );
        }
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        TandemError::Validation { tx_id, issues }
    }

    /// The failure branch for everything before the committed flag.
    ///
    /// Rolls back every per-store transaction, then runs the compensator
    /// for captured operations whose effects may have escaped the local
    /// transactions. If the committed flag is set this branch refuses to
    /// compensate and re-raises as `PostCommit` instead.
    fn fail_and_compensate<T>(
        &self,
        mut record: TransactionRecord,
        handle: &TransactionHandle,
        err: TandemError,
        committed: &AtomicBool,
    ) -> TandemResult<T> {
        let tx_id = record.tx_id;

        if committed.load(Ordering::SeqCst) || err.is_post_commit() {
            error!(
                target: "tandem::coordinator",
                tx_id = %tx_id,
                error = %err,
                "error observed after commit; compensation suppressed"
            );
            return Err(if err.is_post_commit() {
                err
            } else {
                TandemError::post_commit(tx_id, err)
            });
        }

        warn!(
            target: "tandem::coordinator",
            tx_id = %tx_id,
            error = %err,
            "transaction failed; rolling back"
        );

        // The business-error path arrives before the captured set was
        // moved onto the record; compensation and recovery need it there
        if record.operations.is_empty() && !record.state.is_terminal() {
            for op in self.capture.confirmed_operations(tx_id) {
                if let Err(e) = record.append_operation(op) {
                    error!(
                        target: "tandem::coordinator",
                        tx_id = %tx_id,
                        error = %e,
                        "failed to attach captured operations to the record"
                    );
                    break;
                }
            }
        }

        handle.rollback_all();
        record.error_message = Some(err.to_string());
        if record.state != TxState::RollingBack {
            if let Err(e) = record
                .transition_to(TxState::RollingBack)
                .and_then(|_| self.log.save(&record))
            {
                error!(
                    target: "tandem::coordinator",
                    tx_id = %tx_id,
                    error = %e,
                    "failed to persist rolling-back state"
                );
            }
        }

        let rollback_succeeded = match self.compensator.rollback(&mut record) {
            RollbackResult::Completed => {
                if let Err(e) = record
                    .transition_to(TxState::RolledBack)
                    .and_then(|_| self.log.save(&record))
                {
                    error!(
                        target: "tandem::coordinator",
                        tx_id = %tx_id,
                        error = %e,
                        "failed to persist rolled-back state"
                    );
                }
                self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
                true
            }
            RollbackResult::Partial { remaining } => {
                warn!(
                    target: "tandem::coordinator",
                    tx_id = %tx_id,
                    remaining,
                    "compensation incomplete; recovery worker will resume"
                );
                record.note_retry();
                if let Err(e) = self.log.save(&record) {
                    error!(
                        target: "tandem::coordinator",
                        tx_id = %tx_id,
                        error = %e,
                        "failed to persist partial compensation state"
                    );
                }
                false
            }
            RollbackResult::CircuitOpen => {
                warn!(
                    target: "tandem::coordinator",
                    tx_id = %tx_id,
                    "compensation suppressed by open circuit; recovery worker will resume"
                );
                record.note_retry();
                if let Err(e) = self.log.save(&record) {
                    error!(
                        target: "tandem::coordinator",
                        tx_id = %tx_id,
                        error = %e,
                        "failed to persist deferred compensation state"
                    );
                }
                false
            }
            RollbackResult::Fatal { sequence, message } => {
                error!(
                    target: "tandem::coordinator",
                    tx_id = %tx_id,
                    sequence,
                    %message,
                    "fatal compensation error; transaction parked"
                );
                record.error_message = Some(format!(
                    "{}; compensation failed at operation {}: {}",
                    err, sequence, message
                ));
                if let Err(e) = record
                    .transition_to(TxState::Failed)
                    .and_then(|_| self.log.save(&record))
                {
                    error!(
                        target: "tandem::coordinator",
                        tx_id = %tx_id,
                        error = %e,
                        "failed to park record"
                    );
                }
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        };

        Err(TandemError::transaction_failed(
            tx_id,
            rollback_succeeded,
            err,
        ))
    }

    /// Master switch off: run the callable against plain sessions with no
    /// record, capture, validation, or compensation.
    fn execute_passthrough<T>(
        &self,
        options: ExecuteOptions,
        f: impl FnOnce(&mut TransactionHandle) -> TandemResult<T>,
    ) -> TandemResult<T> {
        debug!(
            target: "tandem::coordinator",
            business_key = %options.business_key,
            "coordinator disabled; passthrough execution"
        );
        let tx_id = TxId::new();
        let mut handle = TransactionHandle::new(
            tx_id,
            options.business_key,
            self.open_sessions(tx_id, false),
        );
        match f(&mut handle) {
            Ok(value) => {
                let (committed_count, failure) = handle.commit_in_order();
                if let Some((datasource, e)) = failure {
                    handle.rollback_all();
                    error!(
                        target: "tandem::coordinator",
                        datasource = %datasource,
                        committed = committed_count,
                        error = %e,
                        "passthrough commit failed"
                    );
                    return Err(TandemError::Commit {
                        datasource,
                        message: e.to_string(),
                    });
                }
                Ok(value)
            }
            Err(e) => {
                handle.rollback_all();
                Err(e)
            }
        }
    }
}
