//! Recovery worker
//!
//! Background sweeper that finds stalled transaction records and forces
//! them to a terminal state. One worker per cluster scans at a time,
//! coordinated by a short-lease lock on `recovery:scan-lock`; losing the
//! lock race is a silent no-op for that cycle.
//!
//! Per-record behavior:
//! - attempts budget exhausted: park as FAILED
//! - never progressed (CREATED through PREPARED): force rollback, or mark
//!   ROLLED_BACK directly when nothing was captured
//! - ROLLING_BACK: re-run the compensator, one attempt per cycle
//! - COMMITTING: a crash mid-commit; never auto-complete, park as FAILED
//!   for manual verification

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tandem_compensation::{Compensator, RollbackResult};
use tandem_core::{TransactionRecord, TxState};
use tandem_store::{keys, LockManager, TransactionLog};
use tracing::{debug, error, info, warn};

/// Recovery worker schedule and budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Whether the background worker runs at all.
    #[serde(default = "default_recovery_enabled")]
    pub enabled: bool,
    /// Fixed delay between sweep cycles.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Delay before the first sweep.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Age beyond which a non-terminal record counts as stalled.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    /// Sweep attempts per record before it is parked as FAILED.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// How long to wait for the scan lock before skipping the cycle.
    #[serde(default = "default_scan_lock_wait_ms")]
    pub scan_lock_wait_ms: u64,
    /// Lease on the scan lock.
    #[serde(default = "default_scan_lock_lease_ms")]
    pub scan_lock_lease_ms: u64,
}

fn default_recovery_enabled() -> bool {
    true
}

fn default_scan_interval_ms() -> u64 {
    60_000
}

fn default_initial_delay_ms() -> u64 {
    30_000
}

fn default_stall_timeout_ms() -> u64 {
    300_000
}

fn default_max_recovery_attempts() -> u32 {
    5
}

fn default_scan_lock_wait_ms() -> u64 {
    100
}

fn default_scan_lock_lease_ms() -> u64 {
    30_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            enabled: default_recovery_enabled(),
            scan_interval_ms: default_scan_interval_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            stall_timeout_ms: default_stall_timeout_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
            scan_lock_wait_ms: default_scan_lock_wait_ms(),
            scan_lock_lease_ms: default_scan_lock_lease_ms(),
        }
    }
}

/// Worker counters, cumulative since start.
#[derive(Debug, Clone, Default)]
pub struct RecoveryMetrics {
    /// Records the worker attempted to resolve.
    pub total_attempts: u64,
    /// Records brought to ROLLED_BACK.
    pub successful: u64,
    /// Records parked as FAILED.
    pub failed: u64,
    /// Stalled records found by the most recent scan.
    pub last_scan_found: u64,
}

/// What one sweep cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Stalled records found.
    pub found: usize,
    /// Records brought to ROLLED_BACK this cycle.
    pub recovered: usize,
    /// Records parked as FAILED this cycle.
    pub failed: usize,
    /// Whether this node won the scan lock.
    pub scanned: bool,
}

struct WorkerInner {
    log: Arc<TransactionLog>,
    compensator: Arc<Compensator>,
    locks: Arc<LockManager>,
    config: RecoveryConfig,
    total_attempts: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    last_scan_found: AtomicU64,
    shutdown: Mutex<bool>,
    shutdown_signal: Condvar,
}

impl WorkerInner {
    /// Wait up to `timeout`; returns true if shutdown was requested.
    fn wait_or_shutdown(&self, timeout: Duration) -> bool {
        let mut guard = self.shutdown.lock();
        if *guard {
            return true;
        }
        self.shutdown_signal.wait_for(&mut guard, timeout);
        *guard
    }

    fn run_cycle(&self) -> CycleStats {
        let mut stats = CycleStats::default();

        let scan_lock = match self.locks.try_lock_at(
            keys::RECOVERY_SCAN_LOCK.to_string(),
            Duration::from_millis(self.config.scan_lock_wait_ms),
            Duration::from_millis(self.config.scan_lock_lease_ms),
        ) {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                debug!(target: "tandem::recovery", "scan lock held elsewhere; skipping cycle");
                return stats;
            }
            Err(e) => {
                warn!(target: "tandem::recovery", error = %e, "scan lock unavailable; skipping cycle");
                return stats;
            }
        };
        stats.scanned = true;

        let stalled = match self
            .log
            .list_stalled(chrono::Duration::milliseconds(
                self.config.stall_timeout_ms as i64,
            )) {
            Ok(records) => records,
            Err(e) => {
                warn!(target: "tandem::recovery", error = %e, "stall scan failed");
                return stats;
            }
        };
        stats.found = stalled.len();
        self.last_scan_found
            .store(stalled.len() as u64, Ordering::Relaxed);
        if !stalled.is_empty() {
            info!(target: "tandem::recovery", found = stalled.len(), "stalled transactions found");
        }

        for record in stalled {
            self.total_attempts.fetch_add(1, Ordering::Relaxed);
            self.resolve(record, &mut stats);
        }

        drop(scan_lock);
        stats
    }

    fn resolve(&self, mut record: TransactionRecord, stats: &mut CycleStats) {
        let tx_id = record.tx_id;

        if record.retry_count >= self.config.max_recovery_attempts {
            self.park(
                record,
                "max recovery attempts exceeded",
                stats,
            );
            return;
        }

        match record.state {
            TxState::Created | TxState::Collecting | TxState::Validating | TxState::Prepared => {
                if record.operations.is_empty() {
                    // Nothing was captured, so there is nothing to undo
                    debug!(target: "tandem::recovery", tx_id = %tx_id, "stalled with no operations; closing");
                    if self.persist(record, &[TxState::RollingBack, TxState::RolledBack]) {
                        self.successful.fetch_add(1, Ordering::Relaxed);
                        stats.recovered += 1;
                    }
                } else {
                    info!(target: "tandem::recovery", tx_id = %tx_id, state = %record.state, "forcing rollback");
                    if !self.persist_step(&mut record, TxState::RollingBack) {
                        return;
                    }
                    self.compensate(record, stats);
                }
            }
            TxState::RollingBack => {
                self.compensate(record, stats);
            }
            TxState::Committing => {
                // Crash mid-commit. Some stores may have committed; the
                // worker never attempts automatic completion
                self.park(
                    record,
                    "crashed during commit; manual verification required",
                    stats,
                );
            }
            TxState::Committed | TxState::RolledBack | TxState::Failed => {
                // Terminal records are not stalled; defensive skip
            }
        }
    }

    fn compensate(&self, mut record: TransactionRecord, stats: &mut CycleStats) {
        let tx_id = record.tx_id;
        match self.compensator.rollback_once(&mut record) {
            RollbackResult::Completed => {
                if self.persist(record, &[TxState::RolledBack]) {
                    info!(target: "tandem::recovery", tx_id = %tx_id, "stalled transaction rolled back");
                    self.successful.fetch_add(1, Ordering::Relaxed);
                    stats.recovered += 1;
                }
            }
            RollbackResult::Fatal { sequence, message } => {
                self.park(
                    record,
                    &format!("compensation failed at operation {}: {}", sequence, message),
                    stats,
                );
            }
            RollbackResult::Partial { remaining } => {
                debug!(
                    target: "tandem::recovery",
                    tx_id = %tx_id,
                    remaining,
                    retry_count = record.retry_count + 1,
                    "compensation incomplete; leaving for next cycle"
                );
                record.note_retry();
                if let Err(e) = self.log.save(&record) {
                    error!(target: "tandem::recovery", tx_id = %tx_id, error = %e, "failed to persist retry state");
                }
            }
            RollbackResult::CircuitOpen => {
                debug!(
                    target: "tandem::recovery",
                    tx_id = %tx_id,
                    "circuit open; leaving for next cycle"
                );
                record.note_retry();
                if let Err(e) = self.log.save(&record) {
                    error!(target: "tandem::recovery", tx_id = %tx_id, error = %e, "failed to persist retry state");
                }
            }
        }
    }

    fn park(&self, mut record: TransactionRecord, reason: &str, stats: &mut CycleStats) {
        let tx_id = record.tx_id;
        warn!(target: "tandem::recovery", tx_id = %tx_id, reason, "parking transaction as FAILED");
        record.error_message = Some(reason.to_string());
        if self.persist(record, &[TxState::Failed]) {
            self.failed.fetch_add(1, Ordering::Relaxed);
            stats.failed += 1;
        }
    }

    fn persist_step(&self, record: &mut TransactionRecord, state: TxState) -> bool {
        if let Err(e) = record
            .transition_to(state)
            .and_then(|_| self.log.save(record))
        {
            error!(
                target: "tandem::recovery",
                tx_id = %record.tx_id,
                state = %state,
                error = %e,
                "failed to persist state step"
            );
            return false;
        }
        true
    }

    fn persist(&self, mut record: TransactionRecord, steps: &[TxState]) -> bool {
        for state in steps {
            if !self.persist_step(&mut record, *state) {
                return false;
            }
        }
        true
    }
}

/// Background sweeper for stalled transactions.
pub struct RecoveryWorker {
    inner: Arc<WorkerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryWorker {
    /// Build a worker; `start` actually spawns the thread.
    pub fn new(
        log: Arc<TransactionLog>,
        compensator: Arc<Compensator>,
        locks: Arc<LockManager>,
        config: RecoveryConfig,
    ) -> Self {
        RecoveryWorker {
            inner: Arc::new(WorkerInner {
                log,
                compensator,
                locks,
                config,
                total_attempts: AtomicU64::new(0),
                successful: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                last_scan_found: AtomicU64::new(0),
                shutdown: Mutex::new(false),
                shutdown_signal: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the sweep thread. No-op when disabled or already running.
    pub fn start(&self) {
        if !self.inner.config.enabled {
            info!(target: "tandem::recovery", "recovery worker disabled by configuration");
            return;
        }
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("tandem-recovery".to_string())
            .spawn(move || {
                let initial = Duration::from_millis(inner.config.initial_delay_ms);
                if inner.wait_or_shutdown(initial) {
                    return;
                }
                loop {
                    inner.run_cycle();
                    let interval = Duration::from_millis(inner.config.scan_interval_ms);
                    if inner.wait_or_shutdown(interval) {
                        return;
                    }
                }
            });
        match spawned {
            Ok(join) => *handle = Some(join),
            Err(e) => error!(target: "tandem::recovery", error = %e, "failed to spawn recovery worker"),
        }
    }

    /// Signal shutdown and join the sweep thread.
    pub fn stop(&self) {
        {
            let mut guard = self.inner.shutdown.lock();
            *guard = true;
            self.inner.shutdown_signal.notify_all();
        }
        if let Some(join) = self.handle.lock().take() {
            let _ = join.join();
        }
    }

    /// Run one sweep cycle on the calling thread. Used by the admin
    /// surface to force a sweep.
    pub fn run_cycle(&self) -> CycleStats {
        self.inner.run_cycle()
    }

    /// Cumulative worker counters.
    pub fn metrics(&self) -> RecoveryMetrics {
        RecoveryMetrics {
            total_attempts: self.inner.total_attempts.load(Ordering::Relaxed),
            successful: self.inner.successful.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            last_scan_found: self.inner.last_scan_found.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RecoveryWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
