//! Durable transaction log
//!
//! Persists transaction records as JSON under `txlog:<txId>`. The log is
//! what makes compensation possible after a crash, so a failed write of the
//! primary record is fatal to the caller; read failures during recovery
//! scans are logged and skipped.
//!
//! Two durability modes:
//! - best-effort (default): the write returns when the store accepts it
//! - sync-wait: after the write, re-read until the value is visible or the
//!   configured timeout passes; the timeout logs but does not fail
//!
//! Retention: terminal non-failed records expire after the configured
//! window. FAILED records are duplicated under `txlog:failed:<txId>` with
//! no expiry and the primary key is persisted, so operators can always
//! find them.

use crate::keys;
use crate::kv::KeyValueStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{TandemError, TandemResult, TransactionRecord, TxId, TxState};
use tracing::{debug, warn};

/// Settings for the log store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStoreConfig {
    /// Wait for the written record to be readable before returning.
    #[serde(default)]
    pub wait_for_sync: bool,
    /// Upper bound on the sync wait.
    #[serde(default = "default_wait_for_sync_timeout_ms")]
    pub wait_for_sync_timeout_ms: u64,
    /// How long terminal non-failed records are retained.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_wait_for_sync_timeout_ms() -> u64 {
    2_000
}

fn default_retention_hours() -> u64 {
    24
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        LogStoreConfig {
            wait_for_sync: false,
            wait_for_sync_timeout_ms: default_wait_for_sync_timeout_ms(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl LogStoreConfig {
    fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }
}

/// Persistent store of transaction records.
///
/// One writer per transaction id is the system invariant; the store's
/// last-writer-wins semantics are safe under it.
pub struct TransactionLog {
    store: Arc<dyn KeyValueStore>,
    config: LogStoreConfig,
}

impl TransactionLog {
    /// Build a log over the given store.
    pub fn new(store: Arc<dyn KeyValueStore>, config: LogStoreConfig) -> Self {
        TransactionLog { store, config }
    }

    /// Insert a fresh record in state CREATED and persist it.
    pub fn create(&self, business_key: &str) -> TandemResult<TransactionRecord> {
        let record = TransactionRecord::new(business_key);
        self.save(&record)?;
        debug!(target: "tandem::txlog", tx_id = %record.tx_id, business_key, "transaction record created");
        Ok(record)
    }

    /// Serialize and write a record.
    ///
    /// Propagates store errors to the caller: losing the primary record
    /// means losing the ability to compensate, so the coordinator must not
    /// proceed past a failed save.
    pub fn save(&self, record: &TransactionRecord) -> TandemResult<()> {
        let json = serde_json::to_string(record)?;
        let key = keys::txlog(&record.tx_id);

        let ttl = if record.is_terminal() && record.state != TxState::Failed {
            Some(self.config.retention())
        } else {
            None
        };
        self.store.put(&key, json.clone(), ttl)?;

        if record.state == TxState::Failed {
            // Parked records outlive retention on both keys
            self.store.put(&keys::txlog_failed(&record.tx_id), json.clone(), None)?;
            self.store.persist(&key)?;
        }

        if self.config.wait_for_sync {
            self.await_visible(&key, &json);
        }
        Ok(())
    }

    /// Load a record by id. `Ok(None)` when absent or expired.
    pub fn load(&self, tx_id: &TxId) -> TandemResult<Option<TransactionRecord>> {
        match self.store.get(&keys::txlog(tx_id))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Load a record from the failed queue.
    pub fn load_failed(&self, tx_id: &TxId) -> TandemResult<Option<TransactionRecord>> {
        match self.store.get(&keys::txlog_failed(tx_id))? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write a record into a terminal (or rollback) state,
    /// enforcing the state machine on the stored copy.
    pub fn mark_terminal(
        &self,
        tx_id: &TxId,
        state: TxState,
        reason: Option<&str>,
    ) -> TandemResult<TransactionRecord> {
        let mut record = self.load(tx_id)?.ok_or_else(|| {
            TandemError::storage(format!("transaction record {} not found", tx_id))
        })?;
        if let Some(reason) = reason {
            record.error_message = Some(reason.to_string());
        }
        record.transition_to(state)?;
        self.save(&record)?;
        debug!(target: "tandem::txlog", tx_id = %tx_id, state = %state, "record marked");
        Ok(record)
    }

    /// Every non-terminal record older than `stall_timeout`.
    ///
    /// Corrupted entries are logged and skipped; one bad record must not
    /// hide the rest from the recovery worker. Results are ordered by
    /// start time, oldest first.
    pub fn list_stalled(
        &self,
        stall_timeout: chrono::Duration,
    ) -> TandemResult<Vec<TransactionRecord>> {
        let now = Utc::now();
        let mut stalled = Vec::new();
        for key in self.store.keys_with_prefix(keys::TXLOG_PREFIX)? {
            if keys::is_failed_key(&key) {
                continue;
            }
            let json = match self.store.get(&key) {
                Ok(Some(json)) => json,
                Ok(None) => continue,
                Err(e) => {
                    warn!(target: "tandem::txlog", key = %key, error = %e, "read failed during stall scan");
                    continue;
                }
            };
            match serde_json::from_str::<TransactionRecord>(&json) {
                Ok(record) => {
                    if record.is_stalled(now, stall_timeout) {
                        stalled.push(record);
                    }
                }
                Err(e) => {
                    warn!(target: "tandem::txlog", key = %key, error = %e, "skipping corrupted transaction record");
                }
            }
        }
        stalled.sort_by_key(|r| r.start_time);
        Ok(stalled)
    }

    /// Every record parked for manual intervention.
    pub fn list_failed(&self) -> TandemResult<Vec<TransactionRecord>> {
        let mut failed = Vec::new();
        for key in self.store.keys_with_prefix(keys::TXLOG_FAILED_PREFIX)? {
            let json = match self.store.get(&key) {
                Ok(Some(json)) => json,
                Ok(None) => continue,
                Err(e) => {
                    warn!(target: "tandem::txlog", key = %key, error = %e, "read failed during failed-queue scan");
                    continue;
                }
            };
            match serde_json::from_str::<TransactionRecord>(&json) {
                Ok(record) => failed.push(record),
                Err(e) => {
                    warn!(target: "tandem::txlog", key = %key, error = %e, "skipping corrupted failed record");
                }
            }
        }
        failed.sort_by_key(|r| r.start_time);
        Ok(failed)
    }

    /// Remove a record from the failed queue after operator resolution and
    /// expire its primary copy normally.
    pub fn resolve_failed(&self, tx_id: &TxId) -> TandemResult<bool> {
        let removed = self.store.delete(&keys::txlog_failed(tx_id))?;
        if removed {
            self.store.expire(&keys::txlog(tx_id), self.config.retention())?;
        }
        Ok(removed)
    }

    fn await_visible(&self, key: &str, expected: &str) {
        let deadline = Instant::now() + Duration::from_millis(self.config.wait_for_sync_timeout_ms);
        loop {
            match self.store.get(key) {
                Ok(Some(current)) if current == expected => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "tandem::txlog", key = %key, error = %e, "read failed during sync wait");
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    target: "tandem::txlog",
                    key,
                    timeout_ms = self.config.wait_for_sync_timeout_ms,
                    "durability acknowledgement timed out; continuing best-effort"
                );
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
