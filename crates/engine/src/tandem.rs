//! Engine facade
//!
//! `Tandem` wires every component over one key-value store and a set of
//! registered datasources, starts the recovery worker, and exposes the
//! execute and admin surfaces. Built through `TandemBuilder`.

use crate::config::TandemConfig;
use crate::context;
use crate::coordinator::{Coordinator, CoordinatorMetrics};
use crate::handle::TransactionHandle;
use crate::options::ExecuteOptions;
use crate::recovery::{CycleStats, RecoveryMetrics, RecoveryWorker};
use std::sync::Arc;
use tandem_capture::CaptureEngine;
use tandem_compensation::{CircuitBreaker, Compensator};
use tandem_core::{
    DataSource, DataSourceRegistry, TandemResult, TransactionRecord, TxId,
};
use tandem_store::{
    CacheFacade, IdempotencyGuard, KeyValueStore, LockManager, MemoryStore, TransactionLog,
};
use tandem_validation::PreCommitValidator;
use tracing::info;

/// Builder for a `Tandem` engine.
pub struct TandemBuilder {
    config: TandemConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    sources: Vec<Arc<dyn DataSource>>,
    start_recovery: bool,
}

impl Default for TandemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TandemBuilder {
    /// Fresh builder with default configuration, an in-process store, and
    /// the recovery worker enabled.
    pub fn new() -> Self {
        TandemBuilder {
            config: TandemConfig::default(),
            store: None,
            sources: Vec::new(),
            start_recovery: true,
        }
    }

    /// Use the given configuration.
    pub fn with_config(mut self, config: TandemConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given key-value store instead of an in-process one.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a datasource the coordinator spans.
    pub fn register_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Keep the recovery worker thread unspawned; sweeps then run only
    /// through `Tandem::force_sweep`.
    pub fn without_recovery_thread(mut self) -> Self {
        self.start_recovery = false;
        self
    }

    /// Wire everything together.
    pub fn build(self) -> Tandem {
        let store: Arc<dyn KeyValueStore> =
            self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let mut registry = DataSourceRegistry::new();
        for source in self.sources {
            registry.register(source);
        }
        let registry = Arc::new(registry);

        let log = Arc::new(TransactionLog::new(
            Arc::clone(&store),
            self.config.log_store.clone(),
        ));
        let capture = Arc::new(CaptureEngine::new());
        let breaker = Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone()));
        let compensator = Arc::new(Compensator::new(
            Arc::clone(&registry),
            Arc::clone(&breaker),
            self.config.compensation.clone(),
        ));
        let validator = Arc::new(PreCommitValidator::new(
            Arc::clone(&registry),
            self.config.validation.clone(),
        ));
        let locks = Arc::new(LockManager::new(
            Arc::clone(&store),
            self.config.lock.clone(),
        ));
        let idempotency = Arc::new(IdempotencyGuard::new(
            Arc::clone(&store),
            self.config.idempotency.clone(),
        ));
        let cache = CacheFacade::new(Arc::clone(&store));

        let coordinator = Arc::new(Coordinator::new(
            self.config.clone(),
            Arc::clone(&registry),
            Arc::clone(&log),
            Arc::clone(&capture),
            Arc::clone(&compensator),
            Arc::clone(&validator),
            Arc::clone(&locks),
            Arc::clone(&idempotency),
        ));
        let recovery = Arc::new(RecoveryWorker::new(
            Arc::clone(&log),
            Arc::clone(&compensator),
            Arc::clone(&locks),
            self.config.recovery.clone(),
        ));
        if self.start_recovery {
            recovery.start();
        }

        info!(
            target: "tandem::engine",
            datasources = registry.len(),
            enabled = self.config.enabled,
            "tandem engine ready"
        );

        Tandem {
            coordinator,
            recovery,
            log,
            compensator,
            capture,
            cache,
        }
    }
}

/// The assembled engine.
pub struct Tandem {
    coordinator: Arc<Coordinator>,
    recovery: Arc<RecoveryWorker>,
    log: Arc<TransactionLog>,
    compensator: Arc<Compensator>,
    capture: Arc<CaptureEngine>,
    cache: CacheFacade,
}

impl Tandem {
    /// Start building an engine.
    pub fn builder() -> TandemBuilder {
        TandemBuilder::new()
    }

    /// Run a business callable as one compensated transaction.
    pub fn execute<T>(
        &self,
        options: ExecuteOptions,
        f: impl FnOnce(&mut TransactionHandle) -> TandemResult<T>,
    ) -> TandemResult<T> {
        self.coordinator.execute(options, f)
    }

    /// Coordinator counters.
    pub fn metrics(&self) -> CoordinatorMetrics {
        self.coordinator.metrics()
    }

    /// Recovery worker counters.
    pub fn recovery_metrics(&self) -> RecoveryMetrics {
        self.recovery.metrics()
    }

    /// Run one recovery sweep on the calling thread.
    pub fn force_sweep(&self) -> CycleStats {
        self.recovery.run_cycle()
    }

    /// Load a transaction record by id.
    pub fn record(&self, tx_id: &TxId) -> TandemResult<Option<TransactionRecord>> {
        self.log.load(tx_id)
    }

    /// Records parked for operator attention.
    pub fn failed_records(&self) -> TandemResult<Vec<TransactionRecord>> {
        self.log.list_failed()
    }

    /// Operator retry of a parked record's compensation.
    ///
    /// Returns true when every operation compensated and the record left
    /// the failed queue. The terminal FAILED state itself never changes;
    /// resolution removes the parked duplicate and lets the primary
    /// record expire through normal retention.
    pub fn retry_failed(&self, tx_id: &TxId) -> TandemResult<bool> {
        let Some(mut record) = self.log.load_failed(tx_id)? else {
            return Ok(false);
        };
        match self.compensator.rollback(&mut record) {
            r if r.is_completed() => {
                self.log.save(&record)?;
                self.log.resolve_failed(tx_id)?;
                info!(target: "tandem::engine", tx_id = %tx_id, "failed record resolved by operator retry");
                Ok(true)
            }
            _ => {
                self.log.save(&record)?;
                Ok(false)
            }
        }
    }

    /// Application cache facade. Not consulted by the transaction
    /// pipeline.
    pub fn cache(&self) -> &CacheFacade {
        &self.cache
    }

    /// Stop the recovery worker and best-effort clear any bound contexts
    /// and capture state. Call on process shutdown.
    pub fn shutdown(&self) {
        self.recovery.stop();
        let stale_contexts = context::shutdown_cleanup();
        let stale_captures = self.capture.clear_all();
        info!(
            target: "tandem::engine",
            stale_contexts,
            stale_captures,
            "tandem engine shut down"
        );
    }
}
