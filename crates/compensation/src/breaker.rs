//! Per-transaction circuit breaker
//!
//! Keyed by transaction id. Consecutive compensation failures above the
//! threshold open the circuit for a recovery window; while open, attempts
//! are refused without contacting the stores. When the window passes the
//! circuit goes half-open and admits exactly one probe: a successful probe
//! closes the circuit, a failing one re-opens it.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tandem_core::TxId;
use tracing::{debug, warn};

/// Breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub compensation_failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    #[serde(default = "default_recovery_window_ms")]
    pub recovery_window_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_window_ms() -> u64 {
    30_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            compensation_failure_threshold: default_failure_threshold(),
            recovery_window_ms: default_recovery_window_ms(),
        }
    }
}

/// Observable state of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Attempts flow normally.
    Closed,
    /// Attempts are refused until the recovery window passes.
    Open,
    /// One probe is admitted; its outcome decides open or closed.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        BreakerEntry {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Circuit breaker guarding compensation attempts, keyed by transaction.
pub struct CircuitBreaker {
    entries: DashMap<TxId, BreakerEntry>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Breaker with the given tuning.
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            entries: DashMap::new(),
            config,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_millis(self.config.recovery_window_ms)
    }

    /// Ask permission for one compensation attempt.
    ///
    /// Open circuits refuse until the recovery window has passed, at which
    /// point the circuit goes half-open and this call admits exactly one
    /// probe.
    pub fn try_acquire(&self, tx_id: TxId) -> bool {
        let mut entry = self.entries.entry(tx_id).or_default();
        match entry.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.window() {
                    debug!(target: "tandem::breaker", tx_id = %tx_id, "recovery window passed; admitting probe");
                    entry.state = BreakerState::HalfOpen;
                    entry.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if entry.probe_in_flight {
                    false
                } else {
                    entry.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Report a successful attempt. Closes and forgets the circuit.
    pub fn record_success(&self, tx_id: TxId) {
        self.entries.remove(&tx_id);
    }

    /// Report a failed attempt.
    pub fn record_failure(&self, tx_id: TxId) {
        let mut entry = self.entries.entry(tx_id).or_default();
        entry.consecutive_failures += 1;
        match entry.state {
            BreakerState::HalfOpen => {
                warn!(target: "tandem::breaker", tx_id = %tx_id, "probe failed; circuit re-opened");
                entry.state = BreakerState::Open;
                entry.opened_at = Some(Instant::now());
                entry.probe_in_flight = false;
            }
            BreakerState::Closed => {
                if entry.consecutive_failures >= self.config.compensation_failure_threshold {
                    warn!(
                        target: "tandem::breaker",
                        tx_id = %tx_id,
                        failures = entry.consecutive_failures,
                        "failure threshold reached; circuit opened"
                    );
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state of a transaction's circuit.
    pub fn state(&self, tx_id: TxId) -> BreakerState {
        self.entries
            .get(&tx_id)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Consecutive failures recorded for a transaction.
    pub fn failure_count(&self, tx_id: TxId) -> u32 {
        self.entries
            .get(&tx_id)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}
