//! Engine configuration
//!
//! `TandemConfig` aggregates every tunable in one document, loadable from
//! a TOML file or built in code. Each section deserializes with defaults
//! so a partial file (or none at all) yields a working configuration.

use crate::recovery::RecoveryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tandem_compensation::{BreakerConfig, CompensationConfig};
use tandem_core::{TandemError, TandemResult};
use tandem_store::{IdempotencyConfig, LockConfig, LogStoreConfig};
use tandem_validation::ValidationConfig;

/// Full configuration for a Tandem engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TandemConfig {
    /// Master switch. Off turns the coordinator into a passthrough that
    /// runs business code with no capture, log, or compensation.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Compensation retry tuning.
    #[serde(default)]
    pub compensation: CompensationConfig,
    /// Recovery worker schedule and budgets.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Transaction log durability and retention.
    #[serde(default)]
    pub log_store: LogStoreConfig,
    /// Compensation circuit breaker.
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    /// Pre-commit validation thresholds.
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Idempotency marker retention.
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    /// Default lock timing.
    #[serde(default)]
    pub lock: LockConfig,
}

fn default_enabled() -> bool {
    true
}

impl Default for TandemConfig {
    fn default() -> Self {
        TandemConfig {
            enabled: true,
            compensation: CompensationConfig::default(),
            recovery: RecoveryConfig::default(),
            log_store: LogStoreConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            validation: ValidationConfig::default(),
            idempotency: IdempotencyConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl TandemConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> TandemResult<Self> {
        toml::from_str(content)
            .map_err(|e| TandemError::config(format!("invalid configuration: {}", e)))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> TandemResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TandemError::config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// A commented default configuration document.
    pub fn default_toml() -> &'static str {
        r#"# Tandem coordinator configuration
#
# Master switch. When false the coordinator runs business code directly:
# no capture, no transaction log, no compensation.
enabled = true

[compensation]
# Compensation attempts per rollback, with exponential backoff between
# attempts (backoff = base * 2^(attempt - 1)).
max_rollback_retries = 3
rollback_retry_backoff_ms = 1000

[recovery]
# Background sweep for stalled transactions.
enabled = true
scan_interval_ms = 60000
initial_delay_ms = 30000
stall_timeout_ms = 300000
max_recovery_attempts = 5

[log_store]
# wait_for_sync makes every save confirm the record is readable before
# returning, bounded by the timeout; the timeout logs but never fails.
wait_for_sync = false
wait_for_sync_timeout_ms = 2000
retention_hours = 24

[circuit_breaker]
compensation_failure_threshold = 5
recovery_window_ms = 30000

[validation]
long_running_threshold_ms = 60000
large_batch_threshold = 500
strict_version_check = false

[idempotency]
ttl_seconds = 86400

[lock]
wait_time_ms = 500
lease_time_ms = 30000
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_toml_parses_to_defaults() {
        let parsed = TandemConfig::from_toml_str(TandemConfig::default_toml()).unwrap();
        assert!(parsed.enabled);
        assert_eq!(parsed.compensation.max_rollback_retries, 3);
        assert_eq!(parsed.recovery.scan_interval_ms, 60_000);
        assert_eq!(parsed.log_store.retention_hours, 24);
        assert_eq!(parsed.circuit_breaker.compensation_failure_threshold, 5);
        assert_eq!(parsed.idempotency.ttl_seconds, 86_400);
        assert_eq!(parsed.lock.lease_time_ms, 30_000);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let parsed = TandemConfig::from_toml_str(
            r#"
            [compensation]
            max_rollback_retries = 7
            "#,
        )
        .unwrap();
        assert!(parsed.enabled);
        assert_eq!(parsed.compensation.max_rollback_retries, 7);
        assert_eq!(parsed.compensation.rollback_retry_backoff_ms, 1000);
        assert_eq!(parsed.recovery.max_recovery_attempts, 5);
    }

    #[test]
    fn test_empty_document_is_all_defaults() {
        let parsed = TandemConfig::from_toml_str("").unwrap();
        assert!(parsed.enabled);
        assert!(!parsed.log_store.wait_for_sync);
        assert!(!parsed.validation.strict_version_check);
    }

    #[test]
    fn test_invalid_document_rejected() {
        let err = TandemConfig::from_toml_str("enabled = \"maybe\"").unwrap_err();
        assert!(matches!(err, TandemError::Config { .. }));
    }
}
