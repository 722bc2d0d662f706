//! Risk evaluation of a collected operation set

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tandem_core::{
    DataSourceRegistry, OperationType, RiskFlag, Severity, TransactionRecord,
};
use tracing::debug;

/// Validation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Transaction age that raises LONG_RUNNING.
    #[serde(default = "default_long_running_threshold_ms")]
    pub long_running_threshold_ms: u64,
    /// Captured row count that raises LARGE_BATCH.
    #[serde(default = "default_large_batch_threshold")]
    pub large_batch_threshold: usize,
    /// Escalate version-reliant risks (missing snapshots) to errors.
    #[serde(default)]
    pub strict_version_check: bool,
}

fn default_long_running_threshold_ms() -> u64 {
    60_000
}

fn default_large_batch_threshold() -> usize {
    500
}

impl Default for ValidationConfig {
    fn default() -> Self {
        ValidationConfig {
            long_running_threshold_ms: default_long_running_threshold_ms(),
            large_batch_threshold: default_large_batch_threshold(),
            strict_version_check: false,
        }
    }
}

/// How blocking an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Blocks the commit.
    Error,
    /// Surfaced but not blocking.
    Warning,
}

/// One finding about the operation set.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Whether this finding blocks the commit.
    pub severity: IssueSeverity,
    /// The originating risk flag, when one exists.
    pub flag: Option<RiskFlag>,
    /// Human-readable description.
    pub message: String,
}

/// Everything the validator found, plus the verdict.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// All findings, errors first.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// False exactly when any issue is an error.
    pub fn can_proceed(&self) -> bool {
        !self
            .issues
            .iter()
            .any(|issue| issue.severity == IssueSeverity::Error)
    }

    /// Messages of the blocking issues.
    pub fn error_messages(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Error)
            .map(|issue| issue.message.clone())
            .collect()
    }

    /// Messages of the non-blocking issues.
    pub fn warning_messages(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Warning)
            .map(|issue| issue.message.clone())
            .collect()
    }
}

/// Screens an operation set before the commit phase.
///
/// Schema probes go through the datasource's read-only metadata and are
/// cached by (datasource, table); the caches are shared across all
/// transactions and safe for concurrent use.
pub struct PreCommitValidator {
    registry: Arc<DataSourceRegistry>,
    config: ValidationConfig,
    trigger_cache: DashMap<(String, String), bool>,
    cascade_cache: DashMap<(String, String), Vec<String>>,
}

impl PreCommitValidator {
    /// Build a validator over the registered datasources.
    pub fn new(registry: Arc<DataSourceRegistry>, config: ValidationConfig) -> Self {
        PreCommitValidator {
            registry,
            config,
            trigger_cache: DashMap::new(),
            cascade_cache: DashMap::new(),
        }
    }

    /// Evaluate a record's operations.
    ///
    /// Risk counts are accumulated onto the record's `risk_metrics`; the
    /// report carries the issue list and the verdict. `snapshot_failures`
    /// is the capture engine's deep-copy failure count for this
    /// transaction.
    pub fn validate(
        &self,
        record: &mut TransactionRecord,
        snapshot_failures: u32,
        now: DateTime<Utc>,
    ) -> ValidationReport {
        let mut findings: Vec<(RiskFlag, String)> = Vec::new();
        let mut captured_rows = 0usize;

        for op in &record.operations {
            match op.operation_type {
                OperationType::Insert | OperationType::Update | OperationType::Delete => {
                    captured_rows += 1;
                }
                OperationType::BulkUpdate => {
                    captured_rows += op.affected_entities.len();
                    findings.push((
                        RiskFlag::BulkUpdate,
                        format!(
                            "set-based update of {} on '{}' captured {} pre-image(s)",
                            op.entity_class,
                            op.datasource,
                            op.affected_entities.len()
                        ),
                    ));
                }
                OperationType::BulkDelete => {
                    captured_rows += op.affected_entities.len();
                    findings.push((
                        RiskFlag::BulkDelete,
                        format!(
                            "set-based delete of {} on '{}' captured {} pre-image(s)",
                            op.entity_class,
                            op.datasource,
                            op.affected_entities.len()
                        ),
                    ));
                }
                OperationType::NativeQuery => {
                    captured_rows += op.affected_entities.len();
                    findings.push((
                        RiskFlag::NativeSql,
                        format!(
                            "native statement against '{}': {}",
                            op.datasource,
                            op.additional_info.as_deref().unwrap_or("<unrecorded>")
                        ),
                    ));
                }
                OperationType::StoredProcedure => {
                    captured_rows += op.affected_entities.len();
                    findings.push((
                        RiskFlag::StoredProcedure,
                        format!(
                            "stored procedure on '{}': {}",
                            op.datasource,
                            op.additional_info.as_deref().unwrap_or("<unrecorded>")
                        ),
                    ));
                }
            }

            if self.table_has_triggers(&op.datasource, &op.entity_class) {
                findings.push((
                    RiskFlag::TriggerSuspected,
                    format!(
                        "table '{}' on '{}' carries enabled triggers",
                        op.entity_class, op.datasource
                    ),
                ));
            }

            if matches!(
                op.operation_type,
                OperationType::Delete | OperationType::BulkDelete
            ) {
                let children = self.cascade_children(&op.datasource, &op.entity_class);
                if !children.is_empty() {
                    findings.push((
                        RiskFlag::CascadeDelete,
                        format!(
                            "deleting from '{}' cascades to {}",
                            op.entity_class,
                            children.join(", ")
                        ),
                    ));
                }
            }
        }

        if captured_rows > self.config.large_batch_threshold {
            findings.push((
                RiskFlag::LargeBatch,
                format!(
                    "{} captured rows exceed the batch threshold of {}",
                    captured_rows, self.config.large_batch_threshold
                ),
            ));
        }

        let age_ms = (now - record.start_time).num_milliseconds().max(0) as u64;
        if age_ms > self.config.long_running_threshold_ms {
            findings.push((
                RiskFlag::LongRunning,
                format!(
                    "transaction has been running {}ms (threshold {}ms)",
                    age_ms, self.config.long_running_threshold_ms
                ),
            ));
        }

        for _ in 0..snapshot_failures {
            findings.push((
                RiskFlag::SnapshotMissing,
                "a pre-image deep copy failed; the affected operation cannot be compensated"
                    .to_string(),
            ));
        }

        let mut report = ValidationReport::default();
        for (flag, message) in findings {
            record.record_risk(flag);
            let severity = self.issue_severity(flag);
            report.issues.push(ValidationIssue {
                severity,
                flag: Some(flag),
                message,
            });
        }
        report
            .issues
            .sort_by_key(|issue| issue.severity != IssueSeverity::Error);

        debug!(
            target: "tandem::validation",
            tx_id = %record.tx_id,
            issues = report.issues.len(),
            can_proceed = report.can_proceed(),
            "operation set evaluated"
        );
        report
    }

    /// Static mapping from flag severity to issue severity.
    ///
    /// CRITICAL always blocks. SNAPSHOT_MISSING blocks under strict
    /// version checking, because a missing pre-image makes the inverse
    /// unverifiable. Everything else surfaces as a warning.
    fn issue_severity(&self, flag: RiskFlag) -> IssueSeverity {
        if flag.severity() == Severity::Critical {
            return IssueSeverity::Error;
        }
        if flag == RiskFlag::SnapshotMissing && self.config.strict_version_check {
            return IssueSeverity::Error;
        }
        IssueSeverity::Warning
    }

    fn table_has_triggers(&self, datasource: &str, entity_class: &str) -> bool {
        let key = (datasource.to_string(), entity_class.to_string());
        if let Some(cached) = self.trigger_cache.get(&key) {
            return *cached;
        }
        let probed = self
            .registry
            .get(datasource)
            .and_then(|source| source.schema(entity_class))
            .map(|schema| schema.has_triggers)
            .unwrap_or(false);
        self.trigger_cache.insert(key, probed);
        probed
    }

    fn cascade_children(&self, datasource: &str, entity_class: &str) -> Vec<String> {
        let key = (datasource.to_string(), entity_class.to_string());
        if let Some(cached) = self.cascade_cache.get(&key) {
            return cached.clone();
        }
        let probed = self
            .registry
            .get(datasource)
            .and_then(|source| source.schema(entity_class))
            .map(|schema| schema.cascade_delete_children)
            .unwrap_or_default();
        self.cascade_cache.insert(key, probed.clone());
        probed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tandem_core::{DataSource, EntitySnapshot, OperationRecord, TableSchema, TxState};
    use tandem_store::MemoryDataSource;

    fn snap(v: serde_json::Value) -> EntitySnapshot {
        v.as_object().unwrap().clone()
    }

    fn registry_with(ds: MemoryDataSource) -> Arc<DataSourceRegistry> {
        let mut registry = DataSourceRegistry::new();
        registry.register(Arc::new(ds));
        Arc::new(registry)
    }

    fn record_with(ops: Vec<OperationRecord>) -> TransactionRecord {
        let mut record = TransactionRecord::new("test");
        record.transition_to(TxState::Collecting).unwrap();
        for op in ops {
            record.append_operation(op).unwrap();
        }
        record
    }

    fn plain_source() -> MemoryDataSource {
        let ds = MemoryDataSource::new("db");
        ds.define_table("orders", TableSchema::default());
        ds
    }

    #[test]
    fn test_clean_set_proceeds() {
        let validator =
            PreCommitValidator::new(registry_with(plain_source()), ValidationConfig::default());
        let mut op = OperationRecord::new(1, "db", OperationType::Insert, "orders");
        op.entity_id = Some("1".into());
        let mut record = record_with(vec![op]);

        let report = validator.validate(&mut record, 0, Utc::now());
        assert!(report.can_proceed());
        assert!(report.issues.is_empty());
        assert!(record.risk_metrics.is_empty());
    }

    #[test]
    fn test_native_sql_warns() {
        let validator =
            PreCommitValidator::new(registry_with(plain_source()), ValidationConfig::default());
        let mut op = OperationRecord::new(1, "db", OperationType::NativeQuery, "orders");
        op.additional_info = Some("UPDATE orders SET x = ?".into());
        let mut record = record_with(vec![op]);

        let report = validator.validate(&mut record, 0, Utc::now());
        assert!(report.can_proceed());
        assert_eq!(report.warning_messages().len(), 1);
        assert_eq!(record.risk_metrics[&RiskFlag::NativeSql], 1);
    }

    #[test]
    fn test_trigger_suspected_blocks() {
        let ds = MemoryDataSource::new("db");
        ds.define_table("audited", TableSchema::default().with_triggers());
        let validator = PreCommitValidator::new(registry_with(ds), ValidationConfig::default());

        let mut op = OperationRecord::new(1, "db", OperationType::Update, "audited");
        op.entity_id = Some("1".into());
        op.snapshot = Some(snap(json!({"id": "1"})));
        let mut record = record_with(vec![op]);

        let report = validator.validate(&mut record, 0, Utc::now());
        assert!(!report.can_proceed());
        assert!(report.error_messages()[0].contains("triggers"));
        assert_eq!(record.risk_metrics[&RiskFlag::TriggerSuspected], 1);
    }

    #[test]
    fn test_cascade_delete_warns_on_delete_only() {
        let ds = MemoryDataSource::new("db");
        ds.define_table(
            "orders",
            TableSchema::default().cascades_to("order_lines"),
        );
        let validator = PreCommitValidator::new(registry_with(ds), ValidationConfig::default());

        let mut delete = OperationRecord::new(1, "db", OperationType::Delete, "orders");
        delete.entity_id = Some("1".into());
        delete.snapshot = Some(snap(json!({"id": "1"})));
        let mut record = record_with(vec![delete]);
        let report = validator.validate(&mut record, 0, Utc::now());
        assert!(report
            .warning_messages()
            .iter()
            .any(|m| m.contains("cascades")));

        // An update on the same table does not raise the flag
        let mut update = OperationRecord::new(1, "db", OperationType::Update, "orders");
        update.entity_id = Some("1".into());
        update.snapshot = Some(snap(json!({"id": "1"})));
        let mut record = record_with(vec![update]);
        let report = validator.validate(&mut record, 0, Utc::now());
        assert!(!report
            .warning_messages()
            .iter()
            .any(|m| m.contains("cascades")));
    }

    #[test]
    fn test_large_batch_flag() {
        let validator = PreCommitValidator::new(
            registry_with(plain_source()),
            ValidationConfig {
                large_batch_threshold: 2,
                ..Default::default()
            },
        );
        let mut op = OperationRecord::new(1, "db", OperationType::BulkUpdate, "orders");
        op.affected_entities = vec![
            snap(json!({"id": "1"})),
            snap(json!({"id": "2"})),
            snap(json!({"id": "3"})),
        ];
        let mut record = record_with(vec![op]);

        let report = validator.validate(&mut record, 0, Utc::now());
        assert!(record.risk_metrics.contains_key(&RiskFlag::LargeBatch));
        assert!(record.risk_metrics.contains_key(&RiskFlag::BulkUpdate));
        assert!(report.can_proceed());
    }

    #[test]
    fn test_long_running_flag() {
        let validator = PreCommitValidator::new(
            registry_with(plain_source()),
            ValidationConfig {
                long_running_threshold_ms: 1_000,
                ..Default::default()
            },
        );
        let mut record = record_with(vec![]);
        record.start_time = Utc::now() - chrono::Duration::seconds(5);

        validator.validate(&mut record, 0, Utc::now());
        assert!(record.risk_metrics.contains_key(&RiskFlag::LongRunning));
    }

    #[test]
    fn test_snapshot_failures_warn_and_block_under_strict() {
        let lax =
            PreCommitValidator::new(registry_with(plain_source()), ValidationConfig::default());
        let mut record = record_with(vec![]);
        let report = lax.validate(&mut record, 2, Utc::now());
        assert!(report.can_proceed());
        assert_eq!(record.risk_metrics[&RiskFlag::SnapshotMissing], 2);

        let strict = PreCommitValidator::new(
            registry_with(plain_source()),
            ValidationConfig {
                strict_version_check: true,
                ..Default::default()
            },
        );
        let mut record = record_with(vec![]);
        let report = strict.validate(&mut record, 1, Utc::now());
        assert!(!report.can_proceed());
    }

    #[test]
    fn test_errors_sort_before_warnings() {
        let ds = MemoryDataSource::new("db");
        ds.define_table("audited", TableSchema::default().with_triggers());
        let validator = PreCommitValidator::new(registry_with(ds), ValidationConfig::default());

        // A warning-producing native op first, then a trigger-flagged update
        let mut native = OperationRecord::new(1, "db", OperationType::NativeQuery, "other");
        native.additional_info = Some("UPDATE other SET x = 1".into());
        let mut update = OperationRecord::new(2, "db", OperationType::Update, "audited");
        update.entity_id = Some("1".into());
        update.snapshot = Some(snap(json!({"id": "1"})));
        let mut record = record_with(vec![native, update]);

        let report = validator.validate(&mut record, 0, Utc::now());
        assert!(!report.can_proceed());
        assert_eq!(report.issues[0].severity, IssueSeverity::Error);
    }

    #[test]
    fn test_schema_probe_is_cached() {
        let ds = MemoryDataSource::new("db");
        ds.define_table("audited", TableSchema::default().with_triggers());
        let validator =
            PreCommitValidator::new(registry_with(ds.clone()), ValidationConfig::default());

        let mut op = OperationRecord::new(1, "db", OperationType::Update, "audited");
        op.entity_id = Some("1".into());
        op.snapshot = Some(snap(json!({"id": "1"})));
        let mut record = record_with(vec![op.clone()]);
        assert!(!validator.validate(&mut record, 0, Utc::now()).can_proceed());

        // Redefining the table without triggers does not change the cached
        // probe result
        ds.define_table("audited", TableSchema::default());
        let mut record = record_with(vec![op]);
        assert!(!validator.validate(&mut record, 0, Utc::now()).can_proceed());
    }

    #[test]
    fn test_validator_never_mutates_store_state() {
        let ds = plain_source();
        ds.insert_row("orders", "1", snap(json!({"id": "1", "total": 5})))
            .unwrap();
        let validator =
            PreCommitValidator::new(registry_with(ds.clone()), ValidationConfig::default());

        let mut op = OperationRecord::new(1, "db", OperationType::Delete, "orders");
        op.entity_id = Some("1".into());
        op.snapshot = Some(snap(json!({"id": "1", "total": 5})));
        let mut record = record_with(vec![op]);
        validator.validate(&mut record, 0, Utc::now());

        assert_eq!(ds.row_count("orders"), 1);
        assert!(ds.executed_statements().is_empty());
    }
}
