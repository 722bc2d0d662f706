//! End-to-end scenarios across two datastores
//!
//! Each test wires a full engine over in-memory stores and drives one
//! complete transaction through the public API, asserting on the final
//! record, the store contents, and the error the caller sees.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tandem::{
    DataSource, EntitySnapshot, ExecuteOptions, MemoryDataSource, OperationType, TableSchema,
    Tandem, TandemConfig, TandemError, TxState,
};
use tandem_store::FaultyDataSource;

fn snap(v: serde_json::Value) -> EntitySnapshot {
    v.as_object().unwrap().clone()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_config() -> TandemConfig {
    init_tracing();
    let mut config = TandemConfig::default();
    config.compensation.rollback_retry_backoff_ms = 1;
    config.recovery.stall_timeout_ms = 50;
    config.recovery.scan_lock_wait_ms = 10;
    config
}

fn two_store_engine() -> (Tandem, MemoryDataSource, MemoryDataSource) {
    let a = MemoryDataSource::new("a_db");
    a.define_table("accounts", TableSchema::default());
    let b = MemoryDataSource::new("b_db");
    b.define_table("refs", TableSchema::default());

    let tandem = Tandem::builder()
        .with_config(fast_config())
        .register_source(Arc::new(a.clone()))
        .register_source(Arc::new(b.clone()))
        .without_recovery_thread()
        .build();
    (tandem, a, b)
}

#[test]
fn s1_happy_path_commits_both_stores() {
    let (tandem, a, b) = two_store_engine();

    let tx_id = tandem
        .execute(ExecuteOptions::new("transfer"), |tx| {
            tx.insert("a_db", "accounts", snap(json!({"id": "1", "balance": 100})))?;
            tx.insert("b_db", "refs", snap(json!({"id": "9", "txRef": "1"})))?;
            Ok(tx.tx_id())
        })
        .expect("happy path commits");

    // Both rows visible after return
    assert_eq!(
        a.find_row("accounts", "1").unwrap().unwrap().get("balance"),
        Some(&json!(100))
    );
    assert!(b.find_row("refs", "9").unwrap().is_some());

    // The record reached COMMITTED with exactly two ordered operations
    let record = tandem.record(&tx_id).unwrap().expect("record retained");
    assert_eq!(record.state, TxState::Committed);
    assert!(record.end_time.is_some());
    assert_eq!(record.operations.len(), 2);
    assert_eq!(record.operations[0].sequence, 1);
    assert_eq!(record.operations[0].datasource, "a_db");
    assert_eq!(record.operations[0].operation_type, OperationType::Insert);
    assert_eq!(record.operations[1].sequence, 2);
    assert_eq!(record.operations[1].datasource, "b_db");

    assert_eq!(tandem.metrics().total_committed, 1);
}

#[test]
fn s2_business_error_rolls_back_with_idempotent_compensation() {
    let (tandem, a, b) = two_store_engine();

    let err = tandem
        .execute(ExecuteOptions::new("transfer"), |tx| {
            tx.insert("a_db", "accounts", snap(json!({"id": "1", "balance": 100})))?;
            tx.insert("b_db", "refs", snap(json!({"id": "9", "txRef": "1"})))?;
            Err::<(), _>(TandemError::business("downstream check failed"))
        })
        .unwrap_err();

    // Composite error: original cause, tx id, rollback verdict
    let TandemError::TransactionFailed {
        tx_id,
        rollback_succeeded,
        source,
    } = &err
    else {
        panic!("expected TransactionFailed, got {err:?}");
    };
    assert!(*rollback_succeeded);
    assert!(source.to_string().contains("downstream check failed"));

    // Per-store rollback removed the rows; the INSERT inverses found them
    // already absent and counted that as success
    assert!(a.find_row("accounts", "1").unwrap().is_none());
    assert!(b.find_row("refs", "9").unwrap().is_none());

    let record = tandem.record(tx_id).unwrap().unwrap();
    assert_eq!(record.state, TxState::RolledBack);
    assert!(record.operations.iter().all(|op| op.compensated));
    assert_eq!(tandem.metrics().total_rolled_back, 1);
}

#[test]
fn s3_bulk_update_compensated_after_persisted_effects() {
    let (tandem, a, _b) = two_store_engine();
    a.insert_row("accounts", "1", snap(json!({"id": "1", "balance": 100})))
        .unwrap();
    a.insert_row("accounts", "2", snap(json!({"id": "2", "balance": 200})))
        .unwrap();

    let err = tandem
        .execute(ExecuteOptions::new("rebalance"), |tx| {
            // Set-based update applies immediately, outside the session
            // overlay; local rollback alone cannot undo it
            let touched = tx.update_where(
                "a_db",
                "accounts",
                |_| true,
                |row| {
                    row.insert("balance".into(), json!(0));
                },
            )?;
            assert_eq!(touched, 2);
            Err::<(), _>(TandemError::business("later statement failed"))
        })
        .unwrap_err();

    let tx_id = err.tx_id().expect("failure carries the tx id");
    let record = tandem.record(&tx_id).unwrap().unwrap();
    assert_eq!(record.state, TxState::RolledBack);
    assert_eq!(record.operations.len(), 1);
    assert_eq!(
        record.operations[0].operation_type,
        OperationType::BulkUpdate
    );
    assert!(record.operations[0].compensated);

    // Both pre-images merged back
    assert_eq!(
        a.find_row("accounts", "1").unwrap().unwrap().get("balance"),
        Some(&json!(100))
    );
    assert_eq!(
        a.find_row("accounts", "2").unwrap().unwrap().get("balance"),
        Some(&json!(200))
    );
}

#[test]
fn s4_validation_blocks_trigger_table_without_compensation() {
    let audited = MemoryDataSource::new("a_db");
    audited.define_table("accounts", TableSchema::default().with_triggers());
    audited
        .insert_row("accounts", "1", snap(json!({"id": "1", "balance": 100})))
        .unwrap();

    let mut config = fast_config();
    config.validation.strict_version_check = true;
    let tandem = Tandem::builder()
        .with_config(config)
        .register_source(Arc::new(audited.clone()))
        .without_recovery_thread()
        .build();

    let err = tandem
        .execute(ExecuteOptions::new("risky-update"), |tx| {
            tx.update("a_db", "accounts", "1", |row| {
                row.insert("balance".into(), json!(0));
            })?;
            Ok(())
        })
        .unwrap_err();

    let TandemError::Validation { tx_id, issues } = &err else {
        panic!("expected Validation, got {err:?}");
    };
    assert!(issues.iter().any(|m| m.contains("triggers")));

    // Per-store rollback sufficed; nothing was compensated
    let record = tandem.record(tx_id).unwrap().unwrap();
    assert_eq!(record.state, TxState::RolledBack);
    assert!(record.operations.iter().all(|op| !op.compensated));
    assert!(record
        .risk_metrics
        .contains_key(&tandem::RiskFlag::TriggerSuspected));

    // The row kept its pre-transaction state
    assert_eq!(
        audited
            .find_row("accounts", "1")
            .unwrap()
            .unwrap()
            .get("balance"),
        Some(&json!(100))
    );
}

#[test]
fn s5_recovery_worker_rolls_back_stalled_record() {
    let store = Arc::new(tandem_store::MemoryStore::new());
    let accounts = MemoryDataSource::new("a_db");
    accounts.define_table("accounts", TableSchema::default());
    accounts
        .insert_row("accounts", "5", snap(json!({"id": "5", "value": "new"})))
        .unwrap();
    let tandem = Tandem::builder()
        .with_config(fast_config())
        .with_store(store.clone())
        .register_source(Arc::new(accounts.clone()))
        .without_recovery_thread()
        .build();

    // A transaction that stalled mid-collection with one captured UPDATE,
    // planted through a log over the engine's own store
    let log = tandem_store::TransactionLog::new(store, tandem_store::LogStoreConfig::default());
    let mut record = tandem::TransactionRecord::new("stalled-update");
    record.start_time = chrono::Utc::now() - chrono::Duration::milliseconds(200);
    record.transition_to(TxState::Collecting).unwrap();
    let mut op = tandem::OperationRecord::new(1, "a_db", OperationType::Update, "accounts");
    op.entity_id = Some("5".into());
    op.snapshot = Some(snap(json!({"id": "5", "value": "old"})));
    record.append_operation(op).unwrap();
    log.save(&record).unwrap();

    let stats = tandem.force_sweep();
    assert!(stats.scanned);
    assert_eq!(stats.found, 1);
    assert_eq!(stats.recovered, 1);

    // Snapshot merged back, record closed, counter incremented
    assert_eq!(
        accounts
            .find_row("accounts", "5")
            .unwrap()
            .unwrap()
            .get("value"),
        Some(&json!("old"))
    );
    let recovered = tandem.record(&record.tx_id).unwrap().unwrap();
    assert_eq!(recovered.state, TxState::RolledBack);
    assert_eq!(tandem.recovery_metrics().successful, 1);
}

#[test]
fn s6_circuit_breaker_suppresses_compensation_storm() {
    let mem = MemoryDataSource::new("a_db");
    mem.define_table("accounts", TableSchema::default());
    mem.insert_row("accounts", "1", snap(json!({"id": "1", "balance": 100})))
        .unwrap();
    let faulty = FaultyDataSource::new(Arc::new(mem));
    // Every merge fails with a transient store error
    faulty.fail_next_merges(1_000, tandem::StoreErrorKind::Unavailable);

    let mut config = fast_config();
    config.circuit_breaker.compensation_failure_threshold = 3;
    config.circuit_breaker.recovery_window_ms = 300;
    let tandem = Tandem::builder()
        .with_config(config)
        .register_source(faulty.clone() as Arc<dyn tandem::DataSource>)
        .without_recovery_thread()
        .build();

    let err = tandem
        .execute(ExecuteOptions::new("doomed"), |tx| {
            tx.update_where(
                "a_db",
                "accounts",
                |_| true,
                |row| {
                    row.insert("balance".into(), json!(0));
                },
            )
            .ok();
            Err::<(), _>(TandemError::business("boom"))
        })
        .unwrap_err();
    let tx_id = err.tx_id().unwrap();

    // Three failing compensation attempts opened the circuit
    let attempts_after_rollback = faulty.merge_attempts();
    assert!(attempts_after_rollback >= 3);

    // While open, sweeps find the stalled record but return without
    // touching the store
    std::thread::sleep(Duration::from_millis(60));
    let stats = tandem.force_sweep();
    assert_eq!(stats.found, 1);
    assert_eq!(faulty.merge_attempts(), attempts_after_rollback);

    // After the recovery window one probe is admitted
    std::thread::sleep(Duration::from_millis(300));
    let _ = tandem.force_sweep();
    assert_eq!(faulty.merge_attempts(), attempts_after_rollback + 1);

    let record = tandem.record(&tx_id).unwrap().unwrap();
    assert_eq!(record.state, TxState::RollingBack);
}
