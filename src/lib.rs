//! # Tandem
//!
//! A compensating distributed-transaction coordinator for business
//! services that modify more than one independent datastore in a single
//! logical unit of work. Either every per-store local transaction
//! commits, or every observable effect is undone by replaying captured
//! pre-images as inverse operations, in reverse order.
//!
//! Tandem never holds cross-store prepare locks. Consistency is restored
//! inside a bounded compensation window instead: every mutation made
//! through a transaction handle is captured with enough information to
//! invert it, the captured set is persisted to a durable transaction log
//! before the commit phase, and a background recovery worker finishes
//! whatever a crash interrupted.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem::{ExecuteOptions, MemoryDataSource, TableSchema, Tandem};
//!
//! fn main() -> tandem::TandemResult<()> {
//!     let accounts = MemoryDataSource::new("accounts_db");
//!     accounts.define_table("accounts", TableSchema::default().versioned("version"));
//!     let ledger = MemoryDataSource::new("ledger_db");
//!     ledger.define_table("entries", TableSchema::default());
//!
//!     let tandem = Tandem::builder()
//!         .register_source(Arc::new(accounts))
//!         .register_source(Arc::new(ledger))
//!         .build();
//!
//!     let options = ExecuteOptions::new("transfer")
//!         .with_lock_key("acct:1")
//!         .with_idempotency_key("req-42");
//!
//!     tandem.execute(options, |tx| {
//!         tx.update("accounts_db", "accounts", "1", |row| {
//!             row.insert("balance".into(), serde_json::json!(50));
//!         })?;
//!         tx.insert(
//!             "ledger_db",
//!             "entries",
//!             serde_json::json!({"account": "1", "amount": -50})
//!                 .as_object()
//!                 .cloned()
//!                 .unwrap(),
//!         )?;
//!         Ok(())
//!     })?;
//!
//!     tandem.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # What a failure looks like
//!
//! A business error rolls back every per-store local transaction, then
//! the compensator replays the captured operations in reverse: inserts
//! are deleted, updates and deletes get their pre-images merged or
//! re-inserted, set-based and native statements run their caller-supplied
//! inverses. The caller receives a composite error carrying the original
//! cause, the transaction id, and whether rollback fully succeeded; the
//! record under that id holds the complete story.
//!
//! Errors observed *after* the commit point never trigger compensation.
//! The stores are authoritative once every local transaction committed;
//! such errors re-raise as [`TandemError::PostCommit`].
//!
//! # Components
//!
//! | Component | Crate | Role |
//! |-----------|-------|------|
//! | Coordinator | `tandem-engine` | per-invocation lifecycle state machine |
//! | Capture engine | `tandem-capture` | snapshots every mutation for inversion |
//! | Transaction log | `tandem-store` | durable records under `txlog:` keys |
//! | Compensator | `tandem-compensation` | reverse-order inverse replay |
//! | Circuit breaker | `tandem-compensation` | suppresses compensation storms |
//! | Recovery worker | `tandem-engine` | sweeps and completes stalled records |
//! | Validator | `tandem-validation` | risk flags and pre-commit blocking |
//! | Facades | `tandem-store` | locks, idempotency, cache |

pub use tandem_engine::*;

pub mod prelude;
