//! Storage layer for Tandem
//!
//! Everything durable lives behind the `KeyValueStore` trait: the
//! transaction log, the distributed lock facade, idempotency markers, and
//! the application cache all share one store with reserved key prefixes.
//! The crate ships `MemoryStore`, a sharded in-process implementation with
//! TTL support, and `MemoryDataSource`, an in-memory datasource with local
//! transactions for tests and embedded deployments.
//!
//! # Key layout
//!
//! | Prefix | Contents |
//! |--------|----------|
//! | `txlog:<txId>` | active and terminal non-failed records (TTL retention) |
//! | `txlog:failed:<txId>` | records parked for operators (no expiry) |
//! | `idemp:<key>` | idempotency markers (TTL) |
//! | `lock:<name>` | distributed locks (lease TTL) |
//! | `cache:<key>` | application cache entries (TTL) |
//! | `recovery:scan-lock` | sweep coordination lock |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod idempotency;
pub mod keys;
pub mod kv;
pub mod lock;
pub mod mem_datasource;
pub mod testing;
pub mod txlog;

pub use cache::CacheFacade;
pub use idempotency::{IdempotencyConfig, IdempotencyGuard};
pub use kv::{KeyValueStore, MemoryStore};
pub use lock::{LockConfig, LockHandle, LockManager};
pub use mem_datasource::{ExecutedStatement, MemoryDataSource, ProcedureCall};
pub use testing::{FaultyDataSource, FlakyStore};
pub use txlog::{LogStoreConfig, TransactionLog};
