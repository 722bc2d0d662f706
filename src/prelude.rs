//! Convenience re-exports for typical use
//!
//! ```ignore
//! use tandem::prelude::*;
//! ```

pub use tandem_engine::{
    ExecuteOptions, QueryInfo, TableSchema, Tandem, TandemConfig, TandemError, TandemResult,
    TransactionHandle, TxId, TxState,
};
