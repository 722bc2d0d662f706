//! Pre-commit validation for Tandem
//!
//! Before the commit phase, the collected operation set is screened for
//! compensation risks. Each captured operation contributes zero or more
//! risk flags from a closed vocabulary; flags map to blocking errors or
//! warnings, and `can_proceed` is false exactly when a blocking error
//! exists. The validator never mutates store state; its only store contact
//! is read-only schema probes, cached per (datasource, table).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod validator;

pub use validator::{
    IssueSeverity, PreCommitValidator, ValidationConfig, ValidationIssue, ValidationReport,
};
