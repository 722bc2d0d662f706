//! Compensation for Tandem
//!
//! The compensator replays captured operations as inverses, in strictly
//! reverse sequence order, to undo the observable effects of a failed
//! transaction. Every attempt is classified as success, retryable, or
//! fatal; fatal outcomes stop the sweep immediately, retryable ones leave
//! the operation for the next attempt or the recovery worker.
//!
//! A per-transaction circuit breaker suppresses compensation storms:
//! enough consecutive failures open the circuit and further attempts
//! return without touching the stores until the recovery window passes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod breaker;
pub mod compensator;
pub mod guard;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use compensator::{CompensationConfig, Compensator, RollbackResult};
pub use guard::{validate_inverse_statement, validate_procedure_name};
