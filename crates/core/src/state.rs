//! Transaction lifecycle state machine
//!
//! States progress strictly forward along the happy path:
//!
//! ```text
//! CREATED → COLLECTING → VALIDATING → PREPARED → COMMITTING → COMMITTED
//! ```
//!
//! Any non-terminal state may divert into `ROLLING_BACK`, which resolves to
//! `ROLLED_BACK` or `FAILED`. A partial per-store commit moves `COMMITTING`
//! directly to `FAILED`. Once a terminal state is reached the state never
//! changes again; `mark_terminal` in the log store and `transition_to` on the
//! record both refuse regressions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxState {
    /// Record exists, capture not yet armed.
    Created,
    /// Business callable is running; operations are being captured.
    Collecting,
    /// Captured set is under pre-commit validation.
    Validating,
    /// Validation passed; ready to commit per-store transactions.
    Prepared,
    /// Per-store commits are in flight.
    Committing,
    /// All per-store commits succeeded. Terminal.
    Committed,
    /// Compensation is running or pending.
    RollingBack,
    /// Every observable effect was undone. Terminal.
    RolledBack,
    /// Parked for operator attention. Terminal.
    Failed,
}

impl TxState {
    /// Whether this state ends the lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack | TxState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    ///
    /// Forward-only: a terminal state permits nothing, and no transition
    /// ever moves backwards along the happy path.
    pub fn can_transition_to(&self, to: TxState) -> bool {
        if self.is_terminal() || *self == to {
            return false;
        }
        match to {
            TxState::Collecting => matches!(self, TxState::Created),
            TxState::Validating => matches!(self, TxState::Collecting),
            TxState::Prepared => matches!(self, TxState::Validating),
            TxState::Committing => matches!(self, TxState::Prepared),
            TxState::Committed => matches!(self, TxState::Committing),
            // Diversion: every non-terminal state may start rolling back
            TxState::RollingBack => true,
            TxState::RolledBack => matches!(self, TxState::RollingBack),
            // Failure is reachable from any non-terminal state: exhausted
            // recovery attempts park records regardless of where they stalled
            TxState::Failed => true,
            TxState::Created => false,
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Created => "CREATED",
            TxState::Collecting => "COLLECTING",
            TxState::Validating => "VALIDATING",
            TxState::Prepared => "PREPARED",
            TxState::Committing => "COMMITTING",
            TxState::Committed => "COMMITTED",
            TxState::RollingBack => "ROLLING_BACK",
            TxState::RolledBack => "ROLLED_BACK",
            TxState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}
