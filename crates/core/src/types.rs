//! Identifier types
//!
//! TxId is the opaque identifier for a logical transaction. It is assigned
//! once at creation, is immutable afterwards, and names the transaction in
//! every log line, persisted key, and error the system produces.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one logical transaction.
///
/// Wraps a v4 UUID. Serializes transparently as the UUID string so that
/// persisted keys (`txlog:<txId>`) and the wire format stay human-readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(Uuid);

impl TxId {
    /// Allocate a fresh transaction identifier.
    pub fn new() -> Self {
        TxId(Uuid::new_v4())
    }

    /// Wrap an existing UUID (recovery and test paths).
    pub fn from_uuid(id: Uuid) -> Self {
        TxId(id)
    }

    /// Parse from the canonical string form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(TxId(Uuid::parse_str(s)?))
    }

    /// Access the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
