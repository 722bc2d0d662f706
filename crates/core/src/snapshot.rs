//! Entity snapshots
//!
//! A snapshot is the field-by-field pre-image of a row, captured before a
//! mutation so the compensator can put the row back. Snapshots are produced
//! by structural serialization, which guarantees independence from the live
//! entity: mutating the entity after capture cannot change the stored copy.

use crate::error::{TandemError, TandemResult};
use serde::Serialize;
use serde_json::Value;

/// Field-by-field state of one row.
///
/// Rows travel through the system as JSON objects; the snapshot of a row is
/// simply an owned copy of that object. `serde_json::Map` owns its values
/// recursively, so cloning one is already a deep copy.
pub type EntitySnapshot = serde_json::Map<String, Value>;

/// Produce an independent snapshot of any serializable entity.
///
/// The entity is serialized to a JSON object and the resulting tree shares
/// nothing with the source. Non-object entities (scalars, sequences) are
/// rejected: a row pre-image must have named fields to merge back.
pub fn snapshot_of<T: Serialize>(entity: &T) -> TandemResult<EntitySnapshot> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(TandemError::serialization(format!(
            "entity snapshot must be an object, got {}",
            json_type_name(&other)
        ))),
        Err(e) => Err(TandemError::serialization(format!(
            "entity snapshot failed: {}",
            e
        ))),
    }
}

/// Clear the optimistic-concurrency version field on a snapshot.
///
/// Called before a merge-back so the store treats the write as an
/// unversioned overwrite instead of failing a stale version comparison.
/// A missing field is fine; the snapshot may predate versioning.
pub fn clear_version_field(snapshot: &mut EntitySnapshot, field: &str) {
    if let Some(slot) = snapshot.get_mut(field) {
        *slot = Value::Null;
    }
}

/// Extract the primary key of a snapshot as a string.
///
/// String and integer keys are both common; everything else has no
/// canonical text form and yields `None`.
pub fn entity_id_of(snapshot: &EntitySnapshot, id_field: &str) -> Option<String> {
    match snapshot.get(id_field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
