//! Conflict resolution for concurrent writes to the same key.

use hivemind_core::{CoordinationError, MemoryEntry, Result};
use serde_json::Value;

/// Reconciles two versions of the same key.
///
/// Implementations must be deterministic, commutative and idempotent so
/// replicas that exchange entries in any order end up identical.
pub trait MergePolicy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// The entry to keep given the stored `current` and an `incoming` write.
    fn merge(&self, current: &MemoryEntry, incoming: &MemoryEntry) -> Result<MemoryEntry>;
}

/// Keeps the entry with the highest `(version, written_at, owner)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriterWins;

impl LastWriterWins {
    /// Pick the winner without allocating a policy object.
    pub fn pick(current: &MemoryEntry, incoming: &MemoryEntry) -> MemoryEntry {
        if incoming.supersedes(current) {
            incoming.clone()
        } else {
            current.clone()
        }
    }
}

impl MergePolicy for LastWriterWins {
    fn name(&self) -> &'static str {
        "last-writer-wins"
    }

    fn merge(&self, current: &MemoryEntry, incoming: &MemoryEntry) -> Result<MemoryEntry> {
        Ok(Self::pick(current, incoming))
    }
}

/// Field-wise union for object values, applied at every depth.
///
/// The last-writer-wins winner supplies metadata and wins conflicting
/// leaves; fields only the loser has are kept, including inside nested
/// objects. Non-object values fall back to last-writer-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralMerge;

impl MergePolicy for StructuralMerge {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn merge(&self, current: &MemoryEntry, incoming: &MemoryEntry) -> Result<MemoryEntry> {
        let (winner, loser) = if incoming.supersedes(current) {
            (incoming, current)
        } else {
            (current, incoming)
        };

        if !(winner.value.is_object() && loser.value.is_object()) {
            return Ok(winner.clone());
        }

        if winner.namespace != loser.namespace || winner.key != loser.key {
            return Err(CoordinationError::MemoryConflictResolution(format!(
                "cannot merge {}/{} with {}/{}",
                winner.namespace, winner.key, loser.namespace, loser.key
            )));
        }

        let mut merged = winner.clone();
        merged.value = merge_values(&winner.value, &loser.value);
        merged.tags.extend(loser.tags.iter().cloned());
        Ok(merged)
    }
}

/// Union of two objects, recursing where both sides hold an object.
/// Any other pair resolves to the winner's value.
fn merge_values(winner: &Value, loser: &Value) -> Value {
    let (Value::Object(win_fields), Value::Object(lose_fields)) = (winner, loser) else {
        return winner.clone();
    };
    let mut fields = lose_fields.clone();
    for (k, v) in win_fields {
        let value = match fields.get(k) {
            Some(theirs) => merge_values(v, theirs),
            None => v.clone(),
        };
        fields.insert(k.clone(), value);
    }
    Value::Object(fields)
}
