//! Per-field conflict resolution for remote sync.
//!
//! When an optimistic update is rejected, the local edit set (fields
//! changed since the last known-synced baseline) is merged against the
//! current remote record field by field: a field the remote also changed
//! goes to the remote, a field only the local writer touched stays local.
//! This preserves concurrent edits to disjoint fields from different
//! writers, unlike whole-record last-write-wins.
//!
//! Array and nested fields are compared by whole-value equality; partial
//! overlap inside them (e.g. the provenance metadata list) has no defined
//! merge and is deliberately not attempted.

use serde_json::{Map, Value};
use tracing::debug;

/// Server-managed fields that never belong in an edit set
const SERVER_FIELDS: &[&str] = &["_id", "version"];

/// What to do after merging a rejected update against the remote record
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Every local edit was superseded by the remote; adopt the remote
    /// version locally, no network write needed.
    AlreadySatisfied,
    /// Retry the update with this reduced edit set against the remote's
    /// current version.
    Retry { patch: Map<String, Value> },
}

/// The set of top-level fields in `current` that differ from `baseline`.
///
/// With no baseline (the record has never synced), every field is an
/// edit. Server-managed fields are always excluded.
pub fn edit_set(current: &Value, baseline: Option<&Value>) -> Map<String, Value> {
    let mut edits = Map::new();
    let Some(current_obj) = current.as_object() else {
        return edits;
    };

    for (field, local_value) in current_obj {
        if SERVER_FIELDS.contains(&field.as_str()) {
            continue;
        }
        let baseline_value = baseline.and_then(|b| b.get(field));
        if baseline_value != Some(local_value) {
            edits.insert(field.clone(), local_value.clone());
        }
    }
    edits
}

/// Merge a local edit set against the current remote record.
///
/// For each edited field: if the remote value diverged from the baseline
/// the edit was based on, the remote wins and the field is dropped;
/// otherwise the local value is kept. A field absent on the remote is a
/// local addition and is kept.
pub fn resolve_conflict(
    edits: &Map<String, Value>,
    baseline: Option<&Value>,
    remote: &Value,
) -> Resolution {
    let mut patch = Map::new();

    for (field, local_value) in edits {
        let remote_value = remote.get(field);
        let baseline_value = baseline.and_then(|b| b.get(field));

        match remote_value {
            // Local addition: not a conflict, keep it
            None => {
                patch.insert(field.clone(), local_value.clone());
            }
            Some(r) if Some(r) == baseline_value => {
                // Remote untouched since our baseline: local wins
                patch.insert(field.clone(), local_value.clone());
            }
            Some(r) if r == local_value => {
                // Remote already holds our value: nothing to send
                debug!(field, "Edit already applied remotely");
            }
            Some(_) => {
                // Remote diverged from the baseline: remote wins
                debug!(field, "Dropping local edit, remote changed this field");
            }
        }
    }

    if patch.is_empty() {
        Resolution::AlreadySatisfied
    } else {
        Resolution::Retry { patch }
    }
}
