//! # Merge Engine
//!
//! Reconciles one record present on both sides of a sync round.
//!
//! ## Decision Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  base = local.lastSyncedVersion (remote's when local never synced)     │
//! │  localChanged  = local.version  > base                                 │
//! │  remoteChanged = remote.version > base                                 │
//! │                                                                         │
//! │  local  remote │ result                                                │
//! │  ──────────────┼──────────────────────────────────────────────────────  │
//! │   no     no    │ keep local                                            │
//! │   yes    no    │ fast-forward to local,  lastSynced = remote.version   │
//! │   no     yes   │ fast-forward to remote, lastSynced = local.version    │
//! │   yes    yes   │ converged? keep remote                                │
//! │                │ one side deleted? deletion wins, "deleted" conflict   │
//! │                │ else field-by-field; one-sided edits auto-merge,      │
//! │                │ two-sided edits conflict and remote wins              │
//! │                │ version = max + 1, lastSynced = remote.version        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timestamps never take part in the decision.

use std::collections::BTreeMap;

use crate::conflict::{Conflict, ConflictChoice, DELETED_FIELD};
use crate::equality::{FieldValue, StructuralEq};
use crate::error::{CoreError, CoreResult};
use crate::syncable::Syncable;
use crate::types::Entity;

/// Caller-supplied overrides for two-sided conflicts, keyed by field
/// (`deleted` for a delete/edit conflict).
pub type Resolutions = BTreeMap<String, ConflictChoice>;

/// Result of merging one record pair.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged: Entity,
    pub conflicts: Vec<Conflict>,
}

impl MergeOutcome {
    fn clean(merged: Entity) -> Self {
        MergeOutcome {
            merged,
            conflicts: Vec::new(),
        }
    }
}

/// Merges `local` with `remote` without a base snapshot or overrides.
pub fn merge(local: &Entity, remote: &Entity) -> CoreResult<MergeOutcome> {
    merge_with(local, remote, None, &Resolutions::new())
}

/// Merges `local` with `remote`.
///
/// `base` is the content of the record as last exchanged; when present,
/// fields changed on only one side are taken from that side instead of being
/// reported. `resolutions` overrides the remote-wins default for named
/// fields.
pub fn merge_with(
    local: &Entity,
    remote: &Entity,
    base: Option<&Entity>,
    resolutions: &Resolutions,
) -> CoreResult<MergeOutcome> {
    if local.kind() != remote.kind() {
        return Err(CoreError::KindMismatch {
            local: local.kind(),
            remote: remote.kind(),
        });
    }
    if local.id() != remote.id() {
        return Err(CoreError::IdMismatch {
            local: local.id().to_string(),
            remote: remote.id().to_string(),
        });
    }

    let base_version = local
        .last_synced_version()
        .or(remote.last_synced_version())
        .unwrap_or(0);
    let local_changed = local.version() > base_version;
    let remote_changed = remote.version() > base_version;

    match (local_changed, remote_changed) {
        (false, false) => Ok(MergeOutcome::clean(local.clone())),
        (true, false) => {
            let mut merged = local.clone();
            merged.meta_mut().last_synced_version = Some(remote.version());
            Ok(MergeOutcome::clean(merged))
        }
        (false, true) => {
            let mut merged = remote.clone();
            merged.meta_mut().last_synced_version = Some(local.version());
            Ok(MergeOutcome::clean(merged))
        }
        (true, true) => merge_divergent(local, remote, base, resolutions),
    }
}

fn fields_equal(a: &Entity, b: &Entity) -> bool {
    a.fields()
        .iter()
        .zip(b.fields().iter())
        .all(|((_, x), (_, y))| x.structural_eq(y))
}

fn merge_divergent(
    local: &Entity,
    remote: &Entity,
    base: Option<&Entity>,
    resolutions: &Resolutions,
) -> CoreResult<MergeOutcome> {
    let next_version = local.version().max(remote.version()) + 1;

    // Both sides arrived at the same place independently.
    if local.version() == remote.version()
        && local.is_deleted() == remote.is_deleted()
        && fields_equal(local, remote)
    {
        let mut merged = remote.clone();
        merged.meta_mut().last_synced_version = Some(remote.version());
        return Ok(MergeOutcome::clean(merged));
    }

    let finish = |mut merged: Entity, conflicts: Vec<Conflict>| {
        let meta = merged.meta_mut();
        meta.version = next_version;
        meta.last_synced_version = Some(remote.version());
        meta.updated_at = local.meta().updated_at.max(remote.meta().updated_at);
        MergeOutcome { merged, conflicts }
    };

    let base = base.filter(|b| b.kind() == local.kind() && b.id() == local.id());

    // Two tombstones: nothing left to reconcile field by field.
    if local.is_deleted() && remote.is_deleted() {
        return Ok(finish(remote.clone(), Vec::new()));
    }

    // Deletion takes precedence over edits.
    if local.is_deleted() != remote.is_deleted() {
        let (deleted, edited) = if local.is_deleted() {
            (local, remote)
        } else {
            (remote, local)
        };

        // The surviving side only bumped its version; its content is the
        // synced content, so the deletion applies silently.
        if base.map(|b| fields_equal(edited, b)).unwrap_or(false) {
            return Ok(finish(deleted.clone(), Vec::new()));
        }

        let conflict = Conflict::deletion(
            local.kind(),
            local.id(),
            local.is_deleted(),
            edited.clone(),
            local.version(),
            remote.version(),
        );
        let merged = match resolutions.get(DELETED_FIELD) {
            None => deleted.clone(),
            Some(ConflictChoice::Local) => local.clone(),
            Some(ConflictChoice::Remote) => remote.clone(),
            Some(ConflictChoice::Custom(value)) => {
                return Err(CoreError::FieldType {
                    field: DELETED_FIELD.to_string(),
                    expected: "the local or the remote side",
                    actual: value.type_name().to_string(),
                })
            }
        };
        return Ok(finish(merged, vec![conflict]));
    }

    let mut merged = remote.clone();
    let mut conflicts = Vec::new();

    for ((name, local_value), (_, remote_value)) in local.fields().into_iter().zip(remote.fields()) {
        if local_value.structural_eq(&remote_value) {
            continue;
        }

        if let Some(base_value) = base.and_then(|b| b.field(name)) {
            if local_value.structural_eq(&base_value) {
                // Only remote moved; merged already carries it.
                continue;
            }
            if remote_value.structural_eq(&base_value) {
                merged.set_field(name, local_value)?;
                continue;
            }
        }

        let chosen: Option<FieldValue> = match resolutions.get(name) {
            Some(ConflictChoice::Local) => Some(local_value.clone()),
            Some(ConflictChoice::Custom(v)) => Some(v.clone()),
            Some(ConflictChoice::Remote) | None => None,
        };

        conflicts.push(Conflict::field(
            local.kind(),
            local.id(),
            name,
            local_value,
            remote_value,
            local.version(),
            remote.version(),
        ));

        if let Some(value) = chosen {
            merged.set_field(name, value)?;
        }
    }

    Ok(finish(merged, conflicts))
}

// =============================================================================
// Unit Tests
// =============================================================================
