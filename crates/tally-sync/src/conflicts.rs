//! # Conflict Surface
//!
//! Pending conflicts and their resolution.
//!
//! ```text
//! sync round ──► conflicts (default already applied) ──► sync_conflicts
//!                                                             │
//!          person picks Local | Remote | Custom(value) ◄──────┘
//!                          │
//!                          ▼
//!   apply to the local record (version + 1) ──► mark resolved ──► sync
//! ```
//!
//! For the synthetic `deleted` field, picking the edited side restores the
//! record exactly as it was edited; picking the deleted side tombstones it.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SyncOrchestrator;
use tally_core::{Conflict, ConflictChoice, ConflictValue, CoreError, Entity, Syncable};
use tally_db::{DbError, LocalStore};

/// Result of resolving one conflict.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The local record after the choice was applied.
    pub record: Entity,
    /// False when the follow-up sync did not complete; the resolution is
    /// stored locally and goes out with the next round.
    pub propagated: bool,
}

/// Pending conflicts and their resolution.
#[derive(Clone)]
pub struct ConflictSurface {
    store: LocalStore,
    orchestrator: Arc<SyncOrchestrator>,
}

impl fmt::Debug for ConflictSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictSurface").finish_non_exhaustive()
    }
}

fn choice_label(choice: &ConflictChoice) -> &'static str {
    match choice {
        ConflictChoice::Local => "local",
        ConflictChoice::Remote => "remote",
        ConflictChoice::Custom(_) => "custom",
    }
}

impl ConflictSurface {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        ConflictSurface {
            store: orchestrator.store().clone(),
            orchestrator,
        }
    }

    /// Unresolved conflicts, oldest first.
    pub async fn pending(&self) -> SyncResult<Vec<Conflict>> {
        Ok(self.store.database().conflicts().pending().await?)
    }

    /// Applies `choice` locally, marks the conflict resolved and runs a
    /// follow-up sync.
    pub async fn resolve(&self, conflict_id: &str, choice: ConflictChoice) -> SyncResult<Resolution> {
        let conflict = self
            .store
            .database()
            .conflicts()
            .find_pending(conflict_id)
            .await?
            .ok_or_else(|| DbError::not_found("conflict", conflict_id))?;

        info!(
            conflict_id = %conflict_id,
            kind = %conflict.entity_kind,
            id = %conflict.entity_id,
            field = %conflict.field,
            choice = choice_label(&choice),
            "Resolving conflict"
        );

        let record = self.apply(&conflict, &choice).await?;

        self.store
            .database()
            .conflicts()
            .mark_resolved(conflict_id, choice_label(&choice))
            .await?;

        let propagated = match self.orchestrator.run_round().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Follow-up sync did not complete");
                false
            }
        };

        Ok(Resolution { record, propagated })
    }

    /// Accepts the outcome the merge already applied.
    pub async fn dismiss(&self, conflict_id: &str) -> SyncResult<()> {
        self.store
            .database()
            .conflicts()
            .mark_resolved(conflict_id, "default")
            .await?;
        debug!(conflict_id = %conflict_id, "Conflict dismissed");
        Ok(())
    }

    async fn apply(&self, conflict: &Conflict, choice: &ConflictChoice) -> SyncResult<Entity> {
        let kind = conflict.entity_kind;
        let id = conflict.entity_id.as_str();

        match conflict.chosen(choice) {
            ConflictValue::Deleted => Ok(self.store.soft_delete(kind, id).await?),
            ConflictValue::Edited => {
                let mut restored = conflict.edited_snapshot.clone().ok_or_else(|| {
                    SyncError::Internal(format!("conflict {} has no edited copy", conflict.id))
                })?;
                restored.clear_deleted();
                Ok(self.store.update(restored).await?)
            }
            ConflictValue::Value(value) => {
                if conflict.is_deletion() {
                    return Err(CoreError::FieldType {
                        field: conflict.field.clone(),
                        expected: "the local or the remote side",
                        actual: value.type_name().to_string(),
                    }
                    .into());
                }

                let mut current = self.store.require(kind, id).await?;
                if current.is_deleted() {
                    return Err(SyncError::Internal(format!(
                        "{} {} was deleted after the conflict was recorded",
                        kind, id
                    )));
                }
                current.set_field(&conflict.field, value)?;
                Ok(self.store.update(current).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::RetryPolicy;
    use crate::remote::MemoryRemoteStore;
    use crate::session::StaticSession;
    use tally_core::{Book, EntityKind, FieldValue, Money};
    use tally_db::{Database, DbConfig};

    async fn surface(remote: &MemoryRemoteStore) -> ConflictSurface {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            LocalStore::new(db),
            Arc::new(remote.clone()),
            Arc::new(StaticSession::anonymous()),
            RetryPolicy::default(),
        );
        ConflictSurface::new(Arc::new(orchestrator))
    }

    async fn seed_field_conflict(surface: &ConflictSurface) -> (Entity, Conflict) {
        let book = surface
            .store
            .create(Book::new("Trips", "USD").into())
            .await
            .unwrap();
        let conflict = Conflict::field(
            EntityKind::Book,
            book.id(),
            "name",
            FieldValue::from("Travel"),
            FieldValue::from("Trips"),
            2,
            2,
        );
        surface
            .store
            .database()
            .conflicts()
            .record(&[conflict.clone()])
            .await
            .unwrap();
        (book, conflict)
    }

    #[tokio::test]
    async fn test_resolve_local_applies_value_and_syncs() {
        let remote = MemoryRemoteStore::new();
        let surface = surface(&remote).await;
        let (book, conflict) = seed_field_conflict(&surface).await;

        let resolution = surface
            .resolve(&conflict.id, ConflictChoice::Local)
            .await
            .unwrap();

        assert!(resolution.propagated);
        assert_eq!(resolution.record.version(), book.version() + 1);
        assert_eq!(resolution.record.field("name"), Some(FieldValue::from("Travel")));
        assert!(surface.pending().await.unwrap().is_empty());
        assert_eq!(remote.document().await.books[0]["name"], "Travel");
    }

    #[tokio::test]
    async fn test_resolve_custom_value() {
        let remote = MemoryRemoteStore::new();
        let surface = surface(&remote).await;
        let (_, conflict) = seed_field_conflict(&surface).await;

        let resolution = surface
            .resolve(&conflict.id, ConflictChoice::Custom(FieldValue::from("Holidays")))
            .await
            .unwrap();
        assert_eq!(resolution.record.field("name"), Some(FieldValue::from("Holidays")));
    }

    #[tokio::test]
    async fn test_resolve_unknown_conflict() {
        let remote = MemoryRemoteStore::new();
        let surface = surface(&remote).await;

        let err = surface.resolve("missing", ConflictChoice::Local).await.unwrap_err();
        assert!(matches!(err, SyncError::Database(DbError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_resolve_keeps_local_when_sync_fails() {
        let remote = MemoryRemoteStore::new();
        let surface = surface(&remote).await;
        let (_, conflict) = seed_field_conflict(&surface).await;

        remote.reject_auth(true).await;
        let resolution = surface
            .resolve(&conflict.id, ConflictChoice::Local)
            .await
            .unwrap();

        assert!(!resolution.propagated);
        assert!(resolution.record.has_unsynced_changes());
        assert!(surface.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_choosing_edited_side_restores_record() {
        let remote = MemoryRemoteStore::new();
        let surface = surface(&remote).await;

        let created = surface
            .store
            .create(Book::new("Trips", "USD").into())
            .await
            .unwrap();
        let mut edited = created.clone();
        edited
            .set_field("name", FieldValue::from("Summer trips"))
            .unwrap();
        let tombstone = surface
            .store
            .soft_delete(EntityKind::Book, created.id())
            .await
            .unwrap();

        let conflict = Conflict::deletion(EntityKind::Book, created.id(), false, edited, 2, 2);
        surface
            .store
            .database()
            .conflicts()
            .record(&[conflict.clone()])
            .await
            .unwrap();

        let resolution = surface
            .resolve(&conflict.id, ConflictChoice::Local)
            .await
            .unwrap();

        assert!(!resolution.record.is_deleted());
        assert_eq!(resolution.record.version(), tombstone.version() + 1);
        assert_eq!(
            resolution.record.field("name"),
            Some(FieldValue::from("Summer trips"))
        );
    }

    #[tokio::test]
    async fn test_custom_value_rejected_for_deletion() {
        let remote = MemoryRemoteStore::new();
        let surface = surface(&remote).await;
        let book = surface
            .store
            .create(Book::new("Trips", "USD").into())
            .await
            .unwrap();

        let conflict = Conflict::deletion(EntityKind::Book, book.id(), true, book.clone(), 2, 2);
        surface
            .store
            .database()
            .conflicts()
            .record(&[conflict.clone()])
            .await
            .unwrap();

        let err = surface
            .resolve(&conflict.id, ConflictChoice::Custom(Money::from_cents(1).into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Core(CoreError::FieldType { .. })));
        assert_eq!(surface.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dismiss() {
        let remote = MemoryRemoteStore::new();
        let surface = surface(&remote).await;
        let (book, conflict) = seed_field_conflict(&surface).await;

        surface.dismiss(&conflict.id).await.unwrap();
        assert!(surface.pending().await.unwrap().is_empty());

        let stored = surface.store.require(EntityKind::Book, book.id()).await.unwrap();
        assert_eq!(stored.version(), book.version());
    }
}
