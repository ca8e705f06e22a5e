//! # Local Store
//!
//! The replica's own copy of every collection, with soft-delete semantics
//! and a change hook for the auto-sync notifier.
//!
//! ## Who Calls What
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Presentation / CLI            Sync Orchestrator                       │
//! │  ──────────────────            ─────────────────                       │
//! │  get_all(kind, false)          get_all(kind, true)   ← tombstones too  │
//! │  create / update               replace_all           ← no hooks        │
//! │  soft_delete                   mark_synced / snapshots                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  on_change hooks ──► Change Notifier (debounced auto-sync)             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation through this type increments `version` by exactly one in
//! the same transaction as the write.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::pool::Database;
use tally_core::validation::{validate_book, validate_category, validate_entry};
use tally_core::{summarize, BookSummary, Entity, EntityKind, Syncable};

// =============================================================================
// Change Events
// =============================================================================

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Created,
    Updated,
    Deleted,
}

/// Emitted after every committed create/update/delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub id: String,
    pub version: i64,
    pub op: ChangeOp,
}

type ChangeHook = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

// =============================================================================
// LocalStore
// =============================================================================

/// Validated, versioned access to the local collections.
#[derive(Clone)]
pub struct LocalStore {
    db: Database,
    hooks: Arc<RwLock<Vec<ChangeHook>>>,
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("LocalStore")
            .field("db", &self.db)
            .field("hooks", &hooks)
            .finish()
    }
}

fn validate(entity: &Entity) -> DbResult<()> {
    match entity {
        Entity::Book(b) => validate_book(b)?,
        Entity::Entry(e) => validate_entry(e)?,
        Entity::Category(c) => validate_category(c)?,
    }
    Ok(())
}

impl LocalStore {
    pub fn new(db: Database) -> Self {
        LocalStore {
            db,
            hooks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Registers a callback run after every create, update and delete.
    ///
    /// Callbacks run on the writer's task and must not block.
    /// [`replace_all`](Self::replace_all) never fires them.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        match self.hooks.write() {
            Ok(mut hooks) => hooks.push(Arc::new(callback)),
            Err(poisoned) => poisoned.into_inner().push(Arc::new(callback)),
        }
    }

    fn notify(&self, record: &Entity, op: ChangeOp) {
        let event = ChangeEvent {
            kind: record.kind(),
            id: record.id().to_string(),
            version: record.version(),
            op,
        };
        // Clone out so a hook may register further hooks.
        let hooks: Vec<ChangeHook> = match self.hooks.read() {
            Ok(h) => h.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for hook in hooks {
            hook(&event);
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// All records of one collection.
    ///
    /// `include_tombstones = false` is for presentation; the sync path always
    /// passes `true`.
    pub async fn get_all(&self, kind: EntityKind, include_tombstones: bool) -> DbResult<Vec<Entity>> {
        self.db.records(kind).list(include_tombstones).await
    }

    /// One record, tombstones included.
    pub async fn get(&self, kind: EntityKind, id: &str) -> DbResult<Option<Entity>> {
        self.db.records(kind).find(id).await
    }

    /// Like [`get`](Self::get) but a missing record is an error.
    pub async fn require(&self, kind: EntityKind, id: &str) -> DbResult<Entity> {
        self.get(kind, id)
            .await?
            .ok_or_else(|| DbError::not_found(kind.as_str(), id))
    }

    /// Live entries of one book.
    pub async fn entries_for_book(&self, book_id: &str) -> DbResult<Vec<Entity>> {
        Ok(self
            .get_all(EntityKind::Entry, false)
            .await?
            .into_iter()
            .filter(|e| e.as_entry().map(|e| e.book_id == book_id).unwrap_or(false))
            .collect())
    }

    /// Income, expense and balance of one book.
    pub async fn book_summary(&self, book_id: &str) -> DbResult<BookSummary> {
        self.require(EntityKind::Book, book_id).await?;
        let entries = self.entries_for_book(book_id).await?;
        Ok(summarize(entries.iter().filter_map(Entity::as_entry)))
    }

    // =========================================================================
    // Local mutations
    // =========================================================================

    /// Stores a new record as version 1, never synced.
    pub async fn create(&self, entity: Entity) -> DbResult<Entity> {
        validate(&entity)?;
        if entity.is_deleted() {
            return Err(DbError::Internal("cannot create a tombstone".to_string()));
        }

        let record = self.db.records(entity.kind()).insert(&entity).await?;
        info!(kind = %record.kind(), id = %record.id(), "Record created");
        self.notify(&record, ChangeOp::Created);
        Ok(record)
    }

    /// Replaces the domain fields of a stored record and bumps its version.
    ///
    /// Sync metadata on `entity` is ignored; the stored metadata is kept.
    pub async fn update(&self, entity: Entity) -> DbResult<Entity> {
        if !entity.is_deleted() {
            validate(&entity)?;
        }

        let kind = entity.kind();
        let id = entity.id().to_string();
        let record = self
            .db
            .records(kind)
            .mutate(&id, move |stored| {
                let (deleted, deleted_at) = (entity.is_deleted(), entity.meta().deleted_at);
                let mut next = entity;
                *next.meta_mut() = stored.meta().clone();
                let meta = next.meta_mut();
                meta.deleted = deleted;
                meta.deleted_at = if deleted { deleted_at } else { None };
                *stored = next;
                Ok(())
            })
            .await?;

        debug!(kind = %kind, id = %id, version = record.version(), "Record updated");
        self.notify(&record, ChangeOp::Updated);
        Ok(record)
    }

    /// Tombstones a record. Deleting a tombstone is a no-op.
    pub async fn soft_delete(&self, kind: EntityKind, id: &str) -> DbResult<Entity> {
        let current = self.require(kind, id).await?;
        if current.is_deleted() {
            debug!(kind = %kind, id = %id, "Already deleted");
            return Ok(current);
        }

        let record = self
            .db
            .records(kind)
            .mutate(id, |stored| {
                stored.mark_deleted();
                Ok(())
            })
            .await?;

        info!(kind = %kind, id = %id, version = record.version(), "Record deleted");
        self.notify(&record, ChangeOp::Deleted);
        Ok(record)
    }

    // =========================================================================
    // Sync path
    // =========================================================================

    /// Atomically overwrites a collection with merge results.
    ///
    /// `read` is what the merge started from. Records edited locally since
    /// then are not overwritten and their ids are returned; they stay
    /// unsynced for the next round.
    ///
    /// Does not validate and does not fire change hooks: the records came
    /// out of a merge, not from a person.
    pub async fn replace_all(
        &self,
        kind: EntityKind,
        read: &[Entity],
        merged: &[Entity],
    ) -> DbResult<Vec<String>> {
        let observed: HashMap<String, i64> = read
            .iter()
            .map(|e| (e.id().to_string(), e.version()))
            .collect();
        let skipped = self.db.records(kind).replace_all(merged, &observed).await?;
        if !skipped.is_empty() {
            debug!(kind = %kind, skipped = skipped.len(), "Records edited during sync kept as-is");
        }
        Ok(skipped)
    }

    /// Marks uploaded records as exchanged.
    ///
    /// Rows still at the uploaded version become clean. A record edited
    /// while the upload was in flight stays unsynced so the edit goes out
    /// next round, merged against the copy that was uploaded.
    pub async fn mark_synced(&self, kind: EntityKind, entities: &[Entity]) -> DbResult<usize> {
        let stamped = self.db.records(kind).mark_synced(entities).await?;
        if stamped < entities.len() {
            warn!(
                kind = %kind,
                stamped,
                uploaded = entities.len(),
                "Some records changed during sync"
            );
        }
        Ok(stamped)
    }

    /// Last-synced content per id, used as the field-level merge base.
    pub async fn snapshots(&self, kind: EntityKind) -> DbResult<HashMap<String, Entity>> {
        self.db.records(kind).snapshots().await
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::DbConfig;
    use chrono::Utc;
    use std::sync::Mutex;
    use tally_core::{Book, Entry, EntryKind, Money};

    async fn store() -> LocalStore {
        LocalStore::new(Database::new(DbConfig::in_memory()).await.unwrap())
    }

    fn expense(book_id: &str, cents: i64) -> Entity {
        Entry::new(book_id, EntryKind::Expense, Money::from_cents(cents), Utc::now()).into()
    }

    #[tokio::test]
    async fn test_create_starts_at_version_one() {
        let store = store().await;
        let mut book = Book::new("Household", "EUR");
        book.meta.version = 7;
        book.meta.last_synced_version = Some(7);

        let created = store.create(book.into()).await.unwrap();
        assert_eq!(created.version(), 1);
        assert_eq!(created.last_synced_version(), None);

        let loaded = store.require(EntityKind::Book, created.id()).await.unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn test_versions_strictly_increase() {
        let store = store().await;
        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();

        let mut last = book.version();
        let mut current = book;
        for name in ["Home", "House", "Flat"] {
            current.set_field("name", name.into()).unwrap();
            current = store.update(current).await.unwrap();
            assert_eq!(current.version(), last + 1);
            last = current.version();
        }

        let deleted = store.soft_delete(EntityKind::Book, current.id()).await.unwrap();
        assert_eq!(deleted.version(), last + 1);
        assert!(deleted.is_deleted());
        assert!(deleted.meta().deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_update_ignores_caller_metadata() {
        let store = store().await;
        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();

        let mut stale = book.clone();
        stale.meta_mut().version = 40;
        stale.meta_mut().last_synced_version = Some(40);
        stale.set_field("name", "Home".into()).unwrap();

        let updated = store.update(stale).await.unwrap();
        assert_eq!(updated.version(), 2);
        assert_eq!(updated.last_synced_version(), None);
        assert_eq!(updated.meta().created_at, book.meta().created_at);
    }

    #[tokio::test]
    async fn test_tombstones_hidden_from_presentation_only() {
        let store = store().await;
        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();
        let keep = store.create(expense(book.id(), 100)).await.unwrap();
        let gone = store.create(expense(book.id(), 200)).await.unwrap();
        store.soft_delete(EntityKind::Entry, gone.id()).await.unwrap();

        let visible = store.get_all(EntityKind::Entry, false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id(), keep.id());

        let all = store.get_all(EntityKind::Entry, true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.get(EntityKind::Entry, gone.id()).await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn test_soft_delete_twice_is_noop() {
        let store = store().await;
        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();
        let first = store.soft_delete(EntityKind::Book, book.id()).await.unwrap();
        let second = store.soft_delete(EntityKind::Book, book.id()).await.unwrap();
        assert_eq!(first.version(), second.version());
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let store = store().await;
        let ghost: Entity = Book::new("Ghost", "EUR").into();
        assert!(matches!(store.update(ghost).await, Err(DbError::NotFound { .. })));
        assert!(matches!(
            store.soft_delete(EntityKind::Book, "nope").await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_input() {
        let store = store().await;
        let bad: Entity = Book::new("", "EUR").into();
        assert!(matches!(store.create(bad).await, Err(DbError::Core(_))));

        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();
        assert!(store.create(expense(book.id(), 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_hooks_fire_for_local_mutations_only() {
        let store = store().await;
        let seen: Arc<Mutex<Vec<ChangeOp>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.on_change(move |e| sink.lock().unwrap().push(e.op));

        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();
        let mut edited = book.clone();
        edited.set_field("name", "Home".into()).unwrap();
        let edited = store.update(edited).await.unwrap();
        store.soft_delete(EntityKind::Book, book.id()).await.unwrap();

        let read = store.get_all(EntityKind::Book, true).await.unwrap();
        store.replace_all(EntityKind::Book, &read, &[edited]).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ChangeOp::Created, ChangeOp::Updated, ChangeOp::Deleted]
        );
    }

    #[tokio::test]
    async fn test_replace_all_overwrites_collection() {
        let store = store().await;
        let a = store.create(Book::new("A", "EUR").into()).await.unwrap();
        store.create(Book::new("B", "EUR").into()).await.unwrap();
        let read = store.get_all(EntityKind::Book, true).await.unwrap();

        let mut merged = a.clone();
        merged.meta_mut().version = 5;
        merged.meta_mut().last_synced_version = Some(4);
        let c: Entity = Book::new("C", "USD").into();

        let skipped = store
            .replace_all(EntityKind::Book, &read, &[merged.clone(), c.clone()])
            .await
            .unwrap();
        assert!(skipped.is_empty());

        let all = store.get_all(EntityKind::Book, true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.require(EntityKind::Book, a.id()).await.unwrap().version(), 5);
        assert_eq!(store.require(EntityKind::Book, c.id()).await.unwrap(), c);
    }

    #[tokio::test]
    async fn test_replace_all_keeps_edits_made_after_the_read() {
        let store = store().await;
        let a = store.create(Book::new("A", "EUR").into()).await.unwrap();
        let read = store.get_all(EntityKind::Book, true).await.unwrap();

        // Edited while the merge was running.
        let mut late = a.clone();
        late.set_field("name", "A-late".into()).unwrap();
        let late = store.update(late).await.unwrap();
        let created = store.create(Book::new("New", "EUR").into()).await.unwrap();

        let mut merged = a.clone();
        merged.set_field("name", "A-merged".into()).unwrap();
        merged.meta_mut().version = 2;
        merged.meta_mut().last_synced_version = Some(1);

        let skipped = store
            .replace_all(EntityKind::Book, &read, &[merged])
            .await
            .unwrap();
        assert_eq!(skipped, vec![a.id().to_string()]);

        let now = store.require(EntityKind::Book, a.id()).await.unwrap();
        assert_eq!(now, late);
        assert_eq!(now.field("name"), Some("A-late".into()));
        assert!(now.has_unsynced_changes());
        // Unread rows are not part of the collection being replaced.
        assert!(store.get(EntityKind::Book, created.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mark_synced_skips_records_edited_mid_round() {
        let store = store().await;
        let a = store.create(Book::new("A", "EUR").into()).await.unwrap();
        let b = store.create(Book::new("B", "EUR").into()).await.unwrap();
        let uploaded = vec![a.clone(), b.clone()];

        // Edit B after the upload snapshot was taken.
        let mut late = b.clone();
        late.set_field("name", "B2".into()).unwrap();
        store.update(late).await.unwrap();

        let stamped = store.mark_synced(EntityKind::Book, &uploaded).await.unwrap();
        assert_eq!(stamped, 1);

        let a_now = store.require(EntityKind::Book, a.id()).await.unwrap();
        let b_now = store.require(EntityKind::Book, b.id()).await.unwrap();
        assert_eq!(a_now.last_synced_version(), Some(1));
        assert!(!a_now.has_unsynced_changes());
        assert!(b_now.has_unsynced_changes());
        assert_eq!(b_now.field("name"), Some("B2".into()));
        // B's base is now the copy that was uploaded.
        assert_eq!(b_now.last_synced_version(), Some(1));

        let snapshots = store.snapshots(EntityKind::Book).await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[a.id()].field("name"), Some("A".into()));
        assert_eq!(snapshots[b.id()].field("name"), Some("B".into()));
    }

    #[tokio::test]
    async fn test_snapshot_survives_replace_all() {
        let store = store().await;
        let a = store.create(Book::new("A", "EUR").into()).await.unwrap();
        store.mark_synced(EntityKind::Book, &[a.clone()]).await.unwrap();

        let mut merged = store.require(EntityKind::Book, a.id()).await.unwrap();
        merged.set_field("name", "A2".into()).unwrap();
        merged.touch();
        let read = store.get_all(EntityKind::Book, true).await.unwrap();
        store.replace_all(EntityKind::Book, &read, &[merged]).await.unwrap();

        let snapshots = store.snapshots(EntityKind::Book).await.unwrap();
        assert_eq!(snapshots[a.id()].field("name"), Some("A".into()));
    }

    #[tokio::test]
    async fn test_book_summary() {
        let store = store().await;
        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();
        store.create(expense(book.id(), 1250)).await.unwrap();
        let income: Entity =
            Entry::new(book.id(), EntryKind::Income, Money::from_cents(5000), Utc::now()).into();
        store.create(income).await.unwrap();
        let dropped = store.create(expense(book.id(), 999)).await.unwrap();
        store.soft_delete(EntityKind::Entry, dropped.id()).await.unwrap();

        let summary = store.book_summary(book.id()).await.unwrap();
        assert_eq!(summary.expense, Money::from_cents(1250));
        assert_eq!(summary.income, Money::from_cents(5000));
        assert_eq!(summary.balance, Money::from_cents(3750));
        assert_eq!(summary.entry_count, 2);
    }
}
