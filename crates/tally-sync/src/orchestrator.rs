//! # Sync Orchestrator
//!
//! Runs one reconciliation round between the Local Store and the remote
//! document.
//!
//! ## Round
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   Idle ──► Syncing ──► Idle                                             │
//! │               │                                                         │
//! │               └──────► Error ──(next request)──► Idle ──► Syncing       │
//! │                                                                         │
//! │   1. session.refresh()                       [retried, timed out]       │
//! │   2. remote.download()                       [retried, timed out]       │
//! │   3. local get_all(kind, tombstones) + synced snapshots                 │
//! │   4. merge every id in local ∪ remote, collect conflicts                │
//! │   5. local replace_all(kind, merged), guarded by the versions read      │
//! │      in step 3; record the collection's conflicts                       │
//! │   6. remote.upload(merged, lastSyncedVersion = version)                 │
//! │                                              [retried, timed out]       │
//! │   7. local mark_synced, stamp last sync time                            │
//! │                                                                         │
//! │   A second request while Syncing is rejected, never queued.             │
//! │   401/403 is never retried: the session is invalidated.                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::session::SessionProvider;
use crate::wire::{encode_collection, RemoteDocument};
use tally_core::{merge_with, Conflict, Entity, EntityKind, Resolutions, Syncable};
use tally_db::LocalStore;

// =============================================================================
// State
// =============================================================================

/// Orchestrator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Error => write!(f, "error"),
        }
    }
}

/// Retry and timeout policy for network operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per network operation, the first one included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        RetryPolicy {
            max_attempts: config.sync.max_attempts.max(1),
            initial_backoff: config.sync.initial_backoff(),
            max_backoff: config.sync.max_backoff(),
            attempt_timeout: config.request_timeout(),
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// What one successful round did.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// Conflicts detected this round; already applied with their default.
    pub conflicts: Vec<Conflict>,
    /// Records taken from the remote side.
    pub pulled: usize,
    /// Local changes sent up.
    pub pushed: usize,
    /// Records changed on both sides.
    pub merged: usize,
    /// Remote records carried through without being decoded.
    pub undecodable: usize,
    /// Records in the uploaded document.
    pub uploaded: usize,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tracker {
    last_error: Option<String>,
    last_report: Option<RoundReport>,
}

/// Clears the single-flight flag however the round ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// One orchestrator per signed-in session.
pub struct SyncOrchestrator {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn SessionProvider>,
    policy: RetryPolicy,
    syncing: AtomicBool,
    state: RwLock<SyncState>,
    tracker: RwLock<Tracker>,
}

impl fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("remote", &self.remote.name())
            .field("policy", &self.policy)
            .field("syncing", &self.syncing.load(Ordering::Acquire))
            .finish()
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteStore>,
        session: Arc<dyn SessionProvider>,
        policy: RetryPolicy,
    ) -> Self {
        SyncOrchestrator {
            store,
            remote,
            session,
            policy,
            syncing: AtomicBool::new(false),
            state: RwLock::new(SyncState::Idle),
            tracker: RwLock::new(Tracker::default()),
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn session(&self) -> &Arc<dyn SessionProvider> {
        &self.session
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> SyncState {
        *self.state.read().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.tracker.read().await.last_error.clone()
    }

    pub async fn last_report(&self) -> Option<RoundReport> {
        self.tracker.read().await.last_report.clone()
    }

    /// Runs one round.
    ///
    /// ## Returns
    /// * `Err(SyncError::AlreadySyncing)` - another round holds the lock
    /// * `Err(SyncError::Auth)` - the credential was refused; the session
    ///   has been invalidated
    pub async fn run_round(&self) -> SyncResult<RoundReport> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync requested while a round is running");
            return Err(SyncError::AlreadySyncing);
        }
        let _guard = FlightGuard(&self.syncing);

        {
            let mut state = self.state.write().await;
            if *state == SyncState::Error {
                debug!("Leaving error state");
                *state = SyncState::Idle;
            }
            *state = SyncState::Syncing;
        }

        let span = info_span!("sync_round", remote = self.remote.name());
        let result = self.round().instrument(span).await;

        let mut tracker = self.tracker.write().await;
        match &result {
            Ok(report) => {
                info!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    merged = report.merged,
                    conflicts = report.conflicts.len(),
                    "Sync round complete"
                );
                tracker.last_error = None;
                tracker.last_report = Some(report.clone());
                *self.state.write().await = SyncState::Idle;
            }
            Err(e) => {
                if e.is_auth_error() {
                    warn!(error = %e, "Remote refused the credential, signing out");
                    self.session.invalidate().await;
                } else {
                    error!(error = %e, "Sync round failed");
                }
                tracker.last_error = Some(e.to_string());
                *self.state.write().await = SyncState::Error;
            }
        }

        result
    }

    async fn round(&self) -> SyncResult<RoundReport> {
        let credential = self
            .with_retry("refresh session", || self.session.refresh())
            .await?;
        let token = credential.access_token.as_str();

        let document = self
            .with_retry("download", || self.remote.download(token))
            .await?;
        debug!(
            records = document.record_count(),
            last_sync_at = ?document.last_sync_at,
            "Remote document downloaded"
        );

        let mut report = RoundReport::default();
        let mut outgoing = RemoteDocument::default();
        let mut exchanged: Vec<(EntityKind, Vec<Entity>)> = Vec::with_capacity(EntityKind::ALL.len());

        for kind in EntityKind::ALL {
            let decoded = document.decode(kind);
            report.undecodable += decoded.undecodable.len();

            let local = self.store.get_all(kind, true).await?;
            let snapshots = self.store.snapshots(kind).await?;
            let first_conflict = report.conflicts.len();
            let merged = merge_collection(kind, &local, &decoded.records, &snapshots, &mut report)?;

            let skipped: HashSet<String> = self
                .store
                .replace_all(kind, &local, &merged)
                .await?
                .into_iter()
                .collect();

            // A record edited mid-round is merged again next round, so its
            // conflicts are not final yet.
            let mut detected = report.conflicts.split_off(first_conflict);
            detected.retain(|c| !skipped.contains(&c.entity_id));
            if !detected.is_empty() {
                self.store.database().conflicts().record(&detected).await?;
            }
            report.conflicts.extend(detected);

            let mut sent = Vec::with_capacity(merged.len());
            let mut stamped = Vec::with_capacity(merged.len());
            for mut record in merged {
                if skipped.contains(record.id()) {
                    // Leave the remote copy as it was.
                    if let Some(original) = decoded.records.iter().find(|r| r.id() == record.id()) {
                        sent.push(original.clone());
                    }
                    continue;
                }
                let version = record.version();
                record.meta_mut().last_synced_version = Some(version);
                sent.push(record.clone());
                stamped.push(record);
            }

            let values = encode_collection(&sent, &decoded.undecodable)?;
            report.uploaded += values.len();
            outgoing.set_collection(kind, values);
            exchanged.push((kind, stamped));
        }

        self.with_retry("upload", || self.remote.upload(token, &outgoing))
            .await?;

        for (kind, stamped) in &exchanged {
            self.store.mark_synced(*kind, stamped).await?;
        }

        let finished_at = Utc::now();
        self.store
            .database()
            .settings()
            .set_last_sync(finished_at)
            .await?;
        report.finished_at = Some(finished_at);

        Ok(report)
    }

    /// Runs one network operation with a per-attempt deadline, retrying
    /// network failures and timeouts with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt_fn: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut backoff = self.policy.create_backoff();
        let mut attempt = 1u32;

        loop {
            let result = match timeout(self.policy.attempt_timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::Timeout(self.policy.attempt_timeout.as_secs())),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = backoff.next_backoff().unwrap_or(self.policy.max_backoff);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Merges one collection. Local order is kept; remote-only records follow
/// in remote order.
fn merge_collection(
    kind: EntityKind,
    local: &[Entity],
    remote: &[Entity],
    snapshots: &HashMap<String, Entity>,
    report: &mut RoundReport,
) -> SyncResult<Vec<Entity>> {
    let mut remote_by_id: HashMap<String, &Entity> = HashMap::with_capacity(remote.len());
    let mut remote_order: Vec<String> = Vec::with_capacity(remote.len());
    for record in remote {
        let id = record.id().to_string();
        if remote_by_id.contains_key(&id) {
            warn!(kind = %kind, id = %id, "Duplicate id in remote collection, keeping the first");
            continue;
        }
        remote_order.push(id.clone());
        remote_by_id.insert(id, record);
    }

    let mut merged = Vec::with_capacity(local.len() + remote_order.len());
    let mut seen: HashSet<String> = HashSet::with_capacity(local.len());
    let no_overrides = Resolutions::new();

    for local_record in local {
        seen.insert(local_record.id().to_string());
        match remote_by_id.remove(local_record.id()) {
            Some(remote_record) => {
                let outcome = merge_with(
                    local_record,
                    remote_record,
                    snapshots.get(local_record.id()),
                    &no_overrides,
                )?;
                let merged_version = outcome.merged.version();
                if merged_version > local_record.version().max(remote_record.version()) {
                    report.merged += 1;
                } else if merged_version == remote_record.version()
                    && remote_record.version() != local_record.version()
                {
                    report.pulled += 1;
                } else if local_record.has_unsynced_changes() {
                    report.pushed += 1;
                }
                for conflict in &outcome.conflicts {
                    info!(
                        kind = %kind,
                        id = %conflict.entity_id,
                        field = %conflict.field,
                        local = %conflict.local_value,
                        remote = %conflict.cloud_value,
                        "Conflict"
                    );
                }
                report.conflicts.extend(outcome.conflicts);
                merged.push(outcome.merged);
            }
            None => {
                if local_record.has_unsynced_changes() {
                    report.pushed += 1;
                }
                merged.push(local_record.clone());
            }
        }
    }

    for id in remote_order {
        if seen.contains(&id) {
            continue;
        }
        if let Some(remote_record) = remote_by_id.remove(&id) {
            report.pulled += 1;
            merged.push(remote_record.clone());
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use crate::session::{Credential, StaticSession};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tally_core::{Book, Entry, EntryKind, Money};
    use tally_db::{Database, DbConfig};

    async fn replica(remote: &MemoryRemoteStore) -> (SyncOrchestrator, LocalStore) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let store = LocalStore::new(db);
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            Arc::new(remote.clone()),
            Arc::new(StaticSession::anonymous()),
            fast_policy(),
        );
        (orchestrator, store)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_first_round_uploads_local_records() {
        let remote = MemoryRemoteStore::new();
        let (orchestrator, store) = replica(&remote).await;

        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();

        let report = orchestrator.run_round().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert!(report.conflicts.is_empty());
        assert_eq!(orchestrator.state().await, SyncState::Idle);

        let doc = remote.document().await;
        assert_eq!(doc.books.len(), 1);
        assert_eq!(doc.books[0]["lastSyncedVersion"], 1);

        let local = store.require(EntityKind::Book, book.id()).await.unwrap();
        assert_eq!(local.last_synced_version(), Some(1));
        assert!(!local.has_unsynced_changes());
    }

    #[tokio::test]
    async fn test_second_round_changes_nothing() {
        let remote = MemoryRemoteStore::new();
        let (orchestrator, store) = replica(&remote).await;

        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();
        orchestrator.run_round().await.unwrap();
        let before = store.require(EntityKind::Book, book.id()).await.unwrap();

        let report = orchestrator.run_round().await.unwrap();
        assert!(report.conflicts.is_empty());
        assert_eq!(report.merged, 0);

        let after = store.require(EntityKind::Book, book.id()).await.unwrap();
        assert_eq!(after.version(), before.version());
        assert_eq!(after.last_synced_version(), before.last_synced_version());
    }

    #[tokio::test]
    async fn test_network_failure_is_retried() {
        let remote = MemoryRemoteStore::new();
        let (orchestrator, _store) = replica(&remote).await;

        remote.fail_next(2).await;
        orchestrator.run_round().await.unwrap();

        // Two failed downloads, one good one.
        assert_eq!(remote.download_count().await, 3);
        assert_eq!(remote.upload_count().await, 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let remote = MemoryRemoteStore::new();
        let (orchestrator, _store) = replica(&remote).await;

        remote.fail_next(10).await;
        let err = orchestrator.run_round().await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert_eq!(remote.download_count().await, 3);
        assert_eq!(orchestrator.state().await, SyncState::Error);
        assert!(!orchestrator.is_syncing());

        // A later request starts over from idle.
        remote.fail_next(0).await;
        orchestrator.run_round().await.unwrap();
        assert_eq!(orchestrator.state().await, SyncState::Idle);
        assert_eq!(orchestrator.last_error().await, None);
    }

    #[tokio::test]
    async fn test_slow_remote_times_out() {
        let remote = MemoryRemoteStore::new();
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            LocalStore::new(db),
            Arc::new(remote.clone()),
            Arc::new(StaticSession::anonymous()),
            RetryPolicy {
                max_attempts: 2,
                attempt_timeout: Duration::from_millis(20),
                ..fast_policy()
            },
        );

        remote.set_delay(Some(Duration::from_millis(500))).await;
        let err = orchestrator.run_round().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)));
        assert_eq!(remote.download_count().await, 2);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let remote = MemoryRemoteStore::new();
        let session = Arc::new(StaticSession::new("token-1"));
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            LocalStore::new(db),
            Arc::new(remote.clone()),
            session.clone(),
            fast_policy(),
        );

        remote.reject_auth(true).await;
        let err = orchestrator.run_round().await.unwrap_err();
        assert!(err.is_auth_error());
        assert_eq!(remote.download_count().await, 1);
        assert!(!session.is_signed_in().await);

        // Signed out: the next round fails before touching the remote.
        remote.reject_auth(false).await;
        assert!(orchestrator.run_round().await.unwrap_err().is_auth_error());
        assert_eq!(remote.download_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_round_is_rejected() {
        let remote = MemoryRemoteStore::new();
        let (orchestrator, _store) = replica(&remote).await;
        let orchestrator = Arc::new(orchestrator);

        remote.set_delay(Some(Duration::from_millis(200))).await;
        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_round().await })
        };

        while !orchestrator.is_syncing() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            orchestrator.run_round().await,
            Err(SyncError::AlreadySyncing)
        ));

        first.await.unwrap().unwrap();
        assert!(!orchestrator.is_syncing());
    }

    #[tokio::test]
    async fn test_undecodable_remote_record_survives() {
        let remote = MemoryRemoteStore::new();
        let broken = serde_json::json!({ "id": "e-from-the-future", "amount": { "nested": true } });
        remote
            .set_document(RemoteDocument {
                entries: vec![broken.clone()],
                ..Default::default()
            })
            .await;

        let (orchestrator, store) = replica(&remote).await;
        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();
        store
            .create(Entry::new(book.id(), EntryKind::Expense, Money::from_cents(500), Utc::now()).into())
            .await
            .unwrap();

        let report = orchestrator.run_round().await.unwrap();
        assert_eq!(report.undecodable, 1);

        let doc = remote.document().await;
        assert_eq!(doc.entries.len(), 2);
        assert!(doc.entries.contains(&broken));
        assert_eq!(store.get_all(EntityKind::Entry, true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_sync_is_recorded() {
        let remote = MemoryRemoteStore::new();
        let (orchestrator, store) = replica(&remote).await;

        assert_eq!(store.database().settings().last_sync().await.unwrap(), None);
        let report = orchestrator.run_round().await.unwrap();
        let recorded = store.database().settings().last_sync().await.unwrap().unwrap();
        assert_eq!(Some(recorded.timestamp()), report.finished_at.map(|t| t.timestamp()));
    }

    /// Hands out a new opaque token on every refresh.
    #[derive(Default)]
    struct CountingSession {
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl SessionProvider for CountingSession {
        async fn refresh(&self) -> SyncResult<Credential> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Credential::from_token(format!("token-{}", n)))
        }

        async fn invalidate(&self) {}

        async fn is_signed_in(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_session_is_refreshed_every_round() {
        let remote = MemoryRemoteStore::new();
        let session = Arc::new(CountingSession::default());
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let orchestrator = SyncOrchestrator::new(
            LocalStore::new(db),
            Arc::new(remote.clone()),
            session.clone(),
            fast_policy(),
        );

        orchestrator.run_round().await.unwrap();
        orchestrator.run_round().await.unwrap();
        assert_eq!(session.refreshes.load(Ordering::SeqCst), 2);
        assert_eq!(remote.download_count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_local_changes_pending() {
        let remote = MemoryRemoteStore::new();
        let (orchestrator, store) = replica(&remote).await;
        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();

        remote.fail_uploads(3).await;
        assert!(matches!(orchestrator.run_round().await, Err(SyncError::Network(_))));
        assert_eq!(remote.upload_count().await, 3);
        assert_eq!(remote.document().await.books.len(), 0);

        let local = store.require(EntityKind::Book, book.id()).await.unwrap();
        assert!(local.has_unsynced_changes());

        orchestrator.run_round().await.unwrap();
        assert_eq!(remote.document().await.books.len(), 1);
        assert!(!store.require(EntityKind::Book, book.id()).await.unwrap().has_unsynced_changes());
    }

    #[tokio::test]
    async fn test_edits_during_rounds_are_never_rolled_back() {
        let remote = MemoryRemoteStore::new();
        let (orchestrator, store) = replica(&remote).await;
        let book = store.create(Book::new("Household", "EUR").into()).await.unwrap();
        let id = book.id().to_string();

        let editor = {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    let mut record = store.require(EntityKind::Book, &id).await.unwrap();
                    record.set_field("name", format!("name-{}", i).into()).unwrap();
                    store.update(record).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for _ in 0..5 {
            orchestrator.run_round().await.unwrap();
            tokio::task::yield_now().await;
        }
        editor.await.unwrap();

        let local = store.require(EntityKind::Book, &id).await.unwrap();
        assert_eq!(local.version(), 21);
        assert_eq!(local.field("name"), Some("name-19".into()));

        // The next round carries the last edit up.
        orchestrator.run_round().await.unwrap();
        let local = store.require(EntityKind::Book, &id).await.unwrap();
        assert!(!local.has_unsynced_changes());
        assert_eq!(remote.document().await.books[0]["name"], "name-19");
    }

}
