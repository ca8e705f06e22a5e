//! # Sync Agent
//!
//! The surface the application talks to. Wires the Local Store, the
//! orchestrator, the conflict surface and the change notifier together.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         SyncAgent                                │  │
//! │  │                                                                  │  │
//! │  │  • trigger_manual_sync / enable / disable auto-sync              │  │
//! │  │  • pending / resolve / dismiss conflicts                         │  │
//! │  │  • emits status events to the embedding application             │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ChangeNotifier  │  │SyncOrchestrator│  │   ConflictSurface      │    │
//! │  │                │  │                │  │                        │    │
//! │  │ store hooks ─► │─►│ one round at a │◄─│ resolve, then sync     │    │
//! │  │ debounce 2 s   │  │ time           │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! │  EVENTS:                                                               │
//! │  ───────                                                               │
//! │  status        - { state: "idle", autoSync: true, pendingConflicts: 1 }│
//! │  conflicts     - conflicts detected by a round                         │
//! │  error         - { message: "Network error: ...", retryable: true }    │
//! │  auth required - the user has to sign in again                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::conflicts::{ConflictSurface, Resolution};
use crate::error::{SyncError, SyncResult};
use crate::notifier::{AutoSyncTarget, ChangeNotifier, NotifierHandle};
use crate::orchestrator::{RetryPolicy, SyncOrchestrator, SyncState};
use crate::remote::{self, RemoteStore};
use crate::session::{self, SessionProvider};
use tally_core::{Conflict, ConflictChoice};
use tally_db::{LocalStore, AUTO_SYNC_KEY};

// =============================================================================
// Sync Status
// =============================================================================

/// Current sync status for external queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,

    pub auto_sync: bool,

    pub signed_in: bool,

    pub pending_conflicts: i64,

    /// Last successful round.
    pub last_sync: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
}

/// Result of a sync request, as shown to a person.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    pub message: String,
    /// Conflicts the round detected. Their default outcome is already applied.
    pub conflicts: Vec<Conflict>,
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives sync events for the embedding application.
pub trait SyncEventEmitter: Send + Sync {
    fn emit_status(&self, status: &SyncStatus);

    fn emit_conflicts(&self, conflicts: &[Conflict]);

    fn emit_error(&self, message: &str, retryable: bool);

    /// The credential was refused and the session signed out.
    fn emit_auth_required(&self);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_conflicts(&self, _conflicts: &[Conflict]) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
    fn emit_auth_required(&self) {}
}

// =============================================================================
// Core (shared with the notifier)
// =============================================================================

struct AgentCore {
    orchestrator: Arc<SyncOrchestrator>,
    emitter: Arc<dyn SyncEventEmitter>,
}

impl AgentCore {
    async fn sync(&self, trigger: &'static str) -> SyncOutcome {
        debug!(trigger, "Sync requested");

        let outcome = match self.orchestrator.run_round().await {
            Ok(report) => {
                if !report.conflicts.is_empty() {
                    self.emitter.emit_conflicts(&report.conflicts);
                }
                SyncOutcome {
                    success: true,
                    message: format!(
                        "Synced: {} pulled, {} pushed, {} merged, {} conflicts",
                        report.pulled,
                        report.pushed,
                        report.merged,
                        report.conflicts.len()
                    ),
                    conflicts: report.conflicts,
                }
            }
            Err(SyncError::AlreadySyncing) => SyncOutcome {
                success: false,
                message: SyncError::AlreadySyncing.to_string(),
                conflicts: Vec::new(),
            },
            Err(e) if e.is_auth_error() => {
                self.emitter.emit_auth_required();
                SyncOutcome {
                    success: false,
                    message: "Authentication required: sign in again to sync".to_string(),
                    conflicts: Vec::new(),
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.emitter.emit_error(&message, e.is_retryable());
                SyncOutcome {
                    success: false,
                    message,
                    conflicts: Vec::new(),
                }
            }
        };

        match self.status().await {
            Ok(status) => self.emitter.emit_status(&status),
            Err(e) => warn!(error = %e, "Could not read sync status"),
        }
        outcome
    }

    async fn status(&self) -> SyncResult<SyncStatus> {
        let db = self.orchestrator.store().database();
        let settings = db.settings();

        Ok(SyncStatus {
            state: self.orchestrator.state().await,
            auto_sync: settings.auto_sync_enabled().await?,
            signed_in: self.orchestrator.session().is_signed_in().await,
            pending_conflicts: db.conflicts().pending_count().await?,
            last_sync: settings.last_sync().await?,
            last_error: self.orchestrator.last_error().await,
        })
    }
}

#[async_trait]
impl AutoSyncTarget for AgentCore {
    async fn auto_sync(&self) {
        let outcome = self.sync("auto").await;
        if !outcome.success {
            debug!(message = %outcome.message, "Automatic sync did not complete");
        }
    }
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Main entry point for sync.
pub struct SyncAgent {
    core: Arc<AgentCore>,
    conflicts: ConflictSurface,
    notifier: NotifierHandle,
}

impl SyncAgent {
    pub fn builder(store: LocalStore) -> SyncAgentBuilder {
        SyncAgentBuilder::new(store)
    }

    /// Builds an agent with the remote store and session `config` selects.
    pub async fn from_config(config: &SyncConfig, store: LocalStore) -> SyncResult<Self> {
        config.validate()?;
        SyncAgent::builder(store)
            .remote(remote::from_config(config)?)
            .session(session::from_config(config)?)
            .retry_policy(RetryPolicy::from_config(config))
            .debounce(config.sync.debounce())
            .auto_sync_default(config.sync.auto_sync)
            .build()
            .await
    }

    pub fn store(&self) -> &LocalStore {
        self.core.orchestrator.store()
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.core.orchestrator
    }

    /// Runs a round now, regardless of the auto-sync preference and the
    /// debounce window. Rejected if a round is already running.
    pub async fn trigger_manual_sync(&self) -> SyncOutcome {
        self.core.sync("manual").await
    }

    pub async fn enable_auto_sync(&self) -> SyncResult<()> {
        self.set_auto_sync(true).await
    }

    /// Also cancels a pending debounced sync.
    pub async fn disable_auto_sync(&self) -> SyncResult<()> {
        self.set_auto_sync(false).await
    }

    async fn set_auto_sync(&self, enabled: bool) -> SyncResult<()> {
        self.store()
            .database()
            .settings()
            .set_auto_sync_enabled(enabled)
            .await?;
        self.notifier.set_enabled(enabled).await?;
        info!(enabled, "Auto-sync preference changed");

        let status = self.core.status().await?;
        self.core.emitter.emit_status(&status);
        Ok(())
    }

    pub async fn pending_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        self.conflicts.pending().await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        choice: ConflictChoice,
    ) -> SyncResult<Resolution> {
        let resolution = self.conflicts.resolve(conflict_id, choice).await?;
        let status = self.core.status().await?;
        self.core.emitter.emit_status(&status);
        Ok(resolution)
    }

    pub async fn dismiss_conflict(&self, conflict_id: &str) -> SyncResult<()> {
        self.conflicts.dismiss(conflict_id).await
    }

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        self.core.status().await
    }

    /// Runs any pending debounced sync, then stops the notifier.
    pub async fn shutdown(&self) -> SyncResult<()> {
        info!("Shutting down sync agent");
        self.notifier.shutdown().await
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SyncAgent`].
pub struct SyncAgentBuilder {
    store: LocalStore,
    remote: Option<Arc<dyn RemoteStore>>,
    session: Option<Arc<dyn SessionProvider>>,
    policy: RetryPolicy,
    debounce: Duration,
    auto_sync_default: bool,
    emitter: Arc<dyn SyncEventEmitter>,
}

impl SyncAgentBuilder {
    pub fn new(store: LocalStore) -> Self {
        SyncAgentBuilder {
            store,
            remote: None,
            session: None,
            policy: RetryPolicy::default(),
            debounce: Duration::from_secs(2),
            auto_sync_default: true,
            emitter: Arc::new(NoOpEmitter),
        }
    }

    pub fn remote(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn session(mut self, session: Arc<dyn SessionProvider>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Auto-sync preference used until one is stored.
    pub fn auto_sync_default(mut self, enabled: bool) -> Self {
        self.auto_sync_default = enabled;
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = emitter;
        self
    }

    /// Starts the change notifier and subscribes it to the store.
    pub async fn build(self) -> SyncResult<SyncAgent> {
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("remote store is required".into()))?;
        let session = self
            .session
            .unwrap_or_else(|| Arc::new(session::StaticSession::anonymous()));

        let auto_sync = self
            .store
            .database()
            .settings()
            .get_bool(AUTO_SYNC_KEY, self.auto_sync_default)
            .await?;
        self.store
            .database()
            .settings()
            .set_auto_sync_enabled(auto_sync)
            .await?;

        let orchestrator = Arc::new(SyncOrchestrator::new(
            self.store.clone(),
            remote,
            session,
            self.policy,
        ));
        let core = Arc::new(AgentCore {
            orchestrator: orchestrator.clone(),
            emitter: self.emitter,
        });

        let notifier = ChangeNotifier::new(core.clone(), self.debounce, auto_sync).start();
        let hook = notifier.clone();
        self.store.on_change(move |event| {
            debug!(kind = %event.kind, id = %event.id, "Local change");
            hook.notify_change();
        });

        info!(auto_sync, debounce_ms = self.debounce.as_millis() as u64, "Sync agent ready");

        Ok(SyncAgent {
            core,
            conflicts: ConflictSurface::new(orchestrator),
            notifier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;
    use std::sync::Mutex;
    use tally_core::{Book, EntityKind, Syncable};
    use tally_db::{Database, DbConfig};

    #[derive(Default)]
    struct RecordingEmitter {
        events: Mutex<Vec<String>>,
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_status(&self, status: &SyncStatus) {
            self.events.lock().unwrap().push(format!("status:{}", status.state));
        }
        fn emit_conflicts(&self, conflicts: &[Conflict]) {
            self.events.lock().unwrap().push(format!("conflicts:{}", conflicts.len()));
        }
        fn emit_error(&self, _message: &str, retryable: bool) {
            self.events.lock().unwrap().push(format!("error:{}", retryable));
        }
        fn emit_auth_required(&self) {
            self.events.lock().unwrap().push("auth".to_string());
        }
    }

    async fn agent(remote: &MemoryRemoteStore, emitter: Arc<RecordingEmitter>) -> SyncAgent {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        SyncAgent::builder(LocalStore::new(db))
            .remote(Arc::new(remote.clone()))
            .retry_policy(RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                attempt_timeout: Duration::from_secs(5),
            })
            .debounce(Duration::from_millis(50))
            .emitter(emitter)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_manual_sync_outcome() {
        let remote = MemoryRemoteStore::new();
        let emitter = Arc::new(RecordingEmitter::default());
        let agent = agent(&remote, emitter.clone()).await;
        agent.disable_auto_sync().await.unwrap();

        agent.store().create(Book::new("Household", "EUR").into()).await.unwrap();
        let outcome = agent.trigger_manual_sync().await;

        assert!(outcome.success, "{}", outcome.message);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(remote.document().await.books.len(), 1);

        let status = agent.status().await.unwrap();
        assert_eq!(status.state, SyncState::Idle);
        assert!(status.last_sync.is_some());
        assert!(emitter.events.lock().unwrap().contains(&"status:idle".to_string()));
    }

    #[tokio::test]
    async fn test_manual_sync_reports_network_error() {
        let remote = MemoryRemoteStore::new();
        let emitter = Arc::new(RecordingEmitter::default());
        let agent = agent(&remote, emitter.clone()).await;

        remote.fail_next(5).await;
        let outcome = agent.trigger_manual_sync().await;

        assert!(!outcome.success);
        assert!(outcome.message.contains("Network"));
        assert!(emitter.events.lock().unwrap().contains(&"error:true".to_string()));
        assert_eq!(agent.status().await.unwrap().state, SyncState::Error);
    }

    #[tokio::test]
    async fn test_auth_failure_signs_out() {
        let remote = MemoryRemoteStore::new();
        let emitter = Arc::new(RecordingEmitter::default());
        let agent = agent(&remote, emitter.clone()).await;

        remote.reject_auth(true).await;
        let outcome = agent.trigger_manual_sync().await;

        assert!(!outcome.success);
        assert!(outcome.message.contains("Authentication required"));
        assert!(emitter.events.lock().unwrap().contains(&"auth".to_string()));
        assert!(!agent.status().await.unwrap().signed_in);
    }

    #[tokio::test]
    async fn test_auto_sync_preference_is_persisted() {
        let remote = MemoryRemoteStore::new();
        let agent = agent(&remote, Arc::new(RecordingEmitter::default())).await;

        assert!(agent.status().await.unwrap().auto_sync);
        agent.disable_auto_sync().await.unwrap();
        assert!(!agent
            .store()
            .database()
            .settings()
            .auto_sync_enabled()
            .await
            .unwrap());
        agent.enable_auto_sync().await.unwrap();
        assert!(agent.status().await.unwrap().auto_sync);
    }

    #[tokio::test]
    async fn test_local_change_triggers_auto_sync() {
        let remote = MemoryRemoteStore::new();
        let agent = agent(&remote, Arc::new(RecordingEmitter::default())).await;

        let book = agent
            .store()
            .create(Book::new("Household", "EUR").into())
            .await
            .unwrap();
        agent.shutdown().await.unwrap();

        assert_eq!(remote.upload_count().await, 1);
        let stored = agent.store().require(EntityKind::Book, book.id()).await.unwrap();
        assert!(!stored.has_unsynced_changes());
    }

    #[tokio::test]
    async fn test_disabled_auto_sync_never_uploads() {
        let remote = MemoryRemoteStore::new();
        let agent = agent(&remote, Arc::new(RecordingEmitter::default())).await;
        agent.disable_auto_sync().await.unwrap();

        agent.store().create(Book::new("Household", "EUR").into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        agent.shutdown().await.unwrap();

        assert_eq!(remote.upload_count().await, 0);
    }
}
