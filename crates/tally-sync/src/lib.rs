//! # tally-sync: Sync Engine for Tally
//!
//! Reconciles the local ledger with a per-user remote document so every
//! device of a user converges on the same books, entries and categories.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Engine Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncAgent (application facade)              │  │
//! │  └───────┬───────────────────────┬──────────────────────┬───────────┘  │
//! │          │                       │                      │              │
//! │          ▼                       ▼                      ▼              │
//! │  ┌────────────────┐  ┌──────────────────────┐  ┌──────────────────┐   │
//! │  │ ChangeNotifier │  │  SyncOrchestrator    │  │ ConflictSurface  │   │
//! │  │ debounce local │─►│  single-flight round │◄─│ resolve/dismiss  │   │
//! │  │ changes        │  │  retry + timeout     │  │                  │   │
//! │  └────────────────┘  └──┬───────┬───────┬───┘  └──────────────────┘   │
//! │                         │       │       │                              │
//! │                         ▼       ▼       ▼                              │
//! │              SessionProvider  RemoteStore  LocalStore (tally-db)       │
//! │              static / HTTP    http / file  merge engine (tally-core)   │
//! │                               / memory                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - `SyncAgent` facade, status and event emitter
//! - [`config`] - Sync configuration (TOML file plus `TALLY_*` overrides)
//! - [`conflicts`] - Pending conflicts and their resolution
//! - [`error`] - Sync error types
//! - [`notifier`] - Debounced automatic sync
//! - [`orchestrator`] - One reconciliation round
//! - [`remote`] - Remote store backends
//! - [`session`] - Refreshable credentials
//! - [`wire`] - The remote document
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig, LocalStore};
//! use tally_sync::{SyncAgent, SyncConfig};
//!
//! let config = SyncConfig::load(None)?;
//! let db = Database::new(DbConfig::new(config.database_path())).await?;
//! let agent = SyncAgent::from_config(&config, LocalStore::new(db)).await?;
//!
//! let outcome = agent.trigger_manual_sync().await;
//! println!("{}", outcome.message);
//!
//! agent.shutdown().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod config;
pub mod conflicts;
pub mod error;
pub mod notifier;
pub mod orchestrator;
pub mod remote;
pub mod session;
pub mod wire;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{NoOpEmitter, SyncAgent, SyncAgentBuilder, SyncEventEmitter, SyncOutcome, SyncStatus};
pub use config::{RemoteBackend, SyncConfig};
pub use conflicts::{ConflictSurface, Resolution};
pub use error::{SyncError, SyncResult};
pub use notifier::{AutoSyncTarget, ChangeNotifier, NotifierHandle};
pub use orchestrator::{RetryPolicy, RoundReport, SyncOrchestrator, SyncState};
pub use remote::{FileRemoteStore, HttpRemoteStore, MemoryRemoteStore, RemoteStore};
pub use session::{Credential, HttpSession, SessionProvider, StaticSession};
pub use wire::RemoteDocument;
