//! # tally-db: Local Store for Tally
//!
//! SQLite-backed persistence for the replica's books, entries and
//! categories, plus runtime settings and the persisted conflict log.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Tally Data Flow                                │
//! │                                                                         │
//! │  CLI command (entry add)          Sync round (tally-sync)              │
//! │       │                                 │                               │
//! │       ▼                                 ▼                               │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │  LocalStore   │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │  (store.rs)   │───►│ records.rs    │    │  (embedded)  │  │   │
//! │  │   │ validation    │    │ settings.rs   │    │ 0001_init    │  │   │
//! │  │   │ change hooks  │    │ conflicts.rs  │    │              │  │   │
//! │  │   └───────────────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │                                │  Database (pool.rs)           │   │
//! │  └────────────────────────────────┼────────────────────────────────┘   │
//! │                                   ▼                                     │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │   SQLite (WAL)   <data dir>/tally.db                           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - SQL per table
//! - [`store`] - The Local Store used by collaborators and the sync engine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig, LocalStore};
//! use tally_core::{Book, EntityKind};
//!
//! let db = Database::new(DbConfig::new("tally.db")).await?;
//! let store = LocalStore::new(db);
//!
//! let book = store.create(Book::new("Household", "EUR").into()).await?;
//! let books = store.get_all(EntityKind::Book, false).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use store::{ChangeEvent, ChangeOp, LocalStore};

pub use repository::conflicts::ConflictRepository;
pub use repository::records::RecordRepository;
pub use repository::settings::{SettingsRepository, AUTO_SYNC_KEY, LAST_SYNC_KEY};
