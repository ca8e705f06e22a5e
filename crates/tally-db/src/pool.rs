//! # Database Handle
//!
//! Opens the replica's SQLite file and hands out repositories over one
//! shared pool.
//!
//! ## Who Holds Connections
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   local edits (CLI, LocalStore)        sync round (tally-sync)          │
//! │   create / update / soft_delete        get_all, snapshots, replace_all, │
//! │   one short transaction each           conflicts, mark_synced           │
//! │              │                                   │                      │
//! │              └──────────────┬────────────────────┘                      │
//! │                             ▼                                           │
//! │                 SqlitePool (WAL, busy timeout)                          │
//! │                             │                                           │
//! │                             ▼                                           │
//! │                 <data dir>/tally.db  or  :memory:                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A round never holds a transaction across a network call, so local edits
//! only wait for the round's short writes. WAL lets those edits read while
//! the round writes.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::conflicts::ConflictRepository;
use crate::repository::records::RecordRepository;
use crate::repository::settings::SettingsRepository;
use tally_core::EntityKind;

const IN_MEMORY: &str = ":memory:";

/// Where the replica lives and how many connections may touch it.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// One for local edits, one for the sync round, plus headroom for
    /// the conflict surface and status reads.
    pub max_connections: u32,
    /// How long a writer waits on SQLite's lock before giving up.
    pub busy_timeout: Duration,
}

impl DbConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            path: path.into(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// A private database that disappears with the handle.
    ///
    /// Each SQLite connection to `:memory:` is its own database, so the
    /// pool is capped at one connection and callers must not nest
    /// acquisitions.
    pub fn in_memory() -> Self {
        DbConfig {
            path: PathBuf::from(IN_MEMORY),
            max_connections: 1,
            busy_timeout: Duration::from_secs(5),
        }
    }

    fn is_in_memory(&self) -> bool {
        self.path == Path::new(IN_MEMORY)
    }
}

/// Shared handle to the replica's database.
///
/// Cheap to clone; every clone shares the pool. Most callers go through
/// [`LocalStore`](crate::LocalStore), which adds validation and change
/// notification on top of the repositories.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database and applies pending
    /// migrations.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(path = %config.path.display(), "Opening local store");

        let url = if config.is_in_memory() {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}", config.path.display())
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true)
            .create_if_missing(true);
        if !config.is_in_memory() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        debug!(max_connections = config.max_connections, "Pool ready");

        migrations::run_migrations(&pool).await?;
        Ok(Database { pool })
    }

    /// Repository for one collection.
    pub fn records(&self, kind: EntityKind) -> RecordRepository {
        RecordRepository::new(self.pool.clone(), kind)
    }

    pub fn settings(&self) -> SettingsRepository {
        SettingsRepository::new(self.pool.clone())
    }

    /// The persisted conflict log.
    pub fn conflicts(&self) -> ConflictRepository {
        ConflictRepository::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{Book, Entity};

    #[tokio::test]
    async fn test_file_database_keeps_records_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tally.db");

        let book: Entity = Book::new("Household", "EUR").into();
        {
            let db = Database::new(DbConfig::new(&path)).await.unwrap();
            db.records(EntityKind::Book).insert(&book).await.unwrap();
        }

        // Reopening runs the migrations again without touching the data.
        let db = Database::new(DbConfig::new(&path)).await.unwrap();
        assert_eq!(db.records(EntityKind::Book).count().await.unwrap(), 1);
        assert!(db.settings().last_sync().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_databases_are_isolated() {
        let a = Database::new(DbConfig::in_memory()).await.unwrap();
        let b = Database::new(DbConfig::in_memory()).await.unwrap();

        a.records(EntityKind::Book)
            .insert(&Book::new("Household", "EUR").into())
            .await
            .unwrap();
        assert_eq!(a.records(EntityKind::Book).count().await.unwrap(), 1);
        assert_eq!(b.records(EntityKind::Book).count().await.unwrap(), 0);
    }
}
