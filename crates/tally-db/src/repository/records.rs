//! # Record Repository
//!
//! SQL for the three synchronized collections. Every collection table has
//! the same shape, so one repository serves all of them, parameterised by
//! [`EntityKind`].
//!
//! ## Row Layout
//! ```text
//! ┌──────────┬─────────┬─────────────────────┬─────────┬──────┬─────────────┐
//! │ id       │ version │ last_synced_version │ deleted │ data │ synced_data │
//! ├──────────┼─────────┼─────────────────────┼─────────┼──────┼─────────────┤
//! │ uuid     │ 3       │ 2                   │ 0       │ JSON │ JSON (v2)   │
//! └──────────┴─────────┴─────────────────────┴─────────┴──────┴─────────────┘
//!   columns mirror the metadata inside `data`; `data` is authoritative
//! ```
//!
//! Version arithmetic lives here, inside the same transaction as the write,
//! so a concurrent writer can never make a version go backwards.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{Entity, EntityKind, Syncable};

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    version: i64,
    data: String,
    synced_data: Option<String>,
}

fn decode(kind: EntityKind, data: &str) -> DbResult<Entity> {
    let value: serde_json::Value = serde_json::from_str(data)?;
    Ok(Entity::from_json(kind, value)?)
}

fn encode(entity: &Entity) -> DbResult<String> {
    Ok(serde_json::to_string(&entity.to_json()?)?)
}

/// Repository over one collection table.
#[derive(Debug, Clone)]
pub struct RecordRepository {
    pool: SqlitePool,
    kind: EntityKind,
}

impl RecordRepository {
    pub fn new(pool: SqlitePool, kind: EntityKind) -> Self {
        RecordRepository { pool, kind }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    fn table(&self) -> &'static str {
        self.kind.collection()
    }

    /// Lists the collection ordered by creation time.
    pub async fn list(&self, include_tombstones: bool) -> DbResult<Vec<Entity>> {
        let sql = if include_tombstones {
            format!(
                "SELECT version, data, synced_data FROM {} ORDER BY created_at ASC, id ASC",
                self.table()
            )
        } else {
            format!(
                "SELECT version, data, synced_data FROM {} WHERE deleted = 0 ORDER BY created_at ASC, id ASC",
                self.table()
            )
        };

        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|r| decode(self.kind, &r.data)).collect()
    }

    /// Fetches one record, tombstoned or not.
    pub async fn find(&self, id: &str) -> DbResult<Option<Entity>> {
        let sql = format!(
            "SELECT version, data, synced_data FROM {} WHERE id = ?1",
            self.table()
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| decode(self.kind, &r.data)).transpose()
    }

    /// Inserts a brand-new record as version 1.
    ///
    /// ## Returns
    /// * `Err(DbError::UniqueViolation)` - the id already exists
    pub async fn insert(&self, entity: &Entity) -> DbResult<Entity> {
        let mut record = entity.clone();
        {
            let meta = record.meta_mut();
            let now = Utc::now();
            meta.version = 1;
            meta.last_synced_version = None;
            meta.created_at = now;
            meta.updated_at = now;
        }

        debug!(kind = %self.kind, id = %record.id(), "Inserting record");

        let sql = format!(
            r#"
            INSERT INTO {} (
                id, version, last_synced_version, deleted, deleted_at,
                created_at, updated_at, data, synced_data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)
            "#,
            self.table()
        );

        let meta = record.meta();
        sqlx::query(&sql)
            .bind(&meta.id)
            .bind(meta.version)
            .bind(meta.last_synced_version)
            .bind(meta.deleted)
            .bind(meta.deleted_at)
            .bind(meta.created_at)
            .bind(meta.updated_at)
            .bind(encode(&record)?)
            .execute(&self.pool)
            .await
            .map_err(|e| match DbError::from(e) {
                DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                    field,
                    value: record.id().to_string(),
                },
                other => other,
            })?;

        Ok(record)
    }

    /// Applies `mutate` to the stored record and writes it back as
    /// `stored.version + 1`, in one transaction.
    ///
    /// The stored sync metadata (`lastSyncedVersion`, `createdAt`) always
    /// wins over whatever the caller's copy carried.
    pub async fn mutate<F>(&self, id: &str, mutate: F) -> DbResult<Entity>
    where
        F: FnOnce(&mut Entity) -> DbResult<()>,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let stored = self
            .find_in(&mut tx, id)
            .await?
            .ok_or_else(|| DbError::not_found(self.kind.as_str(), id))?;

        let mut record = stored.clone();
        mutate(&mut record)?;
        {
            let stored_meta = stored.meta();
            let meta = record.meta_mut();
            meta.id = stored_meta.id.clone();
            meta.version = stored_meta.version + 1;
            meta.last_synced_version = stored_meta.last_synced_version;
            meta.created_at = stored_meta.created_at;
            meta.updated_at = Utc::now();
        }

        debug!(
            kind = %self.kind,
            id = %id,
            version = record.version(),
            deleted = record.is_deleted(),
            "Writing record"
        );

        self.write_in(&mut tx, &record).await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(record)
    }

    /// Writes merge results over the rows they were computed from, in one
    /// transaction.
    ///
    /// `observed` holds the `(id, version)` pairs read before the merge. A
    /// row is only overwritten or removed while its stored version is still
    /// the observed one; rows nobody observed are left alone unless absent.
    /// Synced snapshots of surviving rows are kept.
    ///
    /// ## Returns
    /// Ids skipped because the row changed after it was read.
    pub async fn replace_all(
        &self,
        records: &[Entity],
        observed: &HashMap<String, i64>,
    ) -> DbResult<Vec<String>> {
        if let Some(record) = records.iter().find(|r| r.kind() != self.kind) {
            return Err(DbError::Core(tally_core::CoreError::KindMismatch {
                local: self.kind,
                remote: record.kind(),
            }));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let stored: HashMap<String, i64> =
            sqlx::query_as::<_, (String, i64)>(&format!("SELECT id, version FROM {}", self.table()))
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();

        let keep: HashSet<&str> = records.iter().map(|r| r.id()).collect();
        let mut skipped = Vec::new();

        let delete_sql = format!("DELETE FROM {} WHERE id = ?1", self.table());
        let mut removed = 0usize;
        for (id, version) in observed.iter().filter(|(id, _)| !keep.contains(id.as_str())) {
            match stored.get(id) {
                Some(current) if current == version => {
                    sqlx::query(&delete_sql).bind(id).execute(&mut *tx).await?;
                    removed += 1;
                }
                Some(_) => skipped.push(id.clone()),
                None => {}
            }
        }

        let mut written = 0usize;
        for record in records {
            let unchanged = match (observed.get(record.id()), stored.get(record.id())) {
                (Some(seen), Some(current)) => seen == current,
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                skipped.push(record.id().to_string());
                continue;
            }
            self.write_in(&mut tx, record).await?;
            written += 1;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(
            kind = %self.kind,
            written,
            removed,
            skipped = skipped.len(),
            "Collection replaced"
        );
        Ok(skipped)
    }

    /// Records `uploaded` as the synced state of its rows.
    ///
    /// A row still at the uploaded version gets `lastSyncedVersion =
    /// version` and becomes clean. A row edited since the upload keeps its
    /// newer content and stays unsynced, but its sync base moves to the
    /// uploaded copy, which the edit was made on top of.
    ///
    /// ## Returns
    /// Number of rows that became clean.
    pub async fn mark_synced(&self, uploaded: &[Entity]) -> DbResult<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let sql = format!(
            r#"
            UPDATE {} SET
                last_synced_version = ?2,
                data = ?3,
                synced_data = ?4
            WHERE id = ?1 AND version = ?5
            "#,
            self.table()
        );

        let mut stamped = 0usize;
        for sent in uploaded {
            let Some(mut record) = self.find_in(&mut tx, sent.id()).await? else {
                continue;
            };
            if record.version() < sent.version() {
                continue;
            }
            let clean = record.version() == sent.version();
            if !clean {
                debug!(kind = %self.kind, id = %sent.id(), "Edited during sync, left unsynced");
            }

            let mut synced = sent.clone();
            synced.meta_mut().last_synced_version = Some(sent.version());
            record.meta_mut().last_synced_version = Some(sent.version());
            let data = encode(&record)?;
            let synced_data = if clean { data.clone() } else { encode(&synced)? };

            let result = sqlx::query(&sql)
                .bind(sent.id())
                .bind(sent.version())
                .bind(&data)
                .bind(&synced_data)
                .bind(record.version())
                .execute(&mut *tx)
                .await?;
            if clean {
                stamped += result.rows_affected() as usize;
            }
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        Ok(stamped)
    }

    /// The content of each record as last exchanged with the remote store.
    pub async fn snapshots(&self) -> DbResult<HashMap<String, Entity>> {
        let sql = format!(
            "SELECT version, data, synced_data FROM {} WHERE synced_data IS NOT NULL",
            self.table()
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            if let Some(synced) = row.synced_data.as_deref() {
                let entity = decode(self.kind, synced)?;
                out.insert(entity.id().to_string(), entity);
            }
        }
        Ok(out)
    }

    /// Counts rows, tombstones included.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // =========================================================================
    // Transaction helpers
    // =========================================================================

    async fn find_in(&self, conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Entity>> {
        let sql = format!(
            "SELECT version, data, synced_data FROM {} WHERE id = ?1",
            self.table()
        );
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(r) => {
                let entity = decode(self.kind, &r.data)?;
                if entity.version() != r.version {
                    return Err(DbError::Internal(format!(
                        "{} {} version column {} disagrees with record {}",
                        self.kind,
                        id,
                        r.version,
                        entity.version()
                    )));
                }
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Upserts one record. `synced_data` is left alone; only
    /// [`mark_synced`](Self::mark_synced) sets it.
    async fn write_in(&self, conn: &mut SqliteConnection, record: &Entity) -> DbResult<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (
                id, version, last_synced_version, deleted, deleted_at,
                created_at, updated_at, data, synced_data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                last_synced_version = excluded.last_synced_version,
                deleted = excluded.deleted,
                deleted_at = excluded.deleted_at,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                data = excluded.data
            "#,
            self.table()
        );

        let meta = record.meta();
        sqlx::query(&sql)
            .bind(&meta.id)
            .bind(meta.version)
            .bind(meta.last_synced_version)
            .bind(meta.deleted)
            .bind(meta.deleted_at)
            .bind(meta.created_at)
            .bind(meta.updated_at)
            .bind(encode(record)?)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
