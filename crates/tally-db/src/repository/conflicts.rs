//! # Conflict Log Repository
//!
//! Persists the conflicts reported by sync rounds so they outlive the
//! process that detected them.
//!
//! ## Lifecycle
//! ```text
//! detected ──► pending ──► resolved (local | remote | custom | dismissed)
//!                 │
//!                 └── superseded by a newer conflict on the same
//!                     (kind, entity, field): the old row is deleted
//! ```

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::Conflict;

/// Repository for the `sync_conflicts` table.
#[derive(Debug, Clone)]
pub struct ConflictRepository {
    pool: SqlitePool,
}

impl ConflictRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ConflictRepository { pool }
    }

    /// Stores newly detected conflicts, replacing any pending conflict on
    /// the same entity field.
    pub async fn record(&self, conflicts: &[Conflict]) -> DbResult<()> {
        if conflicts.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        for conflict in conflicts {
            sqlx::query(
                r#"
                DELETE FROM sync_conflicts
                WHERE entity_kind = ?1 AND entity_id = ?2 AND field = ?3
                  AND resolved_at IS NULL
                "#,
            )
            .bind(conflict.entity_kind.as_str())
            .bind(&conflict.entity_id)
            .bind(&conflict.field)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO sync_conflicts (
                    id, entity_kind, entity_id, field, payload, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&conflict.id)
            .bind(conflict.entity_kind.as_str())
            .bind(&conflict.entity_id)
            .bind(&conflict.field)
            .bind(serde_json::to_string(conflict)?)
            .bind(conflict.detected_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(count = conflicts.len(), "Conflicts recorded");
        Ok(())
    }

    /// Unresolved conflicts, oldest first.
    pub async fn pending(&self) -> DbResult<Vec<Conflict>> {
        let payloads: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT payload FROM sync_conflicts
            WHERE resolved_at IS NULL
            ORDER BY detected_at ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(DbError::from))
            .collect()
    }

    pub async fn find_pending(&self, id: &str) -> DbResult<Option<Conflict>> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM sync_conflicts WHERE id = ?1 AND resolved_at IS NULL",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        payload
            .map(|p| serde_json::from_str(&p).map_err(DbError::from))
            .transpose()
    }

    /// Closes a pending conflict.
    ///
    /// ## Returns
    /// * `Err(DbError::NotFound)` - unknown id, or already resolved
    pub async fn mark_resolved(&self, id: &str, resolution: &str) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_conflicts SET
                resolved_at = ?2,
                resolution = ?3
            WHERE id = ?1 AND resolved_at IS NULL
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(resolution)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("conflict", id));
        }
        Ok(())
    }

    pub async fn pending_count(&self) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_conflicts WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
