//! # Settings Repository
//!
//! Key/value runtime preferences that must survive restarts but are not
//! synchronized: the auto-sync switch and the last successful sync time.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Whether local changes trigger an automatic sync. Absent means enabled.
pub const AUTO_SYNC_KEY: &str = "auto_sync_enabled";

/// RFC 3339 time of the last round that completed.
pub const LAST_SYNC_KEY: &str = "last_successful_sync";

/// Repository for the `settings` table.
#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SettingsRepository { pool }
    }

    pub async fn get(&self, key: &str) -> DbResult<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set(&self, key: &str, value: &str) -> DbResult<()> {
        debug!(key = %key, "Saving setting");

        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reads a boolean, falling back to `default` when unset or unparsable.
    pub async fn get_bool(&self, key: &str, default: bool) -> DbResult<bool> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(default))
    }

    pub async fn set_bool(&self, key: &str, value: bool) -> DbResult<()> {
        self.set(key, if value { "true" } else { "false" }).await
    }

    pub async fn get_time(&self, key: &str) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self
            .get(key)
            .await?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    pub async fn set_time(&self, key: &str, value: DateTime<Utc>) -> DbResult<()> {
        self.set(key, &value.to_rfc3339()).await
    }

    pub async fn auto_sync_enabled(&self) -> DbResult<bool> {
        self.get_bool(AUTO_SYNC_KEY, true).await
    }

    pub async fn set_auto_sync_enabled(&self, enabled: bool) -> DbResult<()> {
        self.set_bool(AUTO_SYNC_KEY, enabled).await
    }

    pub async fn last_sync(&self) -> DbResult<Option<DateTime<Utc>>> {
        self.get_time(LAST_SYNC_KEY).await
    }

    pub async fn set_last_sync(&self, at: DateTime<Utc>) -> DbResult<()> {
        self.set_time(LAST_SYNC_KEY, at).await
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_auto_sync_defaults_to_enabled() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let settings = db.settings();

        assert!(settings.auto_sync_enabled().await.unwrap());
        settings.set_auto_sync_enabled(false).await.unwrap();
        assert!(!settings.auto_sync_enabled().await.unwrap());
        settings.set_auto_sync_enabled(true).await.unwrap();
        assert!(settings.auto_sync_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_last_sync_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let settings = db.settings();
        assert!(settings.last_sync().await.unwrap().is_none());

        let at = chrono::DateTime::parse_from_rfc3339("2024-03-01T10:00:00+02:00")
            .unwrap()
            .with_timezone(&chrono::Utc);
        settings.set_last_sync(at).await.unwrap();
        assert_eq!(settings.last_sync().await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn test_unparsable_bool_uses_default() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let settings = db.settings();
        settings.set("flag", "maybe").await.unwrap();
        assert!(settings.get_bool("flag", true).await.unwrap());
        assert!(!settings.get_bool("flag", false).await.unwrap());
    }
}
