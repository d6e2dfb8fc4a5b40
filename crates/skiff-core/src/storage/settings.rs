//! Host-wide key/value settings

use crate::error::{Error, Result};
use sqlx::SqlitePool;

/// Repository over the `app_settings` table
#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_settings (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    /// Read a boolean flag; anything other than "true"/"1" is false
    pub async fn get_flag(&self, key: &str) -> Result<bool> {
        Ok(matches!(
            self.get(key).await?.as_deref().map(str::trim),
            Some("true") | Some("1")
        ))
    }

    pub async fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn set_overwrites_and_flags_parse() {
        let db = Database::in_memory().await.unwrap();
        let repo = SettingsRepository::new(db.pool().clone());

        assert_eq!(repo.get("plugins.bootstrapped").await.unwrap(), None);
        assert!(!repo.get_flag("plugins.bootstrapped").await.unwrap());

        repo.set_flag("plugins.bootstrapped", true).await.unwrap();
        assert!(repo.get_flag("plugins.bootstrapped").await.unwrap());

        repo.set("plugins.bootstrapped", "nope").await.unwrap();
        assert!(!repo.get_flag("plugins.bootstrapped").await.unwrap());
    }
}
