//! Enable switches and configuration for built-in and legacy providers

use crate::error::{Error, Result};
use serde_json::Value;
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSetting {
    pub key: String,
    pub enabled: bool,
    pub config: Value,
}

/// Repository over `payment_providers`
#[derive(Debug, Clone)]
pub struct ProviderSettingsRepository {
    pool: SqlitePool,
}

impl ProviderSettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<ProviderSetting>> {
        let row: Option<(String, bool, String)> = sqlx::query_as(
            "SELECT key, enabled, config_json FROM payment_providers WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        row.map(|(key, enabled, config_json)| {
            let config = serde_json::from_str(&config_json).map_err(|e| {
                Error::ConfigError(format!("provider {key} has invalid config_json: {e}"))
            })?;
            Ok(ProviderSetting {
                key,
                enabled,
                config,
            })
        })
        .transpose()
    }

    pub async fn set_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_providers (key, enabled, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET enabled = excluded.enabled, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    /// Store provider config; a new row takes `default_enabled`
    pub async fn set_config(&self, key: &str, config: &Value, default_enabled: bool) -> Result<()> {
        if !config.is_object() {
            return Err(Error::InvalidInput(format!(
                "provider {key} config must be a JSON object"
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO payment_providers (key, enabled, config_json, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET config_json = excluded.config_json, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(default_enabled)
        .bind(config.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }
}
