//! Persisted plugin installation records

use crate::signature::SignatureStatus;
use crate::{Category, PluginError, PluginKey, PluginResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use skiff_core::Error as CoreError;
use skiff_plugin_api::types::HealthResponse;
use sqlx::SqlitePool;

/// One `(category, plugin_id, instance_id)` row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInstallation {
    pub id: i64,
    pub category: Category,
    pub plugin_id: String,
    pub instance_id: String,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub signature_status: SignatureStatus,
    #[serde(skip_serializing)]
    pub config_cipher: String,
    pub last_health_at: Option<DateTime<Utc>>,
    pub last_health_status: Option<String>,
    pub last_health_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginInstallation {
    pub fn key(&self) -> PluginKey {
        PluginKey {
            category: self.category,
            plugin_id: self.plugin_id.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct InstallationRow {
    id: i64,
    category: String,
    plugin_id: String,
    instance_id: String,
    name: String,
    version: String,
    enabled: bool,
    signature_status: String,
    config_cipher: String,
    last_health_at: Option<DateTime<Utc>>,
    last_health_status: Option<String>,
    last_health_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<InstallationRow> for PluginInstallation {
    type Error = PluginError;

    fn try_from(row: InstallationRow) -> PluginResult<Self> {
        Ok(Self {
            id: row.id,
            category: row.category.parse()?,
            plugin_id: row.plugin_id,
            instance_id: row.instance_id,
            name: row.name,
            version: row.version,
            enabled: row.enabled,
            signature_status: SignatureStatus::parse(&row.signature_status)?,
            config_cipher: row.config_cipher,
            last_health_at: row.last_health_at,
            last_health_status: row.last_health_status,
            last_health_message: row.last_health_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, category, plugin_id, instance_id, name, version, enabled, signature_status,
           config_cipher, last_health_at, last_health_status, last_health_message,
           created_at, updated_at
    FROM plugin_installations
"#;

fn db_err(err: sqlx::Error) -> PluginError {
    PluginError::Core(CoreError::DatabaseError(err))
}

/// Repository over `plugin_installations`
#[derive(Debug, Clone)]
pub struct InstallationRepository {
    pool: SqlitePool,
}

impl InstallationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &PluginKey) -> PluginResult<Option<PluginInstallation>> {
        let row: Option<InstallationRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE category = ? AND plugin_id = ? AND instance_id = ?"
        ))
        .bind(key.category.as_str())
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(PluginInstallation::try_from).transpose()
    }

    /// The record for `key`, or `NotFound`
    pub async fn require(&self, key: &PluginKey) -> PluginResult<PluginInstallation> {
        self.get(key)
            .await?
            .ok_or_else(|| PluginError::NotFound(format!("plugin instance {key}")))
    }

    pub async fn list(&self) -> PluginResult<Vec<PluginInstallation>> {
        let rows: Vec<InstallationRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} ORDER BY category, plugin_id, instance_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(PluginInstallation::try_from).collect()
    }

    pub async fn list_for_plugin(
        &self,
        category: Category,
        plugin_id: &str,
    ) -> PluginResult<Vec<PluginInstallation>> {
        let rows: Vec<InstallationRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE category = ? AND plugin_id = ? ORDER BY instance_id"
        ))
        .bind(category.as_str())
        .bind(plugin_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(PluginInstallation::try_from).collect()
    }

    pub async fn list_enabled(&self) -> PluginResult<Vec<PluginInstallation>> {
        let rows: Vec<InstallationRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE enabled = 1 ORDER BY category, plugin_id, instance_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(PluginInstallation::try_from).collect()
    }

    /// Insert a disabled record with empty config; fails if the triple exists
    pub async fn insert(
        &self,
        key: &PluginKey,
        name: &str,
        version: &str,
        signature: SignatureStatus,
    ) -> PluginResult<PluginInstallation> {
        sqlx::query(
            r#"
            INSERT INTO plugin_installations
                (category, plugin_id, instance_id, name, version, enabled, signature_status, config_cipher)
            VALUES (?, ?, ?, ?, ?, 0, ?, '')
            "#,
        )
        .bind(key.category.as_str())
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .bind(name)
        .bind(version)
        .bind(signature.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                PluginError::Conflict(format!("instance {key} already exists"))
            }
            other => db_err(other),
        })?;
        self.require(key).await
    }

    /// Insert or refresh name, version and signature; enabled state and config are kept
    pub async fn upsert_from_disk(
        &self,
        key: &PluginKey,
        name: &str,
        version: &str,
        signature: SignatureStatus,
    ) -> PluginResult<PluginInstallation> {
        sqlx::query(
            r#"
            INSERT INTO plugin_installations
                (category, plugin_id, instance_id, name, version, enabled, signature_status, config_cipher)
            VALUES (?, ?, ?, ?, ?, 0, ?, '')
            ON CONFLICT(category, plugin_id, instance_id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                signature_status = excluded.signature_status,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key.category.as_str())
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .bind(name)
        .bind(version)
        .bind(signature.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        self.require(key).await
    }

    pub async fn set_enabled(&self, key: &PluginKey, enabled: bool) -> PluginResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE plugin_installations SET enabled = ?, updated_at = CURRENT_TIMESTAMP
            WHERE category = ? AND plugin_id = ? AND instance_id = ?
            "#,
        )
        .bind(enabled)
        .bind(key.category.as_str())
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(PluginError::NotFound(format!("plugin instance {key}")));
        }
        Ok(())
    }

    pub async fn set_config_cipher(&self, key: &PluginKey, cipher: &str) -> PluginResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE plugin_installations SET config_cipher = ?, updated_at = CURRENT_TIMESTAMP
            WHERE category = ? AND plugin_id = ? AND instance_id = ?
            "#,
        )
        .bind(cipher)
        .bind(key.category.as_str())
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(PluginError::NotFound(format!("plugin instance {key}")));
        }
        Ok(())
    }

    /// Cache a successful health probe
    pub async fn record_health(
        &self,
        key: &PluginKey,
        at: DateTime<Utc>,
        health: &HealthResponse,
    ) -> PluginResult<()> {
        let status = serde_json::to_value(health.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        sqlx::query(
            r#"
            UPDATE plugin_installations
            SET last_health_at = ?, last_health_status = ?, last_health_message = ?
            WHERE category = ? AND plugin_id = ? AND instance_id = ?
            "#,
        )
        .bind(at)
        .bind(status)
        .bind(&health.message)
        .bind(key.category.as_str())
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Delete the record; returns whether it existed
    pub async fn delete(&self, key: &PluginKey) -> PluginResult<bool> {
        let result = sqlx::query(
            "DELETE FROM plugin_installations WHERE category = ? AND plugin_id = ? AND instance_id = ?",
        )
        .bind(key.category.as_str())
        .bind(&key.plugin_id)
        .bind(&key.instance_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_for_plugin(&self, category: Category, plugin_id: &str) -> PluginResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM plugin_installations WHERE category = ? AND plugin_id = ?",
        )
        .bind(category.as_str())
        .bind(plugin_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::storage::Database;
    use skiff_plugin_api::types::HealthStatus;

    async fn repo() -> InstallationRepository {
        let db = Database::in_memory().await.unwrap();
        InstallationRepository::new(db.pool().clone())
    }

    fn key(instance: &str) -> PluginKey {
        PluginKey::new(Category::Payment, "ezpay", instance).unwrap()
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_triple() {
        let repo = repo().await;
        let rec = repo
            .insert(&key("default"), "EzPay", "1.0.0", SignatureStatus::Unsigned)
            .await
            .unwrap();
        assert!(!rec.enabled);
        assert_eq!(rec.config_cipher, "");
        let err = repo
            .insert(&key("default"), "EzPay", "1.0.0", SignatureStatus::Unsigned)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Conflict(_)));
    }

    #[tokio::test]
    async fn upsert_keeps_enabled_and_config() {
        let repo = repo().await;
        let k = key("default");
        repo.upsert_from_disk(&k, "EzPay", "1.0.0", SignatureStatus::Unsigned)
            .await
            .unwrap();
        repo.set_enabled(&k, true).await.unwrap();
        repo.set_config_cipher(&k, "cipher").await.unwrap();

        let rec = repo
            .upsert_from_disk(&k, "EzPay", "1.1.0", SignatureStatus::Official)
            .await
            .unwrap();
        assert!(rec.enabled);
        assert_eq!(rec.config_cipher, "cipher");
        assert_eq!(rec.version, "1.1.0");
        assert_eq!(rec.signature_status, SignatureStatus::Official);
    }

    #[tokio::test]
    async fn counts_and_deletes_per_plugin() {
        let repo = repo().await;
        for instance in ["default", "payment-ezpay-abc"] {
            repo.insert(&key(instance), "EzPay", "1", SignatureStatus::Unsigned)
                .await
                .unwrap();
        }
        assert_eq!(repo.count_for_plugin(Category::Payment, "ezpay").await.unwrap(), 2);
        assert!(repo.delete(&key("default")).await.unwrap());
        assert!(!repo.delete(&key("default")).await.unwrap());
        assert_eq!(repo.count_for_plugin(Category::Payment, "ezpay").await.unwrap(), 1);
        assert!(matches!(
            repo.set_enabled(&key("default"), true).await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn health_is_cached_on_the_record() {
        let repo = repo().await;
        let k = key("default");
        repo.insert(&k, "EzPay", "1", SignatureStatus::Unsigned)
            .await
            .unwrap();
        let health = HealthResponse {
            status: HealthStatus::Ok,
            message: "fine".to_string(),
            unix_millis: 0,
        };
        repo.record_health(&k, Utc::now(), &health).await.unwrap();
        let rec = repo.require(&k).await.unwrap();
        assert_eq!(rec.last_health_status.as_deref(), Some("ok"));
        assert_eq!(rec.last_health_message.as_deref(), Some("fine"));
        assert!(rec.last_health_at.is_some());
    }
}
