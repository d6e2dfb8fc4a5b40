//! Per-method enable overrides for RPC payment plugins
//!
//! Keyed by `(category, plugin_id, instance_id, method)`. A missing row means
//! the method is enabled. Reads are never cached so a disable applies to the
//! next dispatch.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

pub const PAYMENT_CATEGORY: &str = "payment";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MethodOverride {
    pub category: String,
    pub plugin_id: String,
    pub instance_id: String,
    pub method: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct PaymentMethodRepository {
    pool: SqlitePool,
}

impl PaymentMethodRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn is_enabled(
        &self,
        category: &str,
        plugin_id: &str,
        instance_id: &str,
        method: &str,
    ) -> Result<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            SELECT enabled FROM plugin_payment_methods
            WHERE category = ? AND plugin_id = ? AND instance_id = ? AND method = ?
            "#,
        )
        .bind(category)
        .bind(plugin_id)
        .bind(instance_id)
        .bind(method)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(row.map(|(enabled,)| enabled).unwrap_or(true))
    }

    pub async fn set_enabled(
        &self,
        category: &str,
        plugin_id: &str,
        instance_id: &str,
        method: &str,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugin_payment_methods (category, plugin_id, instance_id, method, enabled, updated_at)
            VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(category, plugin_id, instance_id, method)
            DO UPDATE SET enabled = excluded.enabled, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(category)
        .bind(plugin_id)
        .bind(instance_id)
        .bind(method)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    pub async fn list(
        &self,
        category: &str,
        plugin_id: &str,
        instance_id: &str,
    ) -> Result<Vec<MethodOverride>> {
        sqlx::query_as(
            r#"
            SELECT category, plugin_id, instance_id, method, enabled
            FROM plugin_payment_methods
            WHERE category = ? AND plugin_id = ? AND instance_id = ?
            ORDER BY method
            "#,
        )
        .bind(category)
        .bind(plugin_id)
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)
    }

    /// Drop overrides when an instance is deleted
    pub async fn delete_for_instance(
        &self,
        category: &str,
        plugin_id: &str,
        instance_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM plugin_payment_methods WHERE category = ? AND plugin_id = ? AND instance_id = ?",
        )
        .bind(category)
        .bind(plugin_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn absent_override_means_enabled() {
        let db = Database::in_memory().await.unwrap();
        let repo = PaymentMethodRepository::new(db.pool().clone());
        assert!(repo.is_enabled("payment", "ezpay", "default", "alipay").await.unwrap());

        repo.set_enabled("payment", "ezpay", "default", "alipay", false).await.unwrap();
        assert!(!repo.is_enabled("payment", "ezpay", "default", "alipay").await.unwrap());
        assert!(repo.is_enabled("payment", "ezpay", "default", "wxpay").await.unwrap());
        assert!(repo.is_enabled("payment", "ezpay", "other", "alipay").await.unwrap());

        repo.set_enabled("payment", "ezpay", "default", "alipay", true).await.unwrap();
        let rows = repo.list("payment", "ezpay", "default").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].enabled);

        assert_eq!(repo.delete_for_instance("payment", "ezpay", "default").await.unwrap(), 1);
    }
}
