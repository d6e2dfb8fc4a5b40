//! Schema migrations
//!
//! Steps are applied in version order, each inside its own transaction
//! together with its row in `schema_versions`.

use sqlx::SqlitePool;
use tracing::{debug, info};

const VERSIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_versions (
        version INTEGER PRIMARY KEY NOT NULL,
        name TEXT NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "plugin installations and provider switches",
        sql: PLUGINS_SQL,
    },
    Migration {
        version: 2,
        name: "orders, payments and wallets",
        sql: BILLING_SQL,
    },
    Migration {
        version: 3,
        name: "payment confirmation markers",
        sql: CONFIRMATION_SQL,
    },
];

/// Set once the approver hook ran and once `payment.confirmed` went out
const CONFIRMATION_SQL: &str = r#"
    ALTER TABLE order_payments ADD COLUMN hook_done_at TIMESTAMP;
    ALTER TABLE order_payments ADD COLUMN confirmed_at TIMESTAMP;
"#;

/// Highest version known to this build
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

const PLUGINS_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS app_settings (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS plugin_installations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        category TEXT NOT NULL,
        plugin_id TEXT NOT NULL,
        instance_id TEXT NOT NULL DEFAULT 'default',
        name TEXT NOT NULL DEFAULT '',
        version TEXT NOT NULL DEFAULT '',
        enabled INTEGER NOT NULL DEFAULT 0,
        signature_status TEXT NOT NULL DEFAULT 'unsigned'
            CHECK (signature_status IN ('unsigned', 'untrusted', 'official')),
        config_cipher TEXT NOT NULL DEFAULT '',
        last_health_at TIMESTAMP,
        last_health_status TEXT,
        last_health_message TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (category, plugin_id, instance_id)
    );

    CREATE INDEX IF NOT EXISTS idx_plugin_installations_plugin
        ON plugin_installations(category, plugin_id);
    CREATE INDEX IF NOT EXISTS idx_plugin_installations_enabled
        ON plugin_installations(enabled);

    CREATE TABLE IF NOT EXISTS plugin_payment_methods (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        category TEXT NOT NULL,
        plugin_id TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        method TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (category, plugin_id, instance_id, method)
    );

    CREATE TABLE IF NOT EXISTS payment_providers (
        key TEXT PRIMARY KEY NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        config_json TEXT NOT NULL DEFAULT '{}',
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

const BILLING_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS orders (
        id TEXT PRIMARY KEY NOT NULL,
        order_no TEXT NOT NULL UNIQUE,
        user_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending_payment'
            CHECK (status IN ('pending_payment', 'pending_review', 'approved', 'rejected', 'cancelled')),
        total_amount INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_orders_user_id ON orders(user_id);

    CREATE TABLE IF NOT EXISTS order_payments (
        id TEXT PRIMARY KEY NOT NULL,
        order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
        method TEXT NOT NULL,
        amount INTEGER NOT NULL DEFAULT 0,
        trade_no TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'approved', 'rejected')),
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_order_payments_order_id ON order_payments(order_id);
    CREATE INDEX IF NOT EXISTS idx_order_payments_trade_no ON order_payments(trade_no);

    CREATE TABLE IF NOT EXISTS wallets (
        user_id TEXT PRIMARY KEY NOT NULL,
        balance INTEGER NOT NULL DEFAULT 0,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS wallet_orders (
        id TEXT PRIMARY KEY NOT NULL,
        user_id TEXT NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('recharge', 'refund', 'withdraw')),
        amount INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'approved', 'rejected')),
        note TEXT NOT NULL DEFAULT '',
        meta_json TEXT NOT NULL DEFAULT '{}',
        reviewed_by TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_wallet_orders_user_id ON wallet_orders(user_id);

    CREATE TABLE IF NOT EXISTS wallet_transactions (
        id TEXT PRIMARY KEY NOT NULL,
        user_id TEXT NOT NULL,
        amount INTEGER NOT NULL,
        kind TEXT NOT NULL,
        ref_type TEXT NOT NULL,
        ref_id TEXT NOT NULL,
        note TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (ref_type, ref_id)
    );
"#;

pub async fn applied_version(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::raw_sql(VERSIONS_TABLE).execute(pool).await?;
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_versions")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Apply every step newer than the stored version; returns how many ran
pub async fn migrate(pool: &SqlitePool) -> Result<usize, sqlx::Error> {
    let applied = applied_version(pool).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        debug!(version = applied, "schema up to date");
        return Ok(0);
    }

    for step in &pending {
        info!(version = step.version, name = step.name, "applying migration");
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(step.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_versions (version, name) VALUES (?, ?)")
            .bind(step.version)
            .bind(step.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn versions_are_strictly_increasing() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(latest_version(), 3);
    }

    #[tokio::test]
    async fn migrate_runs_each_step_once() {
        let pool = memory_pool().await;
        assert_eq!(applied_version(&pool).await.unwrap(), 0);

        assert_eq!(migrate(&pool).await.unwrap(), MIGRATIONS.len());
        assert_eq!(applied_version(&pool).await.unwrap(), latest_version());
        assert_eq!(migrate(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn every_table_exists() {
        let pool = memory_pool().await;
        migrate(&pool).await.unwrap();

        for table in [
            "app_settings",
            "plugin_installations",
            "plugin_payment_methods",
            "payment_providers",
            "orders",
            "order_payments",
            "wallets",
            "wallet_orders",
            "wallet_transactions",
        ] {
            let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|e| panic!("{table}: {e}"));
            assert_eq!(rows, 0, "{table}");
        }
    }

    #[tokio::test]
    async fn installation_triple_is_unique() {
        let pool = memory_pool().await;
        migrate(&pool).await.unwrap();

        let insert = "INSERT INTO plugin_installations (category, plugin_id, instance_id) VALUES ('payment', 'ezpay', 'default')";
        sqlx::query(insert).execute(&pool).await.unwrap();
        assert!(sqlx::query(insert).execute(&pool).await.is_err());
    }

    #[tokio::test]
    async fn wallet_credit_ref_is_unique() {
        let pool = memory_pool().await;
        migrate(&pool).await.unwrap();

        let insert = "INSERT INTO wallet_transactions (id, user_id, amount, kind, ref_type, ref_id) VALUES (?, 'u1', 100, 'refund', 'wallet_order', 'wo-1')";
        sqlx::query(insert).bind("t1").execute(&pool).await.unwrap();
        assert!(sqlx::query(insert).bind("t2").execute(&pool).await.is_err());
    }
}
