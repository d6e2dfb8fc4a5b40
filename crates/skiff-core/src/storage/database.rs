//! SQLite pool for the host
//!
//! Opening a database creates the file and its directory when missing and
//! brings the schema up to date before the pool is handed out.

use crate::storage::migrations;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const FILE_POOL_SIZE: u32 = 5;

/// Plugin health writes and admin commands can contend for the write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// `<data_dir>/skiff/skiff.db`, or `skiff.db` in the working directory
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("skiff").join("skiff.db"))
        .unwrap_or_else(|| PathBuf::from("skiff.db"))
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file at `path`
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_SIZE)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        let db = Self {
            pool,
            path: Some(path),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Open the database at [`default_database_path`]
    pub async fn open_default() -> Result<Self> {
        Self::open(default_database_path()).await
    }

    /// Private in-memory database.
    ///
    /// Every connection to `:memory:` sees its own empty database, so the pool
    /// holds exactly one connection and never recycles it.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool, path: None };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Database file, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn migrate(&self) -> Result<()> {
        let applied = migrations::migrate(&self.pool)
            .await
            .context("Failed to migrate database schema")?;
        debug!(applied, version = migrations::latest_version(), "database schema ready");
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64> {
        Ok(migrations::applied_version(&self.pool).await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
