//! Wiring of the host components for one CLI invocation

use anyhow::Context;
use skiff_core::config::HostConfig;
use skiff_core::payment::PaymentRegistry;
use skiff_core::security::ConfigVault;
use skiff_core::storage::Database;
use skiff_plugins::{ManagerPaymentSource, PackageInstaller, PluginManager, ProcessLauncher};
use std::sync::Arc;
use tracing::debug;

pub struct Host {
    pub config: HostConfig,
    pub db: Database,
    pub manager: Arc<PluginManager>,
    pub registry: PaymentRegistry,
}

impl Host {
    pub async fn open(config: HostConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let db = match &config.database.path {
            Some(path) => Database::open(path).await,
            None => Database::open_default().await,
        }
        .context("Failed to open the Skiff database")?;
        debug!(path = ?db.path(), "database ready");

        let installer = PackageInstaller::new(
            &config.plugins.base_dir,
            config.plugins.trusted_key_bytes()?,
        );
        let vault = ConfigVault::new(config.vault.master_key()?);
        let manager = Arc::new(PluginManager::new(
            db.pool().clone(),
            installer,
            Arc::new(ProcessLauncher::new()),
            vault,
        ));

        let mut registry = PaymentRegistry::new(db.pool().clone())
            .with_rpc_source(Arc::new(ManagerPaymentSource::new(manager.clone())));
        if let Some(dir) = &config.plugins.legacy_payment_dir {
            registry = registry.with_legacy_dir(dir);
        }

        Ok(Self {
            config,
            db,
            manager,
            registry,
        })
    }

    pub async fn close(self) {
        self.manager.shutdown().await;
        self.db.close().await;
    }
}
