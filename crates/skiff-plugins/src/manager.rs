//! Plugin instance management
//!
//! [`PluginManager`] owns the installation records and drives the
//! [`Supervisor`]. Enable, disable, delete and config updates for one
//! `(category, plugin_id, instance_id)` are serialized through a per-key lock.

use crate::automation::{AUTOMATION_CONFIG_SCHEMA, AUTOMATION_UI_SCHEMA};
use crate::config_schema::{
    ConfigValidationError, merge_secrets, missing_required_config_fields, parse_config,
    parse_schema, redact_secrets,
};
use crate::installer::PackageInstaller;
use crate::launcher::PluginLauncher;
use crate::manifest::{DiskManifest, EntryResolution, load_manifest, resolve_entry};
use crate::repository::{InstallationRepository, PluginInstallation};
use crate::runtime::{SCHEMA_TIMEOUT, Supervisor};
use crate::signature::{SignatureStatus, verify_plugin_dir};
use crate::{Category, PluginError, PluginKey, PluginResult, validate_plugin_id};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use skiff_core::Error as CoreError;
use skiff_core::payment::PaymentMethodRepository;
use skiff_core::security::ConfigVault;
use skiff_core::storage::SettingsRepository;
use skiff_plugin_api::types::{ConfigSchema, HealthResponse};
use skiff_plugin_api::with_deadline;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Settings flag set once the first disk import has run
pub const BOOTSTRAPPED_FLAG: &str = "plugins.bootstrapped";

const INSTANCE_SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A plugin directory found under the base dir
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPlugin {
    pub category: Category,
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub entry: EntryResolution,
    pub signature: SignatureStatus,
    /// An entry binary exists for this host
    pub runnable: bool,
}

/// An installation record with its runtime state
#[derive(Debug, Clone, Serialize)]
pub struct InstallationView {
    #[serde(flatten)]
    pub installation: PluginInstallation,
    pub running: bool,
    pub last_health_at: Option<DateTime<Utc>>,
    pub last_health: Option<HealthResponse>,
}

pub struct PluginManager {
    repo: InstallationRepository,
    settings: SettingsRepository,
    methods: PaymentMethodRepository,
    installer: PackageInstaller,
    supervisor: Arc<Supervisor>,
    vault: ConfigVault,
    locks: StdMutex<HashMap<PluginKey, Arc<Mutex<()>>>>,
}

impl PluginManager {
    pub fn new(
        pool: SqlitePool,
        installer: PackageInstaller,
        launcher: Arc<dyn PluginLauncher>,
        vault: ConfigVault,
    ) -> Self {
        let repo = InstallationRepository::new(pool.clone());
        let supervisor = Supervisor::new(installer.base_dir(), launcher)
            .with_health_sink(Arc::new(repo.clone()));
        Self::with_supervisor(pool, installer, supervisor, vault)
    }

    /// Use a pre-configured supervisor, e.g. with a custom health interval
    pub fn with_supervisor(
        pool: SqlitePool,
        installer: PackageInstaller,
        supervisor: Supervisor,
        vault: ConfigVault,
    ) -> Self {
        Self {
            repo: InstallationRepository::new(pool.clone()),
            settings: SettingsRepository::new(pool.clone()),
            methods: PaymentMethodRepository::new(pool),
            installer,
            supervisor: Arc::new(supervisor),
            vault,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &InstallationRepository {
        &self.repo
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn installer(&self) -> &PackageInstaller {
        &self.installer
    }

    async fn lock(&self, key: &PluginKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of a deleted key unless another task holds or awaits it
    fn forget_lock(&self, key: &PluginKey) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    // ========== Disk ==========

    async fn scan_disk(&self) -> PluginResult<Vec<DiscoveredPlugin>> {
        let installer = self.installer.clone();
        tokio::task::spawn_blocking(move || scan_base_dir(&installer))
            .await
            .map_err(|e| PluginError::Unavailable(format!("disk scan task failed: {e}")))
    }

    /// Import plugins found on disk
    ///
    /// The first run imports everything; later runs import only packages
    /// whose signature verifies under a trusted key. Plugins that already
    /// have an installation record are left alone, so instances an operator
    /// deleted stay deleted.
    pub async fn bootstrap_from_disk(&self) -> PluginResult<Vec<PluginInstallation>> {
        let first_run = !self.settings.get_flag(BOOTSTRAPPED_FLAG).await?;
        let mut imported = Vec::new();
        for plugin in self.scan_disk().await? {
            if self
                .repo
                .count_for_plugin(plugin.category, &plugin.plugin_id)
                .await?
                > 0
            {
                continue;
            }
            if !first_run && !plugin.signature.is_official() {
                debug!(
                    category = %plugin.category,
                    plugin_id = %plugin.plugin_id,
                    signature = %plugin.signature,
                    "skipping non-official plugin during bootstrap"
                );
                continue;
            }
            match self
                .import_from_disk(plugin.category, &plugin.plugin_id, true)
                .await
            {
                Ok(record) => imported.push(record),
                Err(err) => warn!(
                    category = %plugin.category,
                    plugin_id = %plugin.plugin_id,
                    error = %err,
                    "failed to import plugin from disk"
                ),
            }
        }
        self.settings.set_flag(BOOTSTRAPPED_FLAG, true).await?;
        info!(first_run, imported = imported.len(), "plugin bootstrap finished");
        Ok(imported)
    }

    /// Plugins on disk that have no installation record yet
    pub async fn discover_on_disk(&self) -> PluginResult<Vec<DiscoveredPlugin>> {
        let mut out = Vec::new();
        for plugin in self.scan_disk().await? {
            if self
                .repo
                .count_for_plugin(plugin.category, &plugin.plugin_id)
                .await?
                == 0
            {
                out.push(plugin);
            }
        }
        Ok(out)
    }

    /// Create or refresh the default record for a plugin already on disk
    ///
    /// Packages that are not official need `allow_unofficial`.
    pub async fn import_from_disk(
        &self,
        category: Category,
        plugin_id: &str,
        allow_unofficial: bool,
    ) -> PluginResult<PluginInstallation> {
        let key = PluginKey::default_instance(category, plugin_id)?;
        let (manifest, signature) = self.inspect_plugin_dir(category, plugin_id, true).await?;
        match signature {
            SignatureStatus::Official => {}
            _ if allow_unofficial => {}
            SignatureStatus::Unsigned => {
                return Err(CoreError::SignatureUnsigned(key.to_string()).into());
            }
            SignatureStatus::Untrusted => {
                return Err(CoreError::SignatureUntrusted(key.to_string()).into());
            }
        }
        let record = self
            .repo
            .upsert_from_disk(&key, &manifest.name, &manifest.version, signature)
            .await?;
        info!(plugin = %key, signature = %signature, "plugin imported from disk");
        Ok(record)
    }

    async fn inspect_plugin_dir(
        &self,
        category: Category,
        plugin_id: &str,
        require_entry: bool,
    ) -> PluginResult<(DiskManifest, SignatureStatus)> {
        let dir = self.installer.plugin_dir(category, plugin_id);
        let trusted = self.installer.trusted_keys().to_vec();
        let id = plugin_id.to_string();
        tokio::task::spawn_blocking(move || {
            let manifest = load_manifest(&dir)?;
            if manifest.plugin_id != id {
                return Err(PluginError::Manifest(format!(
                    "manifest plugin_id {:?} does not match directory {id:?}",
                    manifest.plugin_id
                )));
            }
            if require_entry {
                resolve_entry(&dir, &manifest).require()?;
            }
            let signature = verify_plugin_dir(&dir, &trusted);
            Ok((manifest, signature))
        })
        .await
        .map_err(|e| PluginError::Unavailable(format!("plugin inspection failed: {e}")))?
    }

    // ========== Packages ==========

    /// Install a package and create its disabled default instance
    pub async fn install(&self, filename: &str, bytes: Vec<u8>) -> PluginResult<PluginInstallation> {
        let package = self.installer.install(filename, bytes).await?;
        let key = PluginKey::default_instance(package.category, &package.plugin_id)?;

        let recorded = async {
            self.repo.delete(&key).await?;
            self.repo
                .insert(
                    &key,
                    &package.manifest.name,
                    &package.manifest.version,
                    package.signature,
                )
                .await
        }
        .await;

        match recorded {
            Ok(record) => {
                info!(
                    plugin = %key,
                    version = %record.version,
                    signature = %record.signature_status,
                    runnable = package.entry.entry_supported,
                    "plugin installed"
                );
                Ok(record)
            }
            Err(err) => {
                warn!(plugin = %key, error = %err, "rolling back plugin files after failed insert");
                if let Err(cleanup) = self
                    .installer
                    .remove_plugin_dir(package.category, &package.plugin_id)
                {
                    warn!(plugin = %key, error = %cleanup, "failed to remove plugin files");
                }
                Err(err)
            }
        }
    }

    /// Add another instance of an installed plugin
    pub async fn create_instance(
        &self,
        category: Category,
        plugin_id: &str,
        instance_id: Option<&str>,
    ) -> PluginResult<PluginInstallation> {
        validate_plugin_id(plugin_id)?;
        if !self.installer.plugin_dir(category, plugin_id).is_dir() {
            return Err(PluginError::NotFound(format!("plugin {category}/{plugin_id}")));
        }
        let (manifest, signature) = self.inspect_plugin_dir(category, plugin_id, false).await?;
        let instance_id = match instance_id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => generate_instance_id(category, plugin_id),
        };
        let key = PluginKey::new(category, plugin_id, &instance_id)?;
        let record = self
            .repo
            .insert(&key, &manifest.name, &manifest.version, signature)
            .await
            .map_err(|err| match err {
                PluginError::Conflict(_) => PluginError::Conflict("instance already exists".to_string()),
                other => other,
            })?;
        info!(plugin = %key, "plugin instance created");
        Ok(record)
    }

    // ========== Lifecycle ==========

    /// Validate stored config, start the plugin and mark it enabled
    pub async fn enable_instance(&self, key: &PluginKey) -> PluginResult<()> {
        let _guard = self.lock(key).await;
        let record = self.repo.require(key).await?;
        let config_json = self.decrypt_config(&record)?;

        if key.category != Category::Automation {
            let config = parse_config(&config_json)?;
            let schema = self.fetch_schema(key).await?;
            let schema = parse_schema(&schema.json_schema)?;
            self.validate_config(key, &schema, &config).await?;
        }

        self.supervisor.start(key, &config_json).await?;
        if let Err(err) = self.repo.set_enabled(key, true).await {
            self.supervisor.stop(key).await;
            return Err(err);
        }
        info!(plugin = %key, "plugin instance enabled");
        Ok(())
    }

    pub async fn disable_instance(&self, key: &PluginKey) -> PluginResult<()> {
        let _guard = self.lock(key).await;
        self.repo.require(key).await?;
        self.supervisor.stop(key).await;
        self.repo.set_enabled(key, false).await?;
        info!(plugin = %key, "plugin instance disabled");
        Ok(())
    }

    /// Remove an instance; plugin files go with the last instance
    pub async fn delete_instance(&self, key: &PluginKey) -> PluginResult<()> {
        let guard = self.lock(key).await;
        let result = self.delete_locked(key).await;
        drop(guard);
        self.forget_lock(key);
        result
    }

    async fn delete_locked(&self, key: &PluginKey) -> PluginResult<()> {
        self.repo.require(key).await?;
        self.supervisor.stop(key).await;
        self.repo.delete(key).await?;
        if key.category == Category::Payment {
            self.methods
                .delete_for_instance(key.category.as_str(), &key.plugin_id, &key.instance_id)
                .await?;
        }
        if self.repo.count_for_plugin(key.category, &key.plugin_id).await? == 0 {
            self.installer
                .remove_plugin_dir(key.category, &key.plugin_id)?;
            info!(plugin = %key, "last instance deleted, plugin files removed");
        } else {
            info!(plugin = %key, "plugin instance deleted");
        }
        Ok(())
    }

    /// Start every enabled instance; failures are logged and leave the record enabled
    pub async fn start_enabled(&self) -> PluginResult<usize> {
        let mut started = 0;
        for record in self.repo.list_enabled().await? {
            let key = record.key();
            let _guard = self.lock(&key).await;
            let config_json = match self.decrypt_config(&record) {
                Ok(config) => config,
                Err(err) => {
                    warn!(plugin = %key, error = %err, "cannot decrypt config, not starting");
                    continue;
                }
            };
            match self.supervisor.start(&key, &config_json).await {
                Ok(_) => started += 1,
                Err(err) => warn!(plugin = %key, error = %err, "enabled plugin failed to start"),
            }
        }
        Ok(started)
    }

    /// Stop every running plugin
    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
    }

    pub async fn list_installations(&self) -> PluginResult<Vec<InstallationView>> {
        let mut out = Vec::new();
        for installation in self.repo.list().await? {
            let view = match self.supervisor.get_running(&installation.key()).await {
                Some(running) => {
                    let (at, health) = running.last_health();
                    InstallationView {
                        running: true,
                        last_health_at: at.or(installation.last_health_at),
                        last_health: health,
                        installation,
                    }
                }
                None => InstallationView {
                    running: false,
                    last_health_at: installation.last_health_at,
                    last_health: None,
                    installation,
                },
            };
            out.push(view);
        }
        Ok(out)
    }

    // ========== Configuration ==========

    /// Stored config with every secret field blanked
    pub async fn get_config_instance(&self, key: &PluginKey) -> PluginResult<Value> {
        let record = self.repo.require(key).await?;
        let config = match self.decrypt_config(&record) {
            Ok(config) => parse_config(&config)?,
            Err(err) => {
                warn!(plugin = %key, error = %err, "stored config unreadable, showing empty config");
                Value::Object(Default::default())
            }
        };
        let schema = self.fetch_schema(key).await?;
        let schema = parse_schema(&schema.json_schema)?;
        Ok(redact_secrets(&schema, &config))
    }

    /// Merge, validate and persist new config; pushes it to the plugin if enabled
    pub async fn update_config_instance(&self, key: &PluginKey, new_json: &str) -> PluginResult<()> {
        let _guard = self.lock(key).await;
        let record = self.repo.require(key).await?;
        let old = match self.decrypt_config(&record) {
            Ok(config) => parse_config(&config)?,
            Err(err) => {
                warn!(plugin = %key, error = %err, "stored config unreadable, replacing it");
                Value::Object(Default::default())
            }
        };
        let new = parse_config(new_json)?;
        let schema = self.fetch_schema(key).await?;
        let schema = parse_schema(&schema.json_schema)?;
        let merged = merge_secrets(&schema, &old, &new);

        self.validate_config(key, &schema, &merged).await?;

        let merged_json = merged.to_string();
        let cipher = self
            .vault
            .encrypt_str(&merged_json)
            .map_err(|e| PluginError::Vault(e.to_string()))?;
        self.repo.set_config_cipher(key, &cipher).await?;
        debug!(plugin = %key, "plugin config stored");

        if record.enabled {
            if self.supervisor.get_running(key).await.is_some() {
                self.supervisor.reload_config(key, &merged_json).await?;
            } else {
                warn!(plugin = %key, "enabled plugin is not running, config applies on next start");
            }
        }
        Ok(())
    }

    pub async fn get_config_schema_instance(&self, key: &PluginKey) -> PluginResult<ConfigSchema> {
        self.repo.require(key).await?;
        self.fetch_schema(key).await
    }

    fn decrypt_config(&self, record: &PluginInstallation) -> PluginResult<String> {
        if record.config_cipher.trim().is_empty() {
            return Ok("{}".to_string());
        }
        self.vault
            .decrypt_to_string(&record.config_cipher)
            .map_err(|e| PluginError::Vault(e.to_string()))
    }

    async fn fetch_schema(&self, key: &PluginKey) -> PluginResult<ConfigSchema> {
        if key.category == Category::Automation {
            return Ok(ConfigSchema {
                json_schema: AUTOMATION_CONFIG_SCHEMA.to_string(),
                ui_schema: AUTOMATION_UI_SCHEMA.to_string(),
            });
        }
        let dial = self.supervisor.dial(key.category, &key.plugin_id).await?;
        let schema = with_deadline(SCHEMA_TIMEOUT, dial.core.get_config_schema()).await;
        dial.close().await;
        Ok(schema?)
    }

    /// Required-field check, then the plugin's own validation
    async fn validate_config(&self, key: &PluginKey, schema: &Value, config: &Value) -> PluginResult<()> {
        let missing = missing_required_config_fields(schema, config);
        if !missing.is_empty() {
            return Err(ConfigValidationError::missing(key.category, missing).into());
        }
        if key.category == Category::Automation {
            return Ok(());
        }

        let dial = self.supervisor.dial(key.category, &key.plugin_id).await?;
        let ack = with_deadline(SCHEMA_TIMEOUT, dial.core.validate_config(&config.to_string())).await;
        dial.close().await;
        let ack = ack?;
        if !ack.ok {
            return Err(ConfigValidationError::from_plugin_error(key.category, &ack.error).into());
        }
        Ok(())
    }
}

/// `<category>-<plugin_id>-<8 base32 chars>`
fn generate_instance_id(category: Category, plugin_id: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| INSTANCE_SUFFIX_ALPHABET[rng.gen_range(0..INSTANCE_SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!("{category}-{plugin_id}-{suffix}")
}

fn scan_base_dir(installer: &PackageInstaller) -> Vec<DiscoveredPlugin> {
    let mut out = Vec::new();
    for category in Category::ALL {
        let category_dir = installer.base_dir().join(category.as_str());
        let Ok(entries) = std::fs::read_dir(&category_dir) else {
            continue;
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let Some(plugin_id) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };
            if plugin_id.starts_with('.') || validate_plugin_id(&plugin_id).is_err() {
                continue;
            }
            let manifest = match load_manifest(&dir) {
                Ok(m) if m.plugin_id == plugin_id => m,
                Ok(m) => {
                    warn!(dir = %dir.display(), manifest_id = %m.plugin_id, "plugin_id does not match directory");
                    continue;
                }
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "skipping plugin with unreadable manifest");
                    continue;
                }
            };
            let entry = resolve_entry(&dir, &manifest);
            let signature = verify_plugin_dir(&dir, installer.trusted_keys());
            out.push(DiscoveredPlugin {
                category,
                runnable: entry.entry_supported,
                plugin_id,
                name: manifest.name,
                version: manifest.version,
                entry,
                signature,
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_instance_ids_are_valid_keys() {
        let id = generate_instance_id(Category::Payment, "ezpay");
        assert!(id.starts_with("payment-ezpay-"));
        let suffix = id.trim_start_matches("payment-ezpay-");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.bytes().all(|b| INSTANCE_SUFFIX_ALPHABET.contains(&b)));
        assert!(PluginKey::new(Category::Payment, "ezpay", &id).is_ok());
        assert_ne!(id, generate_instance_id(Category::Payment, "ezpay"));
    }

    #[test]
    fn scan_skips_staging_and_mismatched_dirs() {
        let base = tempfile::TempDir::new().unwrap();
        let write = |rel: &str, id: &str| {
            let dir = base.path().join(rel);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join("manifest.json"),
                format!(r#"{{"plugin_id":"{id}","name":"N","version":"1"}}"#),
            )
            .unwrap();
        };
        write("sms/alisms", "alisms");
        write("sms/.alisms.incoming-x", "alisms");
        write("payment/wrong", "other");

        let installer = PackageInstaller::new(base.path(), Vec::new());
        let found = scan_base_dir(&installer);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].plugin_id, "alisms");
        assert_eq!(found[0].signature, SignatureStatus::Unsigned);
        assert!(!found[0].runnable);
    }

    #[tokio::test]
    async fn deleted_instances_release_their_lock_entries() {
        let db = skiff_core::storage::Database::in_memory().await.unwrap();
        let base = tempfile::TempDir::new().unwrap();
        let dir = base.path().join("sms/alisms");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"plugin_id":"alisms","name":"AliSMS","version":"1"}"#,
        )
        .unwrap();
        std::fs::write(dir.join(crate::manifest::root_entry_name()), b"#!/bin/sh\n").unwrap();
        let manager = PluginManager::new(
            db.pool().clone(),
            PackageInstaller::new(base.path(), Vec::new()),
            Arc::new(crate::launcher::InProcessLauncher::new()),
            ConfigVault::new(skiff_core::security::MasterKey::generate()),
        );

        manager
            .import_from_disk(Category::Sms, "alisms", true)
            .await
            .unwrap();
        let second = manager
            .create_instance(Category::Sms, "alisms", Some("backup"))
            .await
            .unwrap();
        let default = PluginKey::default_instance(Category::Sms, "alisms").unwrap();
        manager.disable_instance(&default).await.unwrap();
        assert_eq!(manager.lock_count(), 1);

        manager.delete_instance(&default).await.unwrap();
        manager.delete_instance(&second.key()).await.unwrap();
        assert_eq!(manager.lock_count(), 0);
    }
}
