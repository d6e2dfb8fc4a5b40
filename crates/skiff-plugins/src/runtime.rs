//! Running plugin supervision
//!
//! The [`Supervisor`] owns every live plugin process, keyed by
//! `category:plugin_id:instance_id`. Its lock only guards the map; launches
//! and RPCs happen outside it. Each running plugin carries its own health
//! cache and the cancellation token that ends its health loop.

use crate::launcher::{LaunchedPlugin, PluginLauncher, PluginProcess};
use crate::manifest::{DiskManifest, check_manifest_echo, load_manifest, resolve_entry};
use crate::repository::InstallationRepository;
use crate::{Category, PluginError, PluginKey, PluginResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skiff_plugin_api::types::{HealthResponse, PluginManifest};
use skiff_plugin_api::{
    AutomationClient, CoreClient, KycClient, PaymentClient, RpcClient, SmsClient, with_deadline,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MANIFEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const SCHEMA_TIMEOUT: Duration = Duration::from_secs(5);
pub const INIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RELOAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives successful health probes, usually to persist them
#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn record(&self, key: &PluginKey, at: DateTime<Utc>, health: &HealthResponse);
}

#[async_trait]
impl HealthSink for InstallationRepository {
    async fn record(&self, key: &PluginKey, at: DateTime<Utc>, health: &HealthResponse) {
        if let Err(err) = self.record_health(key, at, health).await {
            warn!(plugin = %key, error = %err, "failed to persist plugin health");
        }
    }
}

#[derive(Debug, Default)]
struct HealthState {
    last_checked: Option<DateTime<Utc>>,
    last: Option<HealthResponse>,
}

/// A started plugin instance
#[derive(Debug)]
pub struct RunningPlugin {
    key: PluginKey,
    manifest: PluginManifest,
    disk_manifest: DiskManifest,
    rpc: RpcClient,
    core: CoreClient,
    payment: Option<PaymentClient>,
    sms: Option<SmsClient>,
    kyc: Option<KycClient>,
    automation: Option<AutomationClient>,
    health: StdMutex<HealthState>,
    cancel: CancellationToken,
    process: Mutex<Option<PluginProcess>>,
}

impl RunningPlugin {
    pub fn key(&self) -> &PluginKey {
        &self.key
    }

    /// Manifest the plugin reported at start
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn disk_manifest(&self) -> &DiskManifest {
        &self.disk_manifest
    }

    pub fn core(&self) -> &CoreClient {
        &self.core
    }

    pub fn payment(&self) -> Option<&PaymentClient> {
        self.payment.as_ref()
    }

    pub fn sms(&self) -> Option<&SmsClient> {
        self.sms.as_ref()
    }

    pub fn kyc(&self) -> Option<&KycClient> {
        self.kyc.as_ref()
    }

    pub fn automation(&self) -> Option<&AutomationClient> {
        self.automation.as_ref()
    }

    /// Time and result of the last successful health probe
    pub fn last_health(&self) -> (Option<DateTime<Utc>>, Option<HealthResponse>) {
        let state = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (state.last_checked, state.last.clone())
    }

    /// Whether the connection to the plugin is still up
    pub fn is_alive(&self) -> bool {
        !self.rpc.is_closed()
    }

    fn set_health(&self, at: DateTime<Utc>, health: HealthResponse) {
        let mut state = self
            .health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.last_checked = Some(at);
        state.last = Some(health);
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(process) = self.process.lock().await.take() {
            LaunchedPlugin {
                client: self.rpc.clone(),
                process,
            }
            .kill()
            .await;
        } else {
            self.rpc.close();
        }
    }
}

/// A plugin started only to answer one Core call
#[derive(Debug)]
pub struct CoreDial {
    pub core: CoreClient,
    pub manifest: PluginManifest,
    launched: LaunchedPlugin,
}

impl CoreDial {
    pub async fn close(self) {
        self.launched.kill().await;
    }
}

/// Owner of every live plugin process
pub struct Supervisor {
    base_dir: PathBuf,
    launcher: Arc<dyn PluginLauncher>,
    running: Mutex<HashMap<PluginKey, Arc<RunningPlugin>>>,
    health_interval: Duration,
    health_sink: Option<Arc<dyn HealthSink>>,
}

impl Supervisor {
    pub fn new(base_dir: impl Into<PathBuf>, launcher: Arc<dyn PluginLauncher>) -> Self {
        Self {
            base_dir: base_dir.into(),
            launcher,
            running: Mutex::new(HashMap::new()),
            health_interval: HEALTH_INTERVAL,
            health_sink: None,
        }
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_health_sink(mut self, sink: Arc<dyn HealthSink>) -> Self {
        self.health_sink = Some(sink);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn plugin_dir(&self, category: Category, plugin_id: &str) -> PathBuf {
        self.base_dir.join(category.as_str()).join(plugin_id)
    }

    async fn launch(&self, key: &PluginKey) -> PluginResult<(DiskManifest, LaunchedPlugin)> {
        let dir = self.plugin_dir(key.category, &key.plugin_id);
        let disk = load_manifest(&dir)?;
        let resolution = resolve_entry(&dir, &disk);
        let entry = resolution.require()?;
        let launched = self.launcher.launch(key, &dir, entry).await?;
        Ok((disk, launched))
    }

    /// Start `key` with `config_json`; returns the live manifest
    ///
    /// Starting an instance that is already running returns its cached
    /// manifest without touching the process.
    pub async fn start(&self, key: &PluginKey, config_json: &str) -> PluginResult<PluginManifest> {
        if let Some(existing) = self.running.lock().await.get(key) {
            return Ok(existing.manifest.clone());
        }

        let (disk, launched) = self.launch(key).await?;
        let plugin = match self.handshake(key, disk, &launched, config_json).await {
            Ok(plugin) => plugin,
            Err(err) => {
                warn!(plugin = %key, error = %err, "plugin failed to start");
                launched.kill().await;
                return Err(err);
            }
        };
        *plugin.process.lock().await = Some(launched.process);
        let plugin = Arc::new(plugin);

        {
            let mut running = self.running.lock().await;
            if let Some(winner) = running.get(key).cloned() {
                drop(running);
                debug!(plugin = %key, "lost start race, stopping duplicate process");
                plugin.shutdown().await;
                return Ok(winner.manifest.clone());
            }
            running.insert(key.clone(), plugin.clone());
        }

        self.spawn_health_loop(plugin.clone());
        info!(
            plugin = %key,
            version = %plugin.manifest.version,
            "plugin started"
        );
        Ok(plugin.manifest.clone())
    }

    async fn handshake(
        &self,
        key: &PluginKey,
        disk: DiskManifest,
        launched: &LaunchedPlugin,
        config_json: &str,
    ) -> PluginResult<RunningPlugin> {
        let rpc = launched.client.clone();
        let core = rpc.dispense_core()?;
        let manifest = with_deadline(MANIFEST_TIMEOUT, core.get_manifest()).await?;
        check_manifest_echo(&disk, &manifest)?;

        let payment = manifest
            .payment
            .is_some()
            .then(|| rpc.dispense_payment())
            .transpose()?;
        let sms = manifest.sms.is_some().then(|| rpc.dispense_sms()).transpose()?;
        let kyc = manifest.kyc.is_some().then(|| rpc.dispense_kyc()).transpose()?;
        let automation = manifest
            .automation
            .is_some()
            .then(|| rpc.dispense_automation())
            .transpose()?;

        let ack = with_deadline(INIT_TIMEOUT, core.init(&key.instance_id, config_json)).await?;
        if !ack.ok {
            return Err(PluginError::InvalidInput(format!(
                "plugin {key} rejected init: {}",
                ack.error
            )));
        }

        Ok(RunningPlugin {
            key: key.clone(),
            manifest,
            disk_manifest: disk,
            rpc,
            core,
            payment,
            sms,
            kyc,
            automation,
            health: StdMutex::new(HealthState::default()),
            cancel: CancellationToken::new(),
            process: Mutex::new(None),
        })
    }

    fn spawn_health_loop(&self, plugin: Arc<RunningPlugin>) {
        let interval = self.health_interval;
        let sink = self.health_sink.clone();
        let cancel = plugin.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let probe = with_deadline(HEALTH_TIMEOUT, plugin.core.health(&plugin.key.instance_id));
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = probe => result,
                };
                match result {
                    Ok(health) => {
                        let now = Utc::now();
                        if let Some(sink) = &sink {
                            sink.record(&plugin.key, now, &health).await;
                        }
                        plugin.set_health(now, health);
                    }
                    Err(err) => {
                        debug!(plugin = %plugin.key, error = %err, "health probe failed");
                    }
                }
            }
            debug!(plugin = %plugin.key, "health loop stopped");
        });
    }

    /// Stop `key`; stopping something that is not running does nothing
    pub async fn stop(&self, key: &PluginKey) {
        let removed = self.running.lock().await.remove(key);
        if let Some(plugin) = removed {
            plugin.shutdown().await;
            info!(plugin = %key, "plugin stopped");
        }
    }

    pub async fn get_running(&self, key: &PluginKey) -> Option<Arc<RunningPlugin>> {
        self.running.lock().await.get(key).cloned()
    }

    pub async fn running_keys(&self) -> Vec<PluginKey> {
        let mut keys: Vec<PluginKey> = self.running.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Push new configuration to a running instance
    pub async fn reload_config(&self, key: &PluginKey, config_json: &str) -> PluginResult<()> {
        let plugin = self
            .get_running(key)
            .await
            .ok_or_else(|| PluginError::Unavailable(format!("plugin {key} is not running")))?;
        let ack = with_deadline(RELOAD_TIMEOUT, plugin.core.reload_config(config_json)).await?;
        if !ack.ok {
            return Err(PluginError::InvalidInput(format!(
                "plugin {key} rejected config reload: {}",
                ack.error
            )));
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let drained: Vec<Arc<RunningPlugin>> =
            self.running.lock().await.drain().map(|(_, p)| p).collect();
        for plugin in drained {
            plugin.shutdown().await;
        }
    }

    /// Launch a Core-only connection that is never registered as running
    pub async fn dial(&self, category: Category, plugin_id: &str) -> PluginResult<CoreDial> {
        let key = PluginKey::new(category, plugin_id, "dial")?;
        let (_, launched) = self.launch(&key).await?;
        let probe = async {
            let core = launched.client.dispense_core()?;
            let manifest = with_deadline(MANIFEST_TIMEOUT, core.get_manifest()).await?;
            if manifest.plugin_id.trim().is_empty() {
                return Err(PluginError::Manifest(
                    "runtime manifest has an empty plugin_id".to_string(),
                ));
            }
            Ok::<_, PluginError>((core, manifest))
        };
        match probe.await {
            Ok((core, manifest)) => Ok(CoreDial {
                core,
                manifest,
                launched,
            }),
            Err(err) => {
                launched.kill().await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::InProcessLauncher;
    use skiff_plugin_api::RpcStatus;
    use skiff_plugin_api::server::{CoreService, PluginServices};
    use skiff_plugin_api::types::{AckResponse, ConfigSchema, HealthStatus, SmsCapability};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct TestCore {
        manifest: PluginManifest,
        init_ok: bool,
        health_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CoreService for TestCore {
        async fn get_manifest(&self) -> Result<PluginManifest, RpcStatus> {
            Ok(self.manifest.clone())
        }
        async fn get_config_schema(&self) -> Result<ConfigSchema, RpcStatus> {
            Ok(ConfigSchema::default())
        }
        async fn validate_config(&self, _config_json: &str) -> Result<AckResponse, RpcStatus> {
            Ok(AckResponse::ok())
        }
        async fn init(&self, _instance_id: &str, _config_json: &str) -> Result<AckResponse, RpcStatus> {
            if self.init_ok {
                Ok(AckResponse::ok())
            } else {
                Ok(AckResponse::failed("api_key required"))
            }
        }
        async fn reload_config(&self, _config_json: &str) -> Result<AckResponse, RpcStatus> {
            Ok(AckResponse::ok())
        }
        async fn health(&self, _instance_id: &str) -> Result<HealthResponse, RpcStatus> {
            self.health_calls.fetch_add(1, Ordering::SeqCst);
            Ok(HealthResponse {
                status: HealthStatus::Ok,
                message: "up".to_string(),
                unix_millis: 1,
            })
        }
    }

    fn live_manifest(version: &str) -> PluginManifest {
        PluginManifest {
            plugin_id: "alisms".to_string(),
            name: "Ali SMS".to_string(),
            version: version.to_string(),
            sms: Some(SmsCapability { send: true }),
            ..Default::default()
        }
    }

    /// Base dir holding `sms/alisms` with a manifest and root entry
    fn plugin_tree() -> TempDir {
        let base = TempDir::new().unwrap();
        let dir = base.path().join("sms/alisms");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            r#"{"plugin_id":"alisms","name":"Ali SMS","version":"1.0.0","capabilities":{"sms":{"send":true}}}"#,
        )
        .unwrap();
        std::fs::write(dir.join(crate::manifest::root_entry_name()), b"").unwrap();
        base
    }

    fn setup(version: &str, init_ok: bool) -> (TempDir, InProcessLauncher, Arc<AtomicUsize>) {
        let base = plugin_tree();
        let launcher = InProcessLauncher::new();
        let health_calls = Arc::new(AtomicUsize::new(0));
        launcher.register(
            "alisms",
            PluginServices::new(Arc::new(TestCore {
                manifest: live_manifest(version),
                init_ok,
                health_calls: health_calls.clone(),
            })),
        );
        (base, launcher, health_calls)
    }

    fn key() -> PluginKey {
        PluginKey::default_instance(Category::Sms, "alisms").unwrap()
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let (base, launcher, _) = setup("1.0.0", true);
        let supervisor = Supervisor::new(base.path(), Arc::new(launcher.clone()));

        let first = supervisor.start(&key(), "{}").await.unwrap();
        let second = supervisor.start(&key(), "{}").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(launcher.launches(), 1);

        let running = supervisor.get_running(&key()).await.unwrap();
        assert!(running.sms().is_some());
        assert!(running.payment().is_none());
        assert!(running.is_alive());

        supervisor.stop(&key()).await;
        assert!(supervisor.get_running(&key()).await.is_none());
        assert!(!running.is_alive());
    }

    #[tokio::test]
    async fn manifest_mismatch_fails_start() {
        let (base, launcher, _) = setup("2.0.0", true);
        let supervisor = Supervisor::new(base.path(), Arc::new(launcher));
        let err = supervisor.start(&key(), "{}").await.unwrap_err();
        assert!(matches!(err, PluginError::Manifest(_)), "{err}");
        assert!(supervisor.running_keys().await.is_empty());
    }

    #[tokio::test]
    async fn rejected_init_fails_start() {
        let (base, launcher, _) = setup("1.0.0", false);
        let supervisor = Supervisor::new(base.path(), Arc::new(launcher));
        let err = supervisor.start(&key(), "{}").await.unwrap_err();
        assert!(err.to_string().contains("api_key required"));
        assert!(supervisor.get_running(&key()).await.is_none());
    }

    #[tokio::test]
    async fn stopping_unknown_key_is_noop() {
        let (base, launcher, _) = setup("1.0.0", true);
        let supervisor = Supervisor::new(base.path(), Arc::new(launcher));
        supervisor.stop(&key()).await;
        assert!(matches!(
            supervisor.reload_config(&key(), "{}").await,
            Err(PluginError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn health_loop_caches_and_stops_on_stop() {
        let (base, launcher, calls) = setup("1.0.0", true);
        let supervisor = Supervisor::new(base.path(), Arc::new(launcher))
            .with_health_interval(Duration::from_millis(20));
        supervisor.start(&key(), "{}").await.unwrap();
        let running = supervisor.get_running(&key()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while running.last_health().1.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let (at, health) = running.last_health();
        assert!(at.is_some());
        assert_eq!(health.unwrap().message, "up");

        supervisor.stop(&key()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn dial_does_not_register_running() {
        let (base, launcher, _) = setup("1.0.0", true);
        let supervisor = Supervisor::new(base.path(), Arc::new(launcher));
        let dial = supervisor.dial(Category::Sms, "alisms").await.unwrap();
        assert_eq!(dial.manifest.plugin_id, "alisms");
        dial.close().await;
        assert!(supervisor.running_keys().await.is_empty());
    }
}
