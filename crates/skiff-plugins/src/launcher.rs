//! Starting plugin processes and connecting to them
//!
//! [`ProcessLauncher`] spawns the entry binary and speaks the RPC protocol
//! over its stdio. [`InProcessLauncher`] serves registered Rust plugin
//! implementations over in-memory pipes with the same framing and handshake.

use crate::{PluginError, PluginKey, PluginResult};
use async_trait::async_trait;
use skiff_plugin_api::RpcClient;
use skiff_plugin_api::protocol::{MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use skiff_plugin_api::server::{PluginServices, serve};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long a fresh plugin has to write its handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const KILL_WAIT: Duration = Duration::from_secs(2);

/// What keeps a launched plugin alive
#[derive(Debug)]
pub enum PluginProcess {
    Child(Child),
    Task(JoinHandle<()>),
}

/// A connected plugin before any RPC has been made
#[derive(Debug)]
pub struct LaunchedPlugin {
    pub client: RpcClient,
    pub process: PluginProcess,
}

impl LaunchedPlugin {
    /// Close the connection and terminate the plugin
    pub async fn kill(self) {
        self.client.close();
        match self.process {
            PluginProcess::Child(mut child) => {
                if let Err(err) = child.start_kill() {
                    debug!(error = %err, "plugin process already gone");
                }
                if tokio::time::timeout(KILL_WAIT, child.wait()).await.is_err() {
                    warn!("plugin process did not exit after kill");
                }
            }
            PluginProcess::Task(handle) => handle.abort(),
        }
    }
}

#[async_trait]
pub trait PluginLauncher: Send + Sync {
    /// Start the plugin for `key` and complete the protocol handshake
    async fn launch(&self, key: &PluginKey, plugin_dir: &Path, entry: &Path)
    -> PluginResult<LaunchedPlugin>;
}

/// Runs plugin binaries as child processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    handshake_timeout: Duration,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl PluginLauncher for ProcessLauncher {
    async fn launch(
        &self,
        key: &PluginKey,
        plugin_dir: &Path,
        entry: &Path,
    ) -> PluginResult<LaunchedPlugin> {
        let mut child = Command::new(entry)
            .current_dir(plugin_dir)
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PluginError::Unavailable(format!("spawn {} for {key}: {e}", entry.display()))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(PluginError::Unavailable(format!(
                "plugin {key} has no stdio pipes"
            )));
        };

        if let Some(stderr) = child.stderr.take() {
            let label = key.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin = %label, "{line}");
                }
            });
        }

        match RpcClient::connect(stdout, stdin, self.handshake_timeout).await {
            Ok(client) => {
                debug!(plugin = %key, pid = ?child.id(), "plugin process connected");
                Ok(LaunchedPlugin {
                    client,
                    process: PluginProcess::Child(child),
                })
            }
            Err(err) => {
                let _ = child.start_kill();
                Err(err.into())
            }
        }
    }
}

/// Serves registered plugin implementations inside the host process
#[derive(Default, Clone)]
pub struct InProcessLauncher {
    plugins: Arc<RwLock<HashMap<String, PluginServices>>>,
    launches: Arc<AtomicUsize>,
}

impl InProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `services` whenever `plugin_id` is launched
    pub fn register(&self, plugin_id: &str, services: PluginServices) {
        self.plugins
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(plugin_id.to_string(), services);
    }

    /// Number of successful launches so far
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginLauncher for InProcessLauncher {
    async fn launch(
        &self,
        key: &PluginKey,
        _plugin_dir: &Path,
        _entry: &Path,
    ) -> PluginResult<LaunchedPlugin> {
        let services = self
            .plugins
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key.plugin_id)
            .cloned()
            .ok_or_else(|| {
                PluginError::Unavailable(format!("no in-process plugin registered for {key}"))
            })?;

        let (host_read, plugin_write) = tokio::io::duplex(64 * 1024);
        let (plugin_read, host_write) = tokio::io::duplex(64 * 1024);
        let label = key.to_string();
        let task = tokio::spawn(async move {
            if let Err(err) = serve(services, plugin_read, plugin_write).await {
                debug!(plugin = %label, error = %err, "in-process plugin stopped");
            }
        });

        match RpcClient::connect(host_read, host_write, HANDSHAKE_TIMEOUT).await {
            Ok(client) => {
                self.launches.fetch_add(1, Ordering::SeqCst);
                Ok(LaunchedPlugin {
                    client,
                    process: PluginProcess::Task(task),
                })
            }
            Err(err) => {
                task.abort();
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Category;
    use std::path::PathBuf;

    #[tokio::test]
    async fn unregistered_plugin_is_unavailable() {
        let launcher = InProcessLauncher::new();
        let key = PluginKey::default_instance(Category::Sms, "nobody").unwrap();
        let err = launcher
            .launch(&key, &PathBuf::from("."), &PathBuf::from("plugin"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Unavailable(_)));
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let key = PluginKey::default_instance(Category::Sms, "ghost").unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let err = ProcessLauncher::new()
            .launch(&key, dir.path(), &dir.path().join("plugin"))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_without_handshake_is_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let entry = dir.path().join("plugin");
        std::fs::write(&entry, "#!/bin/sh\necho not-a-handshake\n").unwrap();
        std::fs::set_permissions(&entry, std::fs::Permissions::from_mode(0o755)).unwrap();

        let key = PluginKey::default_instance(Category::Sms, "noisy").unwrap();
        let err = ProcessLauncher::new()
            .with_handshake_timeout(Duration::from_secs(5))
            .launch(&key, dir.path(), &entry)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Rpc(_)));
    }
}
