//! Directory-scanned command providers
//!
//! Each `<dir>/<name>/provider.json` declares `{key, name, command, args,
//! enabled}`. A call runs the command once from the provider directory,
//! writes `{"action": ..., "request": ...}` to stdin and reads one JSON
//! response from stdout.

use super::provider::{PAYMENT_CALL_TIMEOUT, PaymentProvider, ProviderSource};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skiff_plugin_api::types::{
    CreatePaymentRequest, CreatePaymentResponse, HttpRequest, VerifyNotifyResponse,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

pub const PROVIDER_FILE: &str = "provider.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFile {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct LegacyProvider {
    file: ProviderFile,
    dir: PathBuf,
    timeout: Duration,
}

#[derive(Serialize)]
struct LegacyCall<'a, T: Serialize> {
    action: &'a str,
    request: &'a T,
}

#[derive(Deserialize)]
struct LegacyReply<T> {
    error: Option<String>,
    result: Option<T>,
}

impl LegacyProvider {
    pub fn new(file: ProviderFile, dir: PathBuf) -> Self {
        Self {
            file,
            dir,
            timeout: PAYMENT_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn file(&self) -> &ProviderFile {
        &self.file
    }

    /// Default switch from provider.json
    pub fn declared_enabled(&self) -> bool {
        self.file.enabled
    }

    fn program(&self) -> PathBuf {
        let command = Path::new(&self.file.command);
        if command.is_relative() && command.components().count() > 1 {
            self.dir.join(command)
        } else {
            command.to_path_buf()
        }
    }

    async fn invoke<Req, Resp>(&self, action: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_vec(&LegacyCall { action, request })
            .map_err(|e| Error::Other(format!("encode legacy request: {e}")))?;

        let mut child = Command::new(self.program())
            .args(&self.file.args)
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Unavailable(format!("failed to run provider {}: {e}", self.file.key))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Unavailable(format!("provider {} timed out", self.file.key)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(provider = %self.file.key, status = %output.status, stderr = %stderr.trim(), "legacy provider failed");
            return Err(Error::Unavailable(format!(
                "provider {} exited with {}",
                self.file.key, output.status
            )));
        }

        let reply: LegacyReply<Resp> = serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::Unavailable(format!("provider {} returned invalid JSON: {e}", self.file.key))
        })?;
        match (reply.error, reply.result) {
            (Some(err), _) if !err.is_empty() => Err(Error::InvalidInput(err)),
            (_, Some(result)) => Ok(result),
            _ => Err(Error::Unavailable(format!(
                "provider {} returned no result",
                self.file.key
            ))),
        }
    }
}

#[async_trait]
impl PaymentProvider for LegacyProvider {
    fn key(&self) -> &str {
        &self.file.key
    }

    fn name(&self) -> &str {
        if self.file.name.is_empty() {
            &self.file.key
        } else {
            &self.file.name
        }
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Legacy
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        self.invoke("create_payment", req).await
    }

    async fn verify_notify(&self, req: &HttpRequest) -> Result<VerifyNotifyResponse> {
        self.invoke("verify_notify", req).await
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Scan `dir` for provider directories
///
/// Broken entries are skipped with a warning; the first provider wins a key.
pub fn scan_legacy_dir(dir: &Path) -> Vec<LegacyProvider> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "no legacy payment directory");
            return Vec::new();
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();

    let mut providers: Vec<LegacyProvider> = Vec::new();
    for provider_dir in dirs {
        let manifest = provider_dir.join(PROVIDER_FILE);
        let file: ProviderFile = match std::fs::read(&manifest)
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(|e| e.to_string()))
        {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %manifest.display(), error = %err, "skipping legacy provider");
                continue;
            }
        };
        let file = ProviderFile {
            key: file.key.trim().to_string(),
            ..file
        };
        if !valid_key(&file.key) || super::builtin::is_builtin(&file.key) {
            warn!(key = %file.key, path = %manifest.display(), "invalid legacy provider key");
            continue;
        }
        if file.command.trim().is_empty() {
            warn!(key = %file.key, "legacy provider has no command");
            continue;
        }
        if providers.iter().any(|p| p.file.key == file.key) {
            warn!(key = %file.key, "duplicate legacy provider key");
            continue;
        }
        providers.push(LegacyProvider::new(file, provider_dir));
    }
    providers
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_provider(root: &Path, dir: &str, json: &str) {
        let d = root.join(dir);
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join(PROVIDER_FILE), json).unwrap();
    }

    #[test]
    fn scan_skips_invalid_and_dotted_keys() {
        let tmp = tempfile::tempdir().unwrap();
        write_provider(tmp.path(), "a", r#"{"key":"bank","name":"Bank","command":"./run.sh"}"#);
        write_provider(tmp.path(), "b", r#"{"key":"ez.pay","command":"x"}"#);
        write_provider(tmp.path(), "c", r#"{"key":"yipay","command":"x"}"#);
        write_provider(tmp.path(), "d", "not json");
        write_provider(tmp.path(), "e", r#"{"key":"bank","command":"y"}"#);
        write_provider(tmp.path(), "f", r#"{"key":"off","command":"z","enabled":false}"#);

        let providers = scan_legacy_dir(tmp.path());
        let keys: Vec<&str> = providers.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec!["bank", "off"]);
        assert!(providers[0].declared_enabled());
        assert!(!providers[1].declared_enabled());
        assert_eq!(providers[0].name(), "Bank");
    }

    #[test]
    fn reply_fields_may_be_absent() {
        #[derive(Debug, Deserialize)]
        struct Ack {
            code: u32,
        }

        let reply: LegacyReply<Ack> = serde_json::from_str(r#"{"error":"declined"}"#).unwrap();
        assert_eq!(reply.error.as_deref(), Some("declined"));
        assert!(reply.result.is_none());

        let reply: LegacyReply<Ack> = serde_json::from_str(r#"{"result":{"code":7}}"#).unwrap();
        assert!(reply.error.is_none());
        assert_eq!(reply.result.map(|a| a.code), Some(7));
    }

    #[test]
    fn missing_directory_is_empty() {
        assert!(scan_legacy_dir(Path::new("/definitely/not/here")).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("echo");
        fs::create_dir_all(&dir).unwrap();
        let script = dir.join("run.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncat >/dev/null\necho '{\"result\":{\"trade_no\":\"L1\",\"pay_url\":\"https://l/1\"}}'\n",
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        write_provider(tmp.path(), "echo", r#"{"key":"echo","command":"./run.sh"}"#);

        let provider = scan_legacy_dir(tmp.path()).remove(0);
        let resp = provider
            .create_payment(&CreatePaymentRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.trade_no, "L1");
        assert_eq!(resp.pay_url, "https://l/1");
    }
}
