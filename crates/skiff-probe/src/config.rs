//! Persisted agent config and server-pushed runtime config

use crate::error::{ProbeError, ProbeResult};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Agent config file, rewritten after enrollment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub server_url: String,
    /// One-shot token, cleared after the first enrollment
    pub enroll_token: String,
    pub probe_id: i64,
    pub probe_secret: String,
    pub hostname_alias: String,
    pub tls_insecure_skip_verify: bool,
}

impl ProbeConfig {
    pub fn load(path: &Path) -> ProbeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProbeError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write via a sibling temp file and rename so a crash never leaves a torn file
    pub fn save(&self, path: &Path) -> ProbeResult<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let yaml = serde_yaml::to_string(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| ProbeError::Io(e.error))?;
        Ok(())
    }

    pub fn validate(&self) -> ProbeResult<()> {
        let url = Url::parse(&self.server_url)
            .map_err(|e| ProbeError::Config(format!("invalid server_url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProbeError::Config(format!(
                "server_url must be http or https, got {}",
                url.scheme()
            )));
        }
        if !self.is_enrolled() && self.enroll_token.trim().is_empty() {
            return Err(ProbeError::Config(
                "either enroll_token or probe_id/probe_secret is required".into(),
            ));
        }
        Ok(())
    }

    pub fn is_enrolled(&self) -> bool {
        self.probe_id > 0 && !self.probe_secret.is_empty()
    }

    /// Name shown in the console
    pub fn display_name(&self) -> String {
        let alias = self.hostname_alias.trim();
        if alias.is_empty() {
            gethostname::gethostname().to_string_lossy().into_owned()
        } else {
            alias.to_string()
        }
    }
}

pub const DEFAULT_HEARTBEAT_INTERVAL_SEC: u64 = 10;
pub const DEFAULT_SNAPSHOT_INTERVAL_SEC: u64 = 60;
pub const DEFAULT_LOG_CHUNK_MAX_BYTES: usize = 16 * 1024;

/// Intervals and limits pushed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub heartbeat_interval_sec: u64,
    #[serde(default)]
    pub snapshot_interval_sec: u64,
    #[serde(default)]
    pub log_chunk_max_bytes: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_sec: DEFAULT_HEARTBEAT_INTERVAL_SEC,
            snapshot_interval_sec: DEFAULT_SNAPSHOT_INTERVAL_SEC,
            log_chunk_max_bytes: DEFAULT_LOG_CHUNK_MAX_BYTES,
        }
    }
}

impl RuntimeConfig {
    /// Replace zero values with defaults
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        let pick = |v: u64, d: u64| if v == 0 { d } else { v };
        Self {
            heartbeat_interval_sec: pick(self.heartbeat_interval_sec, defaults.heartbeat_interval_sec),
            snapshot_interval_sec: pick(self.snapshot_interval_sec, defaults.snapshot_interval_sec),
            log_chunk_max_bytes: if self.log_chunk_max_bytes == 0 {
                defaults.log_chunk_max_bytes
            } else {
                self.log_chunk_max_bytes
            },
        }
    }

    /// Decode a pushed config; absent payload means defaults
    pub fn from_payload(payload: Option<&serde_json::Value>) -> ProbeResult<Self> {
        match payload {
            None | Some(serde_json::Value::Null) => Ok(Self::default()),
            Some(value) => Ok(serde_json::from_value::<Self>(value.clone())?.normalized()),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec.max(1))
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_sec.max(1))
    }
}
