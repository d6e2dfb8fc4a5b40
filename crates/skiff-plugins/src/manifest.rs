//! On-disk plugin manifests and runtime entry resolution

use crate::{PluginError, PluginResult};
use serde::{Deserialize, Serialize};
use skiff_plugin_api::types::{
    AutomationFeature, KycCapability, PaymentCapability, PluginManifest, SmsCapability,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// `manifest.json` as shipped inside a plugin directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskManifest {
    #[serde(default)]
    pub plugin_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// `<goos>_<goarch>` to a path under `bin/<goos>_<goarch>/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binaries: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub capabilities: DiskCapabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sms: Option<SmsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kyc: Option<KycCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation: Option<DiskAutomationCapability>,
}

/// Automation capability with features spelled by name
///
/// `features` may carry UI-only tags the RPC enum does not know.
/// `not_supported_reasons` keys are feature names or enum integers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskAutomationCapability {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub not_supported_reasons: BTreeMap<String, String>,
}

impl DiskManifest {
    pub fn validate(&self) -> PluginResult<()> {
        if self.plugin_id.trim().is_empty()
            || self.name.trim().is_empty()
            || self.version.trim().is_empty()
        {
            return Err(PluginError::Manifest(
                "plugin_id, name and version are required".to_string(),
            ));
        }
        crate::validate_plugin_id(self.plugin_id.trim())
            .map_err(|e| PluginError::Manifest(e.to_string()))?;

        if let Some(binaries) = &self.binaries {
            for (platform, path) in binaries {
                validate_binary_path(platform, path)?;
            }
        }
        Ok(())
    }
}

/// Read and validate `<plugin_dir>/manifest.json`
pub fn load_manifest(plugin_dir: &Path) -> PluginResult<DiskManifest> {
    let path = plugin_dir.join(MANIFEST_FILE);
    let metadata = fs::symlink_metadata(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PluginError::Manifest(format!("{} not found", path.display()))
        } else {
            PluginError::Io(e)
        }
    })?;
    if !metadata.file_type().is_file() {
        return Err(PluginError::Manifest(
            "manifest must be a regular file".to_string(),
        ));
    }
    if metadata.len() > MAX_MANIFEST_BYTES {
        return Err(PluginError::Manifest("manifest file too large".to_string()));
    }

    let data = fs::read_to_string(&path)?;
    let manifest: DiskManifest = serde_json::from_str(&data)
        .map_err(|e| PluginError::Manifest(format!("invalid manifest JSON: {e}")))?;
    manifest.validate()?;
    Ok(manifest)
}

fn validate_binary_path(platform: &str, path: &str) -> PluginResult<()> {
    let bad = |why: &str| PluginError::Manifest(format!("binaries[{platform}] = {path:?}: {why}"));

    if platform.is_empty()
        || platform.contains("..")
        || platform.contains(':')
        || platform.contains('/')
        || platform.contains('\\')
    {
        return Err(bad("invalid platform key"));
    }
    let normalized = path.replace('\\', "/");
    if normalized.starts_with('/') || Path::new(path).is_absolute() {
        return Err(bad("path must be relative"));
    }
    if normalized.contains("..") || normalized.contains(':') {
        return Err(bad("path must not contain '..' or ':'"));
    }
    let prefix = format!("bin/{platform}/");
    let Some(file_name) = normalized.strip_prefix(&prefix) else {
        return Err(bad("path must live under bin/<platform>/"));
    };
    if file_name != "plugin" && file_name != "plugin.exe" {
        return Err(bad("binary must be named plugin or plugin.exe"));
    }
    Ok(())
}

/// `<goos>_<goarch>` for the running host
pub fn current_platform() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    format!("{os}_{arch}")
}

pub fn root_entry_name() -> &'static str {
    if cfg!(windows) { "plugin.exe" } else { "plugin" }
}

/// Outcome of picking the binary for this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryResolution {
    pub platform: String,
    pub entry_path: Option<PathBuf>,
    pub entry_supported: bool,
    pub supported_platforms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EntryResolution {
    fn unsupported(platform: String, supported_platforms: Vec<String>, error: String) -> Self {
        Self {
            platform,
            entry_path: None,
            entry_supported: false,
            supported_platforms,
            error: Some(error),
        }
    }

    /// The entry path, or an error naming the platforms the package does support
    pub fn require(&self) -> PluginResult<&Path> {
        match (&self.entry_path, self.entry_supported) {
            (Some(path), true) => Ok(path),
            _ => {
                let reason = self
                    .error
                    .clone()
                    .unwrap_or_else(|| "plugin entry not resolved".to_string());
                if self.supported_platforms.is_empty() {
                    Err(PluginError::Manifest(reason))
                } else {
                    Err(PluginError::Manifest(format!(
                        "{reason} (supported: {})",
                        self.supported_platforms.join(", ")
                    )))
                }
            }
        }
    }
}

/// Join `rel` onto `dir`, refusing results outside `dir`
fn safe_join(dir: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    let joined = dir.join(rel);
    if !joined.starts_with(dir) {
        return None;
    }
    // Symlinks inside the plugin dir must not point outside it.
    if let (Ok(real_dir), Ok(real_entry)) = (dir.canonicalize(), joined.canonicalize()) {
        if !real_entry.starts_with(&real_dir) {
            return None;
        }
    }
    Some(joined)
}

/// Pick the entry binary of `manifest` for the current platform
pub fn resolve_entry(plugin_dir: &Path, manifest: &DiskManifest) -> EntryResolution {
    resolve_entry_for(plugin_dir, manifest, &current_platform())
}

pub fn resolve_entry_for(
    plugin_dir: &Path,
    manifest: &DiskManifest,
    platform: &str,
) -> EntryResolution {
    let platform = platform.to_string();

    let Some(binaries) = &manifest.binaries else {
        let entry = plugin_dir.join(root_entry_name());
        return if entry.is_file() {
            EntryResolution {
                platform,
                entry_path: Some(entry),
                entry_supported: true,
                supported_platforms: Vec::new(),
                error: None,
            }
        } else {
            EntryResolution::unsupported(
                platform,
                Vec::new(),
                format!("plugin entry {} not found", root_entry_name()),
            )
        };
    };

    let supported: Vec<String> = binaries.keys().cloned().collect();
    let Some(rel) = binaries.get(&platform) else {
        return EntryResolution::unsupported(
            platform,
            supported,
            "plugin binary not available for current platform".to_string(),
        );
    };
    let Some(entry) = safe_join(plugin_dir, &rel.replace('\\', "/")) else {
        return EntryResolution::unsupported(
            platform,
            supported,
            format!("plugin binary path {rel:?} escapes the plugin directory"),
        );
    };
    if !entry.is_file() {
        return EntryResolution::unsupported(
            platform,
            supported,
            format!("plugin binary {rel} is missing"),
        );
    }
    EntryResolution {
        platform,
        entry_path: Some(entry),
        entry_supported: true,
        supported_platforms: supported,
        error: None,
    }
}

fn parse_feature_key(key: &str) -> Option<i32> {
    let key = key.trim();
    if let Ok(n) = key.parse::<i32>() {
        return Some(n);
    }
    AutomationFeature::from_name(key).map(AutomationFeature::as_i32)
}

/// Compare the manifest a plugin reports over RPC with the one on disk
pub fn check_manifest_echo(disk: &DiskManifest, live: &PluginManifest) -> PluginResult<()> {
    let mismatch = |what: &str| {
        Err(PluginError::Manifest(format!(
            "runtime manifest {what} does not match manifest.json"
        )))
    };

    if live.plugin_id.trim().is_empty() {
        return Err(PluginError::Manifest(
            "runtime manifest has an empty plugin_id".to_string(),
        ));
    }
    if live.plugin_id.trim() != disk.plugin_id.trim() {
        return mismatch("plugin_id");
    }
    if live.name.trim() != disk.name.trim() {
        return mismatch("name");
    }
    if live.version.trim() != disk.version.trim() {
        return mismatch("version");
    }

    let caps = &disk.capabilities;
    if caps.sms.is_some() != live.sms.is_some() {
        return mismatch("sms capability");
    }
    if caps.payment.is_some() != live.payment.is_some() {
        return mismatch("payment capability");
    }
    if caps.kyc.is_some() != live.kyc.is_some() {
        return mismatch("kyc capability");
    }
    if caps.automation.is_some() != live.automation.is_some() {
        return mismatch("automation capability");
    }

    if let (Some(disk_pay), Some(live_pay)) = (&caps.payment, &live.payment) {
        let a: BTreeSet<&str> = disk_pay.methods.iter().map(|m| m.trim()).collect();
        let b: BTreeSet<&str> = live_pay.methods.iter().map(|m| m.trim()).collect();
        if a != b {
            return mismatch("payment methods");
        }
    }

    if let (Some(disk_kyc), Some(live_kyc)) = (&caps.kyc, &live.kyc) {
        if disk_kyc != live_kyc {
            return mismatch("kyc flags");
        }
    }

    if let (Some(disk_auto), Some(live_auto)) = (&caps.automation, &live.automation) {
        let declared: BTreeSet<i32> = disk_auto
            .features
            .iter()
            .filter_map(|f| parse_feature_key(f))
            .collect();
        if let Some(missing) = live_auto.features.iter().find(|f| !declared.contains(f)) {
            return Err(PluginError::Manifest(format!(
                "runtime automation feature {missing} is not declared in manifest.json"
            )));
        }

        let disk_reasons: BTreeMap<i32, &str> = disk_auto
            .not_supported_reasons
            .iter()
            .filter_map(|(k, v)| parse_feature_key(k).map(|k| (k, v.trim())))
            .collect();
        let live_reasons: BTreeMap<i32, &str> = live_auto
            .not_supported_reasons
            .iter()
            .map(|(k, v)| (*k, v.trim()))
            .collect();
        if disk_reasons != live_reasons {
            return mismatch("automation not_supported_reasons");
        }
    }

    Ok(())
}
