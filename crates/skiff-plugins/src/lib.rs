//! Skiff plugin runtime
//!
//! Host side of out-of-process provider plugins:
//! - Manifest parsing and platform entry resolution
//! - Checksum and Ed25519 signature verification
//! - ZIP / tar.gz package installation
//! - Process launch, handshake, health supervision
//! - Instance management with encrypted, schema-validated configuration

pub mod automation;
pub mod config_schema;
pub mod installer;
pub mod launcher;
pub mod manager;
pub mod manifest;
pub mod payment_source;
pub mod repository;
pub mod runtime;
pub mod signature;

pub use config_schema::{ConfigValidationError, as_config_validation_error};
pub use installer::{InstalledPackage, PackageInstaller};
pub use launcher::{InProcessLauncher, LaunchedPlugin, PluginLauncher, ProcessLauncher};
pub use manager::{DiscoveredPlugin, InstallationView, PluginManager};
pub use manifest::{DiskManifest, EntryResolution};
pub use payment_source::ManagerPaymentSource;
pub use repository::{InstallationRepository, PluginInstallation};
pub use runtime::{RunningPlugin, Supervisor};
pub use signature::SignatureStatus;

use serde::{Deserialize, Serialize};
use skiff_plugin_api::RpcError;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Instance created implicitly for every installed plugin
pub const DEFAULT_INSTANCE_ID: &str = "default";

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Plugin unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("Invalid package: {0}")]
    Package(String),

    #[error("Config vault error: {0}")]
    Vault(String),

    #[error("{0}")]
    ConfigValidation(#[source] ConfigValidationError),

    #[error("Plugin RPC failed: {0}")]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Core(#[from] skiff_core::Error),

    #[error("Plugin IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Stable code in the same ranges as `skiff_core::Error`
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "E001",
            Self::ConfigValidation(_) => "E002",
            Self::NotFound(_) => "E100",
            Self::Conflict(_) => "E300",
            Self::Unavailable(_) | Self::Rpc(_) => "E400",
            Self::Manifest(_) => "E410",
            Self::Package(_) => "E411",
            Self::Vault(_) => "E601",
            Self::Core(err) => err.code(),
            Self::Io(_) => "E9999",
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Core(err) => err.is_not_found(),
            _ => false,
        }
    }
}

impl From<ConfigValidationError> for PluginError {
    fn from(err: ConfigValidationError) -> Self {
        Self::ConfigValidation(err)
    }
}

impl From<PluginError> for skiff_core::Error {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::NotFound(msg) => Self::NotFound(msg),
            PluginError::InvalidInput(msg) => Self::InvalidInput(msg),
            PluginError::Conflict(msg) => Self::Conflict(msg),
            PluginError::Unavailable(msg) => Self::Unavailable(msg),
            PluginError::Rpc(err) => Self::Unavailable(err.to_string()),
            PluginError::ConfigValidation(err) => Self::InvalidInput(err.to_string()),
            PluginError::Vault(msg) => Self::Vault(msg),
            PluginError::Core(err) => err,
            PluginError::Io(err) => Self::Io(err),
            other => Self::Other(other.to_string()),
        }
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

/// Top-level grouping under the plugin base directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Sms,
    Payment,
    Kyc,
    Automation,
}

impl Category {
    pub const ALL: [Category; 4] = [Self::Sms, Self::Payment, Self::Kyc, Self::Automation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Payment => "payment",
            Self::Kyc => "kyc",
            Self::Automation => "automation",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = PluginError;

    fn from_str(s: &str) -> PluginResult<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| PluginError::InvalidInput(format!("unknown plugin category {s:?}")))
    }
}

/// Reject identifiers that could escape a directory or break the `a:b:c` key
pub fn validate_id(kind: &str, value: &str) -> PluginResult<()> {
    let value_ok = !value.trim().is_empty()
        && value.trim() == value
        && !value.contains("..")
        && !value.contains(':')
        && !value.contains('/')
        && !value.contains('\\');
    if value_ok {
        Ok(())
    } else {
        Err(PluginError::InvalidInput(format!("invalid {kind} {value:?}")))
    }
}

/// Plugin ids also name a directory and prefix `plugin_id.method` payment
/// keys, so they may not contain a dot
pub fn validate_plugin_id(value: &str) -> PluginResult<()> {
    validate_id("plugin id", value)?;
    if value.contains('.') {
        return Err(PluginError::InvalidInput(format!(
            "invalid plugin id {value:?}: dots are not allowed"
        )));
    }
    Ok(())
}

/// Identity of one plugin instance: `(category, plugin_id, instance_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PluginKey {
    pub category: Category,
    pub plugin_id: String,
    pub instance_id: String,
}

impl PluginKey {
    pub fn new(category: Category, plugin_id: &str, instance_id: &str) -> PluginResult<Self> {
        validate_plugin_id(plugin_id)?;
        validate_id("instance id", instance_id)?;
        Ok(Self {
            category,
            plugin_id: plugin_id.to_string(),
            instance_id: instance_id.to_string(),
        })
    }

    pub fn default_instance(category: Category, plugin_id: &str) -> PluginResult<Self> {
        Self::new(category, plugin_id, DEFAULT_INSTANCE_ID)
    }
}

impl fmt::Display for PluginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.category, self.plugin_id, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_is_colon_separated() {
        let key = PluginKey::new(Category::Payment, "ezpay", "default").unwrap();
        assert_eq!(key.to_string(), "payment:ezpay:default");
    }

    #[test]
    fn ids_with_separators_are_rejected() {
        for bad in ["", " x", "a:b", "../x", "a/b", "a\\b"] {
            assert!(PluginKey::new(Category::Sms, bad, "default").is_err(), "{bad:?}");
        }
        assert!(PluginKey::new(Category::Sms, "aliyun-sms", "sms-aliyun-x2").is_ok());
    }

    #[test]
    fn dotted_plugin_ids_are_rejected() {
        assert!(validate_plugin_id("ez.pay").is_err());
        assert!(PluginKey::new(Category::Payment, "ez.pay", "default").is_err());
        assert!(PluginKey::new(Category::Payment, "ezpay", "v1.2").is_ok());
    }

    #[test]
    fn category_parses_case_insensitively() {
        assert_eq!("Payment".parse::<Category>().unwrap(), Category::Payment);
        assert!("storage".parse::<Category>().is_err());
    }

    #[test]
    fn config_validation_maps_to_invalid_input() {
        let err = PluginError::from(ConfigValidationError::missing(
            Category::Payment,
            vec!["api_key".to_string()],
        ));
        assert_eq!(err.code(), "E002");
        let core: skiff_core::Error = err.into();
        assert!(matches!(core, skiff_core::Error::InvalidInput(_)));
    }
}
