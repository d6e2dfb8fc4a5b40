//! Host configuration with file persistence

use crate::billing::RefundPolicy;
use crate::security::MasterKey;
use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Default environment variable holding the base64url config vault key
pub const DEFAULT_MASTER_KEY_ENV: &str = "SKIFF_CONFIG_MASTER_KEY";

/// Skiff host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub database: DatabaseSection,
    pub plugins: PluginsSection,
    pub vault: VaultSection,
    pub refund: RefundPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// SQLite file; empty means the platform data directory
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    pub base_dir: PathBuf,
    /// Base64 Ed25519 public keys whose signatures mark a plugin official
    pub trusted_public_keys: Vec<String>,
    pub legacy_payment_dir: Option<PathBuf>,
}

impl Default for PluginsSection {
    fn default() -> Self {
        let base_dir = dirs::data_dir()
            .map(|d| d.join("skiff").join("plugins"))
            .unwrap_or_else(|| PathBuf::from("plugins"));
        Self {
            base_dir,
            trusted_public_keys: Vec::new(),
            legacy_payment_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultSection {
    pub master_key_env: String,
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            master_key_env: DEFAULT_MASTER_KEY_ENV.to_string(),
        }
    }
}

impl PluginsSection {
    /// Decode the trusted keys into raw 32-byte Ed25519 public keys
    pub fn trusted_key_bytes(&self) -> anyhow::Result<Vec<[u8; 32]>> {
        self.trusted_public_keys
            .iter()
            .map(|encoded| {
                let raw = BASE64_STANDARD
                    .decode(encoded.trim())
                    .with_context(|| format!("Invalid trusted public key: {}", encoded))?;
                <[u8; 32]>::try_from(raw.as_slice()).map_err(|_| {
                    anyhow!(
                        "Trusted public key must be 32 bytes, got {}: {}",
                        raw.len(),
                        encoded
                    )
                })
            })
            .collect()
    }
}

impl VaultSection {
    /// Read the master key from the configured environment variable
    pub fn master_key(&self) -> anyhow::Result<MasterKey> {
        let encoded = env::var(&self.master_key_env)
            .with_context(|| format!("{} is not set", self.master_key_env))?;
        MasterKey::from_base64url(&encoded)
            .with_context(|| format!("{} is not a valid key", self.master_key_env))
    }
}

impl HostConfig {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("SKIFF_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("skiff")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: HostConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.plugins.trusted_key_bytes()?;
        if self.vault.master_key_env.trim().is_empty() {
            return Err(anyhow!("vault.master_key_env must not be empty"));
        }
        self.refund
            .validate()
            .map_err(|e| anyhow!("Invalid refund policy: {}", e))
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let r = &self.refund;
        match key {
            "database.path" => Ok(self
                .database
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(default)".to_string())),

            "plugins.base_dir" => Ok(self.plugins.base_dir.display().to_string()),
            "plugins.trusted_public_keys" => Ok(self.plugins.trusted_public_keys.join(", ")),
            "plugins.legacy_payment_dir" => Ok(self
                .plugins
                .legacy_payment_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()),

            "vault.master_key_env" => Ok(self.vault.master_key_env.clone()),
            "vault.master_key" => Ok(match env::var(&self.vault.master_key_env) {
                Ok(_) => "(set)".to_string(),
                Err(_) => format!("(not set - use {} env var)", self.vault.master_key_env),
            }),

            "refund.full_hours" => Ok(r.full_hours.to_string()),
            "refund.full_days" => Ok(r.full_days.to_string()),
            "refund.prorate_hours" => Ok(r.prorate_hours.to_string()),
            "refund.prorate_days" => Ok(r.prorate_days.to_string()),
            "refund.no_refund_hours" => Ok(r.no_refund_hours.to_string()),
            "refund.no_refund_days" => Ok(r.no_refund_days.to_string()),
            "refund.require_approval" => Ok(r.require_approval.to_string()),
            "refund.auto_refund_on_delete" => Ok(r.auto_refund_on_delete.to_string()),
            "refund.curve" => Ok(r
                .curve
                .iter()
                .map(|p| format!("{}%={}", p.percent, p.ratio))
                .collect::<Vec<_>>()
                .join(", ")),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `skiff config list` to see available keys.",
                key
            )),
        }
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "database.path",
            "plugins.base_dir",
            "plugins.trusted_public_keys",
            "plugins.legacy_payment_dir",
            "vault.master_key_env",
            "vault.master_key",
            "refund.full_hours",
            "refund.full_days",
            "refund.prorate_hours",
            "refund.prorate_days",
            "refund.no_refund_hours",
            "refund.no_refund_days",
            "refund.curve",
            "refund.require_approval",
            "refund.auto_refund_on_delete",
        ];

        keys.into_iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.vault.master_key_env, DEFAULT_MASTER_KEY_ENV);
        assert!(config.plugins.trusted_key_bytes().unwrap().is_empty());
    }

    #[test]
    fn parses_sections_and_curve() {
        let key = BASE64_STANDARD.encode([7u8; 32]);
        let toml = format!(
            r#"
            [plugins]
            base_dir = "/srv/plugins"
            trusted_public_keys = ["{key}"]

            [refund]
            require_approval = false
            curve = [{{ percent = 0.0, ratio = 1.0 }}, {{ percent = 100.0, ratio = 0.0 }}]
            "#
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, toml).unwrap();

        let config = HostConfig::load_from(&path).unwrap();
        assert_eq!(config.plugins.base_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.plugins.trusted_key_bytes().unwrap(), vec![[7u8; 32]]);
        assert!(!config.refund.require_approval);
        assert_eq!(config.refund.prorate_days, 7);
        assert_eq!(config.get("refund.curve").unwrap(), "0%=1, 100%=0");
    }

    #[test]
    fn rejects_short_trusted_key() {
        let mut config = HostConfig::default();
        config.plugins.trusted_public_keys = vec![BASE64_STANDARD.encode([1u8; 16])];
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_key_is_an_error() {
        let config = HostConfig::default();
        assert!(config.get("nope").is_err());
        assert_eq!(config.list().unwrap().len(), 15);
    }
}
