//! One keyed namespace over built-in, legacy and RPC payment providers
//!
//! Switches and per-method overrides are read from the database on every
//! lookup, so administrative changes apply to the next dispatch.

use super::builtin;
use super::legacy::{LegacyProvider, scan_legacy_dir};
use super::methods::{MethodOverride, PAYMENT_CATEGORY, PaymentMethodRepository};
use super::provider::{PaymentProvider, ProviderInfo, ProviderSource, rpc_key, split_rpc_key};
use super::rpc::{RpcPaymentProvider, RpcPaymentSource, resolve_instance};
use super::settings::ProviderSettingsRepository;
use crate::error::{Error, Result};
use serde_json::Value;
use skiff_plugin_api::types::{CreatePaymentRequest, CreatePaymentResponse};
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub struct PaymentRegistry {
    settings: ProviderSettingsRepository,
    methods: PaymentMethodRepository,
    legacy: RwLock<Vec<Arc<LegacyProvider>>>,
    rpc: Option<Arc<dyn RpcPaymentSource>>,
}

impl PaymentRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            settings: ProviderSettingsRepository::new(pool.clone()),
            methods: PaymentMethodRepository::new(pool),
            legacy: RwLock::new(Vec::new()),
            rpc: None,
        }
    }

    pub fn with_rpc_source(mut self, source: Arc<dyn RpcPaymentSource>) -> Self {
        self.rpc = Some(source);
        self
    }

    pub fn with_legacy_dir(self, dir: &Path) -> Self {
        self.reload_legacy(dir);
        self
    }

    /// Rescan the legacy provider directory
    pub fn reload_legacy(&self, dir: &Path) -> usize {
        let found: Vec<Arc<LegacyProvider>> =
            scan_legacy_dir(dir).into_iter().map(Arc::new).collect();
        let count = found.len();
        *self
            .legacy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = found;
        info!(dir = %dir.display(), count, "loaded legacy payment providers");
        count
    }

    fn legacy_providers(&self) -> Vec<Arc<LegacyProvider>> {
        self.legacy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn find_legacy(&self, key: &str) -> Option<Arc<LegacyProvider>> {
        self.legacy_providers().into_iter().find(|p| p.key() == key)
    }

    pub fn method_overrides(&self) -> &PaymentMethodRepository {
        &self.methods
    }

    async fn switch(&self, key: &str, default_enabled: bool) -> Result<(bool, Value)> {
        Ok(match self.settings.get(key).await? {
            Some(setting) => (setting.enabled, setting.config),
            None => (default_enabled, Value::Object(Default::default())),
        })
    }

    /// All providers sorted by key; disabled ones only when asked for
    pub async fn list_providers(&self, include_disabled: bool) -> Result<Vec<ProviderInfo>> {
        let mut out = Vec::new();

        for key in builtin::BUILTIN_KEYS {
            let (enabled, _) = self.switch(key, builtin::default_enabled(key)).await?;
            out.push(ProviderInfo {
                key: key.to_string(),
                name: builtin::display_name(key).to_string(),
                source: ProviderSource::Builtin,
                enabled,
            });
        }

        for provider in self.legacy_providers() {
            let (enabled, _) = self
                .switch(provider.key(), provider.declared_enabled())
                .await?;
            out.push(ProviderInfo {
                key: provider.key().to_string(),
                name: provider.name().to_string(),
                source: ProviderSource::Legacy,
                enabled,
            });
        }

        if let Some(rpc) = &self.rpc {
            let instances = rpc.payment_instances().await?;
            let mut plugin_ids: Vec<&str> =
                instances.iter().map(|i| i.plugin_id.as_str()).collect();
            plugin_ids.sort_unstable();
            plugin_ids.dedup();
            for plugin_id in plugin_ids {
                let Some(instance) = resolve_instance(&instances, plugin_id) else {
                    continue;
                };
                for method in &instance.methods {
                    let enabled = self
                        .methods
                        .is_enabled(PAYMENT_CATEGORY, plugin_id, &instance.instance_id, method)
                        .await?;
                    out.push(ProviderInfo {
                        key: rpc_key(plugin_id, method),
                        name: format!("{} ({method})", instance.name),
                        source: ProviderSource::Rpc,
                        enabled,
                    });
                }
            }
        }

        out.retain(|p| include_disabled || p.enabled);
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out.dedup_by(|b, a| a.key == b.key);
        Ok(out)
    }

    pub async fn get_provider(&self, key: &str) -> Result<Arc<dyn PaymentProvider>> {
        let key = key.trim();

        if builtin::is_builtin(key) {
            let (enabled, config) = self.switch(key, builtin::default_enabled(key)).await?;
            if !enabled {
                return Err(Error::Forbidden(format!("payment provider {key} is disabled")));
            }
            return builtin::build(key, &config);
        }

        if let Some(provider) = self.find_legacy(key) {
            let (enabled, _) = self.switch(key, provider.declared_enabled()).await?;
            if !enabled {
                return Err(Error::Forbidden(format!("payment provider {key} is disabled")));
            }
            let provider: Arc<dyn PaymentProvider> = provider;
            return Ok(provider);
        }

        if let (Some((plugin_id, method)), Some(rpc)) = (split_rpc_key(key), &self.rpc) {
            return self.get_rpc_provider(rpc.as_ref(), plugin_id, method).await;
        }

        Err(Error::NotFound(format!("payment provider {key}")))
    }

    async fn get_rpc_provider(
        &self,
        rpc: &dyn RpcPaymentSource,
        plugin_id: &str,
        method: &str,
    ) -> Result<Arc<dyn PaymentProvider>> {
        let key = rpc_key(plugin_id, method);
        let instances = rpc.payment_instances().await?;
        let resolved = resolve_instance(&instances, plugin_id);
        if resolved.is_none() && !instances.iter().any(|i| i.plugin_id == plugin_id) {
            return Err(Error::NotFound(format!("payment provider {key}")));
        }
        if resolved.is_some_and(|i| !i.methods.iter().any(|m| m == method)) {
            return Err(Error::NotFound(format!("payment provider {key}")));
        }
        // Overrides apply whether or not the plugin is running.
        let instance_id = resolved.map_or("default", |i| i.instance_id.as_str());
        if !self
            .methods
            .is_enabled(PAYMENT_CATEGORY, plugin_id, instance_id, method)
            .await?
        {
            return Err(Error::Forbidden(format!("payment method {key} is disabled")));
        }
        let Some(instance) = resolved else {
            return Err(Error::Unavailable(format!("payment plugin {plugin_id} is not running")));
        };

        let client = rpc.payment_client(plugin_id, &instance.instance_id).await?;
        debug!(provider = %key, instance = %instance.instance_id, "resolved rpc payment provider");
        Ok(Arc::new(RpcPaymentProvider::new(
            plugin_id,
            &instance.instance_id,
            method,
            client,
        )))
    }

    pub async fn create_payment(
        &self,
        key: &str,
        req: &CreatePaymentRequest,
    ) -> Result<CreatePaymentResponse> {
        let provider = self.get_provider(key).await?;
        let resp = provider.create_payment(req).await?;
        info!(provider = key, order_no = %req.order_no, amount = req.amount, "payment created");
        Ok(resp)
    }

    /// Turn a built-in or legacy provider on or off
    pub async fn set_provider_enabled(&self, key: &str, enabled: bool) -> Result<()> {
        if !builtin::is_builtin(key) && self.find_legacy(key).is_none() {
            return Err(Error::NotFound(format!("payment provider {key}")));
        }
        self.settings.set_enabled(key, enabled).await?;
        info!(provider = key, enabled, "payment provider switched");
        Ok(())
    }

    /// Store config for a built-in provider, validating that it builds
    pub async fn set_provider_config(&self, key: &str, config: &Value) -> Result<()> {
        if !builtin::is_builtin(key) {
            return Err(Error::InvalidInput(format!(
                "{key} is not a configurable built-in provider"
            )));
        }
        builtin::build(key, config)?;
        self.settings
            .set_config(key, config, builtin::default_enabled(key))
            .await
    }

    pub async fn set_method_enabled(
        &self,
        plugin_id: &str,
        instance_id: &str,
        method: &str,
        enabled: bool,
    ) -> Result<()> {
        if plugin_id.is_empty() || method.is_empty() || method.contains('.') {
            return Err(Error::InvalidInput(format!(
                "invalid payment method {plugin_id}.{method}"
            )));
        }
        self.methods
            .set_enabled(PAYMENT_CATEGORY, plugin_id, instance_id, method, enabled)
            .await?;
        info!(plugin_id, instance_id, method, enabled, "payment method override set");
        Ok(())
    }

    pub async fn list_method_overrides(
        &self,
        plugin_id: &str,
        instance_id: &str,
    ) -> Result<Vec<MethodOverride>> {
        self.methods
            .list(PAYMENT_CATEGORY, plugin_id, instance_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use serde_json::json;

    async fn registry() -> PaymentRegistry {
        let db = Database::in_memory().await.unwrap();
        PaymentRegistry::new(db.pool().clone())
    }

    #[tokio::test]
    async fn builtins_listed_sorted_with_defaults() {
        let r = registry().await;
        let enabled: Vec<String> = r
            .list_providers(false)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.key)
            .collect();
        assert_eq!(enabled, vec!["approval", "balance"]);

        let all: Vec<String> = r
            .list_providers(true)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.key)
            .collect();
        assert_eq!(all, vec!["approval", "balance", "custom", "yipay"]);
    }

    #[tokio::test]
    async fn disabled_builtin_is_forbidden_and_unknown_is_not_found() {
        let r = registry().await;
        assert!(r.get_provider("approval").await.is_ok());
        r.set_provider_enabled("approval", false).await.unwrap();
        assert!(r.get_provider("approval").await.err().unwrap().is_forbidden());
        assert!(r.get_provider("yipay").await.err().unwrap().is_forbidden());
        assert!(r.get_provider("nope").await.err().unwrap().is_not_found());
        assert!(r.get_provider("ezpay.alipay").await.err().unwrap().is_not_found());
        assert!(r.set_provider_enabled("nope", true).await.is_err());
    }

    #[tokio::test]
    async fn configured_yipay_becomes_available() {
        let r = registry().await;
        let config = json!({"base_url": "https://pay.local", "pid": "pid", "key": "secret", "pay_type": "alipay"});
        r.set_provider_config("yipay", &config).await.unwrap();
        r.set_provider_enabled("yipay", true).await.unwrap();
        let resp = r
            .create_payment(
                "yipay",
                &CreatePaymentRequest {
                    order_no: "1".to_string(),
                    amount: 1000,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(resp.pay_url.contains("sign="));
    }

    #[tokio::test]
    async fn method_override_validation() {
        let r = registry().await;
        assert!(r.set_method_enabled("ezpay", "default", "a.b", false).await.is_err());
        r.set_method_enabled("ezpay", "default", "alipay", false).await.unwrap();
        assert_eq!(r.list_method_overrides("ezpay", "default").await.unwrap().len(), 1);
    }
}
