//! Payment plugins as seen by the payment registry

use crate::manager::PluginManager;
use crate::manifest::load_manifest;
use crate::{Category, PluginKey};
use async_trait::async_trait;
use skiff_core::payment::{RpcPaymentInstance, RpcPaymentSource};
use skiff_core::{Error, Result};
use skiff_plugin_api::PaymentClient;
use std::sync::Arc;
use tracing::debug;

/// Exposes payment-category installations and their live clients
#[derive(Clone)]
pub struct ManagerPaymentSource {
    manager: Arc<PluginManager>,
}

impl ManagerPaymentSource {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl RpcPaymentSource for ManagerPaymentSource {
    async fn payment_instances(&self) -> Result<Vec<RpcPaymentInstance>> {
        let records = self.manager.repository().list().await?;
        let supervisor = self.manager.supervisor();
        let mut out = Vec::new();
        for record in records.into_iter().filter(|r| r.category == Category::Payment) {
            let running = supervisor.get_running(&record.key()).await;
            let methods = match &running {
                Some(plugin) => plugin
                    .manifest()
                    .payment
                    .as_ref()
                    .map(|p| p.methods.clone())
                    .unwrap_or_default(),
                None => {
                    let dir = self
                        .manager
                        .installer()
                        .plugin_dir(Category::Payment, &record.plugin_id);
                    match load_manifest(&dir) {
                        Ok(manifest) => manifest
                            .capabilities
                            .payment
                            .map(|p| p.methods)
                            .unwrap_or_default(),
                        Err(err) => {
                            debug!(plugin = %record.key(), error = %err, "no manifest for payment methods");
                            Vec::new()
                        }
                    }
                }
            };
            out.push(RpcPaymentInstance {
                plugin_id: record.plugin_id,
                instance_id: record.instance_id,
                name: record.name,
                enabled: record.enabled,
                loaded: running.is_some(),
                methods,
            });
        }
        Ok(out)
    }

    async fn payment_client(&self, plugin_id: &str, instance_id: &str) -> Result<PaymentClient> {
        let key = PluginKey::new(Category::Payment, plugin_id, instance_id)?;
        let installed = self.manager.repository().get(&key).await?;
        if installed.is_none() {
            return Err(Error::NotFound(format!("payment plugin {key}")));
        }
        let running = self
            .manager
            .supervisor()
            .get_running(&key)
            .await
            .ok_or_else(|| Error::Unavailable(format!("payment plugin {key} is not running")))?;
        running
            .payment()
            .cloned()
            .ok_or_else(|| Error::Unavailable(format!("plugin {key} does not serve payments")))
    }
}
