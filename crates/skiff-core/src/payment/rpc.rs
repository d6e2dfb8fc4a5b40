//! Payment methods served by out-of-process plugins
//!
//! The registry sees plugins only through [`RpcPaymentSource`], which the
//! plugin runtime implements. Keys are `plugin_id.method`.

use super::provider::{PAYMENT_CALL_TIMEOUT, PaymentProvider, ProviderSource, rpc_key};
use crate::error::{Error, Result};
use async_trait::async_trait;
use skiff_plugin_api::types::{
    CreatePaymentRequest, CreatePaymentResponse, HttpRequest, VerifyNotifyRequest,
    VerifyNotifyResponse,
};
use skiff_plugin_api::{PaymentClient, RpcError, with_deadline};
use std::time::Duration;

/// One payment plugin instance as known to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcPaymentInstance {
    pub plugin_id: String,
    pub instance_id: String,
    pub name: String,
    pub enabled: bool,
    /// A live process is serving this instance
    pub loaded: bool,
    pub methods: Vec<String>,
}

#[async_trait]
pub trait RpcPaymentSource: Send + Sync {
    /// Every installed payment plugin instance
    async fn payment_instances(&self) -> Result<Vec<RpcPaymentInstance>>;

    /// Payment client of a running instance
    async fn payment_client(&self, plugin_id: &str, instance_id: &str) -> Result<PaymentClient>;
}

/// Pick the instance that serves `plugin_id`: `default` when usable, else the lowest id
pub fn resolve_instance<'a>(
    instances: &'a [RpcPaymentInstance],
    plugin_id: &str,
) -> Option<&'a RpcPaymentInstance> {
    let mut usable: Vec<&RpcPaymentInstance> = instances
        .iter()
        .filter(|i| i.plugin_id == plugin_id && i.enabled && i.loaded)
        .collect();
    usable.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    usable
        .iter()
        .find(|i| i.instance_id == "default")
        .or_else(|| usable.first())
        .copied()
}

pub(crate) fn map_rpc_error(key: &str, err: RpcError) -> Error {
    match err {
        RpcError::Status(status) => Error::Unavailable(format!("{key}: {}", status.message)),
        other => Error::Unavailable(format!("{key}: {other}")),
    }
}

/// A single `plugin_id.method` bound to a live plugin client
#[derive(Debug, Clone)]
pub struct RpcPaymentProvider {
    key: String,
    name: String,
    method: String,
    instance_id: String,
    client: PaymentClient,
    timeout: Duration,
}

impl RpcPaymentProvider {
    pub fn new(plugin_id: &str, instance_id: &str, method: &str, client: PaymentClient) -> Self {
        Self {
            key: rpc_key(plugin_id, method),
            name: rpc_key(plugin_id, method),
            method: method.to_string(),
            instance_id: instance_id.to_string(),
            client,
            timeout: PAYMENT_CALL_TIMEOUT,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

#[async_trait]
impl PaymentProvider for RpcPaymentProvider {
    fn key(&self) -> &str {
        &self.key
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Rpc
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        let req = CreatePaymentRequest {
            method: self.method.clone(),
            ..req.clone()
        };
        with_deadline(self.timeout, self.client.create_payment(&req))
            .await
            .map_err(|e| map_rpc_error(&self.key, e))
    }

    async fn verify_notify(&self, req: &HttpRequest) -> Result<VerifyNotifyResponse> {
        let req = VerifyNotifyRequest {
            method: self.method.clone(),
            request: req.clone(),
        };
        with_deadline(self.timeout, self.client.verify_notify(&req))
            .await
            .map_err(|e| map_rpc_error(&self.key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(id: &str, enabled: bool, loaded: bool) -> RpcPaymentInstance {
        RpcPaymentInstance {
            plugin_id: "ezpay".to_string(),
            instance_id: id.to_string(),
            name: "EZPay".to_string(),
            enabled,
            loaded,
            methods: vec!["alipay".to_string()],
        }
    }

    #[test]
    fn default_instance_preferred_then_lowest_id() {
        let all = vec![inst("b", true, true), inst("default", true, true), inst("a", true, true)];
        assert_eq!(resolve_instance(&all, "ezpay").unwrap().instance_id, "default");

        let all = vec![inst("b", true, true), inst("default", false, false), inst("a", true, true)];
        assert_eq!(resolve_instance(&all, "ezpay").unwrap().instance_id, "a");

        let all = vec![inst("a", true, false)];
        assert!(resolve_instance(&all, "ezpay").is_none());
        assert!(resolve_instance(&all, "other").is_none());
    }
}
