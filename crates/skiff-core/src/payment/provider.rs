//! The provider abstraction every payment origin implements

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_plugin_api::types::{
    CreatePaymentRequest, CreatePaymentResponse, HttpRequest, VerifyNotifyResponse,
};
use std::time::Duration;

/// Deadline for create/verify calls that leave the host process
pub const PAYMENT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a provider key comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSource {
    Builtin,
    Legacy,
    Rpc,
}

impl ProviderSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Legacy => "legacy",
            Self::Rpc => "rpc",
        }
    }
}

/// Listing entry returned by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub key: String,
    pub name: String,
    pub source: ProviderSource,
    pub enabled: bool,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn key(&self) -> &str;

    fn name(&self) -> &str;

    fn source(&self) -> ProviderSource;

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatePaymentResponse>;

    /// Verify an inbound notification; `paid=false` means "not a success notice"
    async fn verify_notify(&self, req: &HttpRequest) -> Result<VerifyNotifyResponse>;
}

/// Split an RPC provider key `plugin_id.method`
///
/// Exactly one dot, both halves non-empty.
pub fn split_rpc_key(key: &str) -> Option<(&str, &str)> {
    let (plugin_id, method) = key.split_once('.')?;
    if plugin_id.is_empty() || method.is_empty() || method.contains('.') {
        return None;
    }
    Some((plugin_id, method))
}

pub fn rpc_key(plugin_id: &str, method: &str) -> String {
    format!("{plugin_id}.{method}")
}
