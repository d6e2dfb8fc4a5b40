use super::{CUSTOM, display_name, unsupported_notify};
use crate::error::{Error, Result};
use crate::payment::provider::{PaymentProvider, ProviderSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_plugin_api::types::{
    CreatePaymentRequest, CreatePaymentResponse, HttpRequest, VerifyNotifyResponse,
};

/// Operator-defined payment page
///
/// `pay_url` may contain `{order_no}`, `{amount}`, `{user_id}` and `{subject}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomConfig {
    pub name: String,
    pub pay_url: String,
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct CustomProvider {
    config: CustomConfig,
}

impl CustomProvider {
    pub fn new(config: CustomConfig) -> Self {
        Self { config }
    }
}

fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}

#[async_trait]
impl PaymentProvider for CustomProvider {
    fn key(&self) -> &str {
        CUSTOM
    }

    fn name(&self) -> &str {
        if self.config.name.trim().is_empty() {
            display_name(CUSTOM)
        } else {
            &self.config.name
        }
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Builtin
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        if self.config.pay_url.trim().is_empty() && self.config.instructions.trim().is_empty() {
            return Err(Error::ConfigError(
                "custom provider needs pay_url or instructions".to_string(),
            ));
        }
        let pay_url = self
            .config
            .pay_url
            .replace("{order_no}", &req.order_no)
            .replace("{amount}", &format_amount(req.amount))
            .replace("{user_id}", &req.user_id)
            .replace("{subject}", &req.subject);

        let mut resp = CreatePaymentResponse {
            pay_url,
            ..Default::default()
        };
        if !self.config.instructions.is_empty() {
            resp.extra
                .insert("instructions".to_string(), self.config.instructions.clone());
        }
        Ok(resp)
    }

    async fn verify_notify(&self, _req: &HttpRequest) -> Result<VerifyNotifyResponse> {
        Err(unsupported_notify(CUSTOM))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pay_url_template_is_filled() {
        let provider = CustomProvider::new(CustomConfig {
            name: "Bank transfer".to_string(),
            pay_url: "https://pay.local/{order_no}?amt={amount}".to_string(),
            instructions: String::new(),
        });
        let resp = provider
            .create_payment(&CreatePaymentRequest {
                order_no: "SO-9".to_string(),
                amount: 1005,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.pay_url, "https://pay.local/SO-9?amt=10.05");
        assert_eq!(provider.name(), "Bank transfer");
    }

    #[tokio::test]
    async fn unconfigured_custom_provider_fails() {
        let provider = CustomProvider::new(CustomConfig::default());
        assert!(provider.create_payment(&CreatePaymentRequest::default()).await.is_err());
        assert!(provider.verify_notify(&HttpRequest::default()).await.is_err());
    }
}
