use super::{BALANCE, display_name, unsupported_notify};
use crate::error::{Error, Result};
use crate::payment::provider::{PaymentProvider, ProviderSource};
use async_trait::async_trait;
use skiff_plugin_api::types::{
    CreatePaymentRequest, CreatePaymentResponse, HttpRequest, VerifyNotifyResponse,
};

/// Pays from the user's wallet; the host debits the balance itself
#[derive(Debug, Default, Clone, Copy)]
pub struct BalanceProvider;

#[async_trait]
impl PaymentProvider for BalanceProvider {
    fn key(&self) -> &str {
        BALANCE
    }

    fn name(&self) -> &str {
        display_name(BALANCE)
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Builtin
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        if req.amount <= 0 {
            return Err(Error::InvalidInput("amount must be positive".to_string()));
        }
        let mut resp = CreatePaymentResponse::default();
        resp.extra.insert("mode".to_string(), "balance".to_string());
        resp.extra.insert("user_id".to_string(), req.user_id.clone());
        Ok(resp)
    }

    async fn verify_notify(&self, _req: &HttpRequest) -> Result<VerifyNotifyResponse> {
        Err(unsupported_notify(BALANCE))
    }
}
