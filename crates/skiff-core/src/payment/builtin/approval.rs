use super::{APPROVAL, display_name, unsupported_notify};
use crate::error::Result;
use crate::payment::provider::{PaymentProvider, ProviderSource};
use async_trait::async_trait;
use skiff_plugin_api::types::{
    CreatePaymentRequest, CreatePaymentResponse, HttpRequest, VerifyNotifyResponse,
};

/// Offline payment confirmed by an operator
#[derive(Debug, Default, Clone, Copy)]
pub struct ApprovalProvider;

#[async_trait]
impl PaymentProvider for ApprovalProvider {
    fn key(&self) -> &str {
        APPROVAL
    }

    fn name(&self) -> &str {
        display_name(APPROVAL)
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Builtin
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        let mut resp = CreatePaymentResponse::default();
        resp.extra.insert("mode".to_string(), "manual_approval".to_string());
        resp.extra.insert("order_no".to_string(), req.order_no.clone());
        Ok(resp)
    }

    async fn verify_notify(&self, _req: &HttpRequest) -> Result<VerifyNotifyResponse> {
        Err(unsupported_notify(APPROVAL))
    }
}
