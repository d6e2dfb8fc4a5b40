//! YiPay, an EPay-compatible gateway
//!
//! Requests and notifications carry `sign = md5(k1=v1&k2=v2...<key>)` over
//! the non-empty parameters sorted by name, excluding `sign` and `sign_type`.

use super::{YIPAY, display_name};
use crate::error::{Error, Result};
use crate::payment::notify::parse_notify_params;
use crate::payment::provider::{PaymentProvider, ProviderSource};
use async_trait::async_trait;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use skiff_plugin_api::types::{
    CreatePaymentRequest, CreatePaymentResponse, HttpRequest, VerifyNotifyResponse,
};
use std::collections::BTreeMap;
use tracing::warn;
use url::Url;

const TRADE_SUCCESS: &str = "TRADE_SUCCESS";
const ACK_SUCCESS: &str = "success";
const ACK_FAIL: &str = "fail";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct YiPayConfig {
    pub base_url: String,
    pub pid: String,
    pub key: String,
    /// Gateway channel, e.g. `alipay` or `wxpay`
    pub pay_type: String,
    pub notify_url: String,
    pub return_url: String,
}

#[derive(Debug, Clone)]
pub struct YiPayProvider {
    config: YiPayConfig,
}

impl YiPayProvider {
    pub fn new(config: YiPayConfig) -> Self {
        Self { config }
    }

    fn ensure_configured(&self) -> Result<()> {
        let c = &self.config;
        let missing: Vec<&str> = [
            ("base_url", &c.base_url),
            ("pid", &c.pid),
            ("key", &c.key),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::ConfigError(format!(
                "yipay config missing {}",
                missing.join(", ")
            )))
        }
    }

    pub fn sign(&self, params: &BTreeMap<String, String>) -> String {
        sign_params(params, &self.config.key)
    }
}

/// EPay MD5 signature over `params`
pub fn sign_params(params: &BTreeMap<String, String>, key: &str) -> String {
    let payload = params
        .iter()
        .filter(|(k, v)| k.as_str() != "sign" && k.as_str() != "sign_type" && !v.is_empty())
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let mut hasher = Md5::new();
    hasher.update(payload.as_bytes());
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cents to the gateway's `0.00` money format
pub fn format_money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}

/// Gateway money to cents; at most two decimals
pub fn parse_money(money: &str) -> Option<i64> {
    let money = money.trim();
    let (whole, frac) = money.split_once('.').unwrap_or((money, ""));
    if whole.is_empty() || frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    if whole < 0 {
        return None;
    }
    let frac: i64 = format!("{frac:0<2}").parse().ok()?;
    whole.checked_mul(100)?.checked_add(frac)
}

#[async_trait]
impl PaymentProvider for YiPayProvider {
    fn key(&self) -> &str {
        YIPAY
    }

    fn name(&self) -> &str {
        display_name(YIPAY)
    }

    fn source(&self) -> ProviderSource {
        ProviderSource::Builtin
    }

    async fn create_payment(&self, req: &CreatePaymentRequest) -> Result<CreatePaymentResponse> {
        self.ensure_configured()?;
        if req.amount <= 0 {
            return Err(Error::InvalidInput("amount must be positive".to_string()));
        }

        let pay_type = if req.method.is_empty() || req.method == YIPAY {
            self.config.pay_type.clone()
        } else {
            req.method.clone()
        };
        let notify_url = if req.notify_url.is_empty() {
            self.config.notify_url.clone()
        } else {
            req.notify_url.clone()
        };
        let return_url = if req.return_url.is_empty() {
            self.config.return_url.clone()
        } else {
            req.return_url.clone()
        };
        let subject = if req.subject.is_empty() {
            req.order_no.clone()
        } else {
            req.subject.clone()
        };

        let mut params = BTreeMap::new();
        params.insert("pid".to_string(), self.config.pid.clone());
        params.insert("type".to_string(), pay_type);
        params.insert("out_trade_no".to_string(), req.order_no.clone());
        params.insert("notify_url".to_string(), notify_url);
        params.insert("return_url".to_string(), return_url);
        params.insert("name".to_string(), subject);
        params.insert("money".to_string(), format_money(req.amount));
        params.retain(|_, v| !v.is_empty());
        let sign = self.sign(&params);
        params.insert("sign".to_string(), sign);
        params.insert("sign_type".to_string(), "MD5".to_string());

        let endpoint = format!("{}/submit.php", self.config.base_url.trim_end_matches('/'));
        let url = Url::parse_with_params(&endpoint, params.iter())
            .map_err(|e| Error::ConfigError(format!("invalid yipay base_url: {e}")))?;

        Ok(CreatePaymentResponse {
            trade_no: String::new(),
            pay_url: url.to_string(),
            extra: BTreeMap::new(),
        })
    }

    async fn verify_notify(&self, req: &HttpRequest) -> Result<VerifyNotifyResponse> {
        self.ensure_configured()?;
        let params = parse_notify_params(req);

        let provided = params.get("sign").map(String::as_str).unwrap_or_default();
        if provided.is_empty() || !provided.eq_ignore_ascii_case(&self.sign(&params)) {
            warn!(provider = YIPAY, "notify signature mismatch");
            return Err(Error::InvalidInput("yipay notify signature mismatch".to_string()));
        }
        if params.get("pid").map(String::as_str) != Some(self.config.pid.as_str()) {
            return Err(Error::InvalidInput("yipay notify pid mismatch".to_string()));
        }

        let get = |k: &str| params.get(k).cloned().unwrap_or_default();
        let paid = get("trade_status") == TRADE_SUCCESS;
        let amount = parse_money(&get("money"))
            .ok_or_else(|| Error::InvalidInput(format!("invalid money {:?}", get("money"))))?;

        Ok(VerifyNotifyResponse {
            paid,
            order_no: get("out_trade_no"),
            trade_no: get("trade_no"),
            amount,
            ack_body: if paid { ACK_SUCCESS } else { ACK_FAIL }.to_string(),
        })
    }
}
