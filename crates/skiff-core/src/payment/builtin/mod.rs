//! Providers compiled into the host

mod approval;
mod balance;
mod custom;
pub mod yipay;

pub use approval::ApprovalProvider;
pub use balance::BalanceProvider;
pub use custom::{CustomConfig, CustomProvider};
pub use yipay::{YiPayConfig, YiPayProvider};

use super::provider::PaymentProvider;
use crate::error::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

pub const APPROVAL: &str = "approval";
pub const BALANCE: &str = "balance";
pub const YIPAY: &str = "yipay";
pub const CUSTOM: &str = "custom";

pub const BUILTIN_KEYS: [&str; 4] = [APPROVAL, BALANCE, YIPAY, CUSTOM];

pub fn is_builtin(key: &str) -> bool {
    BUILTIN_KEYS.contains(&key)
}

/// Switch state for a built-in without a `payment_providers` row
pub fn default_enabled(key: &str) -> bool {
    matches!(key, APPROVAL | BALANCE)
}

pub fn display_name(key: &str) -> &'static str {
    match key {
        APPROVAL => "Manual approval",
        BALANCE => "Wallet balance",
        YIPAY => "YiPay",
        CUSTOM => "Custom",
        _ => "",
    }
}

/// Construct a built-in from its stored config
pub fn build(key: &str, config: &Value) -> Result<Arc<dyn PaymentProvider>> {
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };
    let provider: Arc<dyn PaymentProvider> = match key {
        APPROVAL => Arc::new(ApprovalProvider),
        BALANCE => Arc::new(BalanceProvider),
        YIPAY => Arc::new(YiPayProvider::new(parse_config(key, config)?)),
        CUSTOM => Arc::new(CustomProvider::new(parse_config(key, config)?)),
        other => return Err(Error::NotFound(format!("payment provider {other}"))),
    };
    Ok(provider)
}

fn parse_config<T: serde::de::DeserializeOwned>(key: &str, config: Value) -> Result<T> {
    serde_json::from_value(config)
        .map_err(|e| Error::ConfigError(format!("invalid {key} provider config: {e}")))
}

fn unsupported_notify(key: &str) -> Error {
    Error::InvalidInput(format!("{key} provider does not accept notifications"))
}
