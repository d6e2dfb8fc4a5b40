//! Payment provider registry and notify dispatch

pub mod builtin;
pub mod legacy;
pub mod methods;
pub mod notify;
pub mod orders;
pub mod provider;
pub mod registry;
pub mod rpc;
pub mod settings;

pub use methods::{MethodOverride, PAYMENT_CATEGORY, PaymentMethodRepository};
pub use notify::{NotifyHandler, NotifyOutcome, parse_notify_params};
pub use orders::{
    Confirmation, NoopApprover, Order, OrderApprover, OrderPayment, OrderRepository, OrderStatus, PaymentStatus,
};
pub use provider::{
    PAYMENT_CALL_TIMEOUT, PaymentProvider, ProviderInfo, ProviderSource, rpc_key, split_rpc_key,
};
pub use registry::PaymentRegistry;
pub use rpc::{RpcPaymentInstance, RpcPaymentProvider, RpcPaymentSource};
pub use settings::{ProviderSetting, ProviderSettingsRepository};
