use async_trait::async_trait;
use serde_json::json;
use skiff_core::events::{EventLog, PAYMENT_CONFIRMED};
use skiff_core::payment::builtin::yipay::sign_params;
use skiff_core::payment::{
    NoopApprover, NotifyHandler, Order, OrderApprover, OrderPayment, OrderRepository, OrderStatus,
    PaymentRegistry, PaymentStatus, RpcPaymentInstance, RpcPaymentSource,
};
use skiff_core::storage::Database;
use skiff_core::{Error, Result};
use skiff_plugin_api::server::{CoreService, PaymentService, PluginServices, serve};
use skiff_plugin_api::types::*;
use skiff_plugin_api::{PaymentClient, RpcClient, RpcStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct EzCore;

#[async_trait]
impl CoreService for EzCore {
    async fn get_manifest(&self) -> std::result::Result<PluginManifest, RpcStatus> {
        Ok(PluginManifest {
            plugin_id: "ezpay".to_string(),
            name: "EzPay".to_string(),
            version: "1.0.0".to_string(),
            payment: Some(PaymentCapability {
                methods: vec!["alipay".into(), "wxpay".into(), "qq".into()],
            }),
            ..Default::default()
        })
    }

    async fn get_config_schema(&self) -> std::result::Result<ConfigSchema, RpcStatus> {
        Ok(ConfigSchema::default())
    }

    async fn validate_config(&self, _: &str) -> std::result::Result<AckResponse, RpcStatus> {
        Ok(AckResponse::ok())
    }

    async fn init(&self, _: &str, _: &str) -> std::result::Result<AckResponse, RpcStatus> {
        Ok(AckResponse::ok())
    }

    async fn reload_config(&self, _: &str) -> std::result::Result<AckResponse, RpcStatus> {
        Ok(AckResponse::ok())
    }

    async fn health(&self, _: &str) -> std::result::Result<HealthResponse, RpcStatus> {
        Ok(HealthResponse::default())
    }
}

struct EzPay;

#[async_trait]
impl PaymentService for EzPay {
    async fn list_methods(&self) -> std::result::Result<ListMethodsResponse, RpcStatus> {
        Ok(ListMethodsResponse::default())
    }

    async fn create_payment(
        &self,
        req: CreatePaymentRequest,
    ) -> std::result::Result<CreatePaymentResponse, RpcStatus> {
        Ok(CreatePaymentResponse {
            pay_url: format!("https://ez.local/{}/{}", req.method, req.order_no),
            ..Default::default()
        })
    }

    async fn query_payment(
        &self,
        _: QueryPaymentRequest,
    ) -> std::result::Result<QueryPaymentResponse, RpcStatus> {
        Err(RpcStatus::unimplemented("query"))
    }

    async fn verify_notify(
        &self,
        req: VerifyNotifyRequest,
    ) -> std::result::Result<VerifyNotifyResponse, RpcStatus> {
        let body = String::from_utf8_lossy(&req.request.body).to_string();
        Ok(VerifyNotifyResponse {
            paid: true,
            order_no: body,
            trade_no: "EZ-T1".to_string(),
            amount: 1000,
            ack_body: "OK".to_string(),
        })
    }
}

struct OneInstanceSource {
    client: PaymentClient,
}

#[async_trait]
impl RpcPaymentSource for OneInstanceSource {
    async fn payment_instances(&self) -> Result<Vec<RpcPaymentInstance>> {
        Ok(vec![RpcPaymentInstance {
            plugin_id: "ezpay".to_string(),
            instance_id: "default".to_string(),
            name: "EzPay".to_string(),
            enabled: true,
            loaded: true,
            methods: vec!["alipay".into(), "wxpay".into(), "qq".into()],
        }])
    }

    async fn payment_client(&self, plugin_id: &str, _: &str) -> Result<PaymentClient> {
        if plugin_id == "ezpay" {
            Ok(self.client.clone())
        } else {
            Err(Error::NotFound(plugin_id.to_string()))
        }
    }
}

async fn ezpay_client() -> PaymentClient {
    let services = PluginServices::new(Arc::new(EzCore)).with_payment(Arc::new(EzPay));
    let (host_read, plugin_write) = tokio::io::duplex(64 * 1024);
    let (plugin_read, host_write) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve(services, plugin_read, plugin_write));
    RpcClient::connect(host_read, host_write, Duration::from_secs(1))
        .await
        .unwrap()
        .dispense_payment()
        .unwrap()
}

#[derive(Default)]
struct CountingApprover(AtomicUsize);

#[async_trait]
impl OrderApprover for CountingApprover {
    async fn on_payment_approved(&self, _: &Order, _: &OrderPayment) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn method_level_disable_for_rpc_plugin() {
    let db = Database::in_memory().await.unwrap();
    let registry = PaymentRegistry::new(db.pool().clone()).with_rpc_source(Arc::new(
        OneInstanceSource {
            client: ezpay_client().await,
        },
    ));

    registry
        .set_method_enabled("ezpay", "default", "alipay", false)
        .await
        .unwrap();

    let err = registry.get_provider("ezpay.alipay").await.err().unwrap();
    assert!(err.is_forbidden());
    let wx = registry.get_provider("ezpay.wxpay").await.unwrap();
    assert_eq!(wx.key(), "ezpay.wxpay");
    assert!(registry.get_provider("ezpay.card").await.err().unwrap().is_not_found());

    let resp = registry
        .create_payment(
            "ezpay.wxpay",
            &CreatePaymentRequest {
                order_no: "SO-7".to_string(),
                amount: 100,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(resp.pay_url, "https://ez.local/wxpay/SO-7");

    let enabled: Vec<String> = registry
        .list_providers(false)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.key)
        .collect();
    assert_eq!(enabled, vec!["approval", "balance", "ezpay.qq", "ezpay.wxpay"]);
    let all = registry.list_providers(true).await.unwrap();
    assert!(all.iter().any(|p| p.key == "ezpay.alipay" && !p.enabled));
}

struct StoppedSource;

#[async_trait]
impl RpcPaymentSource for StoppedSource {
    async fn payment_instances(&self) -> Result<Vec<RpcPaymentInstance>> {
        Ok(vec![RpcPaymentInstance {
            plugin_id: "ezpay".to_string(),
            instance_id: "default".to_string(),
            name: "EzPay".to_string(),
            enabled: true,
            loaded: false,
            methods: vec!["alipay".into(), "wxpay".into()],
        }])
    }

    async fn payment_client(&self, plugin_id: &str, _: &str) -> Result<PaymentClient> {
        Err(Error::Unavailable(plugin_id.to_string()))
    }
}

#[tokio::test]
async fn disabled_method_on_stopped_plugin_is_forbidden() {
    let db = Database::in_memory().await.unwrap();
    let registry = PaymentRegistry::new(db.pool().clone()).with_rpc_source(Arc::new(StoppedSource));
    registry
        .set_method_enabled("ezpay", "default", "alipay", false)
        .await
        .unwrap();

    let err = registry.get_provider("ezpay.alipay").await.err().unwrap();
    assert!(err.is_forbidden(), "{err:?}");
    let err = registry.get_provider("ezpay.wxpay").await.err().unwrap();
    assert!(matches!(err, Error::Unavailable(_)), "{err:?}");
    assert!(registry.get_provider("other.alipay").await.err().unwrap().is_not_found());
}

#[tokio::test]
async fn replayed_notify_approves_once() {
    let db = Database::in_memory().await.unwrap();
    let registry = Arc::new(PaymentRegistry::new(db.pool().clone()).with_rpc_source(Arc::new(
        OneInstanceSource {
            client: ezpay_client().await,
        },
    )));
    let orders = OrderRepository::new(db.pool().clone());
    let order = orders.create_order("SO-1", "u1", 1000).await.unwrap();
    let payment = orders
        .create_payment(order.id, "ezpay.alipay", 1000, "")
        .await
        .unwrap();

    let events = Arc::new(EventLog::new());
    let approver = Arc::new(CountingApprover::default());
    let handler = NotifyHandler::new(registry, orders.clone(), approver.clone(), events.clone());

    let req = HttpRequest {
        method: "POST".to_string(),
        path: "/payments/notify/ezpay.alipay".to_string(),
        body: b"SO-1".to_vec(),
        ..Default::default()
    };
    let first = handler.handle_notify("ezpay.alipay", &req).await.unwrap();
    let second = handler.handle_notify("ezpay.alipay", &req).await.unwrap();

    assert!(first.approved_now);
    assert!(!second.approved_now);
    assert_eq!(first.ack_body, "OK");
    assert_eq!(second.ack_body, "OK");
    assert_eq!(approver.0.load(Ordering::SeqCst), 1);
    assert_eq!(events.of_kind(PAYMENT_CONFIRMED).len(), 1);

    let stored = orders.get_payment(payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Approved);
    assert_eq!(stored.trade_no, "EZ-T1");
    let order = orders.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::PendingReview);
}

/// Rejects its first call, then counts like [`CountingApprover`]
#[derive(Default)]
struct FlakyApprover {
    calls: AtomicUsize,
}

#[async_trait]
impl OrderApprover for FlakyApprover {
    async fn on_payment_approved(&self, _: &Order, _: &OrderPayment) -> Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::Other("approver down".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn redelivery_finishes_confirmation_after_hook_failure() {
    let db = Database::in_memory().await.unwrap();
    let registry = Arc::new(PaymentRegistry::new(db.pool().clone()).with_rpc_source(Arc::new(
        OneInstanceSource {
            client: ezpay_client().await,
        },
    )));
    let orders = OrderRepository::new(db.pool().clone());
    let order = orders.create_order("SO-7", "u1", 1000).await.unwrap();
    let payment = orders
        .create_payment(order.id, "ezpay.alipay", 1000, "")
        .await
        .unwrap();

    let events = Arc::new(EventLog::new());
    let approver = Arc::new(FlakyApprover::default());
    let handler = NotifyHandler::new(registry, orders.clone(), approver.clone(), events.clone());
    let req = HttpRequest {
        body: b"SO-7".to_vec(),
        ..Default::default()
    };

    assert!(handler.handle_notify("ezpay.alipay", &req).await.is_err());
    let state = orders.confirmation(payment.id).await.unwrap();
    assert!(state.approved && !state.hook_done && !state.published);
    assert!(events.of_kind(PAYMENT_CONFIRMED).is_empty());

    let retry = handler.handle_notify("ezpay.alipay", &req).await.unwrap();
    assert!(retry.approved_now);
    assert_eq!(approver.calls.load(Ordering::SeqCst), 2);
    assert_eq!(events.of_kind(PAYMENT_CONFIRMED).len(), 1);
    assert!(orders.confirmation(payment.id).await.unwrap().is_complete());

    let replay = handler.handle_notify("ezpay.alipay", &req).await.unwrap();
    assert!(!replay.approved_now);
    assert_eq!(approver.calls.load(Ordering::SeqCst), 2);
    assert_eq!(events.of_kind(PAYMENT_CONFIRMED).len(), 1);
}

#[tokio::test]
async fn yipay_notify_settles_order() {
    let db = Database::in_memory().await.unwrap();
    let registry = Arc::new(PaymentRegistry::new(db.pool().clone()));
    registry
        .set_provider_config(
            "yipay",
            &json!({"base_url": "https://pay.local", "pid": "pid", "key": "secret", "pay_type": "alipay"}),
        )
        .await
        .unwrap();
    registry.set_provider_enabled("yipay", true).await.unwrap();

    let orders = OrderRepository::new(db.pool().clone());
    let order = orders.create_order("1", "u1", 1000).await.unwrap();
    orders.create_payment(order.id, "yipay", 1000, "").await.unwrap();
    let created = registry
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
    assert!(created.pay_url.contains("sign="));

    let mut params = BTreeMap::new();
    params.insert("pid".to_string(), "pid".to_string());
    params.insert("out_trade_no".to_string(), "1".to_string());
    params.insert("trade_no".to_string(), "YP-9".to_string());
    params.insert("money".to_string(), "10.00".to_string());
    params.insert("trade_status".to_string(), "TRADE_SUCCESS".to_string());
    let sign = sign_params(&params, "secret");
    params.insert("sign".to_string(), sign);
    params.insert("sign_type".to_string(), "MD5".to_string());
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();
    let mut headers = BTreeMap::new();
    headers.insert(
        "Content-Type".to_string(),
        vec!["application/x-www-form-urlencoded".to_string()],
    );
    let req = HttpRequest {
        method: "POST".to_string(),
        path: "/payments/notify/yipay".to_string(),
        headers,
        body: body.into_bytes(),
        ..Default::default()
    };

    let handler = NotifyHandler::new(
        registry,
        orders.clone(),
        Arc::new(NoopApprover),
        Arc::new(EventLog::new()),
    );
    let outcome = handler.handle_notify("yipay", &req).await.unwrap();
    assert!(outcome.paid && outcome.approved_now);
    assert_eq!(outcome.ack_body, "success");
    assert_eq!(outcome.payment.unwrap().trade_no, "YP-9");

    let order = orders.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::PendingReview);
}

#[tokio::test]
async fn notify_for_unknown_order_is_not_found() {
    let db = Database::in_memory().await.unwrap();
    let registry = Arc::new(PaymentRegistry::new(db.pool().clone()).with_rpc_source(Arc::new(
        OneInstanceSource {
            client: ezpay_client().await,
        },
    )));
    let handler = NotifyHandler::new(
        registry,
        OrderRepository::new(db.pool().clone()),
        Arc::new(NoopApprover),
        Arc::new(EventLog::new()),
    );
    let req = HttpRequest {
        body: b"SO-404".to_vec(),
        ..Default::default()
    };
    let err = handler.handle_notify("ezpay.alipay", &req).await.unwrap_err();
    assert!(err.is_not_found());
}
