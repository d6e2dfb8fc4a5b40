//! Payment notification handling
//!
//! A notify is verified by its provider, correlated to a pending order
//! payment, and approved at most once. After approval the approver hook runs
//! and `payment.confirmed` is published; each step is marked on the payment
//! row when it succeeds, so a redelivery finishes whatever a failed delivery
//! left undone. Replays of a fully confirmed payment only return the
//! provider's ack body.

use super::orders::{OrderApprover, OrderPayment, OrderRepository};
use super::registry::PaymentRegistry;
use crate::error::{Error, Result};
use crate::events::{Event, EventPublisher};
use skiff_plugin_api::types::HttpRequest;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// Merge form body and query parameters; the query wins on collisions
pub fn parse_notify_params(req: &HttpRequest) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();

    let form_content = req
        .header("content-type")
        .map(|ct| ct.to_ascii_lowercase().contains("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if form_content || req.body.contains(&b'=') {
        for (k, v) in form_urlencoded::parse(&req.body) {
            params.insert(k.into_owned(), v.into_owned());
        }
    }

    let query = req.raw_query.trim_start_matches('?');
    for (k, v) in form_urlencoded::parse(query.as_bytes()) {
        params.insert(k.into_owned(), v.into_owned());
    }
    params
}

/// Result of one notify delivery
#[derive(Debug, Clone, PartialEq)]
pub struct NotifyOutcome {
    /// Body to write back verbatim to the provider
    pub ack_body: String,
    pub paid: bool,
    pub payment: Option<OrderPayment>,
    /// True only for the delivery that completed the confirmation steps
    pub approved_now: bool,
}

/// Routes verified notifications into order state
pub struct NotifyHandler {
    registry: Arc<PaymentRegistry>,
    orders: OrderRepository,
    approver: Arc<dyn OrderApprover>,
    events: Arc<dyn EventPublisher>,
    /// Serializes the post-approval steps within this process
    confirming: Mutex<()>,
}

impl NotifyHandler {
    pub fn new(
        registry: Arc<PaymentRegistry>,
        orders: OrderRepository,
        approver: Arc<dyn OrderApprover>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            registry,
            orders,
            approver,
            events,
            confirming: Mutex::new(()),
        }
    }

    pub async fn handle_notify(&self, provider_key: &str, req: &HttpRequest) -> Result<NotifyOutcome> {
        let provider = self.registry.get_provider(provider_key).await?;
        let verified = provider.verify_notify(req).await?;
        if !verified.paid {
            debug!(provider = provider_key, order_no = %verified.order_no, "notify not paid");
            return Ok(NotifyOutcome {
                ack_body: verified.ack_body,
                paid: false,
                payment: None,
                approved_now: false,
            });
        }

        let payment = self
            .correlate(provider_key, &verified.order_no, &verified.trade_no)
            .await?;

        let payment = if !verified.trade_no.is_empty() && payment.trade_no != verified.trade_no {
            self.orders
                .update_trade_no(payment.id, &verified.trade_no)
                .await?;
            OrderPayment {
                trade_no: verified.trade_no.clone(),
                ..payment
            }
        } else {
            payment
        };

        if verified.amount > 0 && verified.amount != payment.amount {
            warn!(
                provider = provider_key,
                payment_id = %payment.id,
                expected = payment.amount,
                notified = verified.amount,
                "notify amount differs from payment amount"
            );
        }

        if self.orders.approve_payment(payment.id).await? {
            debug!(provider = provider_key, payment_id = %payment.id, "payment approved");
        }
        let approved_now = self.confirm(provider_key, &payment).await?;

        Ok(NotifyOutcome {
            ack_body: verified.ack_body,
            paid: true,
            payment: Some(payment),
            approved_now,
        })
    }

    /// Run the approver hook and publish the event unless already done.
    /// Returns true when this call finished the confirmation.
    async fn confirm(&self, provider_key: &str, payment: &OrderPayment) -> Result<bool> {
        let _guard = self.confirming.lock().await;
        let state = self.orders.confirmation(payment.id).await?;
        if !state.approved {
            return Err(Error::Conflict(format!("payment {} is not approved", payment.id)));
        }
        if state.is_complete() {
            debug!(provider = provider_key, payment_id = %payment.id, "notify replay for confirmed payment");
            return Ok(false);
        }

        let order = self
            .orders
            .get_order(payment.order_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("order {}", payment.order_id)))?;
        if !state.hook_done {
            self.approver.on_payment_approved(&order, payment).await?;
            self.orders.mark_hook_done(payment.id).await?;
        }
        if !state.published {
            let event = Event::payment_confirmed(
                payment.id,
                order.id,
                &order.order_no,
                provider_key,
                &payment.trade_no,
                payment.amount,
            );
            self.events.publish(event).await?;
            self.orders.mark_confirmed(payment.id).await?;
        }
        info!(
            provider = provider_key,
            order_no = %order.order_no,
            payment_id = %payment.id,
            trade_no = %payment.trade_no,
            "payment confirmed"
        );
        Ok(true)
    }

    async fn correlate(&self, method: &str, order_no: &str, trade_no: &str) -> Result<OrderPayment> {
        if !order_no.is_empty() {
            if let Some(payment) = self
                .orders
                .find_payment_by_order(order_no, method, trade_no)
                .await?
            {
                return Ok(payment);
            }
        }
        if !trade_no.is_empty() {
            if let Some(payment) = self.orders.find_payment_by_trade_no(trade_no).await? {
                return Ok(payment);
            }
        }
        Err(Error::NotFound(format!(
            "no payment for order_no={order_no:?} trade_no={trade_no:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(query: &str, body: &str, content_type: Option<&str>) -> HttpRequest {
        let mut headers = BTreeMap::new();
        if let Some(ct) = content_type {
            headers.insert("Content-Type".to_string(), vec![ct.to_string()]);
        }
        HttpRequest {
            method: "POST".to_string(),
            path: "/payments/notify/yipay".to_string(),
            raw_query: query.to_string(),
            headers,
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn query_wins_over_form_body() {
        let req = request(
            "a=query&c=3",
            "a=body&b=2",
            Some("application/x-www-form-urlencoded; charset=utf-8"),
        );
        let params = parse_notify_params(&req);
        assert_eq!(params["a"], "query");
        assert_eq!(params["b"], "2");
        assert_eq!(params["c"], "3");
    }

    #[test]
    fn body_with_equals_is_parsed_without_content_type() {
        let params = parse_notify_params(&request("", "x=1&y=%E4%BD%A0", None));
        assert_eq!(params["x"], "1");
        assert_eq!(params["y"], "你");
    }

    #[test]
    fn json_body_is_ignored() {
        let params = parse_notify_params(&request("k=v", r#"{"a":1}"#, Some("application/json")));
        assert_eq!(params.len(), 1);
    }
}
