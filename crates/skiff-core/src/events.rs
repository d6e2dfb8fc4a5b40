//! Domain events
//!
//! Events are immutable facts published after a state change commits. The
//! payment notify path publishes `payment.confirmed` through an [`EventPublisher`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

pub const PAYMENT_CONFIRMED: &str = "payment.confirmed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    /// Dotted event name, e.g. `payment.confirmed`
    pub kind: String,
    /// Entity the event is about
    pub subject: Uuid,
    pub data: Value,
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, subject: Uuid, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            subject,
            data,
            occurred_at: Utc::now(),
        }
    }

    /// A notify approved an order payment; the subject is the payment
    pub fn payment_confirmed(
        payment_id: Uuid,
        order_id: Uuid,
        order_no: &str,
        provider_key: &str,
        trade_no: &str,
        amount: i64,
    ) -> Self {
        Self::new(
            PAYMENT_CONFIRMED,
            payment_id,
            json!({
                "order_id": order_id,
                "order_no": order_no,
                "provider": provider_key,
                "trade_no": trade_no,
                "amount": amount,
            }),
        )
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Keeps every published event in memory
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_kind(&self, kind: &str) -> Vec<Event> {
        self.snapshot().into_iter().filter(|e| e.kind == kind).collect()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl EventPublisher for EventLog {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

/// Writes events to the tracing log only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        tracing::info!(
            kind = %event.kind,
            subject = %event.subject,
            data = %event.data,
            "event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_log_filters_by_kind() {
        let log = EventLog::new();
        let payment_id = Uuid::new_v4();
        log.publish(Event::payment_confirmed(
            payment_id,
            Uuid::new_v4(),
            "SO-1",
            "yipay",
            "T1",
            1000,
        ))
        .await
        .unwrap();
        log.publish(Event::new("order.cancelled", Uuid::new_v4(), Value::Null))
            .await
            .unwrap();

        let confirmed = log.of_kind(PAYMENT_CONFIRMED);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].subject, payment_id);
        assert_eq!(confirmed[0].data["amount"], 1000);
        assert_eq!(confirmed[0].data["provider"], "yipay");
        assert_eq!(log.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn tracing_publisher_accepts_events() {
        TracingPublisher
            .publish(Event::new("order.shipped", Uuid::new_v4(), json!({})))
            .await
            .unwrap();
    }
}
