//! Orders and order payments touched by payment notifications

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    PendingReview,
    Approved,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "pending_payment",
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending_payment" => Ok(Self::PendingPayment),
            "pending_review" => Ok(Self::PendingReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Other(format!("unknown order status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Rejected,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::Other(format!("unknown payment status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_no: String,
    pub user_id: String,
    pub status: OrderStatus,
    pub total_amount: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayment {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Provider key the payment was created with
    pub method: String,
    pub amount: i64,
    pub trade_no: String,
    pub status: PaymentStatus,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: String,
    order_no: String,
    user_id: String,
    status: String,
    total_amount: i64,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: String,
    order_id: String,
    method: String,
    amount: i64,
    trade_no: String,
    status: String,
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Other(format!("invalid id {s:?}: {e}")))
}

impl TryFrom<OrderRow> for Order {
    type Error = Error;

    fn try_from(row: OrderRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            order_no: row.order_no,
            user_id: row.user_id,
            status: OrderStatus::parse(&row.status)?,
            total_amount: row.total_amount,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<PaymentRow> for OrderPayment {
    type Error = Error;

    fn try_from(row: PaymentRow) -> Result<Self> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            order_id: parse_uuid(&row.order_id)?,
            method: row.method,
            amount: row.amount,
            trade_no: row.trade_no,
            status: PaymentStatus::parse(&row.status)?,
        })
    }
}

/// How far the post-approval steps of a payment have got
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confirmation {
    pub approved: bool,
    /// The [`OrderApprover`] hook completed
    pub hook_done: bool,
    /// `payment.confirmed` was published
    pub published: bool,
}

impl Confirmation {
    pub fn is_complete(&self) -> bool {
        self.approved && self.hook_done && self.published
    }
}

/// Business hook run once when a payment is first approved
#[async_trait]
pub trait OrderApprover: Send + Sync {
    async fn on_payment_approved(&self, order: &Order, payment: &OrderPayment) -> Result<()>;
}

/// Approver that leaves the order in review
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApprover;

#[async_trait]
impl OrderApprover for NoopApprover {
    async fn on_payment_approved(&self, _order: &Order, _payment: &OrderPayment) -> Result<()> {
        Ok(())
    }
}

const PAYMENT_COLUMNS: &str = "p.id, p.order_id, p.method, p.amount, p.trade_no, p.status";

#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_order(&self, order_no: &str, user_id: &str, total_amount: i64) -> Result<Order> {
        let order = Order {
            id: Uuid::new_v4(),
            order_no: order_no.to_string(),
            user_id: user_id.to_string(),
            status: OrderStatus::PendingPayment,
            total_amount,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO orders (id, order_no, user_id, status, total_amount, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.id.to_string())
        .bind(&order.order_no)
        .bind(&order.user_id)
        .bind(order.status.as_str())
        .bind(order.total_amount)
        .bind(order.created_at)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Error::Conflict(format!("order {order_no} already exists"))
            }
            _ => Error::DatabaseError(e),
        })?;
        Ok(order)
    }

    pub async fn create_payment(
        &self,
        order_id: Uuid,
        method: &str,
        amount: i64,
        trade_no: &str,
    ) -> Result<OrderPayment> {
        let payment = OrderPayment {
            id: Uuid::new_v4(),
            order_id,
            method: method.to_string(),
            amount,
            trade_no: trade_no.to_string(),
            status: PaymentStatus::Pending,
        };
        sqlx::query(
            r#"
            INSERT INTO order_payments (id, order_id, method, amount, trade_no, status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(payment.id.to_string())
        .bind(payment.order_id.to_string())
        .bind(&payment.method)
        .bind(payment.amount)
        .bind(&payment.trade_no)
        .bind(payment.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(payment)
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(
            "SELECT id, order_no, user_id, status, total_amount, created_at FROM orders WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        row.map(Order::try_from).transpose()
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Option<OrderPayment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM order_payments p WHERE p.id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        row.map(OrderPayment::try_from).transpose()
    }

    /// Payment of `order_no` made with `method` whose trade_no matches or is still empty
    pub async fn find_payment_by_order(
        &self,
        order_no: &str,
        method: &str,
        trade_no: &str,
    ) -> Result<Option<OrderPayment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM order_payments p
            JOIN orders o ON o.id = p.order_id
            WHERE o.order_no = ? AND p.method = ? AND (p.trade_no = ? OR p.trade_no = '')
            ORDER BY CASE WHEN p.trade_no = ? THEN 0 ELSE 1 END, p.created_at
            LIMIT 1
            "#
        ))
        .bind(order_no)
        .bind(method)
        .bind(trade_no)
        .bind(trade_no)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        row.map(OrderPayment::try_from).transpose()
    }

    pub async fn find_payment_by_trade_no(&self, trade_no: &str) -> Result<Option<OrderPayment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM order_payments p WHERE p.trade_no = ? ORDER BY p.created_at LIMIT 1"
        ))
        .bind(trade_no)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        row.map(OrderPayment::try_from).transpose()
    }

    pub async fn update_trade_no(&self, payment_id: Uuid, trade_no: &str) -> Result<()> {
        sqlx::query(
            "UPDATE order_payments SET trade_no = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(trade_no)
        .bind(payment_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    /// Approve a payment and move its order into review
    ///
    /// Returns `false` when the payment was already approved; nothing changes then.
    pub async fn approve_payment(&self, payment_id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        let updated = sqlx::query(
            r#"
            UPDATE order_payments
            SET status = 'approved', updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status != 'approved'
            "#,
        )
        .bind(payment_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(Error::DatabaseError)?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.map_err(Error::DatabaseError)?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE orders
            SET status = 'pending_review', updated_at = CURRENT_TIMESTAMP
            WHERE id = (SELECT order_id FROM order_payments WHERE id = ?)
              AND status = 'pending_payment'
            "#,
        )
        .bind(payment_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(Error::DatabaseError)?;

        tx.commit().await.map_err(Error::DatabaseError)?;
        Ok(true)
    }

    pub async fn confirmation(&self, payment_id: Uuid) -> Result<Confirmation> {
        let row: Option<(String, bool, bool)> = sqlx::query_as(
            r#"
            SELECT status, hook_done_at IS NOT NULL, confirmed_at IS NOT NULL
            FROM order_payments WHERE id = ?
            "#,
        )
        .bind(payment_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        let (status, hook_done, published) =
            row.ok_or_else(|| Error::NotFound(format!("payment {payment_id}")))?;
        Ok(Confirmation {
            approved: PaymentStatus::parse(&status)? == PaymentStatus::Approved,
            hook_done,
            published,
        })
    }

    pub async fn mark_hook_done(&self, payment_id: Uuid) -> Result<()> {
        self.set_marker(payment_id, "hook_done_at").await
    }

    pub async fn mark_confirmed(&self, payment_id: Uuid) -> Result<()> {
        self.set_marker(payment_id, "confirmed_at").await
    }

    async fn set_marker(&self, payment_id: Uuid, column: &'static str) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE order_payments SET {column} = CURRENT_TIMESTAMP WHERE id = ? AND {column} IS NULL"
        ))
        .bind(payment_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn approve_is_single_transition() {
        let db = Database::in_memory().await.unwrap();
        let repo = OrderRepository::new(db.pool().clone());
        let order = repo.create_order("SO-1", "u1", 1000).await.unwrap();
        let payment = repo.create_payment(order.id, "yipay", 1000, "").await.unwrap();

        assert!(repo.approve_payment(payment.id).await.unwrap());
        assert!(!repo.approve_payment(payment.id).await.unwrap());

        let order = repo.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::PendingReview);
        let payment = repo.get_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Approved);
    }

    #[tokio::test]
    async fn confirmation_markers_follow_approval() {
        let db = Database::in_memory().await.unwrap();
        let repo = OrderRepository::new(db.pool().clone());
        let order = repo.create_order("SO-4", "u1", 100).await.unwrap();
        let payment = repo.create_payment(order.id, "yipay", 100, "").await.unwrap();

        assert_eq!(repo.confirmation(payment.id).await.unwrap(), Confirmation::default());
        repo.approve_payment(payment.id).await.unwrap();
        repo.mark_hook_done(payment.id).await.unwrap();
        let state = repo.confirmation(payment.id).await.unwrap();
        assert!(state.approved && state.hook_done && !state.published);

        repo.mark_confirmed(payment.id).await.unwrap();
        assert!(repo.confirmation(payment.id).await.unwrap().is_complete());
        assert!(repo.confirmation(Uuid::new_v4()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn correlation_prefers_matching_trade_no() {
        let db = Database::in_memory().await.unwrap();
        let repo = OrderRepository::new(db.pool().clone());
        let order = repo.create_order("SO-2", "u1", 500).await.unwrap();
        let empty = repo.create_payment(order.id, "yipay", 500, "").await.unwrap();

        let found = repo.find_payment_by_order("SO-2", "yipay", "T9").await.unwrap().unwrap();
        assert_eq!(found.id, empty.id);
        assert!(repo.find_payment_by_order("SO-2", "custom", "T9").await.unwrap().is_none());

        repo.update_trade_no(empty.id, "T9").await.unwrap();
        let by_trade = repo.find_payment_by_trade_no("T9").await.unwrap().unwrap();
        assert_eq!(by_trade.id, empty.id);
        assert!(repo.find_payment_by_order("SO-2", "yipay", "OTHER").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_order_no_conflicts() {
        let db = Database::in_memory().await.unwrap();
        let repo = OrderRepository::new(db.pool().clone());
        repo.create_order("SO-3", "u1", 1).await.unwrap();
        assert!(matches!(repo.create_order("SO-3", "u2", 1).await, Err(Error::Conflict(_))));
    }
}
