//! Wallet balances, wallet orders and refund issuance
//!
//! Every balance change is a row in `wallet_transactions` keyed by
//! `(ref_type, ref_id)`, so applying the same credit twice is a no-op.

use super::refund::{RefundPolicy, RefundQuote, RefundSubject, quote_refund};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Reference type for credits that settle a wallet order
pub const REF_WALLET_ORDER: &str = "wallet_order";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletOrderKind {
    Recharge,
    Refund,
    Withdraw,
}

impl WalletOrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recharge => "recharge",
            Self::Refund => "refund",
            Self::Withdraw => "withdraw",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "recharge" => Ok(Self::Recharge),
            "refund" => Ok(Self::Refund),
            "withdraw" => Ok(Self::Withdraw),
            other => Err(Error::Other(format!("unknown wallet order kind {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletOrderStatus {
    Pending,
    Approved,
    Rejected,
}

impl WalletOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::Other(format!("unknown wallet order status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletOrder {
    pub id: Uuid,
    pub user_id: String,
    pub kind: WalletOrderKind,
    pub amount: i64,
    pub status: WalletOrderStatus,
    pub note: String,
    pub meta: serde_json::Value,
    pub reviewed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct WalletOrderRow {
    id: String,
    user_id: String,
    kind: String,
    amount: i64,
    status: String,
    note: String,
    meta_json: String,
    reviewed_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WalletOrderRow> for WalletOrder {
    type Error = Error;

    fn try_from(row: WalletOrderRow) -> Result<Self> {
        Ok(Self {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| Error::Other(format!("bad wallet order id: {e}")))?,
            user_id: row.user_id,
            kind: WalletOrderKind::parse(&row.kind)?,
            amount: row.amount,
            status: WalletOrderStatus::parse(&row.status)?,
            note: row.note,
            meta: parse_meta(&row.id, &row.meta_json),
            reviewed_by: row.reviewed_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn parse_meta(order_id: &str, raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!(order_id, error = %e, "unreadable wallet order meta, using null");
        serde_json::Value::Null
    })
}

/// Repository for wallets, wallet orders and the transaction ledger
#[derive(Debug, Clone)]
pub struct WalletRepository {
    pool: SqlitePool,
}

impl WalletRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM wallets WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(row.map(|(b,)| b).unwrap_or(0))
    }

    /// Apply a balance change once per `(ref_type, ref_id)`
    ///
    /// Returns `false` when the reference was already applied.
    pub async fn credit(
        &self,
        user_id: &str,
        amount: i64,
        kind: &str,
        ref_type: &str,
        ref_id: &str,
        note: &str,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::DatabaseError)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO wallet_transactions (id, user_id, amount, kind, ref_type, ref_id, note, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(ref_type, ref_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(amount)
        .bind(kind)
        .bind(ref_type)
        .bind(ref_id)
        .bind(note)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(Error::DatabaseError)?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.map_err(Error::DatabaseError)?;
            debug!(user_id, ref_type, ref_id, "wallet credit already applied");
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO wallets (user_id, balance, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(user_id) DO UPDATE SET
                balance = wallets.balance + excluded.balance,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(Error::DatabaseError)?;

        tx.commit().await.map_err(Error::DatabaseError)?;
        info!(user_id, amount, ref_type, ref_id, "wallet credited");
        Ok(true)
    }

    pub async fn insert_order(&self, order: &WalletOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_orders (
                id, user_id, kind, amount, status, note, meta_json, reviewed_by, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(order.id.to_string())
        .bind(&order.user_id)
        .bind(order.kind.as_str())
        .bind(order.amount)
        .bind(order.status.as_str())
        .bind(&order.note)
        .bind(order.meta.to_string())
        .bind(&order.reviewed_by)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(())
    }

    pub async fn get_order(&self, id: Uuid) -> Result<Option<WalletOrder>> {
        let row: Option<WalletOrderRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, kind, amount, status, note, meta_json, reviewed_by, created_at, updated_at
            FROM wallet_orders
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        row.map(WalletOrder::try_from).transpose()
    }

    pub async fn list_orders(&self, user_id: &str) -> Result<Vec<WalletOrder>> {
        let rows: Vec<WalletOrderRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, kind, amount, status, note, meta_json, reviewed_by, created_at, updated_at
            FROM wallet_orders
            WHERE user_id = ?
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        rows.into_iter().map(WalletOrder::try_from).collect()
    }

    /// Move a pending order to `status`; false when it was not pending
    async fn review_order(
        &self,
        id: Uuid,
        status: WalletOrderStatus,
        reviewer: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE wallet_orders
            SET status = ?, reviewed_by = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(status.as_str())
        .bind(reviewer)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Issues refunds to the wallet according to a [`RefundPolicy`]
#[derive(Debug, Clone)]
pub struct RefundService {
    wallets: WalletRepository,
    policy: RefundPolicy,
}

impl RefundService {
    pub fn new(wallets: WalletRepository, policy: RefundPolicy) -> Self {
        Self { wallets, policy }
    }

    pub fn policy(&self) -> &RefundPolicy {
        &self.policy
    }

    pub fn quote(&self, subject: &RefundSubject, now: DateTime<Utc>) -> RefundQuote {
        quote_refund(&self.policy, subject, now)
    }

    /// Create a refund wallet order for an instance
    ///
    /// Without `require_approval` the order is created approved and credited immediately.
    pub async fn request_refund(
        &self,
        user_id: &str,
        instance_ref: &str,
        subject: &RefundSubject,
        now: DateTime<Utc>,
    ) -> Result<WalletOrder> {
        let quote = self.quote(subject, now);
        if quote.amount <= 0 {
            return Err(Error::InvalidInput(format!(
                "instance {instance_ref} is not eligible for a refund"
            )));
        }

        let status = if self.policy.require_approval {
            WalletOrderStatus::Pending
        } else {
            WalletOrderStatus::Approved
        };
        let order = WalletOrder {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            kind: WalletOrderKind::Refund,
            amount: quote.amount,
            status,
            note: format!("refund for instance {instance_ref}"),
            meta: serde_json::json!({
                "instance": instance_ref,
                "base_amount": quote.base_amount,
                "elapsed_ratio": quote.elapsed_ratio,
                "rule": quote.rule,
            }),
            reviewed_by: (status == WalletOrderStatus::Approved).then(|| "auto".to_string()),
            created_at: now,
            updated_at: now,
        };
        self.wallets.insert_order(&order).await?;

        if status == WalletOrderStatus::Approved {
            self.apply(&order).await?;
        }
        info!(
            user_id,
            instance = instance_ref,
            amount = order.amount,
            status = order.status.as_str(),
            "refund requested"
        );
        Ok(order)
    }

    /// Approve a pending wallet order and credit it
    ///
    /// Approving an already-approved order re-applies the idempotent credit only.
    pub async fn approve(&self, id: Uuid, reviewer: &str) -> Result<WalletOrder> {
        let order = self
            .wallets
            .get_order(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("wallet order {id}")))?;
        match order.status {
            WalletOrderStatus::Rejected => {
                return Err(Error::Conflict(format!("wallet order {id} was rejected")));
            }
            WalletOrderStatus::Pending => {
                self.wallets
                    .review_order(id, WalletOrderStatus::Approved, reviewer)
                    .await?;
            }
            WalletOrderStatus::Approved => {}
        }
        let order = self
            .wallets
            .get_order(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("wallet order {id}")))?;
        self.apply(&order).await?;
        Ok(order)
    }

    pub async fn reject(&self, id: Uuid, reviewer: &str) -> Result<()> {
        if !self
            .wallets
            .review_order(id, WalletOrderStatus::Rejected, reviewer)
            .await?
        {
            return Err(Error::Conflict(format!("wallet order {id} is not pending")));
        }
        Ok(())
    }

    /// Refund hook for instance deletion; no-op unless `auto_refund_on_delete`
    pub async fn on_instance_deleted(
        &self,
        user_id: &str,
        instance_ref: &str,
        subject: &RefundSubject,
        now: DateTime<Utc>,
    ) -> Result<Option<WalletOrder>> {
        if !self.policy.auto_refund_on_delete {
            return Ok(None);
        }
        if self.quote(subject, now).amount <= 0 {
            debug!(instance = instance_ref, "nothing to refund on delete");
            return Ok(None);
        }
        self.request_refund(user_id, instance_ref, subject, now)
            .await
            .map(Some)
    }

    async fn apply(&self, order: &WalletOrder) -> Result<bool> {
        let amount = match order.kind {
            WalletOrderKind::Withdraw => -order.amount,
            WalletOrderKind::Recharge | WalletOrderKind::Refund => order.amount,
        };
        self.wallets
            .credit(
                &order.user_id,
                amount,
                order.kind.as_str(),
                REF_WALLET_ORDER,
                &order.id.to_string(),
                &order.note,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::refund::RefundCurvePoint;
    use crate::storage::Database;
    use chrono::Duration;

    async fn service(policy: RefundPolicy) -> (RefundService, WalletRepository) {
        let db = Database::in_memory().await.unwrap();
        let wallets = WalletRepository::new(db.pool().clone());
        (RefundService::new(wallets.clone(), policy), wallets)
    }

    fn half_used(now: DateTime<Utc>) -> RefundSubject {
        RefundSubject {
            created_at: Some(now - Duration::hours(100)),
            expire_at: Some(now + Duration::hours(100)),
            monthly_price: 3000,
            order_item_amount: 0,
        }
    }

    fn linear_policy(require_approval: bool) -> RefundPolicy {
        RefundPolicy {
            curve: vec![
                RefundCurvePoint { percent: 0.0, ratio: 1.0 },
                RefundCurvePoint { percent: 100.0, ratio: 0.0 },
            ],
            require_approval,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn credit_is_idempotent_per_reference() {
        let (_, wallets) = service(RefundPolicy::default()).await;
        assert!(wallets.credit("u1", 500, "refund", REF_WALLET_ORDER, "o1", "").await.unwrap());
        assert!(!wallets.credit("u1", 500, "refund", REF_WALLET_ORDER, "o1", "").await.unwrap());
        assert!(wallets.credit("u1", 200, "refund", REF_WALLET_ORDER, "o2", "").await.unwrap());
        assert_eq!(wallets.balance("u1").await.unwrap(), 700);
        assert_eq!(wallets.balance("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn auto_approved_refund_credits_once() {
        let now = Utc::now();
        let (svc, wallets) = service(linear_policy(false)).await;
        let order = svc.request_refund("u1", "vps-1", &half_used(now), now).await.unwrap();
        assert_eq!(order.status, WalletOrderStatus::Approved);
        assert_eq!(order.amount, 1500);
        assert_eq!(wallets.balance("u1").await.unwrap(), 1500);

        // Re-approving replays the keyed credit without double-paying.
        svc.approve(order.id, "admin").await.unwrap();
        assert_eq!(wallets.balance("u1").await.unwrap(), 1500);
    }

    #[tokio::test]
    async fn pending_refund_waits_for_review() {
        let now = Utc::now();
        let (svc, wallets) = service(linear_policy(true)).await;
        let order = svc.request_refund("u1", "vps-1", &half_used(now), now).await.unwrap();
        assert_eq!(order.status, WalletOrderStatus::Pending);
        assert_eq!(wallets.balance("u1").await.unwrap(), 0);

        let approved = svc.approve(order.id, "admin").await.unwrap();
        assert_eq!(approved.status, WalletOrderStatus::Approved);
        assert_eq!(approved.reviewed_by.as_deref(), Some("admin"));
        assert_eq!(wallets.balance("u1").await.unwrap(), 1500);
        assert!(matches!(svc.reject(order.id, "admin").await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn rejected_order_cannot_be_approved() {
        let now = Utc::now();
        let (svc, _) = service(linear_policy(true)).await;
        let order = svc.request_refund("u1", "vps-1", &half_used(now), now).await.unwrap();
        svc.reject(order.id, "admin").await.unwrap();
        assert!(matches!(svc.approve(order.id, "admin").await, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn delete_hook_respects_policy_flag() {
        let now = Utc::now();
        let (svc, _) = service(linear_policy(false)).await;
        assert!(svc.on_instance_deleted("u1", "vps-1", &half_used(now), now).await.unwrap().is_none());

        let (svc, wallets) = service(RefundPolicy {
            auto_refund_on_delete: true,
            ..linear_policy(false)
        })
        .await;
        let order = svc.on_instance_deleted("u1", "vps-1", &half_used(now), now).await.unwrap();
        assert!(order.is_some());
        assert_eq!(wallets.balance("u1").await.unwrap(), 1500);
        assert_eq!(wallets.list_orders("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ineligible_refund_is_rejected() {
        let now = Utc::now();
        let (svc, _) = service(linear_policy(false)).await;
        let expired = RefundSubject {
            created_at: Some(now - Duration::days(60)),
            expire_at: Some(now - Duration::days(1)),
            monthly_price: 3000,
            order_item_amount: 0,
        };
        assert!(matches!(
            svc.request_refund("u1", "vps-1", &expired, now).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn unreadable_meta_becomes_null() {
        assert_eq!(parse_meta("w1", "{not json"), serde_json::Value::Null);
        assert_eq!(parse_meta("w1", r#"{"src":"refund"}"#)["src"], "refund");
    }
}
