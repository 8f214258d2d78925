//! Refund storage with the same conditional-UPDATE discipline as orders.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Waiting,
    Success,
    Failure,
}

/// One refund request against a paid order.
#[derive(Debug, Clone, FromRow)]
pub struct PayRefund {
    pub id: Uuid,
    /// External-facing refund number.
    pub no: String,
    pub app_id: Uuid,
    pub order_id: Uuid,
    pub order_no: String,
    pub merchant_order_id: String,
    pub merchant_refund_id: String,
    pub channel_id: Uuid,
    pub channel_code: String,
    /// Original order price, kept for gateway refund calls.
    pub pay_price: i64,
    pub refund_price: i64,
    pub reason: String,
    pub status: RefundStatus,
    pub success_time: Option<DateTime<Utc>>,
    pub channel_refund_no: Option<String>,
    pub channel_error_code: Option<String>,
    pub channel_error_msg: Option<String>,
    pub channel_notify_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Unique on `(app_id, merchant_refund_id)`; a duplicate surfaces as
    /// [`DatabaseError::UniqueViolation`].
    async fn insert(&self, refund: &PayRefund) -> Result<PayRefund, DatabaseError>;

    async fn get(&self, id: Uuid) -> Result<Option<PayRefund>, DatabaseError>;

    async fn get_by_no(&self, no: &str) -> Result<Option<PayRefund>, DatabaseError>;

    async fn get_by_merchant(
        &self,
        app_id: Uuid,
        merchant_refund_id: &str,
    ) -> Result<Option<PayRefund>, DatabaseError>;

    /// Number of refunds still WAITING for the given order; used to enforce
    /// the single-flight refund rule.
    async fn count_waiting_by_order(&self, order_id: Uuid) -> Result<i64, DatabaseError>;

    async fn cas_success(
        &self,
        id: Uuid,
        channel_refund_no: &str,
        success_time: DateTime<Utc>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    async fn cas_failure(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    async fn list_waiting(&self, limit: i64) -> Result<Vec<PayRefund>, DatabaseError>;
}

const REFUND_COLUMNS: &str = "id, no, app_id, order_id, order_no, merchant_order_id, \
     merchant_refund_id, channel_id, channel_code, pay_price, refund_price, reason, status, \
     success_time, channel_refund_no, channel_error_code, channel_error_msg, \
     channel_notify_data, created_at, updated_at";

pub struct PgRefundRepository {
    pool: PgPool,
}

impl PgRefundRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefundStore for PgRefundRepository {
    async fn insert(&self, refund: &PayRefund) -> Result<PayRefund, DatabaseError> {
        sqlx::query_as::<_, PayRefund>(&format!(
            "INSERT INTO pay_refunds
                 (id, no, app_id, order_id, order_no, merchant_order_id, merchant_refund_id,
                  channel_id, channel_code, pay_price, refund_price, reason, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING {REFUND_COLUMNS}"
        ))
        .bind(refund.id)
        .bind(&refund.no)
        .bind(refund.app_id)
        .bind(refund.order_id)
        .bind(&refund.order_no)
        .bind(&refund.merchant_order_id)
        .bind(&refund.merchant_refund_id)
        .bind(refund.channel_id)
        .bind(&refund.channel_code)
        .bind(refund.pay_price)
        .bind(refund.refund_price)
        .bind(&refund.reason)
        .bind(refund.status)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get(&self, id: Uuid) -> Result<Option<PayRefund>, DatabaseError> {
        sqlx::query_as::<_, PayRefund>(&format!(
            "SELECT {REFUND_COLUMNS} FROM pay_refunds WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_by_no(&self, no: &str) -> Result<Option<PayRefund>, DatabaseError> {
        sqlx::query_as::<_, PayRefund>(&format!(
            "SELECT {REFUND_COLUMNS} FROM pay_refunds WHERE no = $1"
        ))
        .bind(no)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_by_merchant(
        &self,
        app_id: Uuid,
        merchant_refund_id: &str,
    ) -> Result<Option<PayRefund>, DatabaseError> {
        sqlx::query_as::<_, PayRefund>(&format!(
            "SELECT {REFUND_COLUMNS} FROM pay_refunds
             WHERE app_id = $1 AND merchant_refund_id = $2"
        ))
        .bind(app_id)
        .bind(merchant_refund_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn count_waiting_by_order(&self, order_id: Uuid) -> Result<i64, DatabaseError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pay_refunds WHERE order_id = $1 AND status = 'waiting'",
        )
        .bind(order_id)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(count.0)
    }

    async fn cas_success(
        &self,
        id: Uuid,
        channel_refund_no: &str,
        success_time: DateTime<Utc>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_refunds
             SET status = 'success', channel_refund_no = $2, success_time = $3,
                 channel_notify_data = $4, updated_at = NOW()
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(id)
        .bind(channel_refund_no)
        .bind(success_time)
        .bind(notify_data)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cas_failure(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_refunds
             SET status = 'failure', channel_error_code = $2, channel_error_msg = $3,
                 channel_notify_data = $4, updated_at = NOW()
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(id)
        .bind(error_code)
        .bind(error_msg)
        .bind(notify_data)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_waiting(&self, limit: i64) -> Result<Vec<PayRefund>, DatabaseError> {
        sqlx::query_as::<_, PayRefund>(&format!(
            "SELECT {REFUND_COLUMNS} FROM pay_refunds
             WHERE status = 'waiting'
             ORDER BY created_at ASC
             LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
