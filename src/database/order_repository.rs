//! Payment order and order extension storage.
//!
//! Every status transition here is a conditional UPDATE guarded by the
//! expected prior status; `rows_affected() > 0` is the compare-and-swap
//! outcome. No transition ever uses read-modify-write.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Payment-leg status of an order. Only moves forward, except for the
/// refund side channel SUCCESS → REFUNDED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Waiting,
    Success,
    Refunded,
    Closed,
}

/// Status of a single submission attempt against a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExtensionStatus {
    Waiting,
    Success,
    Closed,
}

/// Buyer-facing payment intent. Amounts are integer minor units.
#[derive(Debug, Clone, FromRow)]
pub struct PayOrder {
    pub id: Uuid,
    pub app_id: Uuid,
    /// External-facing order number generated at creation.
    pub no: String,
    pub merchant_order_id: String,
    pub subject: String,
    pub price: i64,
    pub status: OrderStatus,
    pub expire_time: DateTime<Utc>,
    /// Channel chosen by the successful submission, stamped on success.
    pub channel_id: Option<Uuid>,
    pub channel_code: Option<String>,
    pub channel_order_no: Option<String>,
    pub channel_user_id: Option<String>,
    pub channel_fee_rate: Option<f64>,
    pub channel_fee_price: i64,
    pub success_time: Option<DateTime<Utc>>,
    /// The extension that won the payment, once one did.
    pub extension_id: Option<Uuid>,
    pub refund_price: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One submission attempt of an order against a specific channel.
#[derive(Debug, Clone, FromRow)]
pub struct OrderExtension {
    pub id: Uuid,
    /// Channel-scoped transaction number sent to the gateway.
    pub no: String,
    pub order_id: Uuid,
    pub channel_id: Uuid,
    pub channel_code: String,
    pub status: ExtensionStatus,
    pub channel_notify_data: Option<serde_json::Value>,
    pub channel_error_code: Option<String>,
    pub channel_error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field set stamped on the order when its payment succeeds.
#[derive(Debug, Clone)]
pub struct OrderSuccessUpdate {
    pub order_id: Uuid,
    pub extension_id: Uuid,
    pub channel_id: Uuid,
    pub channel_code: String,
    pub channel_order_no: String,
    pub channel_user_id: Option<String>,
    pub channel_fee_rate: f64,
    pub channel_fee_price: i64,
    pub success_time: DateTime<Utc>,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &PayOrder) -> Result<PayOrder, DatabaseError>;

    async fn get_order(&self, id: Uuid) -> Result<Option<PayOrder>, DatabaseError>;

    async fn get_order_by_merchant(
        &self,
        app_id: Uuid,
        merchant_order_id: &str,
    ) -> Result<Option<PayOrder>, DatabaseError>;

    async fn insert_extension(
        &self,
        extension: &OrderExtension,
    ) -> Result<OrderExtension, DatabaseError>;

    async fn get_extension(&self, id: Uuid) -> Result<Option<OrderExtension>, DatabaseError>;

    async fn get_extension_by_no(&self, no: &str)
        -> Result<Option<OrderExtension>, DatabaseError>;

    async fn list_extensions_by_order(
        &self,
        order_id: Uuid,
        status: Option<ExtensionStatus>,
    ) -> Result<Vec<OrderExtension>, DatabaseError>;

    /// WAITING → SUCCESS on an extension, storing the raw notify payload.
    async fn cas_extension_success(
        &self,
        id: Uuid,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// WAITING → CLOSED on an extension.
    async fn cas_extension_closed(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// WAITING → SUCCESS on the parent order, stamping channel identity,
    /// external numbers and the computed fee.
    async fn cas_order_success(&self, update: &OrderSuccessUpdate)
        -> Result<bool, DatabaseError>;

    /// WAITING → CLOSED on the parent order.
    async fn cas_order_closed(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Accumulate a refund onto the order and flip it to REFUNDED. Guarded
    /// so `refund_price` can never exceed `price` under concurrent refunds.
    async fn cas_order_refunded(&self, id: Uuid, refund_delta: i64)
        -> Result<bool, DatabaseError>;

    async fn list_expired_waiting(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PayOrder>, DatabaseError>;

    async fn list_waiting_created_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PayOrder>, DatabaseError>;
}

const ORDER_COLUMNS: &str = "id, app_id, no, merchant_order_id, subject, price, status, \
     expire_time, channel_id, channel_code, channel_order_no, channel_user_id, \
     channel_fee_rate, channel_fee_price, success_time, extension_id, refund_price, \
     created_at, updated_at";

const EXTENSION_COLUMNS: &str = "id, no, order_id, channel_id, channel_code, status, \
     channel_notify_data, channel_error_code, channel_error_msg, created_at, updated_at";

pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for PgOrderRepository {
    async fn insert_order(&self, order: &PayOrder) -> Result<PayOrder, DatabaseError> {
        sqlx::query_as::<_, PayOrder>(&format!(
            "INSERT INTO pay_orders
                 (id, app_id, no, merchant_order_id, subject, price, status, expire_time,
                  refund_price, channel_fee_price)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, 0)
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order.id)
        .bind(order.app_id)
        .bind(&order.no)
        .bind(&order.merchant_order_id)
        .bind(&order.subject)
        .bind(order.price)
        .bind(order.status)
        .bind(order.expire_time)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<PayOrder>, DatabaseError> {
        sqlx::query_as::<_, PayOrder>(&format!(
            "SELECT {ORDER_COLUMNS} FROM pay_orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_order_by_merchant(
        &self,
        app_id: Uuid,
        merchant_order_id: &str,
    ) -> Result<Option<PayOrder>, DatabaseError> {
        sqlx::query_as::<_, PayOrder>(&format!(
            "SELECT {ORDER_COLUMNS} FROM pay_orders
             WHERE app_id = $1 AND merchant_order_id = $2"
        ))
        .bind(app_id)
        .bind(merchant_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn insert_extension(
        &self,
        extension: &OrderExtension,
    ) -> Result<OrderExtension, DatabaseError> {
        sqlx::query_as::<_, OrderExtension>(&format!(
            "INSERT INTO pay_order_extensions
                 (id, no, order_id, channel_id, channel_code, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {EXTENSION_COLUMNS}"
        ))
        .bind(extension.id)
        .bind(&extension.no)
        .bind(extension.order_id)
        .bind(extension.channel_id)
        .bind(&extension.channel_code)
        .bind(extension.status)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_extension(&self, id: Uuid) -> Result<Option<OrderExtension>, DatabaseError> {
        sqlx::query_as::<_, OrderExtension>(&format!(
            "SELECT {EXTENSION_COLUMNS} FROM pay_order_extensions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_extension_by_no(
        &self,
        no: &str,
    ) -> Result<Option<OrderExtension>, DatabaseError> {
        sqlx::query_as::<_, OrderExtension>(&format!(
            "SELECT {EXTENSION_COLUMNS} FROM pay_order_extensions WHERE no = $1"
        ))
        .bind(no)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_extensions_by_order(
        &self,
        order_id: Uuid,
        status: Option<ExtensionStatus>,
    ) -> Result<Vec<OrderExtension>, DatabaseError> {
        match status {
            Some(status) => sqlx::query_as::<_, OrderExtension>(&format!(
                "SELECT {EXTENSION_COLUMNS} FROM pay_order_extensions
                 WHERE order_id = $1 AND status = $2
                 ORDER BY created_at ASC"
            ))
            .bind(order_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx),
            None => sqlx::query_as::<_, OrderExtension>(&format!(
                "SELECT {EXTENSION_COLUMNS} FROM pay_order_extensions
                 WHERE order_id = $1
                 ORDER BY created_at ASC"
            ))
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx),
        }
    }

    async fn cas_extension_success(
        &self,
        id: Uuid,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_order_extensions
             SET status = 'success', channel_notify_data = $2, updated_at = NOW()
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(id)
        .bind(notify_data)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cas_extension_closed(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_order_extensions
             SET status = 'closed', channel_error_code = $2, channel_error_msg = $3,
                 updated_at = NOW()
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(id)
        .bind(error_code)
        .bind(error_msg)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cas_order_success(
        &self,
        update: &OrderSuccessUpdate,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_orders
             SET status = 'success', extension_id = $2, channel_id = $3, channel_code = $4,
                 channel_order_no = $5, channel_user_id = $6, channel_fee_rate = $7,
                 channel_fee_price = $8, success_time = $9, updated_at = NOW()
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(update.order_id)
        .bind(update.extension_id)
        .bind(update.channel_id)
        .bind(&update.channel_code)
        .bind(&update.channel_order_no)
        .bind(&update.channel_user_id)
        .bind(update.channel_fee_rate)
        .bind(update.channel_fee_price)
        .bind(update.success_time)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cas_order_closed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_orders
             SET status = 'closed', updated_at = NOW()
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cas_order_refunded(
        &self,
        id: Uuid,
        refund_delta: i64,
    ) -> Result<bool, DatabaseError> {
        // The amount guard lives in the WHERE clause so concurrent refund
        // notifications can never push refund_price past price.
        let result = sqlx::query(
            "UPDATE pay_orders
             SET status = 'refunded', refund_price = refund_price + $2, updated_at = NOW()
             WHERE id = $1 AND status IN ('success', 'refunded')
               AND refund_price + $2 <= price",
        )
        .bind(id)
        .bind(refund_delta)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_expired_waiting(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PayOrder>, DatabaseError> {
        sqlx::query_as::<_, PayOrder>(&format!(
            "SELECT {ORDER_COLUMNS} FROM pay_orders
             WHERE status = 'waiting' AND expire_time < $1
             ORDER BY expire_time ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_waiting_created_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PayOrder>, DatabaseError> {
        sqlx::query_as::<_, PayOrder>(&format!(
            "SELECT {ORDER_COLUMNS} FROM pay_orders
             WHERE status = 'waiting' AND created_at >= $1
             ORDER BY created_at ASC
             LIMIT $2"
        ))
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
