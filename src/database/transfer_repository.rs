//! Outbound transfer (payout) storage.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// WAITING → PROCESSING → SUCCESS, or WAITING|PROCESSING → CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Waiting,
    Processing,
    Success,
    Closed,
}

/// A payout to an external account, independent of any order.
#[derive(Debug, Clone, FromRow)]
pub struct PayTransfer {
    pub id: Uuid,
    pub no: String,
    pub app_id: Uuid,
    pub channel_id: Uuid,
    pub channel_code: String,
    pub merchant_transfer_id: String,
    pub price: i64,
    pub subject: String,
    /// Recipient identity as the gateway expects it (account number,
    /// wallet id, ...).
    pub user_account: String,
    pub user_name: String,
    pub status: TransferStatus,
    pub success_time: Option<DateTime<Utc>>,
    pub channel_transfer_no: Option<String>,
    pub channel_error_code: Option<String>,
    pub channel_error_msg: Option<String>,
    pub channel_notify_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn insert(&self, transfer: &PayTransfer) -> Result<PayTransfer, DatabaseError>;

    async fn get(&self, id: Uuid) -> Result<Option<PayTransfer>, DatabaseError>;

    async fn get_by_no(&self, no: &str) -> Result<Option<PayTransfer>, DatabaseError>;

    async fn get_by_merchant(
        &self,
        app_id: Uuid,
        merchant_transfer_id: &str,
    ) -> Result<Option<PayTransfer>, DatabaseError>;

    /// WAITING → PROCESSING.
    async fn cas_processing(
        &self,
        id: Uuid,
        channel_transfer_no: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// WAITING|PROCESSING → SUCCESS.
    async fn cas_success(
        &self,
        id: Uuid,
        channel_transfer_no: &str,
        success_time: DateTime<Utc>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// WAITING|PROCESSING → CLOSED.
    async fn cas_closed(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;
}

const TRANSFER_COLUMNS: &str = "id, no, app_id, channel_id, channel_code, \
     merchant_transfer_id, price, subject, user_account, user_name, status, success_time, \
     channel_transfer_no, channel_error_code, channel_error_msg, channel_notify_data, \
     created_at, updated_at";

pub struct PgTransferRepository {
    pool: PgPool,
}

impl PgTransferRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransferStore for PgTransferRepository {
    async fn insert(&self, transfer: &PayTransfer) -> Result<PayTransfer, DatabaseError> {
        sqlx::query_as::<_, PayTransfer>(&format!(
            "INSERT INTO pay_transfers
                 (id, no, app_id, channel_id, channel_code, merchant_transfer_id, price,
                  subject, user_account, user_name, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(transfer.id)
        .bind(&transfer.no)
        .bind(transfer.app_id)
        .bind(transfer.channel_id)
        .bind(&transfer.channel_code)
        .bind(&transfer.merchant_transfer_id)
        .bind(transfer.price)
        .bind(&transfer.subject)
        .bind(&transfer.user_account)
        .bind(&transfer.user_name)
        .bind(transfer.status)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get(&self, id: Uuid) -> Result<Option<PayTransfer>, DatabaseError> {
        sqlx::query_as::<_, PayTransfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM pay_transfers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_by_no(&self, no: &str) -> Result<Option<PayTransfer>, DatabaseError> {
        sqlx::query_as::<_, PayTransfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM pay_transfers WHERE no = $1"
        ))
        .bind(no)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_by_merchant(
        &self,
        app_id: Uuid,
        merchant_transfer_id: &str,
    ) -> Result<Option<PayTransfer>, DatabaseError> {
        sqlx::query_as::<_, PayTransfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM pay_transfers
             WHERE app_id = $1 AND merchant_transfer_id = $2"
        ))
        .bind(app_id)
        .bind(merchant_transfer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn cas_processing(
        &self,
        id: Uuid,
        channel_transfer_no: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_transfers
             SET status = 'processing',
                 channel_transfer_no = COALESCE($2, channel_transfer_no),
                 updated_at = NOW()
             WHERE id = $1 AND status = 'waiting'",
        )
        .bind(id)
        .bind(channel_transfer_no)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cas_success(
        &self,
        id: Uuid,
        channel_transfer_no: &str,
        success_time: DateTime<Utc>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_transfers
             SET status = 'success', channel_transfer_no = $2, success_time = $3,
                 channel_notify_data = $4, updated_at = NOW()
             WHERE id = $1 AND status IN ('waiting', 'processing')",
        )
        .bind(id)
        .bind(channel_transfer_no)
        .bind(success_time)
        .bind(notify_data)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn cas_closed(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_transfers
             SET status = 'closed', channel_error_code = $2, channel_error_msg = $3,
                 channel_notify_data = $4, updated_at = NOW()
             WHERE id = $1 AND status IN ('waiting', 'processing')",
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
}
