//! Durable merchant-notification task queue storage.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotifyTaskType {
    Order,
    Refund,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NotifyStatus {
    Waiting,
    Success,
    Failure,
}

/// One outbound event to deliver to a merchant callback URL.
#[derive(Debug, Clone, FromRow)]
pub struct NotifyTask {
    pub id: Uuid,
    pub app_id: Uuid,
    pub task_type: NotifyTaskType,
    /// Id of the originating order/refund/transfer row.
    pub data_id: Uuid,
    /// Denormalized identifiers so the dispatcher needs no joins.
    pub data_no: String,
    pub merchant_ref: String,
    pub notify_url: String,
    pub status: NotifyStatus,
    pub next_notify_time: DateTime<Utc>,
    pub last_execute_time: Option<DateTime<Utc>>,
    pub notify_times: i32,
    pub max_notify_times: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one delivery attempt.
#[derive(Debug, Clone, FromRow)]
pub struct NotifyLog {
    pub id: Uuid,
    pub task_id: Uuid,
    pub notify_times: i32,
    pub response: String,
    pub status: NotifyStatus,
    pub created_at: DateTime<Utc>,
}

/// Task state written after one delivery attempt.
#[derive(Debug, Clone)]
pub struct TaskAttemptUpdate {
    pub status: NotifyStatus,
    pub notify_times: i32,
    pub last_execute_time: DateTime<Utc>,
    /// Present only while the task keeps WAITING for another attempt.
    pub next_notify_time: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait NotifyStore: Send + Sync {
    async fn insert_task(&self, task: &NotifyTask) -> Result<NotifyTask, DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<NotifyTask>, DatabaseError>;

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotifyTask>, DatabaseError>;

    /// Record the outcome of a delivery attempt, guarded by the attempt
    /// counter observed under the task lock. Returns false if another
    /// process advanced the task first.
    async fn finish_attempt(
        &self,
        id: Uuid,
        expected_times: i32,
        update: &TaskAttemptUpdate,
    ) -> Result<bool, DatabaseError>;

    async fn insert_log(&self, log: &NotifyLog) -> Result<NotifyLog, DatabaseError>;

    async fn list_logs(&self, task_id: Uuid) -> Result<Vec<NotifyLog>, DatabaseError>;
}

const TASK_COLUMNS: &str = "id, app_id, task_type, data_id, data_no, merchant_ref, \
     notify_url, status, next_notify_time, last_execute_time, notify_times, \
     max_notify_times, created_at, updated_at";

const LOG_COLUMNS: &str = "id, task_id, notify_times, response, status, created_at";

pub struct PgNotifyRepository {
    pool: PgPool,
}

impl PgNotifyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotifyStore for PgNotifyRepository {
    async fn insert_task(&self, task: &NotifyTask) -> Result<NotifyTask, DatabaseError> {
        sqlx::query_as::<_, NotifyTask>(&format!(
            "INSERT INTO pay_notify_tasks
                 (id, app_id, task_type, data_id, data_no, merchant_ref, notify_url, status,
                  next_notify_time, notify_times, max_notify_times)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.id)
        .bind(task.app_id)
        .bind(task.task_type)
        .bind(task.data_id)
        .bind(&task.data_no)
        .bind(&task.merchant_ref)
        .bind(&task.notify_url)
        .bind(task.status)
        .bind(task.next_notify_time)
        .bind(task.notify_times)
        .bind(task.max_notify_times)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<NotifyTask>, DatabaseError> {
        sqlx::query_as::<_, NotifyTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM pay_notify_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotifyTask>, DatabaseError> {
        sqlx::query_as::<_, NotifyTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM pay_notify_tasks
             WHERE status = 'waiting' AND next_notify_time <= $1
             ORDER BY next_notify_time ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn finish_attempt(
        &self,
        id: Uuid,
        expected_times: i32,
        update: &TaskAttemptUpdate,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE pay_notify_tasks
             SET status = $3, notify_times = $4, last_execute_time = $5,
                 next_notify_time = COALESCE($6, next_notify_time), updated_at = NOW()
             WHERE id = $1 AND status = 'waiting' AND notify_times = $2",
        )
        .bind(id)
        .bind(expected_times)
        .bind(update.status)
        .bind(update.notify_times)
        .bind(update.last_execute_time)
        .bind(update.next_notify_time)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_log(&self, log: &NotifyLog) -> Result<NotifyLog, DatabaseError> {
        sqlx::query_as::<_, NotifyLog>(&format!(
            "INSERT INTO pay_notify_logs (id, task_id, notify_times, response, status)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {LOG_COLUMNS}"
        ))
        .bind(log.id)
        .bind(log.task_id)
        .bind(log.notify_times)
        .bind(&log.response)
        .bind(log.status)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn list_logs(&self, task_id: Uuid) -> Result<Vec<NotifyLog>, DatabaseError> {
        sqlx::query_as::<_, NotifyLog>(&format!(
            "SELECT {LOG_COLUMNS} FROM pay_notify_logs
             WHERE task_id = $1
             ORDER BY created_at ASC"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }
}
