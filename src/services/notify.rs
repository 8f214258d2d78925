//! Merchant notification dispatcher.
//!
//! Tasks are durable rows; delivery runs under a per-task distributed lock
//! with an attempt-counter compare-and-swap, so a crashed or concurrent
//! dispatcher can never double-count an attempt.

use crate::cache::lock::DistributedLock;
use crate::config::NotifyConfig;
use crate::database::notify_repository::{
    NotifyLog, NotifyStatus, NotifyTask, NotifyTaskType, TaskAttemptUpdate,
};
use crate::database::app_repository::PayApp;
use crate::error::{ServiceError, ServiceResult};
use crate::services::Stores;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay before attempt N+1 after attempt N failed, short to long.
const BACKOFF_SECS: [i64; 8] = [15, 30, 60, 180, 600, 1800, 3600, 7200];

/// One more attempt than backoff slots: the first attempt fires
/// immediately, each failure then consumes one slot.
pub const MAX_NOTIFY_TIMES: i32 = BACKOFF_SECS.len() as i32 + 1;

const LOCK_KEY_PREFIX: &str = "pay:notify:lock:";
const MAX_LOGGED_RESPONSE: usize = 2000;
const ACK_BODY: &str = "success";

fn backoff_after(attempt: i32) -> ChronoDuration {
    let index = (attempt as usize - 1).min(BACKOFF_SECS.len() - 1);
    ChronoDuration::seconds(BACKOFF_SECS[index])
}

pub struct NotifyService {
    stores: Stores,
    lock: Arc<dyn DistributedLock>,
    http: reqwest::Client,
    lock_ttl: Duration,
    batch_size: i64,
    concurrency: usize,
}

impl NotifyService {
    pub fn new(
        stores: Stores,
        lock: Arc<dyn DistributedLock>,
        config: &NotifyConfig,
    ) -> ServiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::InvalidRequest(format!("notify HTTP client init failed: {}", e))
            })?;
        Ok(Self {
            stores,
            lock,
            http,
            lock_ttl: Duration::from_secs(config.lock_ttl_secs),
            batch_size: config.batch_size,
            concurrency: config.concurrency,
        })
    }

    /// Queue a merchant notification for an order/refund/transfer event.
    /// Returns None when the application has no callback URL for the kind.
    pub async fn create_task(
        &self,
        app: &PayApp,
        task_type: NotifyTaskType,
        data_id: Uuid,
        data_no: &str,
        merchant_ref: &str,
    ) -> ServiceResult<Option<NotifyTask>> {
        let notify_url = match task_type {
            NotifyTaskType::Order => &app.order_notify_url,
            NotifyTaskType::Refund => &app.refund_notify_url,
            NotifyTaskType::Transfer => &app.transfer_notify_url,
        };
        if notify_url.is_empty() {
            info!(app_id = %app.id, ?task_type, data_no, "no callback URL configured, skipping notify task");
            return Ok(None);
        }

        let now = Utc::now();
        let task = self
            .stores
            .notifies
            .insert_task(&NotifyTask {
                id: Uuid::new_v4(),
                app_id: app.id,
                task_type,
                data_id,
                data_no: data_no.to_string(),
                merchant_ref: merchant_ref.to_string(),
                notify_url: notify_url.clone(),
                status: NotifyStatus::Waiting,
                next_notify_time: now,
                last_execute_time: None,
                notify_times: 0,
                max_notify_times: MAX_NOTIFY_TIMES,
                created_at: now,
                updated_at: now,
            })
            .await?;
        info!(task_id = %task.id, ?task_type, data_no, "notify task created");
        Ok(Some(task))
    }

    /// One dispatch sweep: pick up due tasks and execute them with bounded
    /// concurrency. Individual task failures never abort the sweep.
    pub async fn run_due_tasks(&self, now: DateTime<Utc>) -> ServiceResult<usize> {
        let due = self.stores.notifies.list_due(now, self.batch_size).await?;
        let count = due.len();
        if count == 0 {
            return Ok(0);
        }
        debug!(count, "dispatching due notify tasks");

        futures::stream::iter(due)
            .for_each_concurrent(self.concurrency, |task| async move {
                self.execute_task(task).await;
            })
            .await;
        Ok(count)
    }

    /// Execute one task attempt under its lock. Losing the lock, or finding
    /// the task already advanced, is a silent no-op.
    pub async fn execute_task(&self, snapshot: NotifyTask) {
        let lock_key = format!("{}{}", LOCK_KEY_PREFIX, snapshot.id);
        let guard = match self.lock.try_acquire(&lock_key, self.lock_ttl).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(task_id = %snapshot.id, "notify task locked elsewhere, skipping");
                return;
            }
            Err(error) => {
                warn!(task_id = %snapshot.id, %error, "notify lock acquisition failed");
                return;
            }
        };

        if let Err(error) = self.attempt(&snapshot).await {
            warn!(task_id = %snapshot.id, %error, "notify attempt failed");
        }

        if let Err(error) = self.lock.release(guard).await {
            warn!(task_id = %snapshot.id, %error, "notify lock release failed");
        }
    }

    async fn attempt(&self, snapshot: &NotifyTask) -> ServiceResult<()> {
        // Re-read under the lock; the snapshot may be stale by the time the
        // lock is ours.
        let Some(task) = self.stores.notifies.get_task(snapshot.id).await? else {
            return Ok(());
        };
        if task.status != NotifyStatus::Waiting || task.notify_times != snapshot.notify_times {
            debug!(task_id = %task.id, "notify task already advanced, skipping");
            return Ok(());
        }

        let payload = self.build_payload(&task).await?;
        let attempt_no = task.notify_times + 1;
        let (delivered, response) = self.deliver(&task.notify_url, &payload).await;

        let now = Utc::now();
        let status = if delivered {
            NotifyStatus::Success
        } else if attempt_no >= task.max_notify_times {
            NotifyStatus::Failure
        } else {
            NotifyStatus::Waiting
        };
        let update = TaskAttemptUpdate {
            status,
            notify_times: attempt_no,
            last_execute_time: now,
            next_notify_time: (status == NotifyStatus::Waiting)
                .then(|| now + backoff_after(attempt_no)),
        };

        let advanced = self
            .stores
            .notifies
            .finish_attempt(task.id, task.notify_times, &update)
            .await?;
        if !advanced {
            debug!(task_id = %task.id, "notify attempt lost the counter race");
            return Ok(());
        }

        self.stores
            .notifies
            .insert_log(&NotifyLog {
                id: Uuid::new_v4(),
                task_id: task.id,
                notify_times: attempt_no,
                response,
                status: if delivered {
                    NotifyStatus::Success
                } else {
                    NotifyStatus::Failure
                },
                created_at: now,
            })
            .await?;

        match status {
            NotifyStatus::Success => {
                info!(task_id = %task.id, attempt_no, "merchant notified")
            }
            NotifyStatus::Failure => {
                warn!(task_id = %task.id, attempt_no, "notify task exhausted")
            }
            NotifyStatus::Waiting => {
                debug!(task_id = %task.id, attempt_no, "notify attempt failed, rescheduled")
            }
        }
        Ok(())
    }

    /// POST the payload; delivery counts iff HTTP 200 with the literal
    /// acknowledgement body.
    async fn deliver(&self, url: &str, payload: &JsonValue) -> (bool, String) {
        let response = match self.http.post(url).json(payload).send().await {
            Ok(response) => response,
            Err(error) => return (false, format!("transport error: {}", error)),
        };
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let delivered =
            status == reqwest::StatusCode::OK && body.trim().eq_ignore_ascii_case(ACK_BODY);

        let mut logged = format!("HTTP {}: {}", status.as_u16(), body);
        logged.truncate(MAX_LOGGED_RESPONSE);
        (delivered, logged)
    }

    /// Payload carries the entity's current state, re-read at delivery
    /// time so retries never replay a stale status.
    async fn build_payload(&self, task: &NotifyTask) -> ServiceResult<JsonValue> {
        let payload = match task.task_type {
            NotifyTaskType::Order => {
                let order = self
                    .stores
                    .orders
                    .get_order(task.data_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::StateConflict(format!(
                            "notify task {} references missing order {}",
                            task.id, task.data_id
                        ))
                    })?;
                serde_json::json!({
                    "type": task.task_type,
                    "id": order.id,
                    "no": order.no,
                    "merchant_order_id": order.merchant_order_id,
                    "status": order.status,
                    "price": order.price,
                    "success_time": order.success_time,
                })
            }
            NotifyTaskType::Refund => {
                let refund = self
                    .stores
                    .refunds
                    .get(task.data_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::StateConflict(format!(
                            "notify task {} references missing refund {}",
                            task.id, task.data_id
                        ))
                    })?;
                serde_json::json!({
                    "type": task.task_type,
                    "id": refund.id,
                    "no": refund.no,
                    "merchant_order_id": refund.merchant_order_id,
                    "merchant_refund_id": refund.merchant_refund_id,
                    "status": refund.status,
                    "price": refund.refund_price,
                    "success_time": refund.success_time,
                })
            }
            NotifyTaskType::Transfer => {
                let transfer = self
                    .stores
                    .transfers
                    .get(task.data_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::StateConflict(format!(
                            "notify task {} references missing transfer {}",
                            task.id, task.data_id
                        ))
                    })?;
                serde_json::json!({
                    "type": task.task_type,
                    "id": transfer.id,
                    "no": transfer.no,
                    "merchant_transfer_id": transfer.merchant_transfer_id,
                    "status": transfer.status,
                    "price": transfer.price,
                    "success_time": transfer.success_time,
                })
            }
        };
        Ok(payload)
    }
}
