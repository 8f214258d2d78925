//! Refund lifecycle engine.
//!
//! A refund is created against a PAID order, validated against the
//! refundable remainder, and kept single-flight: at most one WAITING
//! refund per order at a time. The terminal state comes from the gateway
//! by webhook or from the reconciliation sweep.

use crate::cache::sequence::{SequenceGenerator, REFUND_NO_PREFIX};
use crate::database::app_repository::PayChannel;
use crate::database::notify_repository::NotifyTaskType;
use crate::database::order_repository::OrderStatus;
use crate::database::refund_repository::{PayRefund, RefundStatus};
use crate::error::{ServiceError, ServiceResult};
use crate::gateway::types::{GatewayRefundResult, GatewayRefundStatus, UnifiedRefundRequest};
use crate::services::app::AppService;
use crate::services::notify::NotifyService;
use crate::services::order::WALLET_USER_TYPE_MEMBER;
use crate::services::wallet::{WalletService, BIZ_TYPE_PAYMENT_REFUND};
use crate::services::{is_wallet_channel, Stores};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CreateRefundRequest {
    pub app_id: Uuid,
    pub merchant_order_id: String,
    pub merchant_refund_id: String,
    /// Minor units, strictly positive.
    pub refund_price: i64,
    pub reason: String,
}

pub struct RefundService {
    stores: Stores,
    apps: Arc<AppService>,
    wallets: Arc<WalletService>,
    notify: Arc<NotifyService>,
    sequence: Arc<dyn SequenceGenerator>,
    public_base_url: String,
}

impl RefundService {
    pub fn new(
        stores: Stores,
        apps: Arc<AppService>,
        wallets: Arc<WalletService>,
        notify: Arc<NotifyService>,
        sequence: Arc<dyn SequenceGenerator>,
        public_base_url: String,
    ) -> Self {
        Self {
            stores,
            apps,
            wallets,
            notify,
            sequence,
            public_base_url,
        }
    }

    /// Create a refund and hand it to the paying channel. A gateway
    /// transport failure after the refund row exists is NOT an error: the
    /// refund stays WAITING and the sync sweep finishes the job.
    pub async fn create_refund(&self, request: CreateRefundRequest) -> ServiceResult<PayRefund> {
        if request.refund_price <= 0 {
            return Err(ServiceError::InvalidRequest(
                "refund price must be positive".to_string(),
            ));
        }
        let app = self.apps.require_app(request.app_id).await?;

        if let Some(existing) = self
            .stores
            .refunds
            .get_by_merchant(app.id, &request.merchant_refund_id)
            .await?
        {
            return self.replay_or_conflict(existing, &request);
        }

        let order = self
            .stores
            .orders
            .get_order_by_merchant(app.id, &request.merchant_order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(request.merchant_order_id.clone()))?;
        if !matches!(order.status, OrderStatus::Success | OrderStatus::Refunded) {
            return Err(ServiceError::OrderNotRefundable {
                no: order.no.clone(),
                status: format!("{:?}", order.status).to_lowercase(),
            });
        }
        let remaining = order.price - order.refund_price;
        if request.refund_price > remaining {
            return Err(ServiceError::RefundAmountExceeded {
                requested: request.refund_price,
                remaining,
            });
        }
        if self.stores.refunds.count_waiting_by_order(order.id).await? > 0 {
            return Err(ServiceError::RefundInFlight(order.no.clone()));
        }

        let channel_id = order.channel_id.ok_or_else(|| {
            ServiceError::StateConflict(format!("paid order {} has no channel", order.no))
        })?;
        let channel = self.apps.require_channel(channel_id).await?;

        let now = Utc::now();
        let refund = PayRefund {
            id: Uuid::new_v4(),
            no: self.sequence.next(REFUND_NO_PREFIX).await?,
            app_id: app.id,
            order_id: order.id,
            order_no: order.no.clone(),
            merchant_order_id: order.merchant_order_id.clone(),
            merchant_refund_id: request.merchant_refund_id.clone(),
            channel_id: channel.id,
            channel_code: channel.code.clone(),
            pay_price: order.price,
            refund_price: request.refund_price,
            reason: request.reason.clone(),
            status: RefundStatus::Waiting,
            success_time: None,
            channel_refund_no: None,
            channel_error_code: None,
            channel_error_msg: None,
            channel_notify_data: None,
            created_at: now,
            updated_at: now,
        };
        let refund = match self.stores.refunds.insert(&refund).await {
            Ok(refund) => refund,
            // Two unique constraints can fire here: the merchant refund id
            // (creation replay) and the one-WAITING-refund-per-order index
            // (a concurrent creator slipped past the count above).
            Err(e) if e.is_unique_violation() => {
                match self
                    .stores
                    .refunds
                    .get_by_merchant(app.id, &request.merchant_refund_id)
                    .await?
                {
                    Some(existing) => return self.replay_or_conflict(existing, &request),
                    None => return Err(ServiceError::RefundInFlight(order.no.clone())),
                }
            }
            Err(e) => return Err(e.into()),
        };
        info!(refund_no = %refund.no, order_no = %order.no, price = refund.refund_price, "refund created");

        if is_wallet_channel(&channel) {
            self.refund_to_wallet(&channel, &order.channel_user_id, &refund)
                .await?;
        } else {
            self.submit_to_gateway(&channel, &refund).await;
        }

        Ok(self
            .stores
            .refunds
            .get(refund.id)
            .await?
            .unwrap_or(refund))
    }

    fn replay_or_conflict(
        &self,
        existing: PayRefund,
        request: &CreateRefundRequest,
    ) -> ServiceResult<PayRefund> {
        if existing.refund_price == request.refund_price {
            debug!(refund_no = %existing.no, "refund creation replayed");
            Ok(existing)
        } else {
            Err(ServiceError::DuplicateMerchantRefundId(
                request.merchant_refund_id.clone(),
            ))
        }
    }

    pub async fn get_refund(
        &self,
        app_id: Uuid,
        merchant_refund_id: &str,
    ) -> ServiceResult<PayRefund> {
        self.stores
            .refunds
            .get_by_merchant(app_id, merchant_refund_id)
            .await?
            .ok_or_else(|| ServiceError::RefundNotFound(merchant_refund_id.to_string()))
    }

    /// Wallet refunds settle synchronously by crediting the buyer back.
    async fn refund_to_wallet(
        &self,
        channel: &PayChannel,
        channel_user_id: &Option<String>,
        refund: &PayRefund,
    ) -> ServiceResult<()> {
        let user_id = channel_user_id.as_deref().ok_or_else(|| {
            ServiceError::StateConflict(format!(
                "wallet-paid order {} has no channel user",
                refund.order_no
            ))
        })?;
        let transaction = self
            .wallets
            .credit(
                user_id,
                WALLET_USER_TYPE_MEMBER,
                BIZ_TYPE_PAYMENT_REFUND,
                &refund.no,
                &refund.reason,
                refund.refund_price,
            )
            .await?;
        self.notify_refund(
            channel,
            &GatewayRefundResult {
                status: GatewayRefundStatus::Success,
                refund_no: refund.no.clone(),
                channel_refund_no: Some(transaction.id.to_string()),
                success_time: Some(transaction.created_at),
                error_code: None,
                error_msg: None,
                raw: serde_json::json!({ "wallet_transaction_id": transaction.id }),
            },
        )
        .await
    }

    async fn submit_to_gateway(&self, channel: &PayChannel, refund: &PayRefund) {
        let submitted = async {
            let outer_no = self.paid_extension_no(refund).await?;
            let client = self.apps.client_for(channel).await?;
            let result = client
                .unified_refund(UnifiedRefundRequest {
                    outer_no,
                    refund_no: refund.no.clone(),
                    pay_price: refund.pay_price,
                    refund_price: refund.refund_price,
                    reason: refund.reason.clone(),
                    notify_url: format!(
                        "{}/webhooks/refund/{}",
                        self.public_base_url, channel.id
                    ),
                })
                .await?;
            self.notify_refund(channel, &result).await
        }
        .await;
        if let Err(error) = submitted {
            // The refund row is durable; leave it WAITING for the sweep.
            warn!(refund_no = %refund.no, %error, "refund submission failed, deferring to sync");
        }
    }

    /// The extension number the gateway knows the payment by.
    async fn paid_extension_no(&self, refund: &PayRefund) -> ServiceResult<String> {
        let order = self
            .stores
            .orders
            .get_order(refund.order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(refund.order_no.clone()))?;
        let extension_id = order.extension_id.ok_or_else(|| {
            ServiceError::StateConflict(format!("paid order {} has no extension", order.no))
        })?;
        let extension = self
            .stores
            .orders
            .get_extension(extension_id)
            .await?
            .ok_or_else(|| {
                ServiceError::StateConflict(format!("order {} extension vanished", order.no))
            })?;
        Ok(extension.no)
    }

    /// Apply a gateway-reported refund state, from a webhook or the sync
    /// sweep. WAITING results are ignored.
    pub async fn notify_refund(
        &self,
        channel: &PayChannel,
        result: &GatewayRefundResult,
    ) -> ServiceResult<()> {
        let refund = self
            .stores
            .refunds
            .get_by_no(&result.refund_no)
            .await?
            .ok_or_else(|| ServiceError::RefundNotFound(result.refund_no.clone()))?;
        if refund.channel_id != channel.id {
            return Err(ServiceError::StateConflict(format!(
                "refund {} does not belong to channel {}",
                refund.no, channel.id
            )));
        }

        match result.status {
            GatewayRefundStatus::Success => {
                let transitioned = self
                    .stores
                    .refunds
                    .cas_success(
                        refund.id,
                        result.channel_refund_no.as_deref().unwrap_or(&refund.no),
                        result.success_time.unwrap_or_else(Utc::now),
                        &result.raw,
                    )
                    .await?;
                if !transitioned {
                    debug!(refund_no = %refund.no, "refund success replayed, no transition");
                    return Ok(());
                }
                // Accumulate onto the order; the SQL guard keeps the total
                // within the order price under any interleaving.
                if !self
                    .stores
                    .orders
                    .cas_order_refunded(refund.order_id, refund.refund_price)
                    .await?
                {
                    warn!(
                        refund_no = %refund.no,
                        order_no = %refund.order_no,
                        "refunded amount update rejected by guard"
                    );
                }
                info!(refund_no = %refund.no, order_no = %refund.order_no, "refund succeeded");
                self.queue_refund_notify(&refund).await;
            }
            GatewayRefundStatus::Failure => {
                let transitioned = self
                    .stores
                    .refunds
                    .cas_failure(
                        refund.id,
                        result.error_code.as_deref(),
                        result.error_msg.as_deref(),
                        &result.raw,
                    )
                    .await?;
                if transitioned {
                    info!(refund_no = %refund.no, "refund failed at the channel");
                    self.queue_refund_notify(&refund).await;
                }
            }
            GatewayRefundStatus::Waiting => {
                debug!(refund_no = %refund.no, "non-final refund notification ignored");
            }
        }
        Ok(())
    }

    async fn queue_refund_notify(&self, refund: &PayRefund) {
        let queued = async {
            let app = self
                .stores
                .apps
                .get_app(refund.app_id)
                .await?
                .ok_or(ServiceError::AppNotFound(refund.app_id))?;
            self.notify
                .create_task(
                    &app,
                    NotifyTaskType::Refund,
                    refund.id,
                    &refund.no,
                    &refund.merchant_refund_id,
                )
                .await
        }
        .await;
        if let Err(error) = queued {
            warn!(refund_no = %refund.no, %error, "failed to queue refund notify task");
        }
    }

    /// Reconciliation sweep over WAITING refunds: ask the gateway for the
    /// real state and apply it. Per-refund failures never abort the sweep.
    pub async fn sync_refunds(&self, limit: i64) -> ServiceResult<usize> {
        let waiting = self.stores.refunds.list_waiting(limit).await?;
        let mut finalized = 0;
        for refund in waiting {
            match self.sync_one(&refund).await {
                Ok(true) => finalized += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(refund_no = %refund.no, %error, "refund sync failed");
                }
            }
        }
        Ok(finalized)
    }

    async fn sync_one(&self, refund: &PayRefund) -> ServiceResult<bool> {
        let channel = self.apps.require_channel(refund.channel_id).await?;
        if is_wallet_channel(&channel) {
            // Wallet refunds settle at creation; a WAITING one means the
            // process died mid-flight and needs operator attention.
            warn!(refund_no = %refund.no, "wallet refund stuck in waiting");
            return Ok(false);
        }
        let outer_no = self.paid_extension_no(refund).await?;
        let client = self.apps.client_for(&channel).await?;
        let result = client.get_refund(&outer_no, &refund.no).await?;
        let finalizes = result.status != GatewayRefundStatus::Waiting;
        self.notify_refund(&channel, &result).await?;
        Ok(finalizes)
    }
}
