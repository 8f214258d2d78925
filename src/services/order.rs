//! Order lifecycle engine.
//!
//! An order is the merchant-facing intent; each submission against a
//! channel creates an extension carrying the channel-scoped number the
//! gateway sees. The order is finalized exactly once, by whichever
//! extension's success lands first.

use crate::cache::sequence::{SequenceGenerator, EXTENSION_NO_PREFIX, ORDER_NO_PREFIX};
use crate::database::app_repository::PayChannel;
use crate::database::notify_repository::NotifyTaskType;
use crate::database::order_repository::{
    ExtensionStatus, OrderExtension, OrderStatus, OrderSuccessUpdate, PayOrder,
};
use crate::error::{ServiceError, ServiceResult};
use crate::gateway::types::{
    DisplayMode, GatewayOrderResult, GatewayOrderStatus, UnifiedOrderRequest,
};
use crate::services::app::AppService;
use crate::services::notify::NotifyService;
use crate::services::wallet::{WalletService, BIZ_TYPE_PAYMENT};
use crate::services::{is_wallet_channel, Stores};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Wallet owner kind used for buyer wallets.
pub const WALLET_USER_TYPE_MEMBER: i16 = 1;

#[derive(Debug, Clone)]
pub struct CreateOrderRequest {
    pub app_id: Uuid,
    pub merchant_order_id: String,
    pub subject: String,
    /// Minor units, strictly positive.
    pub price: i64,
    pub expire_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubmitOrderRequest {
    pub app_id: Uuid,
    pub merchant_order_id: String,
    pub channel_code: String,
    pub return_url: Option<String>,
    pub buyer_email: Option<String>,
    /// Identifies the paying wallet; required for the wallet channel.
    pub channel_user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubmitOrderResponse {
    pub order_id: Uuid,
    pub order_status: OrderStatus,
    pub extension_no: String,
    pub display_mode: Option<DisplayMode>,
    pub display_content: Option<String>,
}

pub struct OrderService {
    stores: Stores,
    apps: Arc<AppService>,
    wallets: Arc<WalletService>,
    notify: Arc<NotifyService>,
    sequence: Arc<dyn SequenceGenerator>,
    public_base_url: String,
}

impl OrderService {
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

    /// Create an order. Replaying the same `(app, merchant_order_id)` with
    /// the same price returns the existing order unchanged.
    pub async fn create_order(&self, request: CreateOrderRequest) -> ServiceResult<PayOrder> {
        if request.price <= 0 {
            return Err(ServiceError::InvalidRequest(
                "order price must be positive".to_string(),
            ));
        }
        if request.expire_time <= Utc::now() {
            return Err(ServiceError::InvalidRequest(
                "order expire_time must be in the future".to_string(),
            ));
        }
        let app = self.apps.require_app(request.app_id).await?;

        if let Some(existing) = self
            .stores
            .orders
            .get_order_by_merchant(app.id, &request.merchant_order_id)
            .await?
        {
            return self.replay_or_conflict(existing, &request);
        }

        let now = Utc::now();
        let order = PayOrder {
            id: Uuid::new_v4(),
            app_id: app.id,
            no: self.sequence.next(ORDER_NO_PREFIX).await?,
            merchant_order_id: request.merchant_order_id.clone(),
            subject: request.subject.clone(),
            price: request.price,
            status: OrderStatus::Waiting,
            expire_time: request.expire_time,
            channel_id: None,
            channel_code: None,
            channel_order_no: None,
            channel_user_id: None,
            channel_fee_rate: None,
            channel_fee_price: 0,
            success_time: None,
            extension_id: None,
            refund_price: 0,
            created_at: now,
            updated_at: now,
        };
        match self.stores.orders.insert_order(&order).await {
            Ok(order) => {
                info!(order_no = %order.no, app_id = %app.id, price = order.price, "order created");
                Ok(order)
            }
            // Lost a creation race on (app, merchant_order_id); replay the
            // idempotency check against the winner.
            Err(e) if e.is_unique_violation() => {
                let existing = self
                    .stores
                    .orders
                    .get_order_by_merchant(app.id, &request.merchant_order_id)
                    .await?
                    .ok_or(e)?;
                self.replay_or_conflict(existing, &request)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn replay_or_conflict(
        &self,
        existing: PayOrder,
        request: &CreateOrderRequest,
    ) -> ServiceResult<PayOrder> {
        if existing.price == request.price {
            debug!(order_no = %existing.no, "order creation replayed");
            Ok(existing)
        } else {
            Err(ServiceError::DuplicateMerchantOrderId(
                request.merchant_order_id.clone(),
            ))
        }
    }

    pub async fn get_order(
        &self,
        app_id: Uuid,
        merchant_order_id: &str,
    ) -> ServiceResult<PayOrder> {
        self.stores
            .orders
            .get_order_by_merchant(app_id, merchant_order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(merchant_order_id.to_string()))
    }

    /// Submit a WAITING order to a channel: a fresh extension per attempt,
    /// the gateway only ever sees the extension number.
    pub async fn submit_order(
        &self,
        request: SubmitOrderRequest,
    ) -> ServiceResult<SubmitOrderResponse> {
        let app = self.apps.require_app(request.app_id).await?;
        let order = self
            .stores
            .orders
            .get_order_by_merchant(app.id, &request.merchant_order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(request.merchant_order_id.clone()))?;
        if order.status != OrderStatus::Waiting {
            return Err(ServiceError::OrderNotPayable {
                no: order.no.clone(),
                status: format!("{:?}", order.status).to_lowercase(),
            });
        }
        if order.expire_time <= Utc::now() {
            return Err(ServiceError::OrderExpired(order.no.clone()));
        }
        let channel = self
            .apps
            .require_channel_by_code(app.id, &request.channel_code)
            .await?;

        // A re-submission supersedes any in-flight attempt; at most one
        // extension per order may be WAITING at a time. An attempt that
        // already succeeded wins its CAS before this lands and the order
        // is no longer payable above.
        self.close_waiting_extensions(order.id, "superseded").await;

        let now = Utc::now();
        let extension = self
            .stores
            .orders
            .insert_extension(&OrderExtension {
                id: Uuid::new_v4(),
                no: self.sequence.next(EXTENSION_NO_PREFIX).await?,
                order_id: order.id,
                channel_id: channel.id,
                channel_code: channel.code.clone(),
                status: ExtensionStatus::Waiting,
                channel_notify_data: None,
                channel_error_code: None,
                channel_error_msg: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        info!(order_no = %order.no, extension_no = %extension.no, channel = %channel.code, "order submitted");

        let result = if is_wallet_channel(&channel) {
            self.pay_with_wallet(&order, &extension, request.channel_user_id.as_deref())
                .await?
        } else {
            self.pay_with_gateway(&order, &extension, &channel, &request)
                .await?
        };

        match result.status {
            GatewayOrderStatus::Success => {
                self.mark_extension_success(&channel, &extension, &result)
                    .await?;
            }
            GatewayOrderStatus::Closed => {
                self.stores
                    .orders
                    .cas_extension_closed(
                        extension.id,
                        result.error_code.as_deref(),
                        result.error_msg.as_deref(),
                    )
                    .await?;
            }
            GatewayOrderStatus::Waiting | GatewayOrderStatus::Unknown => {}
        }

        let order_status = self
            .stores
            .orders
            .get_order(order.id)
            .await?
            .map(|o| o.status)
            .unwrap_or(order.status);
        Ok(SubmitOrderResponse {
            order_id: order.id,
            order_status,
            extension_no: extension.no,
            display_mode: result.display_mode,
            display_content: result.display_content,
        })
    }

    async fn pay_with_gateway(
        &self,
        order: &PayOrder,
        extension: &OrderExtension,
        channel: &PayChannel,
        request: &SubmitOrderRequest,
    ) -> ServiceResult<GatewayOrderResult> {
        let client = self.apps.client_for(channel).await?;
        let unified = UnifiedOrderRequest {
            outer_no: extension.no.clone(),
            subject: order.subject.clone(),
            price: order.price,
            expire_time: order.expire_time,
            notify_url: format!("{}/webhooks/order/{}", self.public_base_url, channel.id),
            return_url: request.return_url.clone(),
            buyer_email: request.buyer_email.clone(),
        };
        match client.unified_order(unified).await {
            Ok(result) => Ok(result),
            Err(error) => {
                // The submission never reached a payable state; close the
                // extension so the order can be retried on another channel.
                self.stores
                    .orders
                    .cas_extension_closed(
                        extension.id,
                        Some("gateway_error"),
                        Some(&error.to_string()),
                    )
                    .await?;
                Err(error.into())
            }
        }
    }

    /// The internal wallet channel settles synchronously against the
    /// buyer's wallet balance instead of calling out to a gateway.
    async fn pay_with_wallet(
        &self,
        order: &PayOrder,
        extension: &OrderExtension,
        channel_user_id: Option<&str>,
    ) -> ServiceResult<GatewayOrderResult> {
        let user_id = channel_user_id.ok_or_else(|| {
            ServiceError::InvalidRequest(
                "channel_user_id is required for wallet payments".to_string(),
            )
        })?;
        let transaction = match self
            .wallets
            .pay(
                user_id,
                WALLET_USER_TYPE_MEMBER,
                BIZ_TYPE_PAYMENT,
                &order.no,
                &order.subject,
                order.price,
            )
            .await
        {
            Ok(transaction) => transaction,
            Err(error) => {
                self.stores
                    .orders
                    .cas_extension_closed(
                        extension.id,
                        Some("wallet_balance"),
                        Some(&error.to_string()),
                    )
                    .await?;
                return Err(error);
            }
        };

        Ok(GatewayOrderResult {
            status: GatewayOrderStatus::Success,
            outer_no: extension.no.clone(),
            channel_order_no: Some(transaction.id.to_string()),
            channel_user_id: Some(user_id.to_string()),
            success_time: Some(transaction.created_at),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({ "wallet_transaction_id": transaction.id }),
        })
    }

    /// Apply a gateway-reported order state, from a webhook. SUCCESS and
    /// CLOSED both land here; anything else is a no-op.
    pub async fn notify_order(
        &self,
        channel: &PayChannel,
        result: &GatewayOrderResult,
    ) -> ServiceResult<()> {
        let extension = self
            .stores
            .orders
            .get_extension_by_no(&result.outer_no)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(result.outer_no.clone()))?;
        if extension.channel_id != channel.id {
            return Err(ServiceError::StateConflict(format!(
                "extension {} does not belong to channel {}",
                extension.no, channel.id
            )));
        }

        match result.status {
            GatewayOrderStatus::Success => {
                self.mark_extension_success(channel, &extension, result)
                    .await?;
            }
            GatewayOrderStatus::Closed => {
                self.stores
                    .orders
                    .cas_extension_closed(
                        extension.id,
                        result.error_code.as_deref(),
                        result.error_msg.as_deref(),
                    )
                    .await?;
                if self.stores.orders.cas_order_closed(extension.order_id).await? {
                    info!(extension_no = %extension.no, "order closed by channel notification");
                    self.queue_order_notify(extension.order_id).await;
                }
            }
            GatewayOrderStatus::Waiting | GatewayOrderStatus::Unknown => {
                debug!(extension_no = %extension.no, "non-final order notification ignored");
            }
        }
        Ok(())
    }

    /// SUCCESS path shared by submission, webhook, and active sync:
    /// extension CAS, then order CAS with the channel fee stamped on. Only
    /// the task that wins the order CAS queues the merchant notification.
    async fn mark_extension_success(
        &self,
        channel: &PayChannel,
        extension: &OrderExtension,
        result: &GatewayOrderResult,
    ) -> ServiceResult<bool> {
        self.stores
            .orders
            .cas_extension_success(extension.id, &result.raw)
            .await?;

        let order = self
            .stores
            .orders
            .get_order(extension.order_id)
            .await?
            .ok_or_else(|| {
                ServiceError::StateConflict(format!(
                    "extension {} references missing order",
                    extension.no
                ))
            })?;
        let success_time = result.success_time.unwrap_or_else(Utc::now);
        let update = OrderSuccessUpdate {
            order_id: order.id,
            extension_id: extension.id,
            channel_id: channel.id,
            channel_code: channel.code.clone(),
            channel_order_no: result
                .channel_order_no
                .clone()
                .unwrap_or_else(|| extension.no.clone()),
            channel_user_id: result.channel_user_id.clone(),
            channel_fee_rate: channel.fee_rate,
            channel_fee_price: calculate_fee(order.price, channel.fee_rate),
            success_time,
        };

        let transitioned = self.stores.orders.cas_order_success(&update).await?;
        if transitioned {
            info!(
                order_no = %order.no,
                extension_no = %extension.no,
                fee = update.channel_fee_price,
                "order paid"
            );
            self.queue_order_notify(order.id).await;
        } else {
            debug!(order_no = %order.no, "order success replayed, no transition");
        }
        Ok(transitioned)
    }

    async fn queue_order_notify(&self, order_id: Uuid) {
        let queued = async {
            let order = self
                .stores
                .orders
                .get_order(order_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::StateConflict(format!("order {} vanished", order_id))
                })?;
            let app = self
                .stores
                .apps
                .get_app(order.app_id)
                .await?
                .ok_or(ServiceError::AppNotFound(order.app_id))?;
            self.notify
                .create_task(
                    &app,
                    NotifyTaskType::Order,
                    order.id,
                    &order.no,
                    &order.merchant_order_id,
                )
                .await
        }
        .await;
        if let Err(error) = queued {
            // The order transition already committed; a lost task is
            // recovered by the merchant polling, so log and move on.
            warn!(order_id = %order_id, %error, "failed to queue order notify task");
        }
    }

    /// Close WAITING orders past their expiry. Returns how many closed.
    pub async fn expire_orders(&self, now: DateTime<Utc>, limit: i64) -> ServiceResult<usize> {
        let expired = self.stores.orders.list_expired_waiting(now, limit).await?;
        let mut closed = 0;
        for order in expired {
            match self.stores.orders.cas_order_closed(order.id).await {
                Ok(true) => {
                    closed += 1;
                    info!(order_no = %order.no, "order expired");
                    self.close_waiting_extensions(order.id, "expired").await;
                    self.queue_order_notify(order.id).await;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(order_no = %order.no, %error, "order expiry failed");
                }
            }
        }
        Ok(closed)
    }

    async fn close_waiting_extensions(&self, order_id: Uuid, reason: &str) {
        let waiting = match self
            .stores
            .orders
            .list_extensions_by_order(order_id, Some(ExtensionStatus::Waiting))
            .await
        {
            Ok(waiting) => waiting,
            Err(error) => {
                warn!(order_id = %order_id, %error, "failed to list waiting extensions");
                return;
            }
        };
        for extension in waiting {
            if let Err(error) = self
                .stores
                .orders
                .cas_extension_closed(extension.id, Some(reason), None)
                .await
            {
                warn!(extension_no = %extension.no, %error, "failed to close extension");
            }
        }
    }

    /// Actively query the gateways for recent WAITING orders, applying
    /// SUCCESS results only. A gateway-side CLOSED answer is discarded:
    /// closure is owned by the expiry sweep, a query races the webhook.
    pub async fn sync_recent_orders(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> ServiceResult<usize> {
        let orders = self
            .stores
            .orders
            .list_waiting_created_since(since, limit)
            .await?;
        let mut updated = 0;
        for order in orders {
            if self.sync_order_quietly(&order).await {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn sync_order_quietly(&self, order: &PayOrder) -> bool {
        let extensions = match self
            .stores
            .orders
            .list_extensions_by_order(order.id, Some(ExtensionStatus::Waiting))
            .await
        {
            Ok(extensions) => extensions,
            Err(error) => {
                warn!(order_no = %order.no, %error, "failed to list extensions for sync");
                return false;
            }
        };

        for extension in extensions {
            let channel = match self.stores.apps.get_channel(extension.channel_id).await {
                Ok(Some(channel)) => channel,
                Ok(None) => continue,
                Err(error) => {
                    warn!(extension_no = %extension.no, %error, "channel lookup failed during sync");
                    continue;
                }
            };
            if is_wallet_channel(&channel) {
                continue;
            }
            let client = match self.apps.client_for(&channel).await {
                Ok(client) => client,
                Err(error) => {
                    warn!(extension_no = %extension.no, %error, "client unavailable during sync");
                    continue;
                }
            };
            match client.get_order(&extension.no).await {
                Ok(result) if result.status == GatewayOrderStatus::Success => {
                    match self
                        .mark_extension_success(&channel, &extension, &result)
                        .await
                    {
                        Ok(true) => return true,
                        Ok(false) => {}
                        Err(error) => {
                            warn!(extension_no = %extension.no, %error, "sync success application failed");
                        }
                    }
                }
                Ok(result) => {
                    debug!(
                        extension_no = %extension.no,
                        status = ?result.status,
                        "sync result ignored"
                    );
                }
                Err(error) => {
                    warn!(extension_no = %extension.no, %error, "gateway query failed during sync");
                }
            }
        }
        false
    }
}

/// Channel fee in minor units, rounded half away from zero.
pub fn calculate_fee(price: i64, fee_rate: f64) -> i64 {
    (price as f64 * fee_rate / 100.0).round() as i64
}
