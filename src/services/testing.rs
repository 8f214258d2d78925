//! In-memory store implementations and fixtures for engine tests.
//!
//! The in-memory stores mirror the conditional-update semantics of the
//! Postgres repositories so the engines can be exercised without a
//! database.

use crate::cache::lock::LocalLock;
use crate::cache::sequence::LocalSequence;
use crate::config::NotifyConfig;
use crate::database::app_repository::{AppStore, PayApp, PayChannel};
use crate::database::error::DatabaseError;
use crate::database::notify_repository::{
    NotifyLog, NotifyStatus, NotifyStore, NotifyTask, TaskAttemptUpdate,
};
use crate::database::order_repository::{
    ExtensionStatus, OrderExtension, OrderStatus, OrderStore, OrderSuccessUpdate, PayOrder,
};
use crate::database::refund_repository::{PayRefund, RefundStatus, RefundStore};
use crate::database::transfer_repository::{PayTransfer, TransferStatus, TransferStore};
use crate::database::wallet_repository::{PayWallet, WalletStore, WalletTransaction};
use crate::gateway::client::PaymentClient;
use crate::gateway::error::GatewayResult;
use crate::gateway::registry::ClientRegistry;
use crate::gateway::types::{
    DisplayMode, GatewayOrderResult, GatewayOrderStatus, GatewayRefundResult,
    GatewayRefundStatus, GatewayTransferResult, GatewayTransferStatus, NotifyPayload,
    UnifiedOrderRequest, UnifiedRefundRequest, UnifiedTransferRequest, GATEWAY_MOCK,
};
use crate::services::app::AppService;
use crate::services::notify::NotifyService;
use crate::services::order::OrderService;
use crate::services::refund::RefundService;
use crate::services::transfer::TransferService;
use crate::services::wallet::WalletService;
use crate::services::Stores;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryAppStore {
    apps: Mutex<HashMap<Uuid, PayApp>>,
    channels: Mutex<HashMap<Uuid, PayChannel>>,
}

impl InMemoryAppStore {
    pub async fn put_app(&self, app: PayApp) {
        self.apps.lock().await.insert(app.id, app);
    }

    pub async fn put_channel(&self, channel: PayChannel) {
        self.channels.lock().await.insert(channel.id, channel);
    }
}

#[async_trait]
impl AppStore for InMemoryAppStore {
    async fn get_app(&self, id: Uuid) -> Result<Option<PayApp>, DatabaseError> {
        Ok(self.apps.lock().await.get(&id).cloned())
    }

    async fn get_channel(&self, id: Uuid) -> Result<Option<PayChannel>, DatabaseError> {
        Ok(self.channels.lock().await.get(&id).cloned())
    }

    async fn get_channel_by_code(
        &self,
        app_id: Uuid,
        code: &str,
    ) -> Result<Option<PayChannel>, DatabaseError> {
        Ok(self
            .channels
            .lock()
            .await
            .values()
            .find(|c| c.app_id == app_id && c.code == code)
            .cloned())
    }

    async fn update_channel(
        &self,
        id: Uuid,
        is_enabled: bool,
        fee_rate: f64,
        config: serde_json::Value,
    ) -> Result<PayChannel, DatabaseError> {
        let mut channels = self.channels.lock().await;
        let channel = channels
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("pay_channels", id.to_string()))?;
        channel.is_enabled = is_enabled;
        channel.fee_rate = fee_rate;
        channel.config = config;
        channel.updated_at = Utc::now();
        Ok(channel.clone())
    }
}

#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: Mutex<HashMap<Uuid, PayOrder>>,
    extensions: Mutex<HashMap<Uuid, OrderExtension>>,
}

impl InMemoryOrderStore {
    pub async fn put_order(&self, order: PayOrder) {
        self.orders.lock().await.insert(order.id, order);
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn insert_order(&self, order: &PayOrder) -> Result<PayOrder, DatabaseError> {
        let mut orders = self.orders.lock().await;
        if orders
            .values()
            .any(|o| o.app_id == order.app_id && o.merchant_order_id == order.merchant_order_id)
        {
            return Err(DatabaseError::UniqueViolation {
                constraint: "pay_orders_app_id_merchant_order_id_key".to_string(),
            });
        }
        orders.insert(order.id, order.clone());
        Ok(order.clone())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<PayOrder>, DatabaseError> {
        Ok(self.orders.lock().await.get(&id).cloned())
    }

    async fn get_order_by_merchant(
        &self,
        app_id: Uuid,
        merchant_order_id: &str,
    ) -> Result<Option<PayOrder>, DatabaseError> {
        Ok(self
            .orders
            .lock()
            .await
            .values()
            .find(|o| o.app_id == app_id && o.merchant_order_id == merchant_order_id)
            .cloned())
    }

    async fn insert_extension(
        &self,
        extension: &OrderExtension,
    ) -> Result<OrderExtension, DatabaseError> {
        self.extensions
            .lock()
            .await
            .insert(extension.id, extension.clone());
        Ok(extension.clone())
    }

    async fn get_extension(&self, id: Uuid) -> Result<Option<OrderExtension>, DatabaseError> {
        Ok(self.extensions.lock().await.get(&id).cloned())
    }

    async fn get_extension_by_no(
        &self,
        no: &str,
    ) -> Result<Option<OrderExtension>, DatabaseError> {
        Ok(self
            .extensions
            .lock()
            .await
            .values()
            .find(|e| e.no == no)
            .cloned())
    }

    async fn list_extensions_by_order(
        &self,
        order_id: Uuid,
        status: Option<ExtensionStatus>,
    ) -> Result<Vec<OrderExtension>, DatabaseError> {
        Ok(self
            .extensions
            .lock()
            .await
            .values()
            .filter(|e| e.order_id == order_id && status.map_or(true, |s| e.status == s))
            .cloned()
            .collect())
    }

    async fn cas_extension_success(
        &self,
        id: Uuid,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let mut extensions = self.extensions.lock().await;
        match extensions.get_mut(&id) {
            Some(e) if e.status == ExtensionStatus::Waiting => {
                e.status = ExtensionStatus::Success;
                e.channel_notify_data = Some(notify_data.clone());
                e.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_extension_closed(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let mut extensions = self.extensions.lock().await;
        match extensions.get_mut(&id) {
            Some(e) if e.status == ExtensionStatus::Waiting => {
                e.status = ExtensionStatus::Closed;
                e.channel_error_code = error_code.map(str::to_string);
                e.channel_error_msg = error_msg.map(str::to_string);
                e.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_order_success(
        &self,
        update: &OrderSuccessUpdate,
    ) -> Result<bool, DatabaseError> {
        let mut orders = self.orders.lock().await;
        match orders.get_mut(&update.order_id) {
            Some(o) if o.status == OrderStatus::Waiting => {
                o.status = OrderStatus::Success;
                o.extension_id = Some(update.extension_id);
                o.channel_id = Some(update.channel_id);
                o.channel_code = Some(update.channel_code.clone());
                o.channel_order_no = Some(update.channel_order_no.clone());
                o.channel_user_id = update.channel_user_id.clone();
                o.channel_fee_rate = Some(update.channel_fee_rate);
                o.channel_fee_price = update.channel_fee_price;
                o.success_time = Some(update.success_time);
                o.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_order_closed(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut orders = self.orders.lock().await;
        match orders.get_mut(&id) {
            Some(o) if o.status == OrderStatus::Waiting => {
                o.status = OrderStatus::Closed;
                o.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_order_refunded(
        &self,
        id: Uuid,
        refund_delta: i64,
    ) -> Result<bool, DatabaseError> {
        let mut orders = self.orders.lock().await;
        match orders.get_mut(&id) {
            Some(o)
                if matches!(o.status, OrderStatus::Success | OrderStatus::Refunded)
                    && o.refund_price + refund_delta <= o.price =>
            {
                o.status = OrderStatus::Refunded;
                o.refund_price += refund_delta;
                o.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_expired_waiting(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PayOrder>, DatabaseError> {
        Ok(self
            .orders
            .lock()
            .await
            .values()
            .filter(|o| o.status == OrderStatus::Waiting && o.expire_time <= now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_waiting_created_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PayOrder>, DatabaseError> {
        Ok(self
            .orders
            .lock()
            .await
            .values()
            .filter(|o| o.status == OrderStatus::Waiting && o.created_at >= since)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryRefundStore {
    refunds: Mutex<HashMap<Uuid, PayRefund>>,
}

#[async_trait]
impl RefundStore for InMemoryRefundStore {
    async fn insert(&self, refund: &PayRefund) -> Result<PayRefund, DatabaseError> {
        let mut refunds = self.refunds.lock().await;
        if refunds
            .values()
            .any(|r| r.app_id == refund.app_id && r.merchant_refund_id == refund.merchant_refund_id)
        {
            return Err(DatabaseError::UniqueViolation {
                constraint: "pay_refunds_app_id_merchant_refund_id_key".to_string(),
            });
        }
        // Mirrors the partial unique index on (order_id) WHERE waiting.
        if refund.status == RefundStatus::Waiting
            && refunds
                .values()
                .any(|r| r.order_id == refund.order_id && r.status == RefundStatus::Waiting)
        {
            return Err(DatabaseError::UniqueViolation {
                constraint: "uq_pay_refunds_order_waiting".to_string(),
            });
        }
        refunds.insert(refund.id, refund.clone());
        Ok(refund.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PayRefund>, DatabaseError> {
        Ok(self.refunds.lock().await.get(&id).cloned())
    }

    async fn get_by_no(&self, no: &str) -> Result<Option<PayRefund>, DatabaseError> {
        Ok(self
            .refunds
            .lock()
            .await
            .values()
            .find(|r| r.no == no)
            .cloned())
    }

    async fn get_by_merchant(
        &self,
        app_id: Uuid,
        merchant_refund_id: &str,
    ) -> Result<Option<PayRefund>, DatabaseError> {
        Ok(self
            .refunds
            .lock()
            .await
            .values()
            .find(|r| r.app_id == app_id && r.merchant_refund_id == merchant_refund_id)
            .cloned())
    }

    async fn count_waiting_by_order(&self, order_id: Uuid) -> Result<i64, DatabaseError> {
        Ok(self
            .refunds
            .lock()
            .await
            .values()
            .filter(|r| r.order_id == order_id && r.status == RefundStatus::Waiting)
            .count() as i64)
    }

    async fn cas_success(
        &self,
        id: Uuid,
        channel_refund_no: &str,
        success_time: DateTime<Utc>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let mut refunds = self.refunds.lock().await;
        match refunds.get_mut(&id) {
            Some(r) if r.status == RefundStatus::Waiting => {
                r.status = RefundStatus::Success;
                r.channel_refund_no = Some(channel_refund_no.to_string());
                r.success_time = Some(success_time);
                r.channel_notify_data = Some(notify_data.clone());
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_failure(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let mut refunds = self.refunds.lock().await;
        match refunds.get_mut(&id) {
            Some(r) if r.status == RefundStatus::Waiting => {
                r.status = RefundStatus::Failure;
                r.channel_error_code = error_code.map(str::to_string);
                r.channel_error_msg = error_msg.map(str::to_string);
                r.channel_notify_data = Some(notify_data.clone());
                r.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_waiting(&self, limit: i64) -> Result<Vec<PayRefund>, DatabaseError> {
        Ok(self
            .refunds
            .lock()
            .await
            .values()
            .filter(|r| r.status == RefundStatus::Waiting)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryTransferStore {
    transfers: Mutex<HashMap<Uuid, PayTransfer>>,
}

#[async_trait]
impl TransferStore for InMemoryTransferStore {
    async fn insert(&self, transfer: &PayTransfer) -> Result<PayTransfer, DatabaseError> {
        let mut transfers = self.transfers.lock().await;
        if transfers.values().any(|t| {
            t.app_id == transfer.app_id && t.merchant_transfer_id == transfer.merchant_transfer_id
        }) {
            return Err(DatabaseError::UniqueViolation {
                constraint: "pay_transfers_app_id_merchant_transfer_id_key".to_string(),
            });
        }
        transfers.insert(transfer.id, transfer.clone());
        Ok(transfer.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PayTransfer>, DatabaseError> {
        Ok(self.transfers.lock().await.get(&id).cloned())
    }

    async fn get_by_no(&self, no: &str) -> Result<Option<PayTransfer>, DatabaseError> {
        Ok(self
            .transfers
            .lock()
            .await
            .values()
            .find(|t| t.no == no)
            .cloned())
    }

    async fn get_by_merchant(
        &self,
        app_id: Uuid,
        merchant_transfer_id: &str,
    ) -> Result<Option<PayTransfer>, DatabaseError> {
        Ok(self
            .transfers
            .lock()
            .await
            .values()
            .find(|t| t.app_id == app_id && t.merchant_transfer_id == merchant_transfer_id)
            .cloned())
    }

    async fn cas_processing(
        &self,
        id: Uuid,
        channel_transfer_no: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let mut transfers = self.transfers.lock().await;
        match transfers.get_mut(&id) {
            Some(t) if t.status == TransferStatus::Waiting => {
                t.status = TransferStatus::Processing;
                if let Some(no) = channel_transfer_no {
                    t.channel_transfer_no = Some(no.to_string());
                }
                t.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_success(
        &self,
        id: Uuid,
        channel_transfer_no: &str,
        success_time: DateTime<Utc>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let mut transfers = self.transfers.lock().await;
        match transfers.get_mut(&id) {
            Some(t)
                if matches!(t.status, TransferStatus::Waiting | TransferStatus::Processing) =>
            {
                t.status = TransferStatus::Success;
                t.channel_transfer_no = Some(channel_transfer_no.to_string());
                t.success_time = Some(success_time);
                t.channel_notify_data = Some(notify_data.clone());
                t.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cas_closed(
        &self,
        id: Uuid,
        error_code: Option<&str>,
        error_msg: Option<&str>,
        notify_data: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let mut transfers = self.transfers.lock().await;
        match transfers.get_mut(&id) {
            Some(t)
                if matches!(t.status, TransferStatus::Waiting | TransferStatus::Processing) =>
            {
                t.status = TransferStatus::Closed;
                t.channel_error_code = error_code.map(str::to_string);
                t.channel_error_msg = error_msg.map(str::to_string);
                t.channel_notify_data = Some(notify_data.clone());
                t.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryNotifyStore {
    tasks: Mutex<HashMap<Uuid, NotifyTask>>,
    logs: Mutex<Vec<NotifyLog>>,
}

impl InMemoryNotifyStore {
    pub async fn all_tasks(&self) -> Vec<NotifyTask> {
        self.tasks.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl NotifyStore for InMemoryNotifyStore {
    async fn insert_task(&self, task: &NotifyTask) -> Result<NotifyTask, DatabaseError> {
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(task.clone())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<NotifyTask>, DatabaseError> {
        Ok(self.tasks.lock().await.get(&id).cloned())
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<NotifyTask>, DatabaseError> {
        Ok(self
            .tasks
            .lock()
            .await
            .values()
            .filter(|t| t.status == NotifyStatus::Waiting && t.next_notify_time <= now)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn finish_attempt(
        &self,
        id: Uuid,
        expected_times: i32,
        update: &TaskAttemptUpdate,
    ) -> Result<bool, DatabaseError> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&id) {
            Some(t)
                if t.status == NotifyStatus::Waiting && t.notify_times == expected_times =>
            {
                t.status = update.status;
                t.notify_times = update.notify_times;
                t.last_execute_time = Some(update.last_execute_time);
                if let Some(next) = update.next_notify_time {
                    t.next_notify_time = next;
                }
                t.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_log(&self, log: &NotifyLog) -> Result<NotifyLog, DatabaseError> {
        self.logs.lock().await.push(log.clone());
        Ok(log.clone())
    }

    async fn list_logs(&self, task_id: Uuid) -> Result<Vec<NotifyLog>, DatabaseError> {
        Ok(self
            .logs
            .lock()
            .await
            .iter()
            .filter(|l| l.task_id == task_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryWalletStore {
    wallets: Mutex<HashMap<Uuid, PayWallet>>,
    transactions: Mutex<Vec<WalletTransaction>>,
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn get_or_create(
        &self,
        user_id: &str,
        user_type: i16,
    ) -> Result<PayWallet, DatabaseError> {
        let mut wallets = self.wallets.lock().await;
        if let Some(existing) = wallets
            .values()
            .find(|w| w.user_id == user_id && w.user_type == user_type)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let wallet = PayWallet {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            user_type,
            balance: 0,
            frozen_price: 0,
            total_expense: 0,
            total_recharge: 0,
            created_at: now,
            updated_at: now,
        };
        wallets.insert(wallet.id, wallet.clone());
        Ok(wallet)
    }

    async fn get(&self, id: Uuid) -> Result<Option<PayWallet>, DatabaseError> {
        Ok(self.wallets.lock().await.get(&id).cloned())
    }

    async fn add_balance(&self, id: Uuid, delta: i64) -> Result<Option<i64>, DatabaseError> {
        let mut wallets = self.wallets.lock().await;
        let wallet = wallets
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("pay_wallets", id.to_string()))?;
        if wallet.balance + delta < 0 {
            return Ok(None);
        }
        wallet.balance += delta;
        if delta >= 0 {
            wallet.total_recharge += delta;
        } else {
            wallet.total_expense += -delta;
        }
        wallet.updated_at = Utc::now();
        Ok(Some(wallet.balance))
    }

    async fn freeze(&self, id: Uuid, amount: i64) -> Result<bool, DatabaseError> {
        let mut wallets = self.wallets.lock().await;
        let wallet = wallets
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("pay_wallets", id.to_string()))?;
        if wallet.balance < amount {
            return Ok(false);
        }
        wallet.balance -= amount;
        wallet.frozen_price += amount;
        Ok(true)
    }

    async fn unfreeze(&self, id: Uuid, amount: i64) -> Result<bool, DatabaseError> {
        let mut wallets = self.wallets.lock().await;
        let wallet = wallets
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("pay_wallets", id.to_string()))?;
        if wallet.frozen_price < amount {
            return Ok(false);
        }
        wallet.frozen_price -= amount;
        wallet.balance += amount;
        Ok(true)
    }

    async fn insert_transaction(
        &self,
        transaction: &WalletTransaction,
    ) -> Result<WalletTransaction, DatabaseError> {
        self.transactions.lock().await.push(transaction.clone());
        Ok(transaction.clone())
    }

    async fn list_transactions(
        &self,
        wallet_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, DatabaseError> {
        Ok(self
            .transactions
            .lock()
            .await
            .iter()
            .filter(|t| t.wallet_id == wallet_id)
            .cloned()
            .collect())
    }
}

/// Gateway double that leaves submissions pending and answers active
/// order queries with a fixed status, for exercising the asynchronous
/// webhook and reconciliation paths.
pub struct ScriptedClient {
    pub order_query: GatewayOrderStatus,
}

#[async_trait]
impl PaymentClient for ScriptedClient {
    fn gateway_code(&self) -> &'static str {
        GATEWAY_MOCK
    }

    async fn unified_order(
        &self,
        request: UnifiedOrderRequest,
    ) -> GatewayResult<GatewayOrderResult> {
        Ok(GatewayOrderResult::waiting(
            request.outer_no.clone(),
            DisplayMode::Url,
            format!("https://scripted.invalid/pay/{}", request.outer_no),
            serde_json::json!({}),
        ))
    }

    async fn get_order(&self, outer_no: &str) -> GatewayResult<GatewayOrderResult> {
        Ok(GatewayOrderResult {
            status: self.order_query,
            outer_no: outer_no.to_string(),
            channel_order_no: Some(format!("Q-{outer_no}")),
            channel_user_id: None,
            success_time: Some(Utc::now()),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({}),
        })
    }

    async fn unified_refund(
        &self,
        request: UnifiedRefundRequest,
    ) -> GatewayResult<GatewayRefundResult> {
        Ok(GatewayRefundResult {
            status: GatewayRefundStatus::Waiting,
            refund_no: request.refund_no,
            channel_refund_no: None,
            success_time: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({}),
        })
    }

    async fn get_refund(
        &self,
        _outer_no: &str,
        refund_no: &str,
    ) -> GatewayResult<GatewayRefundResult> {
        Ok(GatewayRefundResult {
            status: GatewayRefundStatus::Waiting,
            refund_no: refund_no.to_string(),
            channel_refund_no: None,
            success_time: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({}),
        })
    }

    async fn unified_transfer(
        &self,
        request: UnifiedTransferRequest,
    ) -> GatewayResult<GatewayTransferResult> {
        Ok(GatewayTransferResult {
            status: GatewayTransferStatus::Waiting,
            outer_no: request.outer_no,
            channel_transfer_no: None,
            success_time: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({}),
        })
    }

    fn parse_order_notify(&self, _payload: &NotifyPayload) -> GatewayResult<GatewayOrderResult> {
        Ok(GatewayOrderResult {
            status: GatewayOrderStatus::Unknown,
            outer_no: String::new(),
            channel_order_no: None,
            channel_user_id: None,
            success_time: None,
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({}),
        })
    }

    fn parse_refund_notify(
        &self,
        _payload: &NotifyPayload,
    ) -> GatewayResult<GatewayRefundResult> {
        Ok(GatewayRefundResult {
            status: GatewayRefundStatus::Waiting,
            refund_no: String::new(),
            channel_refund_no: None,
            success_time: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({}),
        })
    }

    fn parse_transfer_notify(
        &self,
        _payload: &NotifyPayload,
    ) -> GatewayResult<GatewayTransferResult> {
        Ok(GatewayTransferResult {
            status: GatewayTransferStatus::Waiting,
            outer_no: String::new(),
            channel_transfer_no: None,
            success_time: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({}),
        })
    }
}

/// Everything an engine test needs, wired over in-memory stores, the
/// local lock/sequence, and the built-in client registry.
pub struct TestHarness {
    pub stores: Stores,
    pub app_store: Arc<InMemoryAppStore>,
    pub order_store: Arc<InMemoryOrderStore>,
    pub notify_store: Arc<InMemoryNotifyStore>,
    pub apps: Arc<AppService>,
    pub wallets: Arc<WalletService>,
    pub notify: Arc<NotifyService>,
    pub orders: Arc<OrderService>,
    pub refunds: Arc<RefundService>,
    pub transfers: Arc<TransferService>,
}

pub const TEST_BASE_URL: &str = "https://pay.example.com";

impl TestHarness {
    pub fn new() -> Self {
        Self::with_registry(ClientRegistry::builtin())
    }

    /// Harness whose "mock" channel resolves to a [`ScriptedClient`]:
    /// submissions stay pending and active queries answer `order_query`.
    pub fn with_scripted_gateway(order_query: GatewayOrderStatus) -> Self {
        let mut registry = ClientRegistry::builtin();
        registry.register(GATEWAY_MOCK, move |_config| {
            Ok(Arc::new(ScriptedClient { order_query }) as Arc<dyn PaymentClient>)
        });
        Self::with_registry(registry)
    }

    pub fn with_registry(registry: ClientRegistry) -> Self {
        let app_store = Arc::new(InMemoryAppStore::default());
        let order_store = Arc::new(InMemoryOrderStore::default());
        let notify_store = Arc::new(InMemoryNotifyStore::default());
        let stores = Stores {
            apps: app_store.clone(),
            orders: order_store.clone(),
            refunds: Arc::new(InMemoryRefundStore::default()),
            transfers: Arc::new(InMemoryTransferStore::default()),
            notifies: notify_store.clone(),
            wallets: Arc::new(InMemoryWalletStore::default()),
        };

        let registry = Arc::new(registry);
        let apps = Arc::new(AppService::new(stores.clone(), registry));
        let wallets = Arc::new(WalletService::new(stores.clone()));
        let notify = Arc::new(
            NotifyService::new(
                stores.clone(),
                Arc::new(LocalLock::new()),
                &NotifyConfig {
                    interval_secs: 1,
                    batch_size: 50,
                    concurrency: 4,
                    request_timeout_secs: 2,
                    lock_ttl_secs: 30,
                },
            )
            .expect("notify service init"),
        );
        let sequence = Arc::new(LocalSequence::new());
        let orders = Arc::new(OrderService::new(
            stores.clone(),
            apps.clone(),
            wallets.clone(),
            notify.clone(),
            sequence.clone(),
            TEST_BASE_URL.to_string(),
        ));
        let refunds = Arc::new(RefundService::new(
            stores.clone(),
            apps.clone(),
            wallets.clone(),
            notify.clone(),
            sequence.clone(),
            TEST_BASE_URL.to_string(),
        ));
        let transfers = Arc::new(TransferService::new(
            stores.clone(),
            apps.clone(),
            wallets.clone(),
            notify.clone(),
            sequence,
            TEST_BASE_URL.to_string(),
        ));

        Self {
            stores,
            app_store,
            order_store,
            notify_store,
            apps,
            wallets,
            notify,
            orders,
            refunds,
            transfers,
        }
    }

    /// Enabled application with callback URLs on every kind.
    pub async fn seed_app(&self) -> PayApp {
        let now = Utc::now();
        let app = PayApp {
            id: Uuid::new_v4(),
            app_key: format!("app-{}", Uuid::new_v4()),
            name: "storefront".to_string(),
            is_enabled: true,
            order_notify_url: "http://127.0.0.1:1/order".to_string(),
            refund_notify_url: "http://127.0.0.1:1/refund".to_string(),
            transfer_notify_url: "http://127.0.0.1:1/transfer".to_string(),
            created_at: now,
            updated_at: now,
        };
        self.app_store.put_app(app.clone()).await;
        app
    }

    pub async fn seed_channel(
        &self,
        app_id: Uuid,
        code: &str,
        fee_rate: f64,
        config: serde_json::Value,
    ) -> PayChannel {
        let now = Utc::now();
        let channel = PayChannel {
            id: Uuid::new_v4(),
            app_id,
            code: code.to_string(),
            is_enabled: true,
            fee_rate,
            config,
            created_at: now,
            updated_at: now,
        };
        self.app_store.put_channel(channel.clone()).await;
        channel
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::notify_repository::NotifyTaskType;
    use crate::error::ServiceError;
    use crate::services::order::{CreateOrderRequest, SubmitOrderRequest};
    use crate::services::refund::CreateRefundRequest;
    use crate::services::transfer::CreateTransferRequest;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn create_request(app_id: Uuid, merchant_order_id: &str, price: i64) -> CreateOrderRequest {
        CreateOrderRequest {
            app_id,
            merchant_order_id: merchant_order_id.to_string(),
            subject: "two widgets".to_string(),
            price,
            expire_time: Utc::now() + ChronoDuration::hours(2),
        }
    }

    fn submit_request(app_id: Uuid, merchant_order_id: &str, code: &str) -> SubmitOrderRequest {
        SubmitOrderRequest {
            app_id,
            merchant_order_id: merchant_order_id.to_string(),
            channel_code: code.to_string(),
            return_url: None,
            buyer_email: None,
            channel_user_id: None,
        }
    }

    #[tokio::test]
    async fn order_creation_is_idempotent_on_merchant_id() {
        let h = TestHarness::new();
        let app = h.seed_app().await;

        let first = h
            .orders
            .create_order(create_request(app.id, "m-1", 10_000))
            .await
            .unwrap();
        let replay = h
            .orders
            .create_order(create_request(app.id, "m-1", 10_000))
            .await
            .unwrap();
        assert_eq!(first.id, replay.id);
        assert_eq!(first.no, replay.no);

        let conflict = h
            .orders
            .create_order(create_request(app.id, "m-1", 20_000))
            .await
            .unwrap_err();
        assert!(matches!(conflict, ServiceError::DuplicateMerchantOrderId(_)));
    }

    #[tokio::test]
    async fn mock_channel_pays_the_order_and_stamps_the_fee() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 1.0, json!({"gateway": "mock"}))
            .await;

        h.orders
            .create_order(create_request(app.id, "m-2", 10_000))
            .await
            .unwrap();
        let response = h
            .orders
            .submit_order(submit_request(app.id, "m-2", "mock"))
            .await
            .unwrap();
        assert_eq!(response.order_status, OrderStatus::Success);

        let order = h.orders.get_order(app.id, "m-2").await.unwrap();
        assert_eq!(order.status, OrderStatus::Success);
        assert_eq!(order.channel_fee_price, 100);
        assert_eq!(order.channel_fee_rate, Some(1.0));
        assert!(order.success_time.is_some());
        assert!(order.extension_id.is_some());

        let tasks = h.notify_store.all_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, NotifyTaskType::Order);
        assert_eq!(tasks[0].merchant_ref, "m-2");
    }

    #[tokio::test]
    async fn submitting_a_paid_order_is_rejected() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 1.0, json!({"gateway": "mock"}))
            .await;

        h.orders
            .create_order(create_request(app.id, "m-3", 5_000))
            .await
            .unwrap();
        h.orders
            .submit_order(submit_request(app.id, "m-3", "mock"))
            .await
            .unwrap();

        let err = h
            .orders
            .submit_order(submit_request(app.id, "m-3", "mock"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::OrderNotPayable { .. }));
    }

    #[tokio::test]
    async fn wallet_channel_debits_the_buyer_wallet() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "wallet", 0.0, json!({"gateway": "wallet"}))
            .await;
        h.wallets
            .credit("buyer-1", 1, "recharge", "seed", "seed funds", 8_000)
            .await
            .unwrap();

        h.orders
            .create_order(create_request(app.id, "m-4", 5_000))
            .await
            .unwrap();
        let mut request = submit_request(app.id, "m-4", "wallet");
        request.channel_user_id = Some("buyer-1".to_string());
        let response = h.orders.submit_order(request).await.unwrap();
        assert_eq!(response.order_status, OrderStatus::Success);

        let wallet = h.wallets.get_or_create("buyer-1", 1).await.unwrap();
        assert_eq!(wallet.balance, 3_000);
        let ledger = h.wallets.list_transactions(wallet.id).await.unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].price, -5_000);
        assert_eq!(ledger[1].balance, 3_000);
    }

    #[tokio::test]
    async fn insufficient_wallet_balance_closes_the_extension() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "wallet", 0.0, json!({"gateway": "wallet"}))
            .await;

        h.orders
            .create_order(create_request(app.id, "m-5", 5_000))
            .await
            .unwrap();
        let mut request = submit_request(app.id, "m-5", "wallet");
        request.channel_user_id = Some("broke-buyer".to_string());
        let err = h.orders.submit_order(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::WalletBalanceInsufficient(_)));

        // The order stays WAITING and can be retried.
        let order = h.orders.get_order(app.id, "m-5").await.unwrap();
        assert_eq!(order.status, OrderStatus::Waiting);
        let extensions = h
            .stores
            .orders
            .list_extensions_by_order(order.id, None)
            .await
            .unwrap();
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].status, ExtensionStatus::Closed);
    }

    #[tokio::test]
    async fn expiry_sweep_closes_overdue_orders() {
        let h = TestHarness::new();
        let app = h.seed_app().await;

        // Creation validates a future expiry, so backdate the row directly.
        let mut stale = h
            .orders
            .create_order(create_request(app.id, "m-6", 5_000))
            .await
            .unwrap();
        stale.expire_time = Utc::now() - ChronoDuration::minutes(5);
        h.order_store.put_order(stale.clone()).await;

        let closed = h.orders.expire_orders(Utc::now(), 10).await.unwrap();
        assert_eq!(closed, 1);

        let order = h.orders.get_order(app.id, "m-6").await.unwrap();
        assert_eq!(order.status, OrderStatus::Closed);
        // Closing is terminal; a second sweep finds nothing.
        assert_eq!(h.orders.expire_orders(Utc::now(), 10).await.unwrap(), 0);

        let tasks = h.notify_store.all_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, NotifyTaskType::Order);
    }

    #[tokio::test]
    async fn refund_respects_the_refundable_remainder() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 1.0, json!({"gateway": "mock"}))
            .await;

        h.orders
            .create_order(create_request(app.id, "m-7", 10_000))
            .await
            .unwrap();
        h.orders
            .submit_order(submit_request(app.id, "m-7", "mock"))
            .await
            .unwrap();

        let too_big = h
            .refunds
            .create_refund(CreateRefundRequest {
                app_id: app.id,
                merchant_order_id: "m-7".to_string(),
                merchant_refund_id: "r-1".to_string(),
                refund_price: 10_001,
                reason: "overshoot".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(too_big, ServiceError::RefundAmountExceeded { .. }));

        // Mock gateway settles refunds synchronously.
        let refund = h
            .refunds
            .create_refund(CreateRefundRequest {
                app_id: app.id,
                merchant_order_id: "m-7".to_string(),
                merchant_refund_id: "r-2".to_string(),
                refund_price: 4_000,
                reason: "partial".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(refund.status, RefundStatus::Success);

        let order = h.orders.get_order(app.id, "m-7").await.unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert_eq!(order.refund_price, 4_000);

        // The remainder can still be refunded, but not a cent more.
        let over_remainder = h
            .refunds
            .create_refund(CreateRefundRequest {
                app_id: app.id,
                merchant_order_id: "m-7".to_string(),
                merchant_refund_id: "r-3".to_string(),
                refund_price: 6_001,
                reason: "too much".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            over_remainder,
            ServiceError::RefundAmountExceeded { .. }
        ));

        let rest = h
            .refunds
            .create_refund(CreateRefundRequest {
                app_id: app.id,
                merchant_order_id: "m-7".to_string(),
                merchant_refund_id: "r-4".to_string(),
                refund_price: 6_000,
                reason: "the rest".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(rest.status, RefundStatus::Success);
        let order = h.orders.get_order(app.id, "m-7").await.unwrap();
        assert_eq!(order.refund_price, 10_000);
    }

    #[tokio::test]
    async fn refund_creation_replays_on_merchant_refund_id() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 1.0, json!({"gateway": "mock"}))
            .await;
        h.orders
            .create_order(create_request(app.id, "m-8", 10_000))
            .await
            .unwrap();
        h.orders
            .submit_order(submit_request(app.id, "m-8", "mock"))
            .await
            .unwrap();

        let request = CreateRefundRequest {
            app_id: app.id,
            merchant_order_id: "m-8".to_string(),
            merchant_refund_id: "r-same".to_string(),
            refund_price: 1_000,
            reason: "dup".to_string(),
        };
        let first = h.refunds.create_refund(request.clone()).await.unwrap();
        let replay = h.refunds.create_refund(request).await.unwrap();
        assert_eq!(first.id, replay.id);

        let order = h.orders.get_order(app.id, "m-8").await.unwrap();
        assert_eq!(order.refund_price, 1_000);
    }

    #[tokio::test]
    async fn refunding_an_unpaid_order_is_rejected() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.orders
            .create_order(create_request(app.id, "m-9", 10_000))
            .await
            .unwrap();

        let err = h
            .refunds
            .create_refund(CreateRefundRequest {
                app_id: app.id,
                merchant_order_id: "m-9".to_string(),
                merchant_refund_id: "r-x".to_string(),
                refund_price: 1_000,
                reason: "early".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::OrderNotRefundable { .. }));
    }

    #[tokio::test]
    async fn mock_transfer_settles_and_notifies() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 0.0, json!({"gateway": "mock"}))
            .await;

        let transfer = h
            .transfers
            .create_transfer(CreateTransferRequest {
                app_id: app.id,
                merchant_transfer_id: "t-1".to_string(),
                channel_code: "mock".to_string(),
                price: 2_500,
                subject: "payout".to_string(),
                user_account: "0123456789".to_string(),
                user_name: "A. Vendor".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Success);
        assert!(transfer.channel_transfer_no.is_some());

        let tasks = h.notify_store.all_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, NotifyTaskType::Transfer);
    }

    #[tokio::test]
    async fn wallet_transfer_credits_the_recipient() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "wallet", 0.0, json!({"gateway": "wallet"}))
            .await;

        let transfer = h
            .transfers
            .create_transfer(CreateTransferRequest {
                app_id: app.id,
                merchant_transfer_id: "t-2".to_string(),
                channel_code: "wallet".to_string(),
                price: 1_500,
                subject: "bonus".to_string(),
                user_account: "vendor-7".to_string(),
                user_name: "Vendor Seven".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(transfer.status, TransferStatus::Success);

        let wallet = h.wallets.get_or_create("vendor-7", 1).await.unwrap();
        assert_eq!(wallet.balance, 1_500);
    }

    #[tokio::test]
    async fn notify_attempt_against_a_dead_endpoint_reschedules() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 0.0, json!({"gateway": "mock"}))
            .await;
        h.orders
            .create_order(create_request(app.id, "m-10", 1_000))
            .await
            .unwrap();
        h.orders
            .submit_order(submit_request(app.id, "m-10", "mock"))
            .await
            .unwrap();

        let task = h.notify_store.all_tasks().await.remove(0);
        assert_eq!(task.notify_times, 0);

        // The seeded callback URL is unreachable, so the attempt fails and
        // the task is rescheduled with the first backoff slot.
        h.notify.execute_task(task.clone()).await;

        let after = h
            .stores
            .notifies
            .get_task(task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.status, NotifyStatus::Waiting);
        assert_eq!(after.notify_times, 1);
        assert!(after.next_notify_time > Utc::now());
        assert!(after.last_execute_time.is_some());

        let logs = h.stores.notifies.list_logs(task.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, NotifyStatus::Failure);
        assert_eq!(logs[0].notify_times, 1);
    }

    #[tokio::test]
    async fn stale_notify_snapshot_is_a_no_op() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 0.0, json!({"gateway": "mock"}))
            .await;
        h.orders
            .create_order(create_request(app.id, "m-11", 1_000))
            .await
            .unwrap();
        h.orders
            .submit_order(submit_request(app.id, "m-11", "mock"))
            .await
            .unwrap();

        let stale = h.notify_store.all_tasks().await.remove(0);
        h.notify.execute_task(stale.clone()).await;
        // Replaying the original snapshot must not record a second attempt.
        h.notify.execute_task(stale.clone()).await;

        let after = h
            .stores
            .notifies
            .get_task(stale.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.notify_times, 1);
        let logs = h.stores.notifies.list_logs(stale.id).await.unwrap();
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn wallet_freeze_requires_sufficient_balance() {
        let h = TestHarness::new();
        h.wallets
            .credit("saver", 1, "recharge", "seed", "seed", 1_000)
            .await
            .unwrap();
        let wallet = h.wallets.get_or_create("saver", 1).await.unwrap();

        h.wallets.freeze(wallet.id, 600).await.unwrap();
        let err = h.wallets.freeze(wallet.id, 600).await.unwrap_err();
        assert!(matches!(err, ServiceError::WalletBalanceInsufficient(_)));

        h.wallets.unfreeze(wallet.id, 600).await.unwrap();
        let wallet = h.stores.wallets.get(wallet.id).await.unwrap().unwrap();
        assert_eq!(wallet.balance, 1_000);
        assert_eq!(wallet.frozen_price, 0);
    }

    #[tokio::test]
    async fn disabled_channel_is_rejected_at_submission() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        let channel = h
            .seed_channel(app.id, "mock", 0.0, json!({"gateway": "mock"}))
            .await;
        h.apps
            .save_channel_config(channel.id, false, 0.0, json!({"gateway": "mock"}))
            .await
            .unwrap();

        h.orders
            .create_order(create_request(app.id, "m-12", 1_000))
            .await
            .unwrap();
        let err = h
            .orders
            .submit_order(submit_request(app.id, "m-12", "mock"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ChannelDisabled(_)));
    }

    #[tokio::test]
    async fn resubmission_supersedes_the_pending_extension() {
        let h = TestHarness::with_scripted_gateway(GatewayOrderStatus::Waiting);
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 0.0, json!({"gateway": "mock"}))
            .await;

        h.orders
            .create_order(create_request(app.id, "m-13", 3_000))
            .await
            .unwrap();
        let first = h
            .orders
            .submit_order(submit_request(app.id, "m-13", "mock"))
            .await
            .unwrap();
        let second = h
            .orders
            .submit_order(submit_request(app.id, "m-13", "mock"))
            .await
            .unwrap();
        assert_ne!(first.extension_no, second.extension_no);

        // Only the latest attempt stays live; the first was closed.
        let order = h.orders.get_order(app.id, "m-13").await.unwrap();
        let waiting = h
            .stores
            .orders
            .list_extensions_by_order(order.id, Some(ExtensionStatus::Waiting))
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].no, second.extension_no);

        let all = h
            .stores
            .orders
            .list_extensions_by_order(order.id, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_success_notification_creates_one_task() {
        let h = TestHarness::with_scripted_gateway(GatewayOrderStatus::Waiting);
        let app = h.seed_app().await;
        let channel = h
            .seed_channel(app.id, "mock", 1.0, json!({"gateway": "mock"}))
            .await;

        h.orders
            .create_order(create_request(app.id, "m-14", 10_000))
            .await
            .unwrap();
        let response = h
            .orders
            .submit_order(submit_request(app.id, "m-14", "mock"))
            .await
            .unwrap();
        assert_eq!(response.order_status, OrderStatus::Waiting);
        assert!(h.notify_store.all_tasks().await.is_empty());

        let success = GatewayOrderResult {
            status: GatewayOrderStatus::Success,
            outer_no: response.extension_no.clone(),
            channel_order_no: Some("X1".to_string()),
            channel_user_id: None,
            success_time: Some(Utc::now()),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: None,
            raw: json!({"reference": "X1"}),
        };
        h.orders.notify_order(&channel, &success).await.unwrap();
        h.orders.notify_order(&channel, &success).await.unwrap();

        let order = h.orders.get_order(app.id, "m-14").await.unwrap();
        assert_eq!(order.status, OrderStatus::Success);
        assert_eq!(order.channel_order_no.as_deref(), Some("X1"));
        assert_eq!(order.channel_fee_price, 100);

        // The transition happened once, so exactly one merchant task exists.
        let tasks = h.notify_store.all_tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, NotifyTaskType::Order);
    }

    #[tokio::test]
    async fn sync_discards_a_gateway_closed_answer() {
        let h = TestHarness::with_scripted_gateway(GatewayOrderStatus::Closed);
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 0.0, json!({"gateway": "mock"}))
            .await;

        h.orders
            .create_order(create_request(app.id, "m-15", 2_000))
            .await
            .unwrap();
        h.orders
            .submit_order(submit_request(app.id, "m-15", "mock"))
            .await
            .unwrap();

        let updated = h
            .orders
            .sync_recent_orders(Utc::now() - ChronoDuration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(updated, 0);

        // A negative query never closes anything; only expiry or a real
        // notification may.
        let order = h.orders.get_order(app.id, "m-15").await.unwrap();
        assert_eq!(order.status, OrderStatus::Waiting);
        let waiting = h
            .stores
            .orders
            .list_extensions_by_order(order.id, Some(ExtensionStatus::Waiting))
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert!(h.notify_store.all_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn failed_notify_task_terminates_after_the_retry_budget() {
        let h = TestHarness::new();
        let app = h.seed_app().await;
        h.seed_channel(app.id, "mock", 0.0, json!({"gateway": "mock"}))
            .await;
        h.orders
            .create_order(create_request(app.id, "m-16", 1_000))
            .await
            .unwrap();
        h.orders
            .submit_order(submit_request(app.id, "m-16", "mock"))
            .await
            .unwrap();

        let id = h.notify_store.all_tasks().await.remove(0).id;
        // Every delivery to the unreachable callback URL fails.
        for _ in 0..9 {
            let task = h.stores.notifies.get_task(id).await.unwrap().unwrap();
            assert_eq!(task.status, NotifyStatus::Waiting);
            h.notify.execute_task(task).await;
        }

        let after = h.stores.notifies.get_task(id).await.unwrap().unwrap();
        assert_eq!(after.status, NotifyStatus::Failure);
        assert_eq!(after.notify_times, 9);
        let logs = h.stores.notifies.list_logs(id).await.unwrap();
        assert_eq!(logs.len(), 9);

        // FAILURE is terminal: replaying the snapshot records nothing.
        h.notify.execute_task(after).await;
        let settled = h.stores.notifies.get_task(id).await.unwrap().unwrap();
        assert_eq!(settled.notify_times, 9);
        assert_eq!(h.stores.notifies.list_logs(id).await.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn a_second_in_flight_refund_is_rejected() {
        let h = TestHarness::with_scripted_gateway(GatewayOrderStatus::Waiting);
        let app = h.seed_app().await;
        let channel = h
            .seed_channel(app.id, "mock", 0.0, json!({"gateway": "mock"}))
            .await;

        h.orders
            .create_order(create_request(app.id, "m-17", 10_000))
            .await
            .unwrap();
        let response = h
            .orders
            .submit_order(submit_request(app.id, "m-17", "mock"))
            .await
            .unwrap();
        let success = GatewayOrderResult {
            status: GatewayOrderStatus::Success,
            outer_no: response.extension_no,
            channel_order_no: Some("X2".to_string()),
            channel_user_id: None,
            success_time: Some(Utc::now()),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: None,
            raw: json!({}),
        };
        h.orders.notify_order(&channel, &success).await.unwrap();

        // The scripted gateway leaves refunds pending, so the first one
        // stays WAITING.
        let first = h
            .refunds
            .create_refund(CreateRefundRequest {
                app_id: app.id,
                merchant_order_id: "m-17".to_string(),
                merchant_refund_id: "r-a".to_string(),
                refund_price: 2_000,
                reason: "first".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(first.status, RefundStatus::Waiting);

        let err = h
            .refunds
            .create_refund(CreateRefundRequest {
                app_id: app.id,
                merchant_order_id: "m-17".to_string(),
                merchant_refund_id: "r-b".to_string(),
                refund_price: 2_000,
                reason: "second".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RefundInFlight(_)));

        // The storage layer enforces it too, for creators racing past the
        // service-level count.
        let now = Utc::now();
        let racing = PayRefund {
            id: Uuid::new_v4(),
            no: "R999".to_string(),
            app_id: app.id,
            order_id: first.order_id,
            order_no: first.order_no.clone(),
            merchant_order_id: "m-17".to_string(),
            merchant_refund_id: "r-c".to_string(),
            channel_id: first.channel_id,
            channel_code: first.channel_code.clone(),
            pay_price: 10_000,
            refund_price: 2_000,
            reason: "raced".to_string(),
            status: RefundStatus::Waiting,
            success_time: None,
            channel_refund_no: None,
            channel_error_code: None,
            channel_error_msg: None,
            channel_notify_data: None,
            created_at: now,
            updated_at: now,
        };
        let conflict = h.stores.refunds.insert(&racing).await.unwrap_err();
        assert!(conflict.is_unique_violation());
    }
}
