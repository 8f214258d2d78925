//! Outbound transfer (payout) engine.
//!
//! WAITING → PROCESSING → SUCCESS, or WAITING|PROCESSING → CLOSED. The
//! PROCESSING hop is internal bookkeeping; merchants are only notified of
//! terminal states.

use crate::cache::sequence::{SequenceGenerator, TRANSFER_NO_PREFIX};
use crate::database::app_repository::PayChannel;
use crate::database::notify_repository::NotifyTaskType;
use crate::database::transfer_repository::{PayTransfer, TransferStatus};
use crate::error::{ServiceError, ServiceResult};
use crate::gateway::types::{
    GatewayTransferResult, GatewayTransferStatus, UnifiedTransferRequest,
};
use crate::services::app::AppService;
use crate::services::notify::NotifyService;
use crate::services::order::WALLET_USER_TYPE_MEMBER;
use crate::services::wallet::{WalletService, BIZ_TYPE_TRANSFER};
use crate::services::{is_wallet_channel, Stores};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CreateTransferRequest {
    pub app_id: Uuid,
    pub merchant_transfer_id: String,
    pub channel_code: String,
    /// Minor units, strictly positive.
    pub price: i64,
    pub subject: String,
    pub user_account: String,
    pub user_name: String,
}

pub struct TransferService {
    stores: Stores,
    apps: Arc<AppService>,
    wallets: Arc<WalletService>,
    notify: Arc<NotifyService>,
    sequence: Arc<dyn SequenceGenerator>,
    public_base_url: String,
}

impl TransferService {
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

    /// Create a transfer and hand it to the channel. Like refunds, a
    /// transport failure after the row exists leaves it WAITING rather
    /// than failing the call.
    pub async fn create_transfer(
        &self,
        request: CreateTransferRequest,
    ) -> ServiceResult<PayTransfer> {
        if request.price <= 0 {
            return Err(ServiceError::InvalidRequest(
                "transfer price must be positive".to_string(),
            ));
        }
        if request.user_account.is_empty() {
            return Err(ServiceError::InvalidRequest(
                "transfer user_account must not be empty".to_string(),
            ));
        }
        let app = self.apps.require_app(request.app_id).await?;

        if let Some(existing) = self
            .stores
            .transfers
            .get_by_merchant(app.id, &request.merchant_transfer_id)
            .await?
        {
            return self.replay_or_conflict(existing, &request);
        }

        let channel = self
            .apps
            .require_channel_by_code(app.id, &request.channel_code)
            .await?;

        let now = Utc::now();
        let transfer = PayTransfer {
            id: Uuid::new_v4(),
            no: self.sequence.next(TRANSFER_NO_PREFIX).await?,
            app_id: app.id,
            channel_id: channel.id,
            channel_code: channel.code.clone(),
            merchant_transfer_id: request.merchant_transfer_id.clone(),
            price: request.price,
            subject: request.subject.clone(),
            user_account: request.user_account.clone(),
            user_name: request.user_name.clone(),
            status: TransferStatus::Waiting,
            success_time: None,
            channel_transfer_no: None,
            channel_error_code: None,
            channel_error_msg: None,
            channel_notify_data: None,
            created_at: now,
            updated_at: now,
        };
        let transfer = match self.stores.transfers.insert(&transfer).await {
            Ok(transfer) => transfer,
            Err(e) if e.is_unique_violation() => {
                let existing = self
                    .stores
                    .transfers
                    .get_by_merchant(app.id, &request.merchant_transfer_id)
                    .await?
                    .ok_or(e)?;
                return self.replay_or_conflict(existing, &request);
            }
            Err(e) => return Err(e.into()),
        };
        info!(transfer_no = %transfer.no, channel = %channel.code, price = transfer.price, "transfer created");

        if is_wallet_channel(&channel) {
            self.transfer_to_wallet(&channel, &transfer).await?;
        } else {
            self.submit_to_gateway(&channel, &transfer).await;
        }

        Ok(self
            .stores
            .transfers
            .get(transfer.id)
            .await?
            .unwrap_or(transfer))
    }

    fn replay_or_conflict(
        &self,
        existing: PayTransfer,
        request: &CreateTransferRequest,
    ) -> ServiceResult<PayTransfer> {
        if existing.price == request.price {
            debug!(transfer_no = %existing.no, "transfer creation replayed");
            Ok(existing)
        } else {
            Err(ServiceError::DuplicateMerchantTransferId(
                request.merchant_transfer_id.clone(),
            ))
        }
    }

    pub async fn get_transfer(
        &self,
        app_id: Uuid,
        merchant_transfer_id: &str,
    ) -> ServiceResult<PayTransfer> {
        self.stores
            .transfers
            .get_by_merchant(app_id, merchant_transfer_id)
            .await?
            .ok_or_else(|| ServiceError::TransferNotFound(merchant_transfer_id.to_string()))
    }

    /// Wallet transfers credit the recipient wallet synchronously;
    /// `user_account` names the wallet owner.
    async fn transfer_to_wallet(
        &self,
        channel: &PayChannel,
        transfer: &PayTransfer,
    ) -> ServiceResult<()> {
        let transaction = self
            .wallets
            .credit(
                &transfer.user_account,
                WALLET_USER_TYPE_MEMBER,
                BIZ_TYPE_TRANSFER,
                &transfer.no,
                &transfer.subject,
                transfer.price,
            )
            .await?;
        self.notify_transfer(
            channel,
            &GatewayTransferResult {
                status: GatewayTransferStatus::Success,
                outer_no: transfer.no.clone(),
                channel_transfer_no: Some(transaction.id.to_string()),
                success_time: Some(transaction.created_at),
                error_code: None,
                error_msg: None,
                raw: serde_json::json!({ "wallet_transaction_id": transaction.id }),
            },
        )
        .await
    }

    async fn submit_to_gateway(&self, channel: &PayChannel, transfer: &PayTransfer) {
        let submitted = async {
            let client = self.apps.client_for(channel).await?;
            let result = client
                .unified_transfer(UnifiedTransferRequest {
                    outer_no: transfer.no.clone(),
                    price: transfer.price,
                    subject: transfer.subject.clone(),
                    user_account: transfer.user_account.clone(),
                    user_name: transfer.user_name.clone(),
                    notify_url: format!(
                        "{}/webhooks/transfer/{}",
                        self.public_base_url, channel.id
                    ),
                })
                .await?;
            self.notify_transfer(channel, &result).await
        }
        .await;
        if let Err(error) = submitted {
            warn!(transfer_no = %transfer.no, %error, "transfer submission failed, left waiting");
        }
    }

    /// Apply a gateway-reported transfer state. Merchant notify tasks are
    /// created only on the terminal transitions.
    pub async fn notify_transfer(
        &self,
        channel: &PayChannel,
        result: &GatewayTransferResult,
    ) -> ServiceResult<()> {
        let transfer = self
            .stores
            .transfers
            .get_by_no(&result.outer_no)
            .await?
            .ok_or_else(|| ServiceError::TransferNotFound(result.outer_no.clone()))?;
        if transfer.channel_id != channel.id {
            return Err(ServiceError::StateConflict(format!(
                "transfer {} does not belong to channel {}",
                transfer.no, channel.id
            )));
        }

        match result.status {
            GatewayTransferStatus::Processing => {
                // Tolerated after a terminal state as a stale-report no-op.
                self.stores
                    .transfers
                    .cas_processing(transfer.id, result.channel_transfer_no.as_deref())
                    .await?;
            }
            GatewayTransferStatus::Success => {
                let transitioned = self
                    .stores
                    .transfers
                    .cas_success(
                        transfer.id,
                        result
                            .channel_transfer_no
                            .as_deref()
                            .unwrap_or(&transfer.no),
                        result.success_time.unwrap_or_else(Utc::now),
                        &result.raw,
                    )
                    .await?;
                if transitioned {
                    info!(transfer_no = %transfer.no, "transfer succeeded");
                    self.queue_transfer_notify(&transfer).await;
                }
            }
            GatewayTransferStatus::Closed => {
                let transitioned = self
                    .stores
                    .transfers
                    .cas_closed(
                        transfer.id,
                        result.error_code.as_deref(),
                        result.error_msg.as_deref(),
                        &result.raw,
                    )
                    .await?;
                if transitioned {
                    info!(transfer_no = %transfer.no, "transfer closed by the channel");
                    self.queue_transfer_notify(&transfer).await;
                }
            }
            GatewayTransferStatus::Waiting => {
                debug!(transfer_no = %transfer.no, "non-final transfer notification ignored");
            }
        }
        Ok(())
    }

    async fn queue_transfer_notify(&self, transfer: &PayTransfer) {
        let queued = async {
            let app = self
                .stores
                .apps
                .get_app(transfer.app_id)
                .await?
                .ok_or(ServiceError::AppNotFound(transfer.app_id))?;
            self.notify
                .create_task(
                    &app,
                    NotifyTaskType::Transfer,
                    transfer.id,
                    &transfer.no,
                    &transfer.merchant_transfer_id,
                )
                .await
        }
        .await;
        if let Err(error) = queued {
            warn!(transfer_no = %transfer.no, %error, "failed to queue transfer notify task");
        }
    }
}
