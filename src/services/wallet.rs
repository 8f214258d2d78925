//! Wallet ledger engine: every balance mutation is a guarded update plus
//! one append-only transaction row carrying the post-balance.

use crate::database::wallet_repository::{PayWallet, WalletTransaction};
use crate::error::{ServiceError, ServiceResult};
use crate::services::Stores;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

pub const BIZ_TYPE_PAYMENT: &str = "payment";
pub const BIZ_TYPE_PAYMENT_REFUND: &str = "payment_refund";
pub const BIZ_TYPE_RECHARGE: &str = "recharge";
pub const BIZ_TYPE_TRANSFER: &str = "transfer";

pub struct WalletService {
    stores: Stores,
}

impl WalletService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    pub async fn get_or_create(&self, user_id: &str, user_type: i16) -> ServiceResult<PayWallet> {
        Ok(self.stores.wallets.get_or_create(user_id, user_type).await?)
    }

    pub async fn list_transactions(
        &self,
        wallet_id: Uuid,
    ) -> ServiceResult<Vec<WalletTransaction>> {
        Ok(self.stores.wallets.list_transactions(wallet_id).await?)
    }

    /// Debit `price` from the user's wallet. Fails without side effects
    /// when the balance is insufficient.
    pub async fn pay(
        &self,
        user_id: &str,
        user_type: i16,
        biz_type: &str,
        biz_id: &str,
        title: &str,
        price: i64,
    ) -> ServiceResult<WalletTransaction> {
        self.apply(user_id, user_type, biz_type, biz_id, title, -price)
            .await
    }

    /// Credit `price` to the user's wallet.
    pub async fn credit(
        &self,
        user_id: &str,
        user_type: i16,
        biz_type: &str,
        biz_id: &str,
        title: &str,
        price: i64,
    ) -> ServiceResult<WalletTransaction> {
        self.apply(user_id, user_type, biz_type, biz_id, title, price)
            .await
    }

    async fn apply(
        &self,
        user_id: &str,
        user_type: i16,
        biz_type: &str,
        biz_id: &str,
        title: &str,
        delta: i64,
    ) -> ServiceResult<WalletTransaction> {
        if delta == 0 {
            return Err(ServiceError::InvalidRequest(
                "wallet delta must be non-zero".to_string(),
            ));
        }
        let wallet = self.stores.wallets.get_or_create(user_id, user_type).await?;
        let balance = self
            .stores
            .wallets
            .add_balance(wallet.id, delta)
            .await?
            .ok_or(ServiceError::WalletBalanceInsufficient(-delta))?;

        let transaction = self
            .stores
            .wallets
            .insert_transaction(&WalletTransaction {
                id: Uuid::new_v4(),
                wallet_id: wallet.id,
                biz_type: biz_type.to_string(),
                biz_id: biz_id.to_string(),
                title: title.to_string(),
                price: delta,
                balance,
                created_at: Utc::now(),
            })
            .await?;
        info!(
            wallet_id = %wallet.id,
            biz_type,
            biz_id,
            delta,
            balance,
            "wallet balance updated"
        );
        Ok(transaction)
    }

    /// Move funds from the spendable balance into the frozen bucket.
    pub async fn freeze(&self, wallet_id: Uuid, amount: i64) -> ServiceResult<()> {
        if !self.stores.wallets.freeze(wallet_id, amount).await? {
            return Err(ServiceError::WalletBalanceInsufficient(amount));
        }
        Ok(())
    }

    pub async fn unfreeze(&self, wallet_id: Uuid, amount: i64) -> ServiceResult<()> {
        if !self.stores.wallets.unfreeze(wallet_id, amount).await? {
            return Err(ServiceError::StateConflict(format!(
                "wallet {} has less than {} frozen",
                wallet_id, amount
            )));
        }
        Ok(())
    }
}
