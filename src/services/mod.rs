//! Engine layer: all business rules live here, on top of the store traits
//! and the gateway client registry.

pub mod app;
pub mod notify;
pub mod order;
pub mod refund;
pub mod transfer;
pub mod wallet;

#[cfg(test)]
pub mod testing;

use crate::database::app_repository::AppStore;
use crate::database::notify_repository::NotifyStore;
use crate::database::order_repository::OrderStore;
use crate::database::refund_repository::RefundStore;
use crate::database::transfer_repository::TransferStore;
use crate::database::wallet_repository::WalletStore;
use std::sync::Arc;

/// The full set of store handles the engines operate on. Bundled so the
/// services and workers share one wiring point.
#[derive(Clone)]
pub struct Stores {
    pub apps: Arc<dyn AppStore>,
    pub orders: Arc<dyn OrderStore>,
    pub refunds: Arc<dyn RefundStore>,
    pub transfers: Arc<dyn TransferStore>,
    pub notifies: Arc<dyn NotifyStore>,
    pub wallets: Arc<dyn WalletStore>,
}

/// The internal wallet channel is recognized by its config's gateway code;
/// it never reaches the client registry.
pub fn is_wallet_channel(channel: &crate::database::app_repository::PayChannel) -> bool {
    channel
        .config
        .get("gateway")
        .and_then(|v| v.as_str())
        .map(|code| code == crate::gateway::types::GATEWAY_WALLET)
        .unwrap_or(false)
}

impl Stores {
    /// Wire every store against the same Postgres pool.
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        use crate::database::{
            app_repository::PgAppRepository, notify_repository::PgNotifyRepository,
            order_repository::PgOrderRepository, refund_repository::PgRefundRepository,
            transfer_repository::PgTransferRepository, wallet_repository::PgWalletRepository,
        };
        Self {
            apps: Arc::new(PgAppRepository::new(pool.clone())),
            orders: Arc::new(PgOrderRepository::new(pool.clone())),
            refunds: Arc::new(PgRefundRepository::new(pool.clone())),
            transfers: Arc::new(PgTransferRepository::new(pool.clone())),
            notifies: Arc::new(PgNotifyRepository::new(pool.clone())),
            wallets: Arc::new(PgWalletRepository::new(pool)),
        }
    }
}
