//! Service-level errors shared by the engines, the HTTP surface, and the
//! background workers.

use crate::cache::CacheError;
use crate::database::error::DatabaseError;
use crate::gateway::error::GatewayError;
use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("app {0} not found")]
    AppNotFound(Uuid),

    #[error("app {0} is disabled")]
    AppDisabled(Uuid),

    #[error("channel {0} not found")]
    ChannelNotFound(String),

    #[error("channel {0} is disabled")]
    ChannelDisabled(Uuid),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order {no} is not payable in status {status}")]
    OrderNotPayable { no: String, status: String },

    #[error("order {0} has expired")]
    OrderExpired(String),

    #[error("order {no} is not refundable in status {status}")]
    OrderNotRefundable { no: String, status: String },

    #[error("merchant order id {0} already exists for this app")]
    DuplicateMerchantOrderId(String),

    #[error("merchant refund id {0} already exists for this app")]
    DuplicateMerchantRefundId(String),

    #[error("merchant transfer id {0} already exists for this app")]
    DuplicateMerchantTransferId(String),

    #[error("refund of {requested} exceeds the refundable remainder {remaining}")]
    RefundAmountExceeded { requested: i64, remaining: i64 },

    #[error("order {0} already has a refund in flight")]
    RefundInFlight(String),

    #[error("refund {0} not found")]
    RefundNotFound(String),

    #[error("transfer {0} not found")]
    TransferNotFound(String),

    #[error("wallet balance insufficient for {0}")]
    WalletBalanceInsufficient(i64),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ServiceError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AppNotFound(_)
            | Self::ChannelNotFound(_)
            | Self::OrderNotFound(_)
            | Self::RefundNotFound(_)
            | Self::TransferNotFound(_) => StatusCode::NOT_FOUND,
            Self::AppDisabled(_) | Self::ChannelDisabled(_) => StatusCode::FORBIDDEN,
            Self::DuplicateMerchantOrderId(_)
            | Self::DuplicateMerchantRefundId(_)
            | Self::DuplicateMerchantTransferId(_)
            | Self::RefundInFlight(_)
            | Self::StateConflict(_) => StatusCode::CONFLICT,
            Self::OrderNotPayable { .. }
            | Self::OrderExpired(_)
            | Self::OrderNotRefundable { .. }
            | Self::RefundAmountExceeded { .. }
            | Self::WalletBalanceInsufficient(_)
            | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Gateway(GatewayError::WebhookVerification { .. }) => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Gateway(_) | Self::Cache(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
