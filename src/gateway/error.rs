use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("invalid channel config: {message}")]
    InvalidConfig { message: String },

    #[error("unknown gateway code: {0}")]
    UnknownGateway(String),

    #[error("network error: {message}")]
    Network { message: String },

    #[error("webhook verification failed: {message}")]
    WebhookVerification { message: String },

    #[error("gateway error: gateway={gateway}, message={message}")]
    Gateway {
        gateway: String,
        message: String,
        retryable: bool,
    },
}

impl GatewayError {
    /// Transient failures where the remote outcome is unknown; the caller
    /// must rely on notification or reconciliation rather than assume the
    /// call failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Network { .. } => true,
            GatewayError::Gateway { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
