//! Unified request/result types spoken between the engines and the
//! gateway clients. All amounts are integer minor units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Gateway codes understood by the client registry.
pub const GATEWAY_PAYSTACK: &str = "paystack";
pub const GATEWAY_FLUTTERWAVE: &str = "flutterwave";
pub const GATEWAY_MOCK: &str = "mock";
/// The internal wallet channel; handled by the order engine itself and
/// never instantiated through the registry.
pub const GATEWAY_WALLET: &str = "wallet";

/// Gateway-specific channel credentials, tagged by gateway code. Stored as
/// JSONB on the channel row and decoded on first client construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "gateway", rename_all = "snake_case")]
pub enum ChannelConfig {
    Paystack {
        secret_key: String,
        #[serde(default)]
        webhook_secret: Option<String>,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        currency: Option<String>,
    },
    Flutterwave {
        secret_key: String,
        verif_hash: String,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        currency: Option<String>,
    },
    Mock {},
    Wallet {},
}

impl ChannelConfig {
    pub fn gateway_code(&self) -> &'static str {
        match self {
            ChannelConfig::Paystack { .. } => GATEWAY_PAYSTACK,
            ChannelConfig::Flutterwave { .. } => GATEWAY_FLUTTERWAVE,
            ChannelConfig::Mock {} => GATEWAY_MOCK,
            ChannelConfig::Wallet {} => GATEWAY_WALLET,
        }
    }
}

/// How the buyer-facing payment instruction should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Redirect the buyer to a URL.
    Url,
    /// Render the content as a QR code.
    QrCode,
    /// Opaque token handed to a native app SDK.
    AppToken,
}

#[derive(Debug, Clone)]
pub struct UnifiedOrderRequest {
    /// Channel-scoped transaction number (the extension `no`).
    pub outer_no: String,
    pub subject: String,
    pub price: i64,
    pub expire_time: DateTime<Utc>,
    /// Channel-specific callback URL carrying the channel id in its path.
    pub notify_url: String,
    pub return_url: Option<String>,
    /// Buyer contact, required by some gateways at initialization.
    pub buyer_email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOrderStatus {
    Waiting,
    Success,
    Closed,
    Unknown,
}

/// Order state as reported by a gateway, from a webhook or an active query.
#[derive(Debug, Clone)]
pub struct GatewayOrderResult {
    pub status: GatewayOrderStatus,
    pub outer_no: String,
    pub channel_order_no: Option<String>,
    pub channel_user_id: Option<String>,
    pub success_time: Option<DateTime<Utc>>,
    pub display_mode: Option<DisplayMode>,
    pub display_content: Option<String>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
    pub raw: JsonValue,
}

impl GatewayOrderResult {
    /// Minimal WAITING result for submissions that only return display data.
    pub fn waiting(outer_no: String, mode: DisplayMode, content: String, raw: JsonValue) -> Self {
        Self {
            status: GatewayOrderStatus::Waiting,
            outer_no,
            channel_order_no: None,
            channel_user_id: None,
            success_time: None,
            display_mode: Some(mode),
            display_content: Some(content),
            error_code: None,
            error_msg: None,
            raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnifiedRefundRequest {
    /// Extension no of the paid order leg.
    pub outer_no: String,
    /// External refund number.
    pub refund_no: String,
    pub pay_price: i64,
    pub refund_price: i64,
    pub reason: String,
    pub notify_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRefundStatus {
    Waiting,
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct GatewayRefundResult {
    pub status: GatewayRefundStatus,
    pub refund_no: String,
    pub channel_refund_no: Option<String>,
    pub success_time: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
    pub raw: JsonValue,
}

#[derive(Debug, Clone)]
pub struct UnifiedTransferRequest {
    /// External transfer number.
    pub outer_no: String,
    pub price: i64,
    pub subject: String,
    pub user_account: String,
    pub user_name: String,
    pub notify_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayTransferStatus {
    Waiting,
    Processing,
    Success,
    Closed,
}

#[derive(Debug, Clone)]
pub struct GatewayTransferResult {
    pub status: GatewayTransferStatus,
    pub outer_no: String,
    pub channel_transfer_no: Option<String>,
    pub success_time: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
    pub raw: JsonValue,
}

/// Raw inbound webhook as received by the HTTP layer.
#[derive(Debug, Clone)]
pub struct NotifyPayload {
    /// Value of the client's signature header, when present.
    pub signature: Option<String>,
    pub body: Vec<u8>,
}
