//! Paystack gateway integration.
//!
//! Covers order initialization (redirect URL display mode), active order
//! verification, refunds, transfers, and HMAC-SHA512 webhook verification.

use crate::gateway::client::PaymentClient;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::http::{verify_hmac_sha512_hex, GatewayHttpClient};
use crate::gateway::types::{
    ChannelConfig, DisplayMode, GatewayOrderResult, GatewayOrderStatus, GatewayRefundResult,
    GatewayRefundStatus, GatewayTransferResult, GatewayTransferStatus, NotifyPayload,
    UnifiedOrderRequest, UnifiedRefundRequest, UnifiedTransferRequest, GATEWAY_PAYSTACK,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::info;

const DEFAULT_BASE_URL: &str = "https://api.paystack.co";
const DEFAULT_CURRENCY: &str = "NGN";
const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 2;

pub struct PaystackClient {
    secret_key: String,
    webhook_secret: Option<String>,
    base_url: String,
    currency: String,
    http: GatewayHttpClient,
}

impl PaystackClient {
    pub fn new(config: &ChannelConfig) -> GatewayResult<Self> {
        let ChannelConfig::Paystack {
            secret_key,
            webhook_secret,
            base_url,
            currency,
        } = config
        else {
            return Err(GatewayError::InvalidConfig {
                message: "expected a paystack channel config".to_string(),
            });
        };
        if secret_key.trim().is_empty() {
            return Err(GatewayError::InvalidConfig {
                message: "paystack secret_key must not be empty".to_string(),
            });
        }

        Ok(Self {
            secret_key: secret_key.clone(),
            webhook_secret: webhook_secret.clone(),
            base_url: base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            currency: currency.clone().unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            http: GatewayHttpClient::new(Duration::from_secs(TIMEOUT_SECS), MAX_RETRIES)?,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn verify_signature(&self, payload: &NotifyPayload) -> GatewayResult<JsonValue> {
        let signature = payload
            .signature
            .as_deref()
            .ok_or(GatewayError::WebhookVerification {
                message: "missing paystack signature header".to_string(),
            })?;
        let secret = self.webhook_secret.as_deref().unwrap_or(&self.secret_key);
        if !verify_hmac_sha512_hex(&payload.body, secret, signature) {
            return Err(GatewayError::WebhookVerification {
                message: "invalid paystack signature".to_string(),
            });
        }
        serde_json::from_slice(&payload.body).map_err(|e| GatewayError::WebhookVerification {
            message: format!("invalid webhook JSON payload: {}", e),
        })
    }

    fn map_order_status(status: &str) -> GatewayOrderStatus {
        match status {
            "success" => GatewayOrderStatus::Success,
            "pending" | "ongoing" => GatewayOrderStatus::Waiting,
            "failed" | "abandoned" | "reversed" => GatewayOrderStatus::Closed,
            _ => GatewayOrderStatus::Unknown,
        }
    }

    fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
        raw.and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    fn err(message: String) -> GatewayError {
        GatewayError::Gateway {
            gateway: GATEWAY_PAYSTACK.to_string(),
            message,
            retryable: false,
        }
    }
}

#[async_trait::async_trait]
impl PaymentClient for PaystackClient {
    fn gateway_code(&self) -> &'static str {
        GATEWAY_PAYSTACK
    }

    async fn unified_order(
        &self,
        request: UnifiedOrderRequest,
    ) -> GatewayResult<GatewayOrderResult> {
        let email = request
            .buyer_email
            .clone()
            .unwrap_or_else(|| format!("{}@buyer.invalid", request.outer_no.to_lowercase()));
        let payload = serde_json::json!({
            "email": email,
            "amount": request.price,
            "currency": self.currency,
            "reference": request.outer_no,
            "callback_url": request.return_url,
            "metadata": { "notify_url": request.notify_url, "subject": request.subject },
        });

        let raw: Envelope<InitializeData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/transaction/initialize"),
                Some(&self.secret_key),
                Some(&payload),
            )
            .await?;
        if !raw.status {
            return Err(Self::err(raw.message));
        }
        info!(outer_no = %request.outer_no, "paystack order initialized");

        Ok(GatewayOrderResult::waiting(
            request.outer_no,
            DisplayMode::Url,
            raw.data.authorization_url,
            serde_json::json!({ "access_code": raw.data.access_code }),
        ))
    }

    async fn get_order(&self, outer_no: &str) -> GatewayResult<GatewayOrderResult> {
        let raw: Envelope<VerifyData> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/transaction/verify/{}", outer_no)),
                Some(&self.secret_key),
                None,
            )
            .await?;
        if !raw.status {
            return Err(Self::err(raw.message));
        }

        let data = raw.data;
        Ok(GatewayOrderResult {
            status: Self::map_order_status(&data.status),
            outer_no: outer_no.to_string(),
            channel_order_no: data.id.map(|id| id.to_string()),
            channel_user_id: data.customer.and_then(|c| c.email),
            success_time: Self::parse_time(data.paid_at.as_deref()),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: data.gateway_response,
            raw: serde_json::json!({ "status": data.status }),
        })
    }

    async fn unified_refund(
        &self,
        request: UnifiedRefundRequest,
    ) -> GatewayResult<GatewayRefundResult> {
        let payload = serde_json::json!({
            "transaction": request.outer_no,
            "amount": request.refund_price,
            "currency": self.currency,
            "merchant_note": request.reason,
        });

        let raw: Envelope<RefundData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/refund"),
                Some(&self.secret_key),
                Some(&payload),
            )
            .await?;
        if !raw.status {
            return Err(Self::err(raw.message));
        }
        info!(refund_no = %request.refund_no, "paystack refund submitted");

        // Paystack settles refunds asynchronously; the terminal state
        // arrives by webhook or the reconciliation sweep.
        Ok(GatewayRefundResult {
            status: GatewayRefundStatus::Waiting,
            refund_no: request.refund_no,
            channel_refund_no: raw.data.id.map(|id| id.to_string()),
            success_time: None,
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({ "refund_status": raw.data.status }),
        })
    }

    async fn get_refund(
        &self,
        outer_no: &str,
        refund_no: &str,
    ) -> GatewayResult<GatewayRefundResult> {
        let raw: Envelope<Vec<RefundData>> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/refund?transaction={}", outer_no)),
                Some(&self.secret_key),
                None,
            )
            .await?;
        if !raw.status {
            return Err(Self::err(raw.message));
        }

        // The listing has one entry per refund of the transaction; the most
        // recent one is ours because refunds are single-flight per order.
        let data = raw
            .data
            .into_iter()
            .next_back()
            .ok_or_else(|| Self::err(format!("no refund found for {}", outer_no)))?;
        let status = match data.status.as_deref() {
            Some("processed") => GatewayRefundStatus::Success,
            Some("failed") => GatewayRefundStatus::Failure,
            _ => GatewayRefundStatus::Waiting,
        };
        Ok(GatewayRefundResult {
            status,
            refund_no: refund_no.to_string(),
            channel_refund_no: data.id.map(|id| id.to_string()),
            success_time: (status == GatewayRefundStatus::Success).then(Utc::now),
            error_code: None,
            error_msg: None,
            raw: serde_json::json!({ "refund_status": data.status }),
        })
    }

    async fn unified_transfer(
        &self,
        request: UnifiedTransferRequest,
    ) -> GatewayResult<GatewayTransferResult> {
        let recipient_payload = serde_json::json!({
            "type": "nuban",
            "name": request.user_name,
            "account_number": request.user_account,
            "currency": self.currency,
        });
        let recipient: Envelope<RecipientData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/transferrecipient"),
                Some(&self.secret_key),
                Some(&recipient_payload),
            )
            .await?;
        if !recipient.status {
            return Err(Self::err(recipient.message));
        }

        let transfer_payload = serde_json::json!({
            "source": "balance",
            "amount": request.price,
            "recipient": recipient.data.recipient_code,
            "reference": request.outer_no,
            "reason": request.subject,
        });
        let transfer: Envelope<TransferData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/transfer"),
                Some(&self.secret_key),
                Some(&transfer_payload),
            )
            .await?;
        if !transfer.status {
            return Err(Self::err(transfer.message));
        }

        let status = match transfer.data.status.as_deref() {
            Some("success") => GatewayTransferStatus::Success,
            Some("failed") | Some("reversed") => GatewayTransferStatus::Closed,
            _ => GatewayTransferStatus::Processing,
        };
        Ok(GatewayTransferResult {
            status,
            outer_no: request.outer_no,
            channel_transfer_no: transfer.data.transfer_code,
            success_time: (status == GatewayTransferStatus::Success).then(Utc::now),
            error_code: None,
            error_msg: transfer.data.failure_reason,
            raw: serde_json::json!({ "transfer_status": transfer.data.status }),
        })
    }

    fn parse_order_notify(&self, payload: &NotifyPayload) -> GatewayResult<GatewayOrderResult> {
        let parsed = self.verify_signature(payload)?;
        let event = parsed.get("event").and_then(|v| v.as_str()).unwrap_or("");
        let data = parsed.get("data").cloned().unwrap_or(JsonValue::Null);
        let outer_no = data
            .get("reference")
            .and_then(|v| v.as_str())
            .ok_or(GatewayError::WebhookVerification {
                message: "order webhook missing data.reference".to_string(),
            })?
            .to_string();

        let status = match event {
            "charge.success" => GatewayOrderStatus::Success,
            "charge.failed" => GatewayOrderStatus::Closed,
            _ => GatewayOrderStatus::Unknown,
        };
        Ok(GatewayOrderResult {
            status,
            outer_no,
            channel_order_no: data.get("id").and_then(|v| v.as_i64()).map(|v| v.to_string()),
            channel_user_id: data
                .get("customer")
                .and_then(|c| c.get("email"))
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            success_time: Self::parse_time(data.get("paid_at").and_then(|v| v.as_str()))
                .or_else(|| (status == GatewayOrderStatus::Success).then(Utc::now)),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: data
                .get("gateway_response")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            raw: parsed,
        })
    }

    fn parse_refund_notify(
        &self,
        payload: &NotifyPayload,
    ) -> GatewayResult<GatewayRefundResult> {
        let parsed = self.verify_signature(payload)?;
        let event = parsed.get("event").and_then(|v| v.as_str()).unwrap_or("");
        let data = parsed.get("data").cloned().unwrap_or(JsonValue::Null);
        let refund_no = data
            .get("merchant_note")
            .and_then(|v| v.as_str())
            .ok_or(GatewayError::WebhookVerification {
                message: "refund webhook missing data.merchant_note".to_string(),
            })?
            .to_string();

        let status = match event {
            "refund.processed" => GatewayRefundStatus::Success,
            "refund.failed" => GatewayRefundStatus::Failure,
            _ => GatewayRefundStatus::Waiting,
        };
        Ok(GatewayRefundResult {
            status,
            refund_no,
            channel_refund_no: data.get("id").and_then(|v| v.as_i64()).map(|v| v.to_string()),
            success_time: (status == GatewayRefundStatus::Success).then(Utc::now),
            error_code: None,
            error_msg: None,
            raw: parsed,
        })
    }

    fn parse_transfer_notify(
        &self,
        payload: &NotifyPayload,
    ) -> GatewayResult<GatewayTransferResult> {
        let parsed = self.verify_signature(payload)?;
        let event = parsed.get("event").and_then(|v| v.as_str()).unwrap_or("");
        let data = parsed.get("data").cloned().unwrap_or(JsonValue::Null);
        let outer_no = data
            .get("reference")
            .and_then(|v| v.as_str())
            .ok_or(GatewayError::WebhookVerification {
                message: "transfer webhook missing data.reference".to_string(),
            })?
            .to_string();

        let status = match event {
            "transfer.success" => GatewayTransferStatus::Success,
            "transfer.failed" | "transfer.reversed" => GatewayTransferStatus::Closed,
            _ => GatewayTransferStatus::Processing,
        };
        Ok(GatewayTransferResult {
            status,
            outer_no,
            channel_transfer_no: data
                .get("transfer_code")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            success_time: (status == GatewayTransferStatus::Success).then(Utc::now),
            error_code: None,
            error_msg: None,
            raw: parsed,
        })
    }

    fn signature_header(&self) -> Option<&'static str> {
        Some("x-paystack-signature")
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    access_code: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    paid_at: Option<String>,
    #[serde(default)]
    gateway_response: Option<String>,
    #[serde(default)]
    customer: Option<CustomerData>,
}

#[derive(Debug, Deserialize)]
struct CustomerData {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecipientData {
    recipient_code: String,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    #[serde(default)]
    transfer_code: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}
