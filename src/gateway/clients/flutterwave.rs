//! Flutterwave gateway integration.
//!
//! Uses the v3 standard checkout for orders and verif-hash header
//! comparison for webhook verification.

use crate::gateway::client::PaymentClient;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::http::{secure_eq, GatewayHttpClient};
use crate::gateway::types::{
    ChannelConfig, DisplayMode, GatewayOrderResult, GatewayOrderStatus, GatewayRefundResult,
    GatewayRefundStatus, GatewayTransferResult, GatewayTransferStatus, NotifyPayload,
    UnifiedOrderRequest, UnifiedRefundRequest, UnifiedTransferRequest, GATEWAY_FLUTTERWAVE,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::info;

const DEFAULT_BASE_URL: &str = "https://api.flutterwave.com/v3";
const DEFAULT_CURRENCY: &str = "NGN";
const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 2;

pub struct FlutterwaveClient {
    secret_key: String,
    verif_hash: String,
    base_url: String,
    currency: String,
    http: GatewayHttpClient,
}

impl FlutterwaveClient {
    pub fn new(config: &ChannelConfig) -> GatewayResult<Self> {
        let ChannelConfig::Flutterwave {
            secret_key,
            verif_hash,
            base_url,
            currency,
        } = config
        else {
            return Err(GatewayError::InvalidConfig {
                message: "expected a flutterwave channel config".to_string(),
            });
        };
        if secret_key.trim().is_empty() || verif_hash.trim().is_empty() {
            return Err(GatewayError::InvalidConfig {
                message: "flutterwave secret_key and verif_hash must not be empty".to_string(),
            });
        }

        Ok(Self {
            secret_key: secret_key.clone(),
            verif_hash: verif_hash.clone(),
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

    /// Flutterwave sends the configured hash verbatim in the `verif-hash`
    /// header; there is no per-payload signature to recompute.
    fn verify_hash(&self, payload: &NotifyPayload) -> GatewayResult<JsonValue> {
        let signature = payload
            .signature
            .as_deref()
            .ok_or(GatewayError::WebhookVerification {
                message: "missing verif-hash header".to_string(),
            })?;
        if !secure_eq(signature.as_bytes(), self.verif_hash.as_bytes()) {
            return Err(GatewayError::WebhookVerification {
                message: "verif-hash mismatch".to_string(),
            });
        }
        serde_json::from_slice(&payload.body).map_err(|e| GatewayError::WebhookVerification {
            message: format!("invalid webhook JSON payload: {}", e),
        })
    }

    fn map_order_status(status: &str) -> GatewayOrderStatus {
        match status {
            "successful" => GatewayOrderStatus::Success,
            "pending" => GatewayOrderStatus::Waiting,
            "failed" | "cancelled" => GatewayOrderStatus::Closed,
            _ => GatewayOrderStatus::Unknown,
        }
    }

    fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
        raw.and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    fn err(message: String) -> GatewayError {
        GatewayError::Gateway {
            gateway: GATEWAY_FLUTTERWAVE.to_string(),
            message,
            retryable: false,
        }
    }
}

#[async_trait::async_trait]
impl PaymentClient for FlutterwaveClient {
    fn gateway_code(&self) -> &'static str {
        GATEWAY_FLUTTERWAVE
    }

    async fn unified_order(
        &self,
        request: UnifiedOrderRequest,
    ) -> GatewayResult<GatewayOrderResult> {
        let payload = serde_json::json!({
            "tx_ref": request.outer_no,
            "amount": request.price,
            "currency": self.currency,
            "redirect_url": request.return_url,
            "customer": {
                "email": request
                    .buyer_email
                    .clone()
                    .unwrap_or_else(|| format!("{}@buyer.invalid", request.outer_no.to_lowercase())),
            },
            "customizations": { "title": request.subject },
        });

        let raw: Envelope<PaymentLinkData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/payments"),
                Some(&self.secret_key),
                Some(&payload),
            )
            .await?;
        if raw.status != "success" {
            return Err(Self::err(raw.message));
        }
        info!(outer_no = %request.outer_no, "flutterwave payment link created");

        Ok(GatewayOrderResult::waiting(
            request.outer_no,
            DisplayMode::Url,
            raw.data.link,
            JsonValue::Null,
        ))
    }

    async fn get_order(&self, outer_no: &str) -> GatewayResult<GatewayOrderResult> {
        let raw: Envelope<TransactionData> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!(
                    "/transactions/verify_by_reference?tx_ref={}",
                    outer_no
                )),
                Some(&self.secret_key),
                None,
            )
            .await?;
        if raw.status != "success" {
            return Err(Self::err(raw.message));
        }

        let data = raw.data;
        Ok(GatewayOrderResult {
            status: Self::map_order_status(data.status.as_deref().unwrap_or("")),
            outer_no: outer_no.to_string(),
            channel_order_no: data.id.map(|id| id.to_string()),
            channel_user_id: data.customer.and_then(|c| c.email),
            success_time: Self::parse_time(data.created_at.as_deref()),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: data.processor_response,
            raw: serde_json::json!({ "status": data.status }),
        })
    }

    async fn unified_refund(
        &self,
        request: UnifiedRefundRequest,
    ) -> GatewayResult<GatewayRefundResult> {
        // The refund endpoint wants the numeric transaction id; resolve it
        // from the tx_ref first.
        let order = self.get_order(&request.outer_no).await?;
        let transaction_id = order
            .channel_order_no
            .ok_or_else(|| Self::err(format!("no transaction id for {}", request.outer_no)))?;

        let payload = serde_json::json!({
            "amount": request.refund_price,
            "comments": request.refund_no,
        });
        let raw: Envelope<RefundData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint(&format!("/transactions/{}/refund", transaction_id)),
                Some(&self.secret_key),
                Some(&payload),
            )
            .await?;
        if raw.status != "success" {
            return Err(Self::err(raw.message));
        }
        info!(refund_no = %request.refund_no, "flutterwave refund submitted");

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
        let order = self.get_order(outer_no).await?;
        let transaction_id = order
            .channel_order_no
            .ok_or_else(|| Self::err(format!("no transaction id for {}", outer_no)))?;

        let raw: Envelope<Vec<RefundData>> = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/refunds?transaction_id={}", transaction_id)),
                Some(&self.secret_key),
                None,
            )
            .await?;
        if raw.status != "success" {
            return Err(Self::err(raw.message));
        }

        let data = raw
            .data
            .into_iter()
            .next_back()
            .ok_or_else(|| Self::err(format!("no refund found for {}", outer_no)))?;
        let status = match data.status.as_deref() {
            Some("completed") => GatewayRefundStatus::Success,
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
        let payload = serde_json::json!({
            "account_bank": request.user_name,
            "account_number": request.user_account,
            "amount": request.price,
            "currency": self.currency,
            "narration": request.subject,
            "reference": request.outer_no,
        });
        let raw: Envelope<TransferData> = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/transfers"),
                Some(&self.secret_key),
                Some(&payload),
            )
            .await?;
        if raw.status != "success" {
            return Err(Self::err(raw.message));
        }

        let status = match raw.data.status.as_deref() {
            Some("SUCCESSFUL") => GatewayTransferStatus::Success,
            Some("FAILED") => GatewayTransferStatus::Closed,
            _ => GatewayTransferStatus::Processing,
        };
        Ok(GatewayTransferResult {
            status,
            outer_no: request.outer_no,
            channel_transfer_no: raw.data.id.map(|id| id.to_string()),
            success_time: (status == GatewayTransferStatus::Success).then(Utc::now),
            error_code: None,
            error_msg: raw.data.complete_message,
            raw: serde_json::json!({ "transfer_status": raw.data.status }),
        })
    }

    fn parse_order_notify(&self, payload: &NotifyPayload) -> GatewayResult<GatewayOrderResult> {
        let parsed = self.verify_hash(payload)?;
        let event = parsed.get("event").and_then(|v| v.as_str()).unwrap_or("");
        let data = parsed.get("data").cloned().unwrap_or(JsonValue::Null);
        let outer_no = data
            .get("tx_ref")
            .and_then(|v| v.as_str())
            .ok_or(GatewayError::WebhookVerification {
                message: "order webhook missing data.tx_ref".to_string(),
            })?
            .to_string();
        let data_status = data.get("status").and_then(|v| v.as_str()).unwrap_or("");

        let status = if event == "charge.completed" && data_status == "successful" {
            GatewayOrderStatus::Success
        } else if event == "charge.completed" {
            GatewayOrderStatus::Closed
        } else {
            GatewayOrderStatus::Unknown
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
            success_time: (status == GatewayOrderStatus::Success).then(Utc::now),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: data
                .get("processor_response")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            raw: parsed,
        })
    }

    fn parse_refund_notify(
        &self,
        payload: &NotifyPayload,
    ) -> GatewayResult<GatewayRefundResult> {
        let parsed = self.verify_hash(payload)?;
        let data = parsed.get("data").cloned().unwrap_or(JsonValue::Null);
        let refund_no = data
            .get("comments")
            .and_then(|v| v.as_str())
            .ok_or(GatewayError::WebhookVerification {
                message: "refund webhook missing data.comments".to_string(),
            })?
            .to_string();
        let data_status = data.get("status").and_then(|v| v.as_str()).unwrap_or("");

        let status = match data_status {
            "completed" => GatewayRefundStatus::Success,
            "failed" => GatewayRefundStatus::Failure,
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
        let parsed = self.verify_hash(payload)?;
        let data = parsed.get("data").cloned().unwrap_or(JsonValue::Null);
        let outer_no = data
            .get("reference")
            .and_then(|v| v.as_str())
            .ok_or(GatewayError::WebhookVerification {
                message: "transfer webhook missing data.reference".to_string(),
            })?
            .to_string();
        let data_status = data.get("status").and_then(|v| v.as_str()).unwrap_or("");

        let status = match data_status {
            "SUCCESSFUL" => GatewayTransferStatus::Success,
            "FAILED" => GatewayTransferStatus::Closed,
            _ => GatewayTransferStatus::Processing,
        };
        Ok(GatewayTransferResult {
            status,
            outer_no,
            channel_transfer_no: data.get("id").and_then(|v| v.as_i64()).map(|v| v.to_string()),
            success_time: (status == GatewayTransferStatus::Success).then(Utc::now),
            error_code: None,
            error_msg: data
                .get("complete_message")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string()),
            raw: parsed,
        })
    }

    fn signature_header(&self) -> Option<&'static str> {
        Some("verif-hash")
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    message: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct PaymentLinkData {
    link: String,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    processor_response: Option<String>,
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
struct TransferData {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    complete_message: Option<String>,
}
