//! Mock gateway used by local setups and integration tests.
//!
//! Every operation succeeds immediately and no webhook verification is
//! performed, so flows can be exercised end to end without credentials.

use crate::gateway::client::PaymentClient;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::types::{
    DisplayMode, GatewayOrderResult, GatewayOrderStatus, GatewayRefundResult,
    GatewayRefundStatus, GatewayTransferResult, GatewayTransferStatus, NotifyPayload,
    UnifiedOrderRequest, UnifiedRefundRequest, UnifiedTransferRequest, GATEWAY_MOCK,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value as JsonValue;

pub struct MockClient;

impl MockClient {
    pub fn new() -> Self {
        Self
    }

    fn parse_body(payload: &NotifyPayload) -> GatewayResult<MockNotifyBody> {
        serde_json::from_slice(&payload.body).map_err(|e| GatewayError::WebhookVerification {
            message: format!("invalid mock webhook payload: {}", e),
        })
    }
}

impl Default for MockClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PaymentClient for MockClient {
    fn gateway_code(&self) -> &'static str {
        GATEWAY_MOCK
    }

    async fn unified_order(
        &self,
        request: UnifiedOrderRequest,
    ) -> GatewayResult<GatewayOrderResult> {
        Ok(GatewayOrderResult {
            status: GatewayOrderStatus::Success,
            channel_order_no: Some(format!("MOCK-{}", request.outer_no)),
            channel_user_id: Some("mock-user".to_string()),
            success_time: Some(Utc::now()),
            display_mode: Some(DisplayMode::Url),
            display_content: Some(format!("https://mock.invalid/pay/{}", request.outer_no)),
            error_code: None,
            error_msg: None,
            raw: JsonValue::Null,
            outer_no: request.outer_no,
        })
    }

    async fn get_order(&self, outer_no: &str) -> GatewayResult<GatewayOrderResult> {
        Ok(GatewayOrderResult {
            status: GatewayOrderStatus::Success,
            outer_no: outer_no.to_string(),
            channel_order_no: Some(format!("MOCK-{}", outer_no)),
            channel_user_id: Some("mock-user".to_string()),
            success_time: Some(Utc::now()),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: None,
            raw: JsonValue::Null,
        })
    }

    async fn unified_refund(
        &self,
        request: UnifiedRefundRequest,
    ) -> GatewayResult<GatewayRefundResult> {
        Ok(GatewayRefundResult {
            status: GatewayRefundStatus::Success,
            channel_refund_no: Some(format!("MOCK-{}", request.refund_no)),
            success_time: Some(Utc::now()),
            error_code: None,
            error_msg: None,
            raw: JsonValue::Null,
            refund_no: request.refund_no,
        })
    }

    async fn get_refund(
        &self,
        _outer_no: &str,
        refund_no: &str,
    ) -> GatewayResult<GatewayRefundResult> {
        Ok(GatewayRefundResult {
            status: GatewayRefundStatus::Success,
            refund_no: refund_no.to_string(),
            channel_refund_no: Some(format!("MOCK-{}", refund_no)),
            success_time: Some(Utc::now()),
            error_code: None,
            error_msg: None,
            raw: JsonValue::Null,
        })
    }

    async fn unified_transfer(
        &self,
        request: UnifiedTransferRequest,
    ) -> GatewayResult<GatewayTransferResult> {
        Ok(GatewayTransferResult {
            status: GatewayTransferStatus::Success,
            channel_transfer_no: Some(format!("MOCK-{}", request.outer_no)),
            success_time: Some(Utc::now()),
            error_code: None,
            error_msg: None,
            raw: JsonValue::Null,
            outer_no: request.outer_no,
        })
    }

    fn parse_order_notify(&self, payload: &NotifyPayload) -> GatewayResult<GatewayOrderResult> {
        let body = Self::parse_body(payload)?;
        let status = match body.status.as_str() {
            "success" => GatewayOrderStatus::Success,
            "closed" => GatewayOrderStatus::Closed,
            _ => GatewayOrderStatus::Waiting,
        };
        Ok(GatewayOrderResult {
            status,
            channel_order_no: Some(format!("MOCK-{}", body.no)),
            channel_user_id: None,
            success_time: (status == GatewayOrderStatus::Success).then(Utc::now),
            display_mode: None,
            display_content: None,
            error_code: None,
            error_msg: None,
            raw: JsonValue::Null,
            outer_no: body.no,
        })
    }

    fn parse_refund_notify(
        &self,
        payload: &NotifyPayload,
    ) -> GatewayResult<GatewayRefundResult> {
        let body = Self::parse_body(payload)?;
        let status = match body.status.as_str() {
            "success" => GatewayRefundStatus::Success,
            "failure" => GatewayRefundStatus::Failure,
            _ => GatewayRefundStatus::Waiting,
        };
        Ok(GatewayRefundResult {
            status,
            channel_refund_no: Some(format!("MOCK-{}", body.no)),
            success_time: (status == GatewayRefundStatus::Success).then(Utc::now),
            error_code: None,
            error_msg: None,
            raw: JsonValue::Null,
            refund_no: body.no,
        })
    }

    fn parse_transfer_notify(
        &self,
        payload: &NotifyPayload,
    ) -> GatewayResult<GatewayTransferResult> {
        let body = Self::parse_body(payload)?;
        let status = match body.status.as_str() {
            "success" => GatewayTransferStatus::Success,
            "closed" => GatewayTransferStatus::Closed,
            _ => GatewayTransferStatus::Processing,
        };
        Ok(GatewayTransferResult {
            status,
            channel_transfer_no: Some(format!("MOCK-{}", body.no)),
            success_time: (status == GatewayTransferStatus::Success).then(Utc::now),
            error_code: None,
            error_msg: None,
            raw: JsonValue::Null,
            outer_no: body.no,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MockNotifyBody {
    no: String,
    status: String,
}
