//! The capability interface every payment gateway integration implements.

use crate::gateway::error::GatewayResult;
use crate::gateway::types::{
    GatewayOrderResult, GatewayRefundResult, GatewayTransferResult, NotifyPayload,
    UnifiedOrderRequest, UnifiedRefundRequest, UnifiedTransferRequest,
};
use async_trait::async_trait;

/// One live integration with a payment gateway, bound to one channel's
/// credentials. Implementations own signature verification and payload
/// parsing; a verification failure is a hard error, never a silently
/// accepted payload.
#[async_trait]
pub trait PaymentClient: Send + Sync {
    fn gateway_code(&self) -> &'static str;

    /// Submit a payment and return the buyer-facing payment instruction.
    async fn unified_order(
        &self,
        request: UnifiedOrderRequest,
    ) -> GatewayResult<GatewayOrderResult>;

    /// Actively query the gateway for the order identified by `outer_no`.
    async fn get_order(&self, outer_no: &str) -> GatewayResult<GatewayOrderResult>;

    async fn unified_refund(
        &self,
        request: UnifiedRefundRequest,
    ) -> GatewayResult<GatewayRefundResult>;

    async fn get_refund(
        &self,
        outer_no: &str,
        refund_no: &str,
    ) -> GatewayResult<GatewayRefundResult>;

    async fn unified_transfer(
        &self,
        request: UnifiedTransferRequest,
    ) -> GatewayResult<GatewayTransferResult>;

    /// Verify and parse an inbound order webhook.
    fn parse_order_notify(&self, payload: &NotifyPayload) -> GatewayResult<GatewayOrderResult>;

    fn parse_refund_notify(&self, payload: &NotifyPayload)
        -> GatewayResult<GatewayRefundResult>;

    fn parse_transfer_notify(
        &self,
        payload: &NotifyPayload,
    ) -> GatewayResult<GatewayTransferResult>;

    /// Header carrying the webhook signature, when the gateway uses one.
    fn signature_header(&self) -> Option<&'static str> {
        None
    }

    /// Body this gateway expects back to acknowledge a webhook.
    fn notify_ack(&self) -> &'static str {
        "success"
    }
}
