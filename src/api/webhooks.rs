//! Inbound gateway webhooks.
//!
//! The channel id is carried in the URL path (stamped into the callback
//! URL at submission time), so the raw body can be handed to the right
//! client for verification before anything is parsed.

use crate::api::AppState;
use crate::error::ServiceResult;
use crate::gateway::types::NotifyPayload;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use tracing::info;
use uuid::Uuid;

pub async fn order_webhook(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ServiceResult<Response> {
    let channel = state.apps.require_channel(channel_id).await?;
    let client = state.apps.client_for(&channel).await?;
    let payload = payload_from(&headers, client.signature_header(), body);

    let result = client.parse_order_notify(&payload)?;
    info!(channel_id = %channel_id, outer_no = %result.outer_no, status = ?result.status, "order webhook received");
    state.orders.notify_order(&channel, &result).await?;
    Ok(ack(client.notify_ack()))
}

pub async fn refund_webhook(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ServiceResult<Response> {
    let channel = state.apps.require_channel(channel_id).await?;
    let client = state.apps.client_for(&channel).await?;
    let payload = payload_from(&headers, client.signature_header(), body);

    let result = client.parse_refund_notify(&payload)?;
    info!(channel_id = %channel_id, refund_no = %result.refund_no, status = ?result.status, "refund webhook received");
    state.refunds.notify_refund(&channel, &result).await?;
    Ok(ack(client.notify_ack()))
}

pub async fn transfer_webhook(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ServiceResult<Response> {
    let channel = state.apps.require_channel(channel_id).await?;
    let client = state.apps.client_for(&channel).await?;
    let payload = payload_from(&headers, client.signature_header(), body);

    let result = client.parse_transfer_notify(&payload)?;
    info!(channel_id = %channel_id, outer_no = %result.outer_no, status = ?result.status, "transfer webhook received");
    state.transfers.notify_transfer(&channel, &result).await?;
    Ok(ack(client.notify_ack()))
}

fn payload_from(
    headers: &HeaderMap,
    signature_header: Option<&'static str>,
    body: Bytes,
) -> NotifyPayload {
    let signature = signature_header
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    NotifyPayload {
        signature,
        body: body.to_vec(),
    }
}

fn ack(body: &'static str) -> Response {
    Response::new(body.into())
}
