//! HTTP surface: the inbound webhook router and the health endpoint.
//! Merchant-facing order/refund/transfer creation is driven through the
//! service layer by the embedding application.

pub mod webhooks;

use crate::cache::RedisPool;
use crate::error::ServiceError;
use crate::services::app::AppService;
use crate::services::order::OrderService;
use crate::services::refund::RefundService;
use crate::services::transfer::TransferService;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub apps: Arc<AppService>,
    pub orders: Arc<OrderService>,
    pub refunds: Arc<RefundService>,
    pub transfers: Arc<TransferService>,
    pub pool: PgPool,
    pub cache: RedisPool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/order/{channel_id}", post(webhooks::order_webhook))
        .route(
            "/webhooks/refund/{channel_id}",
            post(webhooks::refund_webhook),
        )
        .route(
            "/webhooks/transfer/{channel_id}",
            post(webhooks::transfer_webhook),
        )
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let database = crate::database::health_check(&state.pool).await.is_ok();
    let cache = crate::cache::health_check(&state.cache).await.is_ok();
    let healthy = database && cache;

    let body = Json(serde_json::json!({
        "status": if healthy { "ok" } else { "degraded" },
        "database": database,
        "cache": cache,
    }));
    if healthy {
        (StatusCode::OK, body).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            warn!(%self, "request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
