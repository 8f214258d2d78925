//! Merchant application and channel read model.
//!
//! Applications and channels are owned by admin tooling outside this core;
//! the engines only read them, except for the channel-config save that has
//! to invalidate the gateway client cache.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Merchant-facing credential bundle with per-kind callback URLs.
#[derive(Debug, Clone, FromRow)]
pub struct PayApp {
    pub id: Uuid,
    pub app_key: String,
    pub name: String,
    pub is_enabled: bool,
    pub order_notify_url: String,
    pub refund_notify_url: String,
    pub transfer_notify_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One gateway integration configured under an application.
///
/// `config` is the gateway-specific credential blob, decoded into
/// [`crate::gateway::types::ChannelConfig`] by the registry.
#[derive(Debug, Clone, FromRow)]
pub struct PayChannel {
    pub id: Uuid,
    pub app_id: Uuid,
    pub code: String,
    pub is_enabled: bool,
    /// Fee rate in percent, e.g. 1.0 means 1% of the order price.
    pub fee_rate: f64,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait AppStore: Send + Sync {
    async fn get_app(&self, id: Uuid) -> Result<Option<PayApp>, DatabaseError>;

    async fn get_channel(&self, id: Uuid) -> Result<Option<PayChannel>, DatabaseError>;

    async fn get_channel_by_code(
        &self,
        app_id: Uuid,
        code: &str,
    ) -> Result<Option<PayChannel>, DatabaseError>;

    /// Persist a channel's configuration. The caller is responsible for
    /// invalidating the gateway client cache afterwards.
    async fn update_channel(
        &self,
        id: Uuid,
        is_enabled: bool,
        fee_rate: f64,
        config: serde_json::Value,
    ) -> Result<PayChannel, DatabaseError>;
}

const APP_COLUMNS: &str = "id, app_key, name, is_enabled, order_notify_url, refund_notify_url, \
     transfer_notify_url, created_at, updated_at";

const CHANNEL_COLUMNS: &str =
    "id, app_id, code, is_enabled, fee_rate, config, created_at, updated_at";

pub struct PgAppRepository {
    pool: PgPool,
}

impl PgAppRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AppStore for PgAppRepository {
    async fn get_app(&self, id: Uuid) -> Result<Option<PayApp>, DatabaseError> {
        sqlx::query_as::<_, PayApp>(&format!(
            "SELECT {APP_COLUMNS} FROM pay_apps WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_channel(&self, id: Uuid) -> Result<Option<PayChannel>, DatabaseError> {
        sqlx::query_as::<_, PayChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM pay_channels WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn get_channel_by_code(
        &self,
        app_id: Uuid,
        code: &str,
    ) -> Result<Option<PayChannel>, DatabaseError> {
        sqlx::query_as::<_, PayChannel>(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM pay_channels WHERE app_id = $1 AND code = $2"
        ))
        .bind(app_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn update_channel(
        &self,
        id: Uuid,
        is_enabled: bool,
        fee_rate: f64,
        config: serde_json::Value,
    ) -> Result<PayChannel, DatabaseError> {
        sqlx::query_as::<_, PayChannel>(&format!(
            "UPDATE pay_channels
             SET is_enabled = $2, fee_rate = $3, config = $4, updated_at = NOW()
             WHERE id = $1
             RETURNING {CHANNEL_COLUMNS}"
        ))
        .bind(id)
        .bind(is_enabled)
        .bind(fee_rate)
        .bind(config)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| DatabaseError::not_found("PayChannel", id.to_string()))
    }
}
