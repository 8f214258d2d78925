//! Application and channel directory: validated lookups plus the one write
//! path (channel config save) that has to invalidate the client cache.

use crate::database::app_repository::{PayApp, PayChannel};
use crate::error::{ServiceError, ServiceResult};
use crate::gateway::client::PaymentClient;
use crate::gateway::registry::ClientRegistry;
use crate::services::Stores;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct AppService {
    stores: Stores,
    registry: Arc<ClientRegistry>,
}

impl AppService {
    pub fn new(stores: Stores, registry: Arc<ClientRegistry>) -> Self {
        Self { stores, registry }
    }

    /// Application by id, rejected unless it exists and is enabled.
    pub async fn require_app(&self, app_id: Uuid) -> ServiceResult<PayApp> {
        let app = self
            .stores
            .apps
            .get_app(app_id)
            .await?
            .ok_or(ServiceError::AppNotFound(app_id))?;
        if !app.is_enabled {
            return Err(ServiceError::AppDisabled(app_id));
        }
        Ok(app)
    }

    /// Channel by id, rejected unless enabled. Used on the webhook path
    /// where only the channel id is known.
    pub async fn require_channel(&self, channel_id: Uuid) -> ServiceResult<PayChannel> {
        let channel = self
            .stores
            .apps
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| ServiceError::ChannelNotFound(channel_id.to_string()))?;
        if !channel.is_enabled {
            return Err(ServiceError::ChannelDisabled(channel_id));
        }
        Ok(channel)
    }

    /// Channel by (app, code), rejected unless enabled. Used on submission
    /// paths where the caller names the channel by code.
    pub async fn require_channel_by_code(
        &self,
        app_id: Uuid,
        code: &str,
    ) -> ServiceResult<PayChannel> {
        let channel = self
            .stores
            .apps
            .get_channel_by_code(app_id, code)
            .await?
            .ok_or_else(|| ServiceError::ChannelNotFound(code.to_string()))?;
        if !channel.is_enabled {
            return Err(ServiceError::ChannelDisabled(channel.id));
        }
        Ok(channel)
    }

    /// The live gateway client for a channel, built and cached on demand.
    pub async fn client_for(
        &self,
        channel: &PayChannel,
    ) -> ServiceResult<Arc<dyn PaymentClient>> {
        Ok(self
            .registry
            .get_or_create(channel.id, &channel.config)
            .await?)
    }

    /// Persist a channel's configuration and drop any cached client so the
    /// next use is built from the new credentials.
    pub async fn save_channel_config(
        &self,
        channel_id: Uuid,
        is_enabled: bool,
        fee_rate: f64,
        config: serde_json::Value,
    ) -> ServiceResult<PayChannel> {
        let channel = self
            .stores
            .apps
            .update_channel(channel_id, is_enabled, fee_rate, config)
            .await?;
        self.registry.invalidate(channel_id).await;
        info!(channel_id = %channel_id, code = %channel.code, "channel config saved");
        Ok(channel)
    }
}
