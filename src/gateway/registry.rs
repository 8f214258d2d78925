//! Gateway client registry: maps gateway codes to constructors and caches
//! one live client per channel id. The cache is owned by the process and
//! explicitly invalidated when a channel's configuration is re-saved.

use crate::gateway::client::PaymentClient;
use crate::gateway::clients::{FlutterwaveClient, MockClient, PaystackClient};
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::types::{ChannelConfig, GATEWAY_FLUTTERWAVE, GATEWAY_MOCK, GATEWAY_PAYSTACK};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

type ClientCtor =
    Arc<dyn Fn(&ChannelConfig) -> GatewayResult<Arc<dyn PaymentClient>> + Send + Sync>;

pub struct ClientRegistry {
    ctors: HashMap<&'static str, ClientCtor>,
    clients: RwLock<HashMap<Uuid, Arc<dyn PaymentClient>>>,
}

impl ClientRegistry {
    /// Registry with all built-in gateway integrations.
    pub fn builtin() -> Self {
        let mut registry = Self {
            ctors: HashMap::new(),
            clients: RwLock::new(HashMap::new()),
        };
        registry.register(GATEWAY_PAYSTACK, |config| {
            Ok(Arc::new(PaystackClient::new(config)?) as Arc<dyn PaymentClient>)
        });
        registry.register(GATEWAY_FLUTTERWAVE, |config| {
            Ok(Arc::new(FlutterwaveClient::new(config)?) as Arc<dyn PaymentClient>)
        });
        registry.register(GATEWAY_MOCK, |_config| {
            Ok(Arc::new(MockClient::new()) as Arc<dyn PaymentClient>)
        });
        registry
    }

    pub fn register<F>(&mut self, code: &'static str, ctor: F)
    where
        F: Fn(&ChannelConfig) -> GatewayResult<Arc<dyn PaymentClient>> + Send + Sync + 'static,
    {
        self.ctors.insert(code, Arc::new(ctor));
    }

    /// Resolve the client for a channel, instantiating and caching it on
    /// first use.
    pub async fn get_or_create(
        &self,
        channel_id: Uuid,
        raw_config: &serde_json::Value,
    ) -> GatewayResult<Arc<dyn PaymentClient>> {
        if let Some(client) = self.clients.read().await.get(&channel_id) {
            return Ok(client.clone());
        }

        let config: ChannelConfig =
            serde_json::from_value(raw_config.clone()).map_err(|e| {
                GatewayError::InvalidConfig {
                    message: format!("channel {} config does not parse: {}", channel_id, e),
                }
            })?;
        let code = config.gateway_code();
        let ctor = self
            .ctors
            .get(code)
            .ok_or_else(|| GatewayError::UnknownGateway(code.to_string()))?;
        let client = ctor(&config)?;

        let mut clients = self.clients.write().await;
        // Another task may have built the client while we were parsing;
        // keep the first one so callers share a single instance.
        let client = clients.entry(channel_id).or_insert(client).clone();
        info!(channel_id = %channel_id, gateway = code, "gateway client instantiated");
        Ok(client)
    }

    /// Drop the cached client for a channel after its config changed; the
    /// next use rebuilds it from the new config.
    pub async fn invalidate(&self, channel_id: Uuid) {
        if self.clients.write().await.remove(&channel_id).is_some() {
            info!(channel_id = %channel_id, "gateway client cache invalidated");
        }
    }
}
