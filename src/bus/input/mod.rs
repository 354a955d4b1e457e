//! MQTT input adapter.
//!
//! Subscribes to the configured topic filters and hands each broker
//! delivery to the pipeline as a standalone single-part message. Multipart
//! framing is never reconstructed: a message written as K parts arrives as K
//! independent messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::connection::{ConnectionManager, ConnectionState};
use super::{BatchError, BrokerClient, BrokerConnector, Delivery, Input, Result};
use crate::config::{ConfigError, MqttInputConfig};
use crate::message::Message;

/// The delivery most recently returned by `read`.
struct Pending {
    client: Arc<dyn BrokerClient>,
    delivery: Delivery,
}

/// Input adapter reading from MQTT topics.
pub struct MqttInput {
    config: MqttInputConfig,
    conn: ConnectionManager,
    pending: Mutex<Option<Pending>>,
}

impl MqttInput {
    /// Create an input using `connector` to reach the broker.
    pub fn new(
        config: MqttInputConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> std::result::Result<Self, ConfigError> {
        let config = config.validated()?;
        let conn = ConnectionManager::new("mqtt_input", config.connection.clone(), connector);
        Ok(Self {
            config,
            conn,
            pending: Mutex::new(None),
        })
    }

    /// Create an input backed by the rumqttc client.
    #[cfg(feature = "mqtt")]
    pub fn mqtt(config: MqttInputConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(config, Arc::new(super::mqtt::MqttConnector::new()))
    }

    pub fn config(&self) -> &MqttInputConfig {
        &self.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }
}

#[async_trait]
impl Input for MqttInput {
    async fn connect(&self) -> Result<()> {
        self.conn.connect(&self.config.topics).await
    }

    async fn read(&self) -> Result<Message> {
        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            return Err(super::BusError::AckPending);
        }

        let link = self.conn.link().await?;
        let delivery = self
            .conn
            .guard(ConnectionState::Connected, async {
                let mut deliveries = link.deliveries.lock().await;
                match deliveries.recv().await {
                    Some(delivery) => Ok(delivery),
                    None => Err(self.conn.state().unusable_error()),
                }
            })
            .await?;

        debug!(
            topic = %delivery.topic,
            message_id = delivery.message_id,
            duplicate = delivery.duplicate,
            "Received delivery"
        );

        let message = delivery.to_message();
        *pending = Some(Pending {
            client: link.client,
            delivery,
        });
        Ok(message)
    }

    async fn acknowledge(&self, batch_err: BatchError<'_>) -> Result<()> {
        let Pending { client, delivery } = self
            .pending
            .lock()
            .await
            .take()
            .ok_or(super::BusError::NoPendingDelivery)?;

        if let Some(err) = batch_err {
            debug!(
                topic = %delivery.topic,
                message_id = delivery.message_id,
                error = %err,
                "Withholding acknowledgment"
            );
            return Ok(());
        }

        client.ack(&delivery).await
    }

    fn close_async(&self) {
        self.conn.close_async();
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.take();
        }
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        self.conn.wait_for_close(timeout).await
    }
}
