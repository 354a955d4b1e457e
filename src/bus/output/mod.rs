//! MQTT output adapter.
//!
//! Fans each part of a pipeline message out as its own broker publish on
//! the configured topic, waiting for the broker to confirm each one before
//! sending the next. There is no transactional multi-part publish: when a
//! part fails, the parts before it stay published.
//!
//! MQTT 3.1.1 has no user-defined headers, so part metadata is not
//! forwarded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::connection::{ConnectionManager, ConnectionState};
use super::{BrokerConnector, Output, Result};
use crate::config::{ConfigError, MqttOutputConfig};
use crate::message::Message;

/// Output adapter publishing to one MQTT topic.
pub struct MqttOutput {
    config: MqttOutputConfig,
    conn: ConnectionManager,
}

impl MqttOutput {
    /// Create an output using `connector` to reach the broker.
    pub fn new(
        config: MqttOutputConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> std::result::Result<Self, ConfigError> {
        let config = config.validated()?;
        let conn = ConnectionManager::new("mqtt_output", config.connection.clone(), connector);
        Ok(Self { config, conn })
    }

    /// Create an output backed by the rumqttc client.
    #[cfg(feature = "mqtt")]
    pub fn mqtt(config: MqttOutputConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(config, Arc::new(super::mqtt::MqttConnector::new()))
    }

    pub fn config(&self) -> &MqttOutputConfig {
        &self.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }
}

#[async_trait]
impl Output for MqttOutput {
    async fn connect(&self) -> Result<()> {
        self.conn.connect(&[]).await
    }

    #[tracing::instrument(name = "mqtt.write", skip_all, fields(topic = %self.config.topic, parts = msg.len()))]
    async fn write(&self, msg: &Message) -> Result<()> {
        let link = self.conn.link().await?;
        let qos = self.config.connection.qos;

        for (index, part) in msg.iter().enumerate() {
            if !part.metadata().is_empty() {
                trace!(
                    index,
                    keys = part.metadata().len(),
                    "Dropping part metadata, MQTT has no user headers"
                );
            }

            self.conn
                .guard(
                    ConnectionState::Connected,
                    link.client.publish(
                        &self.config.topic,
                        qos,
                        self.config.retained,
                        part.payload().clone(),
                    ),
                )
                .await
                .inspect_err(|e| debug!(index, error = %e, "Part publish failed"))?;
        }

        debug!("Published message");
        Ok(())
    }

    fn close_async(&self) {
        self.conn.close_async();
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        self.conn.wait_for_close(timeout).await
    }
}
