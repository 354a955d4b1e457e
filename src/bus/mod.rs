//! Broker-facing adapters for the stream pipeline.
//!
//! This module contains:
//! - `Input` / `Output` traits: the contract the pipeline engine drives
//! - `BrokerConnector` / `BrokerClient` traits: the seam to a broker client
//! - `BusError`: the error taxonomy shared by both adapters
//! - Implementations: MQTT (rumqttc), in-process channel broker
//!
//! The adapters never retry or reconnect on their own. Failures are returned
//! to the caller; opt-in retry lives in [`reconnect`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{ConnectionConfig, QosLevel};
use crate::message::{Message, Metadata, Part};

// Implementation modules
pub mod channel;
pub mod connection;
pub mod input;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod output;
pub mod reconnect;
pub mod topic;

// Re-exports
pub use channel::ChannelBroker;
pub use connection::{ConnectionManager, ConnectionState};
pub use input::MqttInput;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttConnector;
pub use output::MqttOutput;
pub use reconnect::{connect_with_backoff, ReconnectingInput, ReconnectingOutput};

/// Metadata key carrying the topic a delivery arrived on.
pub const META_TOPIC: &str = "mqtt_topic";
/// Metadata key carrying the delivery QoS (`0`, `1` or `2`).
pub const META_QOS: &str = "mqtt_qos";
/// Metadata key set to `true` when the broker replayed a retained message.
pub const META_RETAINED: &str = "mqtt_retained";
/// Metadata key set to `true` when the broker flagged a redelivery.
pub const META_DUPLICATE: &str = "mqtt_duplicate";
/// Metadata key carrying the broker packet identifier.
pub const META_MESSAGE_ID: &str = "mqtt_message_id";

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Type closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for close")]
    Timeout(Duration),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Ack(String),

    #[error("No delivery is awaiting acknowledgment")]
    NoPendingDelivery,

    #[error("Previous delivery has not been acknowledged")]
    AckPending,
}

impl BusError {
    /// Whether a fresh `connect` could plausibly clear this error.
    ///
    /// `Closed` is terminal and never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::NotConnected)
    }
}

/// Pipeline-side error handed to [`Input::acknowledge`].
pub type BatchError<'a> = Option<&'a (dyn std::error::Error + Send + Sync)>;

// ============================================================================
// Broker seam
// ============================================================================

/// Opaque broker-assigned handle used to acknowledge a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// One inbound unit received from the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the message was published to.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Bytes,
    /// QoS the broker delivered with.
    pub qos: QosLevel,
    /// Replayed retained message.
    pub retained: bool,
    /// Broker flagged this as a redelivery.
    pub duplicate: bool,
    /// Broker packet identifier (0 for QoS 0).
    pub message_id: u16,
    /// Handle for acknowledging this delivery.
    pub tag: DeliveryTag,
}

impl Delivery {
    /// Wrap this delivery as a standalone single-part message.
    ///
    /// Metadata only carries what the broker attached to the delivery;
    /// nothing set by the producer survives the trip.
    pub fn to_message(&self) -> Message {
        let mut metadata = Metadata::new();
        metadata
            .set(META_TOPIC, self.topic.clone())
            .set(META_QOS, self.qos.as_u8().to_string())
            .set(META_RETAINED, self.retained.to_string())
            .set(META_DUPLICATE, self.duplicate.to_string())
            .set(META_MESSAGE_ID, self.message_id.to_string());
        Message::from(Part::with_metadata(self.payload.clone(), metadata))
    }
}

/// Notifications a live broker session emits in the background.
#[derive(Debug)]
pub enum SessionEvent {
    /// A message arrived on a subscribed topic.
    Delivery(Delivery),
    /// The connection dropped unexpectedly.
    Lost(String),
    /// The connection was closed by a requested disconnect.
    Closed,
}

/// A live connection to one broker endpoint.
pub struct Session {
    /// Handle for issuing broker operations on this connection.
    pub client: Arc<dyn BrokerClient>,
    /// Background notifications for this connection.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Operations on an established broker connection.
///
/// Every call completes only once the broker has confirmed it (or, for
/// QoS 0 publishes, once the packet was sent). Implementations must be safe
/// to call from many tasks at once.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Subscribe to a topic filter and wait for the broker to accept it.
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()>;

    /// Publish one payload and wait for the broker's confirmation.
    async fn publish(&self, topic: &str, qos: QosLevel, retain: bool, payload: Bytes)
        -> Result<()>;

    /// Acknowledge a delivery so the broker stops tracking it.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Disconnect gracefully and wait until the connection is gone.
    async fn disconnect(&self) -> Result<()>;
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect to a single endpoint URL and wait for the broker to accept.
    async fn connect(&self, url: &str, config: &ConnectionConfig) -> Result<Session>;
}

// ============================================================================
// Pipeline-facing traits
// ============================================================================

/// Source of messages for the pipeline.
///
/// Exactly one `acknowledge` must follow each successful `read` before the
/// next `read`.
#[async_trait]
pub trait Input: Send + Sync {
    /// Connect to the broker and subscribe. Succeeds immediately when
    /// already connected.
    async fn connect(&self) -> Result<()>;

    /// Wait for the next delivery.
    ///
    /// Fails with `Closed` once closing starts and with `NotConnected` when
    /// no connection is established.
    async fn read(&self) -> Result<Message>;

    /// Acknowledge the delivery returned by the previous `read`.
    ///
    /// With `Some(err)` the acknowledgment is withheld so the broker may
    /// redeliver.
    async fn acknowledge(&self, batch_err: BatchError<'_>) -> Result<()>;

    /// Begin shutting down. Never blocks; repeated calls are no-ops.
    fn close_async(&self);

    /// Wait for shutdown to finish.
    async fn wait_for_close(&self, timeout: Duration) -> Result<()>;
}

/// Sink for pipeline messages.
#[async_trait]
pub trait Output: Send + Sync {
    /// Connect to the broker. Succeeds immediately when already connected.
    async fn connect(&self) -> Result<()>;

    /// Publish every part of `msg` in order, each as its own broker message.
    ///
    /// Stops at the first failing part; parts already published stay
    /// published.
    async fn write(&self, msg: &Message) -> Result<()>;

    /// Begin shutting down. Never blocks; repeated calls are no-ops.
    fn close_async(&self);

    /// Wait for shutdown to finish.
    async fn wait_for_close(&self, timeout: Duration) -> Result<()>;
}
