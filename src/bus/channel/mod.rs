//! In-process MQTT-style broker for standalone mode and tests.
//!
//! Behaves like a single MQTT broker reachable at one `memory://` address:
//! - topic filters with `+` and `#`
//! - effective QoS is the lower of publish and subscription QoS
//! - QoS 1/2 deliveries stay tracked until acknowledged
//! - persistent sessions (`clean_session = false`) keep subscriptions and
//!   unacknowledged deliveries, which are redelivered with the duplicate flag
//!   on reconnect
//! - retained messages are replayed to new subscriptions
//!
//! Failure injection (`set_available`, `drop_connections`) lets tests
//! exercise unreachable endpoints and lost connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::topic::{topic_matches, validate_topic_filter, validate_topic_name};
use super::{
    BrokerClient, BrokerConnector, BusError, Delivery, DeliveryTag, Result, Session, SessionEvent,
};
use crate::config::{ConnectionConfig, QosLevel};

/// Address of a broker created with [`ChannelBroker::new`].
pub const DEFAULT_ADDRESS: &str = "memory://local";

/// A message held by the broker for one client.
#[derive(Debug, Clone)]
struct StoredMessage {
    topic: String,
    payload: Bytes,
    qos: QosLevel,
    retained: bool,
    message_id: u16,
}

struct LiveConnection {
    id: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

#[derive(Default)]
struct ClientSession {
    persistent: bool,
    subscriptions: Vec<(String, QosLevel)>,
    connection: Option<LiveConnection>,
    /// Deliveries awaiting acknowledgment, keyed by delivery tag.
    unacked: BTreeMap<u64, StoredMessage>,
    next_message_id: u16,
}

impl ClientSession {
    fn is_live(&self, connection_id: u64) -> bool {
        self.connection.as_ref().map(|c| c.id) == Some(connection_id)
    }

    fn message_id(&mut self) -> u16 {
        self.next_message_id = self.next_message_id.checked_add(1).unwrap_or(1);
        self.next_message_id
    }

    /// Highest QoS among subscriptions matching `topic`.
    fn matching_qos(&self, topic: &str) -> Option<QosLevel> {
        self.subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, qos)| *qos)
            .max()
    }

    /// Send to the live connection, dropping it if the receiver is gone.
    fn send(&mut self, tag: u64, message: &StoredMessage, duplicate: bool) {
        let Some(connection) = &self.connection else {
            return;
        };
        let delivery = Delivery {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            retained: message.retained,
            duplicate,
            message_id: message.message_id,
            tag: DeliveryTag::new(tag),
        };
        if connection.events.send(SessionEvent::Delivery(delivery)).is_err() {
            self.connection = None;
        }
    }
}

#[derive(Default)]
struct BrokerState {
    available: bool,
    sessions: HashMap<String, ClientSession>,
    retained: HashMap<String, StoredMessage>,
}

struct BrokerInner {
    address: String,
    state: Mutex<BrokerState>,
    next_tag: AtomicU64,
    next_connection: AtomicU64,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct ChannelBroker {
    inner: Arc<BrokerInner>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    /// Create a broker reachable at [`DEFAULT_ADDRESS`].
    pub fn new() -> Self {
        Self::with_address(DEFAULT_ADDRESS)
    }

    /// Create a broker reachable at `address`.
    pub fn with_address(address: impl Into<String>) -> Self {
        let address = address.into();
        info!(address = %address, "Channel broker initialized");
        Self {
            inner: Arc::new(BrokerInner {
                address,
                state: Mutex::new(BrokerState {
                    available: true,
                    ..Default::default()
                }),
                next_tag: AtomicU64::new(0),
                next_connection: AtomicU64::new(0),
            }),
        }
    }

    /// The URL clients must connect to.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Refuse (`false`) or accept (`true`) new connections.
    pub fn set_available(&self, available: bool) {
        self.inner.state().available = available;
    }

    /// Drop every live connection as if the network failed.
    ///
    /// Persistent sessions keep their state; clean sessions are discarded.
    pub fn drop_connections(&self) {
        let mut state = self.inner.state();
        for session in state.sessions.values_mut() {
            if let Some(connection) = session.connection.take() {
                let _ = connection
                    .events
                    .send(SessionEvent::Lost("connection reset by broker".to_string()));
            }
        }
        state.sessions.retain(|_, s| s.persistent);
        debug!("Dropped all channel broker connections");
    }

    /// Number of clients with a live connection.
    pub fn connected_clients(&self) -> usize {
        self.inner
            .state()
            .sessions
            .values()
            .filter(|s| s.connection.is_some())
            .count()
    }

    /// Number of deliveries awaiting acknowledgment for `client_id`.
    pub fn unacked_count(&self, client_id: &str) -> usize {
        self.inner
            .state()
            .sessions
            .get(client_id)
            .map_or(0, |s| s.unacked.len())
    }
}

#[async_trait]
impl BrokerConnector for ChannelBroker {
    async fn connect(&self, url: &str, config: &ConnectionConfig) -> Result<Session> {
        let mut state = self.inner.state();
        if url != self.inner.address || !state.available {
            return Err(BusError::Connection(format!("connection refused: {}", url)));
        }

        let client_id = config.client_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1;

        let session = state.sessions.entry(client_id.clone()).or_default();
        if let Some(previous) = session.connection.take() {
            // Same client id: the newer connection takes over.
            let _ = previous
                .events
                .send(SessionEvent::Lost("session taken over".to_string()));
        }
        if config.clean_session {
            *session = ClientSession::default();
        }
        session.persistent = !config.clean_session;
        session.connection = Some(LiveConnection {
            id: connection_id,
            events: tx,
        });

        let resend: Vec<(u64, StoredMessage)> = session
            .unacked
            .iter()
            .map(|(tag, m)| (*tag, m.clone()))
            .collect();
        for (tag, message) in &resend {
            session.send(*tag, message, true);
        }

        debug!(
            client_id = %client_id,
            redelivered = resend.len(),
            "Channel broker accepted connection"
        );

        Ok(Session {
            client: Arc::new(ChannelClient {
                broker: Arc::clone(&self.inner),
                client_id,
                connection_id,
            }),
            events: rx,
        })
    }
}

/// One connection to a [`ChannelBroker`].
struct ChannelClient {
    broker: Arc<BrokerInner>,
    client_id: String,
    connection_id: u64,
}

impl ChannelClient {
    fn closed() -> BusError {
        BusError::Connection("connection closed".to_string())
    }
}

#[async_trait]
impl BrokerClient for ChannelClient {
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()> {
        validate_topic_filter(filter).map_err(|e| BusError::Subscribe(e.to_string()))?;

        let mut state = self.broker.state();
        let retained: Vec<StoredMessage> = state
            .retained
            .values()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect();

        let session = state
            .sessions
            .get_mut(&self.client_id)
            .filter(|s| s.is_live(self.connection_id))
            .ok_or_else(Self::closed)?;

        session.subscriptions.retain(|(f, _)| f != filter);
        session.subscriptions.push((filter.to_string(), qos));

        for mut message in retained {
            message.qos = message.qos.min(qos);
            message.message_id = session.message_id();
            let tag = self.broker.tag();
            if message.qos != QosLevel::AtMostOnce {
                session.unacked.insert(tag, message.clone());
            }
            session.send(tag, &message, false);
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        qos: QosLevel,
        retain: bool,
        payload: Bytes,
    ) -> Result<()> {
        validate_topic_name(topic).map_err(|e| BusError::Publish(e.to_string()))?;

        let mut state = self.broker.state();
        if !state
            .sessions
            .get(&self.client_id)
            .is_some_and(|s| s.is_live(self.connection_id))
        {
            return Err(Self::closed());
        }

        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(
                    topic.to_string(),
                    StoredMessage {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                        qos,
                        retained: true,
                        message_id: 0,
                    },
                );
            }
        }

        let mut routed = 0usize;
        for session in state.sessions.values_mut() {
            let Some(sub_qos) = session.matching_qos(topic) else {
                continue;
            };
            let message = StoredMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos: qos.min(sub_qos),
                retained: false,
                message_id: session.message_id(),
            };
            let tag = self.broker.tag();
            if message.qos != QosLevel::AtMostOnce {
                // Offline persistent sessions receive it on reconnect.
                session.unacked.insert(tag, message.clone());
            } else if session.connection.is_none() {
                continue;
            }
            session.send(tag, &message, false);
            routed += 1;
        }

        debug!(topic = %topic, receivers = routed, "Published to channel broker");
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.broker.state();
        let session = state
            .sessions
            .get_mut(&self.client_id)
            .filter(|s| s.is_live(self.connection_id))
            .ok_or_else(|| BusError::Ack("connection closed".to_string()))?;
        session.unacked.remove(&delivery.tag.value());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.broker.state();
        let Some(session) = state.sessions.get_mut(&self.client_id) else {
            return Ok(());
        };
        if !session.is_live(self.connection_id) {
            return Ok(());
        }
        if let Some(connection) = session.connection.take() {
            let _ = connection.events.send(SessionEvent::Closed);
        }
        if !session.persistent {
            state.sessions.remove(&self.client_id);
        }
        debug!(client_id = %self.client_id, "Channel broker connection closed");
        Ok(())
    }
}
