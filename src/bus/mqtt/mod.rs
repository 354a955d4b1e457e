//! MQTT broker client backed by rumqttc.
//!
//! rumqttc splits a connection into an `AsyncClient` that queues requests
//! and an `EventLoop` that must be polled to make progress. One driver task
//! per session polls the event loop and turns broker confirmations back into
//! completions for the callers waiting on them:
//!
//! - publishes complete on `PubAck` (QoS 1), `PubComp` (QoS 2), or as soon
//!   as the packet leaves (QoS 0)
//! - subscribes complete on `SubAck`
//! - incoming publishes become [`SessionEvent::Delivery`] and are only
//!   acknowledged when the input asks for it (manual acks)
//!
//! Packet identifiers are assigned inside the event loop, so callers are
//! matched to them in the order their requests were queued.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use super::{
    BrokerClient, BrokerConnector, BusError, Delivery, DeliveryTag, Result, Session, SessionEvent,
};
use crate::config::{ConnectionConfig, QosLevel, TlsConfig};

/// Default plain-text MQTT port.
pub const DEFAULT_PORT: u16 = 1883;
/// Default MQTT-over-TLS port.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Default request queue depth between a client handle and its event loop.
const DEFAULT_CAPACITY: usize = 64;

// ============================================================================
// Endpoint parsing
// ============================================================================

/// Broker address extracted from a connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse a broker URL such as `tcp://host:1883` or `ssl://host`.
///
/// `tcp` and `mqtt` are plain connections; `ssl`, `tls` and `mqtts` use TLS.
/// A missing scheme means `tcp`.
pub fn parse_endpoint(url: &str) -> Result<Endpoint> {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("tcp".to_string(), url),
    };

    let tls = match scheme.as_str() {
        "tcp" | "mqtt" => false,
        "ssl" | "tls" | "mqtts" => true,
        other => {
            return Err(BusError::Connection(format!(
                "unsupported scheme '{}' in {}",
                other, url
            )))
        }
    };

    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| BusError::Connection(format!("unterminated IPv6 address in {}", url)))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(BusError::Connection(format!("missing host in {}", url)));
    }

    let port = match port {
        Some(port) => port
            .parse()
            .map_err(|_| BusError::Connection(format!("invalid port '{}' in {}", port, url)))?,
        None if tls => DEFAULT_TLS_PORT,
        None => DEFAULT_PORT,
    };

    Ok(Endpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

// ============================================================================
// Option building
// ============================================================================

fn to_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn from_qos(qos: QoS) -> QosLevel {
    match qos {
        QoS::AtMostOnce => QosLevel::AtMostOnce,
        QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}

async fn read_file(path: &str, what: &str) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| BusError::Connection(format!("failed to read {} '{}': {}", what, path, e)))
}

async fn tls_transport(tls: Option<&TlsConfig>) -> Result<Transport> {
    let Some(tls) = tls else {
        return Ok(Transport::tls_with_default_config());
    };

    let ca = match &tls.ca_file {
        Some(path) => read_file(path, "CA file").await?,
        None => return Ok(Transport::tls_with_default_config()),
    };

    let client_auth = match (&tls.client_cert_file, &tls.client_key_file) {
        (Some(cert), Some(key)) => Some((
            read_file(cert, "client certificate").await?,
            read_file(key, "client key").await?,
        )),
        _ => None,
    };

    Ok(Transport::Tls(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

/// Translate connection settings into rumqttc options for one endpoint.
pub async fn build_options(endpoint: &Endpoint, config: &ConnectionConfig) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(&config.client_id, &endpoint.host, endpoint.port);
    options
        .set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)))
        .set_clean_session(config.clean_session)
        .set_manual_acks(true);

    if let Some(credentials) = &config.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    if endpoint.tls || config.tls.is_some() {
        options.set_transport(tls_transport(config.tls.as_ref()).await?);
    }

    Ok(options)
}

// ============================================================================
// Completion tracking
// ============================================================================

struct Waiter {
    id: u64,
    qos: QosLevel,
    done: oneshot::Sender<Result<()>>,
}

impl Waiter {
    fn complete(self, result: Result<()>) {
        let _ = self.done.send(result);
    }
}

#[derive(Default)]
struct Tracker {
    next_id: u64,
    next_tag: u64,
    queued_publishes: VecDeque<Waiter>,
    inflight_publishes: HashMap<u16, Waiter>,
    queued_subscribes: VecDeque<Waiter>,
    inflight_subscribes: HashMap<u16, Waiter>,
    deliveries: HashMap<u64, Publish>,
    closing: bool,
    stopped: bool,
}

impl Tracker {
    fn enqueue(
        &mut self,
        subscribe: bool,
        qos: QosLevel,
    ) -> Result<(u64, oneshot::Receiver<Result<()>>)> {
        if self.stopped {
            return Err(BusError::NotConnected);
        }
        self.next_id += 1;
        let (done, rx) = oneshot::channel();
        let waiter = Waiter {
            id: self.next_id,
            qos,
            done,
        };
        if subscribe {
            self.queued_subscribes.push_back(waiter);
        } else {
            self.queued_publishes.push_back(waiter);
        }
        Ok((self.next_id, rx))
    }

    /// Drop a waiter whose request never reached the event loop.
    fn cancel(&mut self, id: u64) {
        self.queued_publishes.retain(|w| w.id != id);
        self.queued_subscribes.retain(|w| w.id != id);
    }

    fn publish_sent(&mut self, pkid: u16) {
        let Some(waiter) = self.queued_publishes.pop_front() else {
            return;
        };
        if waiter.qos == QosLevel::AtMostOnce {
            waiter.complete(Ok(()));
        } else {
            self.inflight_publishes.insert(pkid, waiter);
        }
    }

    fn publish_confirmed(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight_publishes.remove(&pkid) {
            waiter.complete(Ok(()));
        }
    }

    fn subscribe_sent(&mut self, pkid: u16) {
        if let Some(waiter) = self.queued_subscribes.pop_front() {
            self.inflight_subscribes.insert(pkid, waiter);
        }
    }

    fn subscribe_confirmed(&mut self, pkid: u16, codes: &[SubscribeReasonCode]) {
        let Some(waiter) = self.inflight_subscribes.remove(&pkid) else {
            return;
        };
        if codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
            waiter.complete(Err(BusError::Subscribe(
                "broker rejected subscription".to_string(),
            )));
        } else {
            waiter.complete(Ok(()));
        }
    }

    fn record_delivery(&mut self, publish: Publish) -> u64 {
        self.next_tag += 1;
        if publish.qos != QoS::AtMostOnce {
            self.deliveries.insert(self.next_tag, publish);
        }
        self.next_tag
    }

    /// Fail everything still waiting and refuse new requests.
    fn stop(&mut self) {
        self.stopped = true;
        let waiters = self
            .queued_publishes
            .drain(..)
            .chain(self.queued_subscribes.drain(..))
            .chain(self.inflight_publishes.drain().map(|(_, w)| w))
            .chain(self.inflight_subscribes.drain().map(|(_, w)| w));
        for waiter in waiters {
            waiter.complete(Err(BusError::NotConnected));
        }
        self.deliveries.clear();
    }
}

struct Shared {
    url: String,
    tracker: Mutex<Tracker>,
}

impl Shared {
    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens rumqttc sessions.
pub struct MqttConnector {
    capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttConnector {
    pub fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Set the request queue depth between client handle and event loop.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }
}

/// Poll until the broker answers the CONNECT packet.
async fn await_connack(eventloop: &mut EventLoop) -> std::result::Result<bool, String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(ack.session_present)
                } else {
                    Err(format!("connection refused: {:?}", ack.code))
                };
            }
            Ok(event) => trace!(?event, "Pre-ConnAck event"),
            Err(e) => return Err(e.to_string()),
        }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self, url: &str, config: &ConnectionConfig) -> Result<Session> {
        let endpoint = parse_endpoint(url)?;
        let options = build_options(&endpoint, config).await?;
        let (client, mut eventloop) = AsyncClient::new(options, self.capacity);

        let timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let session_present = tokio::time::timeout(timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| BusError::Connection(format!("no ConnAck within {:?}", timeout)))?
            .map_err(BusError::Connection)?;

        info!(
            url = %url,
            client_id = %config.client_id,
            session_present,
            "Connected to MQTT broker"
        );

        let shared = Arc::new(Shared {
            url: url.to_string(),
            tracker: Mutex::new(Tracker::default()),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = watch::channel(false);

        tokio::spawn(drive(eventloop, Arc::clone(&shared), events_tx, stopped_tx));

        Ok(Session {
            client: Arc::new(MqttClient {
                client,
                shared,
                send_lock: tokio::sync::Mutex::new(()),
                stopped: stopped_rx,
            }),
            events: events_rx,
        })
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Poll the event loop until the connection ends or nobody listens.
async fn drive(
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<SessionEvent>,
    stopped: watch::Sender<bool>,
) {
    loop {
        let polled = tokio::select! {
            biased;
            _ = events.closed() => {
                debug!(url = %shared.url, "Session dropped, stopping event loop");
                break;
            }
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let tag = shared.tracker().record_delivery(publish.clone());
                let delivery = Delivery {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: from_qos(publish.qos),
                    retained: publish.retain,
                    duplicate: publish.dup,
                    message_id: publish.pkid,
                    tag: DeliveryTag::new(tag),
                };
                if events.send(SessionEvent::Delivery(delivery)).is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                shared.tracker().publish_confirmed(ack.pkid);
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                shared.tracker().publish_confirmed(comp.pkid);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                shared.tracker().subscribe_confirmed(ack.pkid, &ack.return_codes);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(SessionEvent::Lost("broker sent DISCONNECT".to_string()));
                break;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                shared.tracker().publish_sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                shared.tracker().subscribe_sent(pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(url = %shared.url, "DISCONNECT sent");
                let _ = events.send(SessionEvent::Closed);
                break;
            }
            Ok(event) => trace!(?event, "MQTT event"),
            Err(e) => {
                let closing = shared.tracker().closing;
                let event = if closing {
                    SessionEvent::Closed
                } else {
                    warn!(url = %shared.url, error = %e, "MQTT event loop failed");
                    SessionEvent::Lost(e.to_string())
                };
                let _ = events.send(event);
                break;
            }
        }
    }

    shared.tracker().stop();
    stopped.send_replace(true);
}

// ============================================================================
// Client
// ============================================================================

/// Broker operations on one rumqttc session.
pub struct MqttClient {
    client: AsyncClient,
    shared: Arc<Shared>,
    /// Keeps waiter order identical to request order.
    send_lock: tokio::sync::Mutex<()>,
    stopped: watch::Receiver<bool>,
}

impl MqttClient {
    /// Queue a waiter, then the request, as one step.
    async fn request<F, Fut>(
        &self,
        subscribe: bool,
        qos: QosLevel,
        send: F,
    ) -> Result<oneshot::Receiver<Result<()>>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), rumqttc::ClientError>>,
    {
        let _order = self.send_lock.lock().await;
        let (id, rx) = self.shared.tracker().enqueue(subscribe, qos)?;
        let mut unsent = Unsent {
            shared: &self.shared,
            id,
            armed: true,
        };
        if let Err(e) = send().await {
            let reason = e.to_string();
            return Err(if subscribe {
                BusError::Subscribe(reason)
            } else {
                BusError::Publish(reason)
            });
        }
        unsent.armed = false;
        Ok(rx)
    }
}

/// Withdraws a queued waiter unless its request reached the event loop.
///
/// Covers both a failed send and a caller that gave up while the send was
/// still waiting for room in the request queue.
struct Unsent<'a> {
    shared: &'a Shared,
    id: u64,
    armed: bool,
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.tracker().cancel(self.id);
        }
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<()> {
        let rx = self
            .request(true, qos, || self.client.subscribe(filter, to_qos(qos)))
            .await?;
        rx.await.map_err(|_| BusError::NotConnected)??;
        debug!(filter = %filter, qos = qos.as_u8(), "Subscribed");
        Ok(())
    }

    async fn publish(&self, topic: &str, qos: QosLevel, retain: bool, payload: Bytes) -> Result<()> {
        let rx = self
            .request(false, qos, || {
                self.client.publish_bytes(topic, to_qos(qos), retain, payload)
            })
            .await?;
        rx.await.map_err(|_| BusError::NotConnected)?
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let publish = {
            let mut tracker = self.shared.tracker();
            if tracker.stopped {
                return Err(BusError::Ack("connection closed".to_string()));
            }
            tracker.deliveries.remove(&delivery.tag.value())
        };
        match publish {
            Some(publish) => self
                .client
                .ack(&publish)
                .await
                .map_err(|e| BusError::Ack(e.to_string())),
            // Nothing to send back for QoS 0.
            None if delivery.qos == QosLevel::AtMostOnce => Ok(()),
            None => Err(BusError::Ack(format!(
                "unknown delivery {}",
                delivery.tag.value()
            ))),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        if *self.stopped.borrow() {
            return Ok(());
        }
        self.shared.tracker().closing = true;

        if let Err(e) = self.client.disconnect().await {
            // The event loop is already gone.
            debug!(error = %e, "Disconnect request not delivered");
            return Ok(());
        }

        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|s| *s).await;
        Ok(())
    }
}
