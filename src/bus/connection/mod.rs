//! Connection lifecycle shared by the input and output adapters.
//!
//! Wraps a broker's asynchronous connect/disconnect into blocking calls and
//! tracks whether the connection is usable. State lives in a `watch`
//! channel so every transition is atomic and wakes all waiters, which is how
//! a pending read or write learns that a close has started.
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!      ^                        |                  |
//!      +-------failure----------+<---lost----------+
//!
//! Disconnected/Connecting/Connected --close_async--> Closing --> Closed
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::{BrokerClient, BrokerConnector, BusError, Delivery, Result, Session, SessionEvent};
use crate::config::ConnectionConfig;

/// Connection state of one adapter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Error a read or write observes in this state.
    pub fn unusable_error(self) -> BusError {
        match self {
            ConnectionState::Closing | ConnectionState::Closed => BusError::Closed,
            _ => BusError::NotConnected,
        }
    }
}

/// Handle to the current session: its client and delivery buffer.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) client: Arc<dyn BrokerClient>,
    pub(crate) deliveries: Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>,
    generation: u64,
}

struct Shared {
    name: String,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
}

impl Shared {
    /// Move to `to` when the current state satisfies `from`.
    fn transition(&self, from: impl Fn(ConnectionState) -> bool, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if from(*state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Forget a session that ended on its own.
    async fn session_ended(&self, generation: u64, reason: Option<&str>) {
        let mut link = self.link.lock().await;
        if link.as_ref().map(|l| l.generation) != Some(generation) {
            return;
        }
        link.take();
        drop(link);

        let dropped = self.transition(
            |s| matches!(s, ConnectionState::Connected | ConnectionState::Connecting),
            ConnectionState::Disconnected,
        );
        if dropped {
            warn!(
                adapter = %self.name,
                reason = reason.unwrap_or("session ended"),
                "Broker connection lost"
            );
        }
    }

    async fn finish_close(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            if let Err(e) = link.client.disconnect().await {
                warn!(adapter = %self.name, error = %e, "Broker disconnect failed");
            }
        }
        self.state.send_replace(ConnectionState::Closed);
        info!(adapter = %self.name, "Closed");
    }
}

/// Owns the broker client handle and the connection state machine.
///
/// The raw client is never handed to callers; reads and writes borrow the
/// current [`Link`] and race every broker call against state changes.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn BrokerConnector>,
    shared: Arc<Shared>,
    generation: AtomicU64,
    connect_lock: Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    pub fn new(
        name: impl Into<String>,
        config: ConnectionConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            connector,
            shared: Arc::new(Shared {
                name: name.into(),
                state,
                link: Mutex::new(None),
            }),
            generation: AtomicU64::new(0),
            connect_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Connect to the first reachable endpoint and subscribe to `filters`.
    ///
    /// Returns immediately when already connected. On failure the state
    /// returns to `Disconnected` so a later call can try again.
    pub async fn connect(&self, filters: &[String]) -> Result<()> {
        let _serialized = self.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => return Err(BusError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }
        if !self.shared.transition(
            |s| s == ConnectionState::Disconnected,
            ConnectionState::Connecting,
        ) {
            return Err(self.state().unusable_error());
        }

        let session = match self
            .guard(ConnectionState::Connecting, self.open_session())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.shared.transition(
                    |s| s == ConnectionState::Connecting,
                    ConnectionState::Disconnected,
                );
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let client = Arc::clone(&session.client);
        self.install(session, generation).await?;

        for filter in filters {
            let subscribed = self
                .guard(
                    ConnectionState::Connecting,
                    client.subscribe(filter, self.config.qos),
                )
                .await;
            if let Err(e) = subscribed {
                self.abandon(generation).await;
                return Err(e);
            }
            debug!(adapter = %self.shared.name, filter = %filter, "Subscribed");
        }

        if self.shared.transition(
            |s| s == ConnectionState::Connecting,
            ConnectionState::Connected,
        ) {
            info!(
                adapter = %self.shared.name,
                client_id = %self.config.client_id,
                "Connected"
            );
            return Ok(());
        }

        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => Err(BusError::Closed),
            _ => Err(BusError::Connection(
                "connection lost while connecting".to_string(),
            )),
        }
    }

    /// Try every configured endpoint in order.
    async fn open_session(&self) -> Result<Session> {
        let mut failures = Vec::with_capacity(self.config.urls.len());
        for url in &self.config.urls {
            match self.connector.connect(url, &self.config).await {
                Ok(session) => {
                    debug!(adapter = %self.shared.name, url = %url, "Broker accepted connection");
                    return Ok(session);
                }
                Err(e) => {
                    debug!(adapter = %self.shared.name, url = %url, error = %e, "Endpoint unreachable");
                    failures.push(format!("{}: {}", url, e));
                }
            }
        }
        Err(BusError::Connection(failures.join("; ")))
    }

    /// Make `session` current and start pumping its events.
    async fn install(&self, session: Session, generation: u64) -> Result<()> {
        let Session { client, mut events } = session;
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut link = self.shared.link.lock().await;
            // A close that started while we were dialing owns the outcome.
            if self.state() != ConnectionState::Connecting {
                drop(link);
                let _ = client.disconnect().await;
                return Err(self.state().unusable_error());
            }
            *link = Some(Link {
                client,
                deliveries: Arc::new(Mutex::new(rx)),
                generation,
            });
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut reason = None;
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Delivery(delivery) => {
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    SessionEvent::Lost(why) => {
                        reason = Some(why);
                        break;
                    }
                    SessionEvent::Closed => break,
                }
            }
            shared.session_ended(generation, reason.as_deref()).await;
        });

        Ok(())
    }

    /// Tear down a session whose setup failed.
    async fn abandon(&self, generation: u64) {
        let link = {
            let mut link = self.shared.link.lock().await;
            if link.as_ref().map(|l| l.generation) == Some(generation) {
                link.take()
            } else {
                None
            }
        };
        if let Some(link) = link {
            let _ = link.client.disconnect().await;
        }
        self.shared.transition(
            |s| s == ConnectionState::Connecting,
            ConnectionState::Disconnected,
        );
    }

    /// Current link, or the error matching the state.
    pub(crate) async fn link(&self) -> Result<Link> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(state.unusable_error());
        }
        self.shared
            .link
            .lock()
            .await
            .clone()
            .ok_or_else(|| self.state().unusable_error())
    }

    /// Run `fut` while the state stays `expected`.
    ///
    /// Resolves with the state's error as soon as the state moves on, so a
    /// close never leaves a broker call hanging.
    pub async fn guard<T>(
        &self,
        expected: ConnectionState,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut state = self.shared.state.subscribe();
        tokio::pin!(fut);
        loop {
            let current = *state.borrow_and_update();
            if current != expected {
                return Err(current.unusable_error());
            }
            tokio::select! {
                biased;
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(BusError::Closed);
                    }
                }
                out = &mut fut => return out,
            }
        }
    }

    /// Begin closing. Never blocks and never fails.
    ///
    /// Disconnecting from the broker happens on a background task;
    /// `wait_for_close` observes its completion.
    pub fn close_async(&self) {
        let mut disconnect = false;
        self.shared.state.send_if_modified(|state| match *state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                *state = ConnectionState::Closing;
                disconnect = true;
                true
            }
            ConnectionState::Disconnected => {
                *state = ConnectionState::Closed;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        });

        if !disconnect {
            return;
        }

        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.finish_close().await });
            }
            Err(_) => {
                warn!(adapter = %shared.name, "No runtime available, closing without broker disconnect");
                if let Ok(mut link) = shared.link.try_lock() {
                    link.take();
                }
                shared.state.send_replace(ConnectionState::Closed);
            }
        }
    }

    /// Wait until the state reaches `Closed`.
    pub async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        let closed = async {
            state
                .wait_for(|s| *s == ConnectionState::Closed)
                .await
                .map(|_| ())
        };
        let outcome = tokio::time::timeout(timeout, closed).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests;
