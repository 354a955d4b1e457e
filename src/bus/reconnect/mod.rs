//! Opt-in reconnection on top of the adapters.
//!
//! [`MqttInput`](super::MqttInput) and [`MqttOutput`](super::MqttOutput)
//! report a lost connection as `NotConnected` and leave recovery to the
//! caller. The wrappers here are that caller: they reconnect with
//! exponential backoff and retry the failed operation once. `Closed` is
//! terminal and passes straight through.
//!
//! A retried write republishes the whole message, so parts published before
//! the connection dropped can arrive twice.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tracing::{info, warn};

use super::{BatchError, BusError, Input, Output, Result};
use crate::message::Message;
use crate::utils::retry::reconnect_backoff;

/// Run `connect` until it succeeds, backing off between retryable failures.
///
/// Gives up immediately on errors that reconnecting cannot clear (see
/// [`BusError::is_retryable`]) and returns the last error once the backoff
/// runs out.
pub async fn connect_with_backoff<F, Fut>(
    name: &str,
    backoff: ExponentialBuilder,
    connect: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    connect
        .retry(backoff)
        .when(BusError::is_retryable)
        .notify(|err: &BusError, dur: Duration| {
            warn!(adapter = %name, error = %err, delay = ?dur, "Connection failed, retrying");
        })
        .await?;
    info!(adapter = %name, "Connected");
    Ok(())
}

/// Input that reconnects when a read finds the connection gone.
pub struct ReconnectingInput<I> {
    inner: I,
    backoff: ExponentialBuilder,
}

impl<I: Input> ReconnectingInput<I> {
    pub fn new(inner: I) -> Self {
        Self::with_backoff(inner, reconnect_backoff())
    }

    pub fn with_backoff(inner: I, backoff: ExponentialBuilder) -> Self {
        Self { inner, backoff }
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

#[async_trait]
impl<I: Input> Input for ReconnectingInput<I> {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn read(&self) -> Result<Message> {
        match self.inner.read().await {
            Err(BusError::NotConnected) => {
                connect_with_backoff("input", self.backoff.clone(), || self.inner.connect())
                    .await?;
                self.inner.read().await
            }
            other => other,
        }
    }

    async fn acknowledge(&self, batch_err: BatchError<'_>) -> Result<()> {
        self.inner.acknowledge(batch_err).await
    }

    fn close_async(&self) {
        self.inner.close_async();
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        self.inner.wait_for_close(timeout).await
    }
}

/// Output that reconnects when a write finds the connection gone.
pub struct ReconnectingOutput<O> {
    inner: O,
    backoff: ExponentialBuilder,
}

impl<O: Output> ReconnectingOutput<O> {
    pub fn new(inner: O) -> Self {
        Self::with_backoff(inner, reconnect_backoff())
    }

    pub fn with_backoff(inner: O, backoff: ExponentialBuilder) -> Self {
        Self { inner, backoff }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }
}

#[async_trait]
impl<O: Output> Output for ReconnectingOutput<O> {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn write(&self, msg: &Message) -> Result<()> {
        match self.inner.write(msg).await {
            Err(BusError::NotConnected) => {
                connect_with_backoff("output", self.backoff.clone(), || self.inner.connect())
                    .await?;
                self.inner.write(msg).await
            }
            other => other,
        }
    }

    fn close_async(&self) {
        self.inner.close_async();
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        self.inner.wait_for_close(timeout).await
    }
}

#[cfg(test)]
mod tests;
