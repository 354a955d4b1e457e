use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bus::channel::{ChannelBroker, DEFAULT_ADDRESS};
use crate::bus::{ConnectionState, MqttInput, MqttOutput};
use crate::config::{MqttInputConfig, MqttOutputConfig};

const TOPIC: &str = "reconnect_topic";

fn fast_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
        .with_max_times(50)
}

async fn wait_for_state(state: impl Fn() -> ConnectionState, expected: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while state() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("state never reached");
}

#[tokio::test]
async fn test_connect_with_backoff_retries_until_available() {
    let broker = ChannelBroker::new();
    broker.set_available(false);
    let output = MqttOutput::new(
        MqttOutputConfig::new([DEFAULT_ADDRESS], TOPIC),
        Arc::new(broker.clone()),
    )
    .unwrap();

    let restore = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            broker.set_available(true);
        })
    };

    connect_with_backoff("output", fast_backoff(), || output.connect())
        .await
        .unwrap();
    restore.await.unwrap();

    assert_eq!(output.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_connect_with_backoff_stops_on_closed() {
    let attempts = AtomicUsize::new(0);

    let result = connect_with_backoff("test", fast_backoff(), || {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(BusError::Closed) }
    })
    .await;

    assert!(matches!(result, Err(BusError::Closed)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connect_with_backoff_gives_up() {
    let attempts = AtomicUsize::new(0);
    let backoff = fast_backoff().with_max_times(3);

    let result = connect_with_backoff("test", backoff, || {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(BusError::Connection("refused".to_string())) }
    })
    .await;

    assert!(matches!(result, Err(BusError::Connection(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_reconnecting_output_recovers_from_loss() {
    let broker = ChannelBroker::new();
    let output = ReconnectingOutput::with_backoff(
        MqttOutput::new(
            MqttOutputConfig::new([DEFAULT_ADDRESS], TOPIC).with_client_id("writer"),
            Arc::new(broker.clone()),
        )
        .unwrap(),
        fast_backoff(),
    );
    output.connect().await.unwrap();

    broker.drop_connections();
    wait_for_state(|| output.inner().state(), ConnectionState::Disconnected).await;

    output.write(&Message::new(vec!["after loss"])).await.unwrap();
    assert_eq!(output.inner().state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_reconnecting_input_recovers_from_loss() {
    let broker = ChannelBroker::new();
    let input = Arc::new(ReconnectingInput::with_backoff(
        MqttInput::new(
            MqttInputConfig::new([DEFAULT_ADDRESS], [TOPIC]).with_client_id("reader"),
            Arc::new(broker.clone()),
        )
        .unwrap(),
        fast_backoff(),
    ));
    input.connect().await.unwrap();

    broker.drop_connections();
    wait_for_state(|| input.inner().state(), ConnectionState::Disconnected).await;

    let reader = {
        let input = Arc::clone(&input);
        tokio::spawn(async move { input.read().await })
    };
    wait_for_state(|| input.inner().state(), ConnectionState::Connected).await;

    let output = MqttOutput::new(
        MqttOutputConfig::new([DEFAULT_ADDRESS], TOPIC).with_client_id("writer"),
        Arc::new(broker.clone()),
    )
    .unwrap();
    output.connect().await.unwrap();
    output.write(&Message::new(vec!["resumed"])).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("read never completed")
        .unwrap()
        .unwrap();
    assert_eq!(msg.part(0).payload().as_ref(), b"resumed");
    input.acknowledge(None).await.unwrap();
}

#[tokio::test]
async fn test_reconnecting_input_does_not_retry_after_close() {
    let broker = ChannelBroker::new();
    let input = ReconnectingInput::with_backoff(
        MqttInput::new(
            MqttInputConfig::new([DEFAULT_ADDRESS], [TOPIC]),
            Arc::new(broker.clone()),
        )
        .unwrap(),
        fast_backoff(),
    );
    input.connect().await.unwrap();

    input.close_async();
    input.wait_for_close(Duration::from_secs(1)).await.unwrap();

    assert!(matches!(input.read().await, Err(BusError::Closed)));
    assert_eq!(broker.connected_clients(), 0);
}
