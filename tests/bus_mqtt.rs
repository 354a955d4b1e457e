//! MQTT adapter integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_mqtt --features container-tests -- --nocapture
//!
//! These tests spin up Mosquitto in a container using testcontainers-rs.
//! No manual broker setup required.

use std::sync::Arc;
use std::time::Duration;

use streambus_mqtt::bus::{
    BusError, ConnectionState, Input, MqttInput, MqttOutput, Output, META_TOPIC,
};
use streambus_mqtt::config::{MqttInputConfig, MqttOutputConfig, QosLevel};
use streambus_mqtt::message::{Message, Metadata, Part};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start Mosquitto container.
///
/// Returns (container, broker_url) where broker_url is suitable for MQTT connection.
async fn start_mosquitto() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    // 1.6 still allows anonymous clients on the default listener.
    let image = GenericImage::new("eclipse-mosquitto", "1.6")
        .with_exposed_port(1883.tcp())
        .with_wait_for(WaitFor::message_on_stderr("Opening ipv4 listen socket"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start mosquitto container");

    let host_port = container
        .get_host_port_ipv4(1883)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("tcp://{}:{}", host, host_port);

    println!("Mosquitto available at: {}", url);

    (container, url)
}

async fn connected_pair(url: &str, topic: &str) -> (MqttInput, MqttOutput) {
    let input = MqttInput::mqtt(
        MqttInputConfig::new([url], [topic]).with_client_id(format!("in-{}", uuid::Uuid::new_v4())),
    )
    .expect("valid input config");
    let output = MqttOutput::mqtt(
        MqttOutputConfig::new([url], topic).with_client_id(format!("out-{}", uuid::Uuid::new_v4())),
    )
    .expect("valid output config");

    input.connect().await.expect("Failed to connect input");
    output.connect().await.expect("Failed to connect output");
    (input, output)
}

async fn read(input: &MqttInput) -> Message {
    tokio::time::timeout(Duration::from_secs(5), input.read())
        .await
        .expect("Timed out waiting for message")
        .expect("Read failed")
}

#[tokio::test]
async fn test_single_part_round_trip() {
    println!("=== MQTT Single Part Round Trip Test ===");

    let (_container, url) = start_mosquitto().await;
    let (input, output) = connected_pair(&url, "test_input_1").await;

    output
        .write(&Message::new(vec!["hello world"]))
        .await
        .expect("Failed to write");

    let msg = read(&input).await;
    assert_eq!(msg.len(), 1);
    assert_eq!(msg.part(0).payload().as_ref(), b"hello world");
    assert_eq!(msg.part(0).metadata().get(META_TOPIC), Some("test_input_1"));
    input.acknowledge(None).await.expect("Failed to acknowledge");

    println!("=== Test PASSED ===");
}

#[tokio::test]
async fn test_multipart_fan_out() {
    println!("=== MQTT Multipart Fan-out Test ===");

    let (_container, url) = start_mosquitto().await;
    let (input, output) = connected_pair(&url, "test_input_1").await;

    let parts = (0..3)
        .map(|i| {
            let mut metadata = Metadata::new();
            metadata.set("foo", "bar").set("root_foo", "bar2");
            Part::with_metadata(format!("hello world: {}", i), metadata)
        })
        .collect();
    output
        .write(&Message::from_parts(parts))
        .await
        .expect("Failed to write");

    for i in 0..3 {
        let msg = read(&input).await;
        assert_eq!(msg.len(), 1);
        let part = msg.part(0);
        assert_eq!(part.payload().as_ref(), format!("hello world: {}", i).as_bytes());
        assert_eq!(part.metadata().get("foo"), None);
        assert_eq!(part.metadata().get("root_foo"), None);
        input.acknowledge(None).await.expect("Failed to acknowledge");
    }

    println!("=== Test PASSED ===");
}

#[tokio::test]
async fn test_exactly_once_publish() {
    let (_container, url) = start_mosquitto().await;
    let input = MqttInput::mqtt(
        MqttInputConfig::new([url.as_str()], ["qos2"]).with_qos(QosLevel::ExactlyOnce),
    )
    .unwrap();
    let output = MqttOutput::mqtt(
        MqttOutputConfig::new([url.as_str()], "qos2").with_qos(QosLevel::ExactlyOnce),
    )
    .unwrap();
    input.connect().await.unwrap();
    output.connect().await.unwrap();

    output.write(&Message::new(vec!["once"])).await.unwrap();

    let msg = read(&input).await;
    assert_eq!(msg.part(0).payload().as_ref(), b"once");
    input.acknowledge(None).await.unwrap();
}

#[tokio::test]
async fn test_disconnect() {
    println!("=== MQTT Disconnect Test ===");

    let (_container, url) = start_mosquitto().await;
    let (input, output) = connected_pair(&url, "test_input_1").await;
    let input = Arc::new(input);

    let reader = {
        let input = Arc::clone(&input);
        tokio::spawn(async move { input.read().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    input.close_async();
    output.close_async();
    input
        .wait_for_close(Duration::from_secs(5))
        .await
        .expect("Input did not close");
    output
        .wait_for_close(Duration::from_secs(5))
        .await
        .expect("Output did not close");

    let result = tokio::time::timeout(Duration::from_secs(1), reader)
        .await
        .expect("Read stayed blocked after close")
        .unwrap();
    assert!(matches!(
        result,
        Err(BusError::Closed) | Err(BusError::NotConnected)
    ));
    assert_eq!(input.state(), ConnectionState::Closed);
    assert!(matches!(
        output.write(&Message::new(vec!["late"])).await,
        Err(BusError::Closed)
    ));

    println!("=== Test PASSED ===");
}

#[tokio::test]
async fn test_unreachable_broker() {
    let input = MqttInput::mqtt(MqttInputConfig::new(["tcp://127.0.0.1:1"], ["t"])).unwrap();

    let result = input.connect().await;

    assert!(matches!(result, Err(BusError::Connection(_))));
    assert_eq!(input.state(), ConnectionState::Disconnected);
}
