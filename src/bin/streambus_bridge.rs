//! streambus-bridge: MQTT to MQTT relay
//!
//! Reads from the configured input topics and republishes every message on
//! the output topic. Input deliveries are only acknowledged after the write
//! succeeded, so a failed write leaves the message with the broker.
//!
//! ## Architecture
//! ```text
//! [broker A] --(subscribe)--> [MqttInput] --> [MqttOutput] --(publish)--> [broker B]
//! ```
//!
//! ## Configuration
//! - First argument: path to a YAML config file (optional)
//! - STREAMBUS_CONFIG: alternative config file path
//! - STREAMBUS__INPUT__URLS, STREAMBUS__OUTPUT__TOPIC, ...: overrides
//! - STREAMBUS_LOG: tracing filter (default: info)

use std::time::Duration;

use tracing::{error, info, warn};

use streambus_mqtt::bus::{
    connect_with_backoff, BusError, Input, MqttInput, MqttOutput, Output,
};
use streambus_mqtt::config::BridgeConfig;
use streambus_mqtt::utils::bootstrap::init_tracing;
use streambus_mqtt::utils::retry::connection_backoff;

/// Relay messages until a read or write finds the connection unusable.
async fn relay(input: &dyn Input, output: &dyn Output) -> BusError {
    let mut relayed = 0u64;
    loop {
        let msg = match input.read().await {
            Ok(msg) => msg,
            Err(e) => return e,
        };

        let written = output.write(&msg).await;
        let acked = match &written {
            Ok(()) => input.acknowledge(None).await,
            Err(e) => {
                warn!(error = %e, parts = msg.len(), "Write failed, leaving delivery unacknowledged");
                input.acknowledge(Some(e)).await
            }
        };
        if let Err(e) = acked {
            return e;
        }

        match written {
            Ok(()) => {
                relayed += 1;
                if relayed % 1000 == 0 {
                    info!(relayed, "Relay progress");
                }
            }
            Err(e @ (BusError::Closed | BusError::NotConnected)) => return e,
            Err(_) => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = BridgeConfig::load(path.as_deref())?;
    let shutdown_timeout = Duration::from_secs(config.shutdown_timeout_secs);

    let input = MqttInput::mqtt(config.input)?;
    let output = MqttOutput::mqtt(config.output)?;

    info!(
        topics = ?input.config().topics,
        output_topic = %output.config().topic,
        "streambus-bridge starting"
    );

    connect_with_backoff("input", connection_backoff(), || input.connect()).await?;
    connect_with_backoff("output", connection_backoff(), || output.connect()).await?;

    let outcome = tokio::select! {
        e = relay(&input, &output) => Some(e),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        None => info!("Shutdown signal received"),
        Some(e) => error!(error = %e, "Relay stopped"),
    }

    input.close_async();
    output.close_async();
    let (input_closed, output_closed) = tokio::join!(
        input.wait_for_close(shutdown_timeout),
        output.wait_for_close(shutdown_timeout),
    );
    input_closed?;
    output_closed?;

    info!("streambus-bridge stopped");
    Ok(())
}
