//! streambus-mqtt - MQTT adapters for stream pipelines
//!
//! An input that turns broker deliveries into pipeline messages and an
//! output that publishes pipeline messages to a broker topic, sharing one
//! connection lifecycle. Ships a rumqttc backend and an in-process channel
//! broker for tests.

pub mod bus;
pub mod config;
pub mod message;
pub mod utils;
