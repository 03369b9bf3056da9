//! # Broker Module
//!
//! Message broker adapters implementing `core::BrokerPublisher`.
//!
//! ## Contained Modules:
//! - **`mqtt`**: acknowledged MQTT publishing over `rumqttc`.
//! - **`topic`**: Canary path ↔ MQTT topic conversion and publish topic checks.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Acknowledged MQTT publisher.
pub mod mqtt;
pub mod topic;

pub use mqtt::{ack_qos, publish_packet_size, MqttPublisher, MqttPublisherOptions};
pub use rumqttc::QoS;
pub use topic::{from_canary_path, to_canary_path, validate_publish_topic};
