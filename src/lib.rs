//! mqtt-mux - device-side MQTT connection multiplexer
//!
//! Sits between local application subscribers and a cloud MQTT broker:
//! many on-device subscriptions are multiplexed onto a dynamically sized
//! pool of broker connections, overlapping topic filters are consolidated
//! so the broker sees the minimum necessary set, and outbound publishes go
//! through a persistent spool drained by a publisher loop with retry,
//! in-flight flow control, and per-connection throttling.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mqtt_mux::{ConfigStore, DeviceConfig, InboundMessage, MqttClient, PublishRequest, QoS};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! mqtt_mux::observability::logging::init_default_logging();
//!
//! let config = ConfigStore::new(DeviceConfig {
//!     thing_name: "core-1".into(),
//!     iot_data_endpoint: "example-ats.iot.us-east-1.amazonaws.com".into(),
//!     certificate_path: Some("/greengrass/v2/thingCert.crt".into()),
//!     private_key_path: Some("/greengrass/v2/privKey.key".into()),
//!     ..Default::default()
//! });
//! let client = MqttClient::with_default_transport(config);
//!
//! client
//!     .subscribe(
//!         "devices/+/status",
//!         QoS::AtLeastOnce,
//!         Arc::new(|message: &InboundMessage| {
//!             println!("{}: {} bytes", message.topic, message.payload.len());
//!         }),
//!     )
//!     .await
//!     .unwrap();
//!
//! client
//!     .publish(PublishRequest::new("devices/core-1/status", b"online".to_vec(), QoS::AtLeastOnce))
//!     .await
//!     .unwrap();
//! # }
//! ```

pub mod client;
pub mod config;
pub(crate) mod connection;
pub mod error;
pub mod observability;
pub(crate) mod pool;
pub(crate) mod publisher;
pub(crate) mod reconfigure;
pub mod registry;
pub mod spool;
pub mod testing;
pub mod throttle;
pub mod topic;
pub mod transport;

pub use client::{ConnectivityEvent, MqttClient};
pub use connection::MAX_SUBSCRIPTIONS_PER_CONNECTION;
pub use config::{
    ConfigStore, DeviceConfig, MqttSection, ProxySection, PublishLimits, SpoolerSection,
};
pub use error::{PublishError, SubscribeError};
pub use registry::{LocalSubscription, MessageCallback};
pub use spool::{InMemorySpool, PublishRequest, Spool, SpoolConfig, SpoolError};
pub use topic::{TopicError, TopicFilter};
pub use transport::{InboundMessage, MqttTransport, QoS, TransportError, TransportFactory};
