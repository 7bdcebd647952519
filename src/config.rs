//! Device configuration: typed MQTT options, identity paths, and a
//! change-notification stream.
//!
//! Configuration is loaded from TOML. Every recognized MQTT option has a
//! default so a minimal file (or none at all) still yields a working
//! client. Mutations go through [`ConfigStore::update`], which applies the
//! change and broadcasts a [`ConfigChange`] naming the modified node so the
//! reconfiguration controller can decide whether a reconnect is required.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// IoT Core limit on unacknowledged QoS 1 publishes per connection.
pub const IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES: u32 = 100;
/// MQTT spec limit on message size.
pub const MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES: usize = 256 * 1024 * 1024;
/// IoT Core limit on message size.
pub const DEFAULT_MQTT_MAX_OF_MESSAGE_SIZE_IN_BYTES: usize = 128 * 1024;
pub const DEFAULT_MQTT_MAX_OF_PUBLISH_RETRY_COUNT: i64 = 100;

// Configuration tree nodes watched by the reconfiguration controller.
pub const NODE_MQTT_NAMESPACE: &str = "mqtt";
pub const NODE_THING_NAME: &str = "system.thingName";
pub const NODE_IOT_DATA_ENDPOINT: &str = "system.iotDataEndpoint";
pub const NODE_PRIVATE_KEY_PATH: &str = "system.privateKeyPath";
pub const NODE_CERTIFICATE_FILE_PATH: &str = "system.certificateFilePath";
pub const NODE_ROOT_CA_PATH: &str = "system.rootCaPath";
pub const NODE_AWS_REGION: &str = "system.awsRegion";

/// MQTT client options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,
    /// Maximum concurrently in-flight publishes, clamped to the IoT Core
    /// limit of 100.
    #[serde(default = "default_max_in_flight_publishes")]
    pub max_in_flight_publishes: u32,
    /// Maximum publish payload size, clamped to the MQTT spec limit.
    #[serde(default = "default_max_message_size_in_bytes")]
    pub max_message_size_in_bytes: usize,
    /// Publish retry bound; -1 retries forever.
    #[serde(default = "default_max_publish_retry")]
    pub max_publish_retry: i64,
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}
fn default_keep_alive_timeout_ms() -> u64 {
    60_000
}
fn default_ping_timeout_ms() -> u64 {
    30_000
}
fn default_socket_timeout_ms() -> u64 {
    3_000
}
fn default_port() -> u16 {
    8883
}
fn default_thread_pool_size() -> usize {
    1
}
fn default_max_in_flight_publishes() -> u32 {
    5
}
fn default_max_message_size_in_bytes() -> usize {
    DEFAULT_MQTT_MAX_OF_MESSAGE_SIZE_IN_BYTES
}
fn default_max_publish_retry() -> i64 {
    DEFAULT_MQTT_MAX_OF_PUBLISH_RETRY_COUNT
}

impl Default for MqttSection {
    fn default() -> Self {
        MqttSection {
            operation_timeout_ms: default_operation_timeout_ms(),
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            port: default_port(),
            thread_pool_size: default_thread_pool_size(),
            max_in_flight_publishes: default_max_in_flight_publishes(),
            max_message_size_in_bytes: default_max_message_size_in_bytes(),
            max_publish_retry: default_max_publish_retry(),
        }
    }
}

/// Where spooled publishes are kept.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpoolStorageType {
    Memory,
    Disk,
}

/// Spooler options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpoolerSection {
    #[serde(default)]
    pub keep_qos0_when_offline: bool,
    #[serde(default = "default_spool_size_in_bytes")]
    pub spool_size_in_bytes: usize,
    #[serde(default = "default_storage_type")]
    pub storage_type: SpoolStorageType,
}

fn default_spool_size_in_bytes() -> usize {
    2_621_440 // 2.5 MB
}
fn default_storage_type() -> SpoolStorageType {
    SpoolStorageType::Memory
}

impl Default for SpoolerSection {
    fn default() -> Self {
        SpoolerSection {
            keep_qos0_when_offline: false,
            spool_size_in_bytes: default_spool_size_in_bytes(),
            storage_type: default_storage_type(),
        }
    }
}

/// Network proxy between the device and the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxySection {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Full device configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub thing_name: String,
    #[serde(default)]
    pub iot_data_endpoint: String,
    #[serde(default)]
    pub aws_region: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub certificate_path: Option<PathBuf>,
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,
    #[serde(default)]
    pub proxy: Option<ProxySection>,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub spooler: SpoolerSection,
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// What happened to a configuration node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Changed,
    ChildChanged,
    TimestampUpdated,
    InteriorAdded,
    Removed,
}

/// A change event naming the modified node by its dotted path.
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub kind: ChangeKind,
    pub node: String,
}

impl ConfigChange {
    /// True when the changed node is `prefix` itself or a descendant of it.
    pub fn node_child_of(&self, prefix: &str) -> bool {
        self.node == prefix || self.node.starts_with(&format!("{prefix}."))
    }
}

/// Shared handle to the device configuration plus its change stream.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<ConfigStoreInner>,
}

struct ConfigStoreInner {
    config: RwLock<DeviceConfig>,
    changes: broadcast::Sender<ConfigChange>,
}

impl ConfigStore {
    pub fn new(config: DeviceConfig) -> Self {
        let (changes, _) = broadcast::channel(64);
        ConfigStore {
            inner: Arc::new(ConfigStoreInner {
                config: RwLock::new(config),
                changes,
            }),
        }
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DeviceConfig = toml::from_str(&content)?;
        Ok(ConfigStore::new(config))
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> DeviceConfig {
        self.inner.config.read().unwrap().clone()
    }

    pub fn mqtt(&self) -> MqttSection {
        self.inner.config.read().unwrap().mqtt.clone()
    }

    pub fn spooler(&self) -> SpoolerSection {
        self.inner.config.read().unwrap().spooler.clone()
    }

    pub fn operation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.mqtt().operation_timeout_ms)
    }

    /// The device can reach the cloud only when its identity and endpoint
    /// are configured.
    pub fn is_configured_to_talk_to_cloud(&self) -> bool {
        let config = self.inner.config.read().unwrap();
        !config.thing_name.is_empty()
            && !config.iot_data_endpoint.is_empty()
            && config.certificate_path.is_some()
            && config.private_key_path.is_some()
    }

    pub fn is_proxy_configured(&self) -> bool {
        self.inner.config.read().unwrap().proxy.is_some()
    }

    /// Apply a mutation and broadcast the change event for `node`.
    pub fn update(&self, kind: ChangeKind, node: &str, apply: impl FnOnce(&mut DeviceConfig)) {
        {
            let mut config = self.inner.config.write().unwrap();
            apply(&mut config);
        }
        let _ = self.inner.changes.send(ConfigChange {
            kind,
            node: node.to_string(),
        });
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ConfigChange> {
        self.inner.changes.subscribe()
    }
}

/// Validated publish limits, re-derived on every reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishLimits {
    pub max_in_flight: u32,
    pub max_message_size: usize,
    pub max_retry: i64,
}

impl PublishLimits {
    pub fn from_config(mqtt: &MqttSection) -> Self {
        let mut max_in_flight = mqtt.max_in_flight_publishes;
        if max_in_flight > IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES {
            warn!(
                configured = max_in_flight,
                limit = IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES,
                "maxInFlightPublishes exceeds the IoT Core limit on unacknowledged \
                 QoS 1 publishes; clamping to the maximum allowed setting"
            );
            max_in_flight = IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES;
        }

        let mut max_message_size = mqtt.max_message_size_in_bytes;
        if max_message_size > MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES {
            warn!(
                configured = max_message_size,
                limit = MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES,
                "maxMessageSizeInBytes exceeds the MQTT limit; clamping to the \
                 maximum allowed setting"
            );
            max_message_size = MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES;
        }

        PublishLimits {
            max_in_flight,
            max_message_size,
            max_retry: mqtt.max_publish_retry,
        }
    }

    pub fn retries_unlimited(&self) -> bool {
        self.max_retry == -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_uses_defaults() {
        let config: DeviceConfig = toml::from_str(
            r#"
thing_name = "core-1"
iot_data_endpoint = "example-ats.iot.us-east-1.amazonaws.com"
"#,
        )
        .unwrap();

        assert_eq!(config.mqtt.operation_timeout_ms, 30_000);
        assert_eq!(config.mqtt.keep_alive_timeout_ms, 60_000);
        assert_eq!(config.mqtt.ping_timeout_ms, 30_000);
        assert_eq!(config.mqtt.socket_timeout_ms, 3_000);
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.thread_pool_size, 1);
        assert_eq!(config.mqtt.max_in_flight_publishes, 5);
        assert_eq!(config.mqtt.max_message_size_in_bytes, 131_072);
        assert_eq!(config.mqtt.max_publish_retry, 100);
        assert!(!config.spooler.keep_qos0_when_offline);
        assert_eq!(config.spooler.storage_type, SpoolStorageType::Memory);
    }

    #[test]
    fn full_toml_parses_every_section() {
        let config: DeviceConfig = toml::from_str(
            r#"
thing_name = "core-1"
iot_data_endpoint = "example-ats.iot.us-east-1.amazonaws.com"
aws_region = "us-east-1"
private_key_path = "/greengrass/v2/privKey.key"
certificate_path = "/greengrass/v2/thingCert.crt"
root_ca_path = "/greengrass/v2/rootCA.pem"

[proxy]
url = "http://proxy.example.com:3128"

[mqtt]
operation_timeout_ms = 5000
max_in_flight_publishes = 20

[spooler]
keep_qos0_when_offline = true
storage_type = "disk"
"#,
        )
        .unwrap();

        assert_eq!(config.mqtt.operation_timeout_ms, 5000);
        assert_eq!(config.mqtt.max_in_flight_publishes, 20);
        // Unspecified options still default.
        assert_eq!(config.mqtt.port, 8883);
        assert!(config.spooler.keep_qos0_when_offline);
        assert_eq!(config.spooler.storage_type, SpoolStorageType::Disk);
        assert!(config.proxy.is_some());
    }

    #[test]
    fn publish_limits_clamp_to_broker_maximums() {
        let mqtt = MqttSection {
            max_in_flight_publishes: 500,
            max_message_size_in_bytes: MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES + 1,
            ..Default::default()
        };
        let limits = PublishLimits::from_config(&mqtt);
        assert_eq!(
            limits.max_in_flight,
            IOT_MAX_LIMIT_IN_FLIGHT_OF_QOS1_PUBLISHES
        );
        assert_eq!(
            limits.max_message_size,
            MQTT_MAX_LIMIT_OF_MESSAGE_SIZE_IN_BYTES
        );
    }

    #[test]
    fn unlimited_retry_sentinel() {
        let mqtt = MqttSection {
            max_publish_retry: -1,
            ..Default::default()
        };
        assert!(PublishLimits::from_config(&mqtt).retries_unlimited());
    }

    #[test]
    fn cloud_configuration_requires_identity_and_endpoint() {
        let store = ConfigStore::new(DeviceConfig::default());
        assert!(!store.is_configured_to_talk_to_cloud());

        let store = ConfigStore::new(DeviceConfig {
            thing_name: "core-1".into(),
            iot_data_endpoint: "endpoint".into(),
            certificate_path: Some("/cert".into()),
            private_key_path: Some("/key".into()),
            ..Default::default()
        });
        assert!(store.is_configured_to_talk_to_cloud());
    }

    #[test]
    fn updates_broadcast_the_changed_node() {
        let store = ConfigStore::new(DeviceConfig::default());
        let mut rx = store.subscribe_changes();

        store.update(ChangeKind::Changed, "mqtt.operationTimeoutMs", |c| {
            c.mqtt.operation_timeout_ms = 1000;
        });

        let change = rx.try_recv().unwrap();
        assert_eq!(change.kind, ChangeKind::Changed);
        assert!(change.node_child_of(NODE_MQTT_NAMESPACE));
        assert_eq!(store.mqtt().operation_timeout_ms, 1000);
    }

    #[test]
    fn node_child_of_matches_descendants_only() {
        let change = ConfigChange {
            kind: ChangeKind::Changed,
            node: "system.thingName".into(),
        };
        assert!(change.node_child_of(NODE_THING_NAME));
        assert!(change.node_child_of("system"));
        assert!(!change.node_child_of("system.thing"));
        assert!(!change.node_child_of(NODE_MQTT_NAMESPACE));
    }
}
