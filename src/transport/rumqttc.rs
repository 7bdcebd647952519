//! rumqttc-backed transport.
//!
//! Each pool connection owns one rumqttc client and event-loop task. The
//! event loop routes broker packets into the shared [`ClientEvent`] channel:
//! CONNACK becomes `Resumed`, connection errors become `Interrupted`, and
//! PUBLISH packets become `Message`s. TLS material comes from the device
//! identity paths, with the root CA read through the shared proxy TLS
//! context so a reconfiguration swap is picked up by the next connect.

use super::{
    ClientEvent, ClientEventKind, InboundMessage, MqttTransport, ProxyTlsContext, QoS,
    TransportError, TransportFactory,
};
use crate::config::{ConfigStore, DeviceConfig};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};
use rumqttc::{TlsConfiguration, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

const EVENT_LOOP_CHANNEL_CAPACITY: usize = 10;
const EVENT_LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Produces [`RumqttcTransport`]s configured from the device config.
pub struct RumqttcTransportFactory {
    config: ConfigStore,
    proxy_tls: Arc<Mutex<ProxyTlsContext>>,
}

impl RumqttcTransportFactory {
    pub fn new(config: ConfigStore, proxy_tls: Arc<Mutex<ProxyTlsContext>>) -> Self {
        RumqttcTransportFactory { config, proxy_tls }
    }
}

impl TransportFactory for RumqttcTransportFactory {
    fn create(
        &self,
        connection_id: u64,
        client_id: &str,
        events: mpsc::Sender<ClientEvent>,
    ) -> Arc<dyn MqttTransport> {
        Arc::new(RumqttcTransport {
            config: self.config.clone(),
            proxy_tls: self.proxy_tls.clone(),
            connection_id,
            client_id: client_id.to_string(),
            events,
            active: tokio::sync::Mutex::new(None),
        })
    }
}

struct ActiveConnection {
    client: AsyncClient,
    poller: JoinHandle<()>,
}

pub struct RumqttcTransport {
    config: ConfigStore,
    proxy_tls: Arc<Mutex<ProxyTlsContext>>,
    connection_id: u64,
    client_id: String,
    events: mpsc::Sender<ClientEvent>,
    active: tokio::sync::Mutex<Option<ActiveConnection>>,
}

/// Endpoint may be a bare hostname, `host:port`, or a URL.
fn parse_endpoint(endpoint: &str, default_port: u16) -> (String, u16) {
    if endpoint.contains("://") {
        if let Ok(url) = url::Url::parse(endpoint) {
            if let Some(host) = url.host_str() {
                return (host.to_string(), url.port().unwrap_or(default_port));
            }
        }
    }
    if let Some((host, port)) = endpoint.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return (host.to_string(), port);
        }
    }
    (endpoint.to_string(), default_port)
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
    }
}

impl RumqttcTransport {
    fn build_options(&self) -> Result<MqttOptions, TransportError> {
        let config = self.config.get();
        if config.iot_data_endpoint.is_empty() {
            return Err(TransportError::ConnectionFailed(
                "no IoT data endpoint configured".to_string(),
            ));
        }

        let (host, port) = parse_endpoint(&config.iot_data_endpoint, config.mqtt.port);
        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options.set_clean_start(false);
        options.set_keep_alive(Duration::from_millis(config.mqtt.keep_alive_timeout_ms));
        options.set_max_packet_size(Some(config.mqtt.max_message_size_in_bytes as u32));
        options.set_transport(self.tls_transport(&config));
        Ok(options)
    }

    fn tls_transport(&self, config: &DeviceConfig) -> Transport {
        let ca = {
            let tls = self.proxy_tls.lock().unwrap();
            tls.root_ca.clone()
        }
        .or_else(|| {
            config
                .root_ca_path
                .as_ref()
                .and_then(|path| std::fs::read(path).ok())
        });

        let client_auth = match (&config.certificate_path, &config.private_key_path) {
            (Some(cert), Some(key)) => match (std::fs::read(cert), std::fs::read(key)) {
                (Ok(cert), Ok(key)) => Some((cert, key)),
                _ => {
                    warn!(
                        cert = %cert.display(),
                        key = %key.display(),
                        "failed to read device identity files, connecting without client auth"
                    );
                    None
                }
            },
            _ => None,
        };

        match ca {
            Some(ca) => Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }),
            None => Transport::tls_with_default_config(),
        }
    }
}

#[async_trait]
impl MqttTransport for RumqttcTransport {
    async fn connect(&self) -> Result<bool, TransportError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            // Idempotent teardown of any previous session.
            let _ = previous.client.disconnect().await;
            previous.poller.abort();
        }

        let options = self.build_options()?;
        let (client, event_loop) = AsyncClient::new(options, EVENT_LOOP_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let poller = tokio::spawn(run_event_loop(
            event_loop,
            self.connection_id,
            self.events.clone(),
            ready_tx,
        ));
        *active = Some(ActiveConnection { client, poller });
        drop(active);

        match ready_rx.await {
            Ok(Ok(session_present)) => Ok(session_present),
            Ok(Err(message)) => Err(TransportError::ConnectionFailed(message)),
            Err(_) => Err(TransportError::ConnectionFailed(
                "event loop exited before CONNACK".to_string(),
            )),
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            let result = previous.client.disconnect().await;
            previous.poller.abort();
            result.map_err(|error| TransportError::ConnectionFailed(error.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let active = self.active.lock().await;
        let Some(active) = active.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        active
            .client
            .subscribe(topic, to_rumqttc_qos(qos))
            .await
            .map_err(|error| TransportError::SubscribeFailed(error.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let active = self.active.lock().await;
        let Some(active) = active.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        active
            .client
            .unsubscribe(topic)
            .await
            .map_err(|error| TransportError::UnsubscribeFailed(error.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u16, TransportError> {
        let active = self.active.lock().await;
        let Some(active) = active.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        active
            .client
            .publish(topic, to_rumqttc_qos(qos), retain, Bytes::copy_from_slice(payload))
            .await
            .map_err(|error| TransportError::PublishFailed(error.to_string()))?;
        // rumqttc assigns packet ids inside the event loop; the spooler
        // keys retries on spool ids, so the wire id is informational only.
        Ok(0)
    }
}

/// Polls the rumqttc event loop, routing packets into the shared event
/// channel. The first CONNACK (or the first error) resolves the pending
/// connect; afterwards rumqttc keeps retrying the link itself and the pool
/// hears about it through `Interrupted`/`Resumed` events.
async fn run_event_loop(
    mut event_loop: EventLoop,
    connection_id: u64,
    events: mpsc::Sender<ClientEvent>,
    ready: oneshot::Sender<Result<bool, String>>,
) {
    let mut ready = Some(ready);
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let session_present = ack.session_present;
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(session_present));
                }
                let delivered = events
                    .send(ClientEvent {
                        connection_id,
                        kind: ClientEventKind::Resumed { session_present },
                    })
                    .await;
                if delivered.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                };
                if events
                    .send(ClientEvent {
                        connection_id,
                        kind: ClientEventKind::Message(message),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                warn!(connection_id, ?disconnect, "broker disconnected the client");
                let _ = events
                    .send(ClientEvent {
                        connection_id,
                        kind: ClientEventKind::Interrupted { error_code: 0 },
                    })
                    .await;
            }
            Ok(other) => {
                trace!(connection_id, event = ?other, "mqtt event");
            }
            Err(connection_error) => {
                if let Some(tx) = ready.take() {
                    // Initial connect failed; the pool owns the retry.
                    let _ = tx.send(Err(connection_error.to_string()));
                    break;
                }
                error!(connection_id, error = %connection_error, "MQTT event loop error");
                if events
                    .send(ClientEvent {
                        connection_id,
                        kind: ClientEventKind::Interrupted { error_code: -1 },
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                tokio::time::sleep(EVENT_LOOP_ERROR_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing_accepts_all_three_shapes() {
        assert_eq!(
            parse_endpoint("example-ats.iot.us-east-1.amazonaws.com", 8883),
            ("example-ats.iot.us-east-1.amazonaws.com".to_string(), 8883)
        );
        assert_eq!(
            parse_endpoint("broker.local:1883", 8883),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_endpoint("mqtts://broker.local:443", 8883),
            ("broker.local".to_string(), 443)
        );
        assert_eq!(
            parse_endpoint("mqtts://broker.local", 8883),
            ("broker.local".to_string(), 8883)
        );
    }

    #[test]
    fn qos_mapping_is_one_to_one() {
        assert_eq!(
            to_rumqttc_qos(QoS::AtMostOnce),
            rumqttc::v5::mqttbytes::QoS::AtMostOnce
        );
        assert_eq!(
            to_rumqttc_qos(QoS::AtLeastOnce),
            rumqttc::v5::mqttbytes::QoS::AtLeastOnce
        );
    }
}
