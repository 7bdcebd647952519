//! Transport seam between the multiplexer and the MQTT wire library.
//!
//! The pool drives broker connections exclusively through [`MqttTransport`]
//! and creates them through [`TransportFactory`]. Inbound messages and
//! connectivity transitions flow back over a single mpsc channel of
//! [`ClientEvent`]s rather than callbacks into the facade, so the transport
//! never holds a reference to the client that owns it.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

pub mod rumqttc;

/// Supported delivery guarantees. QoS 2 is deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    pub fn value(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// A broker-delivered message handed to local subscribers.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Event emitted by a transport, tagged with the owning connection.
#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub connection_id: u64,
    pub kind: ClientEventKind,
}

#[derive(Debug, Clone)]
pub enum ClientEventKind {
    /// A PUBLISH arrived from the broker.
    Message(InboundMessage),
    /// The connection dropped.
    Interrupted { error_code: i32 },
    /// The connection is (re)established.
    Resumed { session_present: bool },
}

/// Transport-level failures. Subscribes surface these to the caller;
/// publishes retry through the spooler.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
    #[error("unsubscribe failed: {0}")]
    UnsubscribeFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("connection is closed")]
    NotConnected,
}

/// One broker connection as seen by the pool.
#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Establish the connection. Returns whether the broker resumed an
    /// existing session.
    async fn connect(&self) -> Result<bool, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Returns the packet id assigned to the publish.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u16, TransportError>;
}

/// Produces transports for new pool connections.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        connection_id: u64,
        client_id: &str,
        events: mpsc::Sender<ClientEvent>,
    ) -> Arc<dyn MqttTransport>;
}

/// TLS material used when connecting through a proxy. Rebuilt by the
/// reconfiguration controller whenever the root CA path changes, under a
/// dedicated lock so connect attempts read a consistent snapshot.
#[derive(Debug, Default)]
pub struct ProxyTlsContext {
    pub root_ca_path: Option<PathBuf>,
    pub root_ca: Option<Vec<u8>>,
}

impl ProxyTlsContext {
    pub fn load(root_ca_path: Option<&Path>) -> Self {
        let root_ca = root_ca_path.and_then(|path| match std::fs::read(path) {
            Ok(pem) => Some(pem),
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to read root CA for proxy TLS");
                None
            }
        });
        ProxyTlsContext {
            root_ca_path: root_ca_path.map(Path::to_path_buf),
            root_ca,
        }
    }

    pub fn matches_path(&self, path: Option<&Path>) -> bool {
        self.root_ca_path.as_deref() == path
    }
}
