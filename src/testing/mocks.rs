//! Mock implementations for testing.
//!
//! [`MockBroker`] records every wire operation across all mock transports
//! and scripts failures; [`MockTransportFactory`] hands out
//! [`MockTransport`]s wired to one shared broker; [`RecordingSpool`] wraps
//! a real spool and counts the calls the publisher loop makes.

use crate::spool::{PublishRequest, Spool, SpoolConfig, SpoolError, SpoolMessage};
use crate::transport::{
    ClientEvent, ClientEventKind, InboundMessage, MqttTransport, QoS, TransportError,
    TransportFactory,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A recorded publish: (client id, topic, payload, qos, retain).
pub type RecordedPublish = (String, String, Vec<u8>, QoS, bool);

/// Shared fake broker: every mock transport reports its operations here.
#[derive(Default)]
pub struct MockBroker {
    connects: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<String>>,
    subscribes: Mutex<Vec<(String, String)>>,
    unsubscribes: Mutex<Vec<(String, String)>>,
    publishes: Mutex<Vec<RecordedPublish>>,
    fail_connects: AtomicUsize,
    fail_subscribes: AtomicUsize,
    fail_publishes: AtomicBool,
    subscribe_delay: Mutex<Option<Duration>>,
    resume_sessions: AtomicBool,
    next_packet_id: AtomicU16,
}

impl MockBroker {
    pub fn shared() -> Arc<Self> {
        Arc::new(MockBroker::default())
    }

    pub fn connect_count(&self, client_id: &str) -> usize {
        self.connects
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == client_id)
            .count()
    }

    pub fn disconnect_count(&self, client_id: &str) -> usize {
        self.disconnects
            .lock()
            .unwrap()
            .iter()
            .filter(|id| *id == client_id)
            .count()
    }

    pub fn subscribes(&self) -> Vec<(String, String)> {
        self.subscribes.lock().unwrap().clone()
    }

    pub fn unsubscribes(&self) -> Vec<(String, String)> {
        self.unsubscribes.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<RecordedPublish> {
        self.publishes.lock().unwrap().clone()
    }

    /// Fail the next `count` CONNECT attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` SUBSCRIBE attempts.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.fail_subscribes.store(count, Ordering::SeqCst);
    }

    /// Fail every PUBLISH until told otherwise.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Delay SUBACKs, e.g. beyond the caller's operation timeout.
    pub fn delay_subscribes(&self, delay: Option<Duration>) {
        *self.subscribe_delay.lock().unwrap() = delay;
    }

    /// Make subsequent connects report a present session.
    pub fn resume_sessions(&self, resume: bool) {
        self.resume_sessions.store(resume, Ordering::SeqCst);
    }

    fn take_scripted_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

/// One fake broker connection.
pub struct MockTransport {
    connection_id: u64,
    client_id: String,
    broker: Arc<MockBroker>,
    events: mpsc::Sender<ClientEvent>,
    connected: AtomicBool,
}

impl MockTransport {
    pub fn new(
        connection_id: u64,
        client_id: &str,
        broker: Arc<MockBroker>,
        events: mpsc::Sender<ClientEvent>,
    ) -> Self {
        MockTransport {
            connection_id,
            client_id: client_id.to_string(),
            broker,
            events,
            connected: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Deliver a broker message through this connection's event stream.
    pub async fn inject_message(&self, topic: &str, payload: &[u8]) {
        let _ = self
            .events
            .send(ClientEvent {
                connection_id: self.connection_id,
                kind: ClientEventKind::Message(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                    retain: false,
                }),
            })
            .await;
    }

    pub async fn inject_interrupted(&self, error_code: i32) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(ClientEvent {
                connection_id: self.connection_id,
                kind: ClientEventKind::Interrupted { error_code },
            })
            .await;
    }

    pub async fn inject_resumed(&self, session_present: bool) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self
            .events
            .send(ClientEvent {
                connection_id: self.connection_id,
                kind: ClientEventKind::Resumed { session_present },
            })
            .await;
    }
}

#[async_trait]
impl MqttTransport for MockTransport {
    async fn connect(&self) -> Result<bool, TransportError> {
        if MockBroker::take_scripted_failure(&self.broker.fail_connects) {
            return Err(TransportError::ConnectionFailed(
                "scripted connect failure".to_string(),
            ));
        }
        self.broker
            .connects
            .lock()
            .unwrap()
            .push(self.client_id.clone());
        self.connected.store(true, Ordering::SeqCst);
        let session_present = self.broker.resume_sessions.load(Ordering::SeqCst);
        let _ = self
            .events
            .send(ClientEvent {
                connection_id: self.connection_id,
                kind: ClientEventKind::Resumed { session_present },
            })
            .await;
        Ok(session_present)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker
            .disconnects
            .lock()
            .unwrap()
            .push(self.client_id.clone());
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let delay = *self.broker.subscribe_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if MockBroker::take_scripted_failure(&self.broker.fail_subscribes) {
            return Err(TransportError::SubscribeFailed(
                "scripted subscribe failure".to_string(),
            ));
        }
        self.broker
            .subscribes
            .lock()
            .unwrap()
            .push((self.client_id.clone(), topic.to_string()));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.broker
            .unsubscribes
            .lock()
            .unwrap()
            .push((self.client_id.clone(), topic.to_string()));
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<u16, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.broker.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed(
                "scripted publish failure".to_string(),
            ));
        }
        self.broker.publishes.lock().unwrap().push((
            self.client_id.clone(),
            topic.to_string(),
            payload.to_vec(),
            qos,
            retain,
        ));
        Ok(self.broker.next_packet_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Factory handing out transports wired to one shared [`MockBroker`].
pub struct MockTransportFactory {
    pub broker: Arc<MockBroker>,
    created: Mutex<Vec<Arc<MockTransport>>>,
    events: Mutex<Option<mpsc::Sender<ClientEvent>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        MockTransportFactory {
            broker: MockBroker::shared(),
            created: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        }
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().unwrap().clone()
    }

    /// The event sender given to the most recent transport; lets tests
    /// inject events for arbitrary connection ids.
    pub fn events_sender(&self) -> Option<mpsc::Sender<ClientEvent>> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        connection_id: u64,
        client_id: &str,
        events: mpsc::Sender<ClientEvent>,
    ) -> Arc<dyn MqttTransport> {
        let transport = Arc::new(MockTransport::new(
            connection_id,
            client_id,
            self.broker.clone(),
            events.clone(),
        ));
        *self.events.lock().unwrap() = Some(events);
        self.created.lock().unwrap().push(transport.clone());
        transport
    }
}

/// Spool wrapper counting the calls the publisher loop makes.
pub struct RecordingSpool {
    inner: Arc<dyn Spool>,
    add_message_calls: AtomicUsize,
    add_id_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    qos0_purges: AtomicUsize,
}

impl RecordingSpool {
    pub fn wrap(inner: Arc<dyn Spool>) -> Arc<Self> {
        Arc::new(RecordingSpool {
            inner,
            add_message_calls: AtomicUsize::new(0),
            add_id_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            qos0_purges: AtomicUsize::new(0),
        })
    }

    pub fn add_message_calls(&self) -> usize {
        self.add_message_calls.load(Ordering::SeqCst)
    }

    pub fn add_id_calls(&self) -> usize {
        self.add_id_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    pub fn qos0_purges(&self) -> usize {
        self.qos0_purges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Spool for RecordingSpool {
    async fn add_message(&self, request: PublishRequest) -> Result<Arc<SpoolMessage>, SpoolError> {
        self.add_message_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.add_message(request).await
    }

    async fn pop_id(&self) -> u64 {
        self.inner.pop_id().await
    }

    fn add_id(&self, id: u64) {
        self.add_id_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.add_id(id);
    }

    fn get_message_by_id(&self, id: u64) -> Option<Arc<SpoolMessage>> {
        self.inner.get_message_by_id(id)
    }

    fn remove_message_by_id(&self, id: u64) {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.remove_message_by_id(id);
    }

    fn pop_all_qos0(&self) {
        self.qos0_purges.fetch_add(1, Ordering::SeqCst);
        self.inner.pop_all_qos0();
    }

    fn config(&self) -> SpoolConfig {
        self.inner.config()
    }
}
