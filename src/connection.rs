//! One pooled broker connection.
//!
//! Wraps a transport with the connection state machine, the per-connection
//! subscription budget, and the publish throttle. Subscription slots track
//! in-flight SUBSCRIBEs separately from acknowledged ones: a slot created
//! by a timed-out attempt stays pending so a repeated subscribe never puts
//! a second SUBSCRIBE on the wire, and the original wire call promotes the
//! slot whenever the SUBACK eventually lands.

use crate::spool::PublishRequest;
use crate::throttle::TokenBucket;
use crate::transport::{MqttTransport, QoS, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Broker limit on subscriptions per connection.
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 50;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// SUBSCRIBE issued, SUBACK not yet seen.
    Pending,
    /// Acknowledged by the broker.
    Active,
    Failed,
}

pub(crate) struct PooledConnection {
    id: u64,
    client_id: String,
    transport: Arc<dyn MqttTransport>,
    state: watch::Sender<ConnectionState>,
    slots: Mutex<HashMap<String, (QoS, watch::Sender<SlotState>)>>,
    throttle: Mutex<TokenBucket>,
    operation_timeout: Duration,
    // Serializes connect/reconnect teardown so concurrent demand connects
    // collapse into one wire CONNECT.
    connect_lock: tokio::sync::Mutex<()>,
}

impl PooledConnection {
    pub fn new(
        id: u64,
        client_id: String,
        transport: Arc<dyn MqttTransport>,
        operation_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        PooledConnection {
            id,
            client_id,
            transport,
            state,
            slots: Mutex::new(HashMap::new()),
            throttle: Mutex::new(TokenBucket::for_publishes()),
            operation_timeout,
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscription_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Whether a new subscription fits the broker's per-connection budget.
    /// Pending SUBSCRIBEs count against it.
    pub fn can_accept_subscription(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) && self.subscription_count() < MAX_SUBSCRIPTIONS_PER_CONNECTION
    }

    /// A connection with no acknowledged or in-flight subscriptions may be
    /// reclaimed by the pool.
    pub fn is_closable(&self) -> bool {
        self.slots.lock().unwrap().is_empty()
    }

    /// Token-bucket wait that would make the next publish non-blocking.
    pub fn throttling_wait(&self) -> Duration {
        self.throttle.lock().unwrap().wait_time(Instant::now())
    }

    /// Establish the connection if necessary. Returns whether the broker
    /// resumed an existing session.
    pub async fn connect(&self) -> Result<bool, TransportError> {
        let _guard = self.connect_lock.lock().await;
        match self.state() {
            ConnectionState::Connected => return Ok(true),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(TransportError::NotConnected)
            }
            _ => {}
        }

        info!(client_id = %self.client_id, "connecting to broker");
        self.state.send_replace(ConnectionState::Connecting);
        match tokio::time::timeout(self.operation_timeout, self.transport.connect()).await {
            Ok(Ok(session_present)) => {
                self.state.send_replace(ConnectionState::Connected);
                if !session_present {
                    self.resubscribe_active().await;
                }
                Ok(session_present)
            }
            Ok(Err(error)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(error)
            }
            Err(_) => {
                warn!(client_id = %self.client_id, "timed out waiting for broker CONNACK");
                self.state.send_replace(ConnectionState::Disconnected);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Idempotent teardown followed by a fresh connect.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        {
            let _guard = self.connect_lock.lock().await;
            if matches!(
                self.state(),
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                return Err(TransportError::NotConnected);
            }
            info!(client_id = %self.client_id, "reconnecting");
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.transport.disconnect()).await;
            self.state.send_replace(ConnectionState::Disconnected);
        }
        self.connect().await.map(|_| ())
    }

    /// Wait until the connection is usable, driving a demand connect when
    /// it is down.
    async fn ensure_connected(&self) -> Result<(), TransportError> {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(TransportError::NotConnected)
                }
                ConnectionState::Disconnected => {
                    self.connect().await?;
                }
                ConnectionState::Connecting => {
                    match tokio::time::timeout(self.operation_timeout, rx.changed()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return Err(TransportError::NotConnected),
                        Err(_) => return Err(TransportError::Timeout),
                    }
                }
            }
        }
    }

    /// Issue a broker SUBSCRIBE, de-duplicating against slots that are
    /// already active or pending.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.ensure_connected().await?;

        let pending_rx = {
            let mut slots = self.slots.lock().unwrap();
            let current = slots
                .get(topic)
                .map(|(_, slot)| (*slot.borrow(), slot.subscribe()));
            match current {
                Some((SlotState::Active, _)) => return Ok(()),
                Some((SlotState::Pending, rx)) => Some(rx),
                Some((SlotState::Failed, _)) | None => {
                    let (slot, _) = watch::channel(SlotState::Pending);
                    slots.insert(topic.to_string(), (qos, slot));
                    None
                }
            }
        };

        // A SUBSCRIBE from an earlier (possibly timed-out) attempt is still
        // on the wire; wait for its outcome instead of sending another.
        if let Some(mut rx) = pending_rx {
            debug!(client_id = %self.client_id, topic, "subscribe already in flight");
            loop {
                rx.changed().await.map_err(|_| {
                    TransportError::SubscribeFailed("subscription slot abandoned".to_string())
                })?;
                match *rx.borrow() {
                    SlotState::Active => return Ok(()),
                    SlotState::Failed => {
                        return Err(TransportError::SubscribeFailed(format!(
                            "subscribe to {topic} failed on another caller"
                        )))
                    }
                    SlotState::Pending => {}
                }
            }
        }

        match self.transport.subscribe(topic, qos).await {
            Ok(()) => {
                let slots = self.slots.lock().unwrap();
                if let Some((_, slot)) = slots.get(topic) {
                    slot.send_replace(SlotState::Active);
                }
                Ok(())
            }
            Err(error) => {
                let mut slots = self.slots.lock().unwrap();
                if let Some((_, slot)) = slots.get(topic) {
                    slot.send_replace(SlotState::Failed);
                }
                slots.remove(topic);
                Err(error)
            }
        }
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        tokio::time::timeout(self.operation_timeout, self.transport.unsubscribe(topic))
            .await
            .map_err(|_| TransportError::Timeout)??;
        self.slots.lock().unwrap().remove(topic);
        Ok(())
    }

    /// Publish a single request. The caller is expected to have slept the
    /// throttling wait first, so the token acquire never blocks.
    pub async fn publish(&self, request: &PublishRequest) -> Result<u16, TransportError> {
        self.ensure_connected().await?;
        self.throttle.lock().unwrap().acquire(Instant::now());
        tokio::time::timeout(
            self.operation_timeout,
            self.transport.publish(
                &request.topic,
                &request.payload,
                request.qos,
                request.retain,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    /// Re-issue SUBSCRIBEs for acknowledged slots after a session was lost.
    pub async fn resubscribe_active(&self) {
        let active: Vec<(String, QoS)> = {
            let slots = self.slots.lock().unwrap();
            slots
                .iter()
                .filter(|(_, (_, slot))| *slot.borrow() == SlotState::Active)
                .map(|(topic, (qos, _))| (topic.clone(), *qos))
                .collect()
        };
        for (topic, qos) in active {
            if let Err(error) = self.transport.subscribe(&topic, qos).await {
                warn!(client_id = %self.client_id, topic, %error, "failed to re-subscribe");
            } else {
                debug!(client_id = %self.client_id, topic, "re-subscribed");
            }
        }
    }

    /// Transport reported an interruption.
    pub fn note_interrupted(&self, error_code: i32) {
        if !matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            warn!(client_id = %self.client_id, error_code, "connection interrupted");
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }

    /// Transport reported the connection is up again.
    pub fn note_resumed(&self, session_present: bool) {
        if !matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            debug!(client_id = %self.client_id, session_present, "connection resumed");
            self.state.send_replace(ConnectionState::Connected);
        }
    }

    /// Reclaim an idle connection.
    pub async fn close(&self) {
        debug!(client_id = %self.client_id, "closing idle connection");
        self.close_on_shutdown().await;
    }

    pub async fn close_on_shutdown(&self) {
        self.state.send_replace(ConnectionState::Closing);
        if tokio::time::timeout(CLOSE_TIMEOUT, self.transport.disconnect())
            .await
            .is_err()
        {
            warn!(client_id = %self.client_id, "timed out disconnecting from broker");
        }
        self.state.send_replace(ConnectionState::Closed);
    }
}
