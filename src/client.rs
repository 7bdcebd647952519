//! Public facade of the multiplexer.
//!
//! One [`MqttClient`] owns the connection pool, the subscription registry,
//! the spool, and the background tasks (event dispatcher, publisher loop,
//! reconfiguration controller). Everything is scoped to the instance; there
//! is no module-level state.

use crate::config::{ConfigStore, PublishLimits};
use crate::connection::PooledConnection;
use crate::error::{PublishError, SubscribeError};
use crate::pool::ConnectionPool;
use crate::registry::{deliver, LocalSubscription, MessageCallback, SubscriptionRegistry};
use crate::spool::{InMemorySpool, PublishRequest, Spool, SpoolConfig};
use crate::topic::{self, TopicFilter};
use crate::transport::rumqttc::RumqttcTransportFactory;
use crate::transport::{
    ClientEvent, ClientEventKind, ProxyTlsContext, QoS, TransportError, TransportFactory,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const RECONFIGURE_DEBOUNCE: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connectivity transitions re-broadcast to interested device components.
#[derive(Debug, Clone)]
pub enum ConnectivityEvent {
    Interrupted { error_code: i32 },
    Resumed { session_present: bool },
}

/// Pool vector and registry maps, guarded together: consolidation
/// decisions need a consistent view of both.
pub(crate) struct MuxState {
    pub connections: Vec<Arc<PooledConnection>>,
    pub registry: SubscriptionRegistry,
}

/// State shared with the background tasks.
pub(crate) struct Core {
    pub config: ConfigStore,
    pub state: RwLock<MuxState>,
    pub pool: ConnectionPool,
    pub spool: Arc<dyn Spool>,
    pub online: AtomicBool,
    pub limits: StdRwLock<PublishLimits>,
    pub spooler_task: StdMutex<Option<JoinHandle<()>>>,
    pub shutdown: watch::Sender<bool>,
    pub connectivity: broadcast::Sender<ConnectivityEvent>,
    pub proxy_tls: Arc<StdMutex<ProxyTlsContext>>,
}

impl Core {
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Start the publisher loop unless one is already running.
pub(crate) fn trigger_spooler(core: &Arc<Core>) {
    let mut task = core.spooler_task.lock().unwrap();
    let running = task.as_ref().is_some_and(|t| !t.is_finished());
    if !running && !core.is_shutdown() {
        *task = Some(tokio::spawn(crate::publisher::run_spooler(core.clone())));
    }
}

/// Consumes transport events sequentially. Running fan-out on this single
/// task is what gives per-subscription arrival ordering.
async fn run_dispatcher(core: Arc<Core>, mut events: mpsc::Receiver<ClientEvent>) {
    let mut shutdown = core.shutdown_rx();
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event.kind {
            ClientEventKind::Message(message) => {
                let targets = {
                    let state = core.state.read().await;
                    let (targets, wrong_connection) = state
                        .registry
                        .fanout_targets(&message.topic, event.connection_id);
                    if targets.is_empty() {
                        error!(
                            topic = %message.topic,
                            connection = event.connection_id,
                            "got a message from a topic that no one subscribed to"
                        );
                        continue;
                    }
                    if wrong_connection {
                        warn!(
                            topic = %message.topic,
                            connection = event.connection_id,
                            "got a message on a different connection than the one that \
                             subscribed; delivering to all matching subscribers"
                        );
                    }
                    targets
                };
                deliver(&message, &targets);
            }
            ClientEventKind::Interrupted { error_code } => {
                {
                    let state = core.state.read().await;
                    if let Some(connection) = state
                        .connections
                        .iter()
                        .find(|c| c.id() == event.connection_id)
                    {
                        connection.note_interrupted(error_code);
                    }
                }
                core.online.store(false, Ordering::SeqCst);
                if !core.spool.config().keep_qos0_when_offline {
                    core.spool.pop_all_qos0();
                }
                let _ = core
                    .connectivity
                    .send(ConnectivityEvent::Interrupted { error_code });
            }
            ClientEventKind::Resumed { session_present } => {
                {
                    let state = core.state.read().await;
                    if let Some(connection) = state
                        .connections
                        .iter()
                        .find(|c| c.id() == event.connection_id)
                    {
                        connection.note_resumed(session_present);
                    }
                }
                core.online.store(true, Ordering::SeqCst);
                trigger_spooler(&core);
                let _ = core
                    .connectivity
                    .send(ConnectivityEvent::Resumed { session_present });
            }
        }
    }
}

/// Device-side MQTT client manager.
///
/// Multiplexes local subscribers onto a pool of broker connections,
/// consolidating overlapping topic filters so the broker sees the minimum
/// necessary set, and drains an offline spool of publish requests with
/// retry and flow control.
pub struct MqttClient {
    core: Arc<Core>,
    // Serializes subscribe/unsubscribe so consolidation decisions never
    // interleave.
    ops: Mutex<()>,
    background: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MqttClient {
    /// Client with an explicit transport factory and spool, using the
    /// default reconfiguration debounce.
    pub fn new(
        config: ConfigStore,
        factory: Arc<dyn TransportFactory>,
        spool: Arc<dyn Spool>,
    ) -> Self {
        Self::with_reconnect_debounce(config, factory, spool, RECONFIGURE_DEBOUNCE)
    }

    /// Production client: rumqttc transport and an in-memory spool sized
    /// from the spooler configuration.
    pub fn with_default_transport(config: ConfigStore) -> Self {
        let proxy_tls = Arc::new(StdMutex::new(ProxyTlsContext::load(
            config.get().root_ca_path.as_deref(),
        )));
        let factory = Arc::new(RumqttcTransportFactory::new(
            config.clone(),
            proxy_tls.clone(),
        ));
        let spool = Arc::new(InMemorySpool::new(SpoolConfig::from(&config.spooler())));
        Self::build(config, factory, spool, proxy_tls, RECONFIGURE_DEBOUNCE)
    }

    pub fn with_reconnect_debounce(
        config: ConfigStore,
        factory: Arc<dyn TransportFactory>,
        spool: Arc<dyn Spool>,
        debounce: Duration,
    ) -> Self {
        let proxy_tls = Arc::new(StdMutex::new(ProxyTlsContext::load(
            config.get().root_ca_path.as_deref(),
        )));
        Self::build(config, factory, spool, proxy_tls, debounce)
    }

    fn build(
        config: ConfigStore,
        factory: Arc<dyn TransportFactory>,
        spool: Arc<dyn Spool>,
        proxy_tls: Arc<StdMutex<ProxyTlsContext>>,
        debounce: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let (connectivity, _) = broadcast::channel(32);
        let limits = PublishLimits::from_config(&config.mqtt());
        let pool = ConnectionPool::new(factory, events_tx, config.clone());

        let core = Arc::new(Core {
            config,
            state: RwLock::new(MuxState {
                connections: Vec::new(),
                registry: SubscriptionRegistry::new(),
            }),
            pool,
            spool,
            online: AtomicBool::new(false),
            limits: StdRwLock::new(limits),
            spooler_task: StdMutex::new(None),
            shutdown,
            connectivity,
            proxy_tls,
        });

        let dispatcher = tokio::spawn(run_dispatcher(core.clone(), events_rx));
        let reconfigure = crate::reconfigure::spawn(core.clone(), debounce);

        MqttClient {
            core,
            ops: Mutex::new(()),
            background: StdMutex::new(vec![dispatcher, reconfigure]),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a publish request.
    ///
    /// Resolves as soon as the spool accepts the message; broker delivery
    /// happens asynchronously through the publisher loop, so success here
    /// means acceptance, not confirmation. A QoS 0 request while offline is
    /// dropped up front unless the spooler keeps QoS 0 messages.
    pub async fn publish(&self, request: PublishRequest) -> Result<u16, PublishError> {
        if !self.core.config.is_configured_to_talk_to_cloud() {
            debug!(
                topic = %request.topic,
                "cannot publish because device is configured to run offline"
            );
            return Err(PublishError::NotConfigured);
        }

        let max_size = self.core.limits.read().unwrap().max_message_size;
        if request.payload.len() > max_size {
            error!(
                topic = %request.topic,
                size = request.payload.len(),
                limit = max_size,
                "invalid publish request: payload exceeds the configured limit"
            );
            return Err(PublishError::PayloadTooLarge {
                size: request.payload.len(),
                limit: max_size,
            });
        }
        if let Err(error) = topic::validate_publish_topic(&request.topic) {
            error!(topic = %request.topic, %error, "invalid publish request");
            return Err(PublishError::InvalidTopic(error));
        }

        let spool_config = self.core.spool.config();
        if !self.core.online.load(Ordering::SeqCst)
            && request.qos == QoS::AtMostOnce
            && !spool_config.keep_qos0_when_offline
        {
            debug!(topic = %request.topic, "device is offline, dropping QoS 0 message");
            return Err(PublishError::OfflineDrop);
        }

        if let Err(error) = self.core.spool.add_message(request).await {
            debug!(%error, "failed to add publish request to the spooler queue");
            return Err(PublishError::Spool(error));
        }
        trigger_spooler(&self.core);
        Ok(0)
    }

    /// Subscribe `callback` to a topic filter.
    ///
    /// When an existing broker-side filter already covers the topic, the
    /// subscription binds to it without any broker traffic. Otherwise a
    /// connection is acquired from the pool (growing it if necessary) and a
    /// broker SUBSCRIBE is issued, waiting up to the operation timeout for
    /// the SUBACK.
    pub async fn subscribe(
        &self,
        topic_filter: &str,
        qos: QoS,
        callback: MessageCallback,
    ) -> Result<(), SubscribeError> {
        topic::validate_subscribe_topic(topic_filter)?;
        if !self.core.config.is_configured_to_talk_to_cloud() {
            error!(
                topic = topic_filter,
                "cannot subscribe because device is configured to run offline"
            );
            return Ok(());
        }

        let _ops = self.ops.lock().await;
        let subscription = LocalSubscription::new(topic_filter, qos, callback);

        let connection = {
            let mut state = self.core.state.write().await;
            if let Some((covering, owner)) = state.registry.find_superset_owner(topic_filter) {
                debug!(
                    topic = topic_filter,
                    filter = %covering,
                    "existing broker subscription covers this topic"
                );
                state.registry.bind(subscription, owner);
                return Ok(());
            }
            let connection = self
                .core
                .pool
                .acquire_for_subscribe(&mut state.connections)
                .await;
            state.registry.bind(subscription.clone(), connection.id());
            connection
        };

        let filter = TopicFilter::new(topic_filter);
        let wire = {
            let core = self.core.clone();
            let connection = connection.clone();
            let filter = filter.clone();
            let topic = topic_filter.to_string();
            // Detached so a timed-out SUBSCRIBE can still record the broker
            // filter when its SUBACK eventually lands.
            tokio::spawn(async move {
                match connection.subscribe(&topic, qos).await {
                    Ok(()) => {
                        core.state
                            .write()
                            .await
                            .registry
                            .insert_active(filter, connection.id());
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            })
        };

        match tokio::time::timeout(self.core.config.operation_timeout(), wire).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(error))) => {
                error!(topic = topic_filter, %error, "error subscribing");
                self.remove_tentative_binding(&subscription).await;
                Err(SubscribeError::Transport(error))
            }
            Ok(Err(join_error)) => {
                self.remove_tentative_binding(&subscription).await;
                Err(SubscribeError::Transport(TransportError::SubscribeFailed(
                    join_error.to_string(),
                )))
            }
            Err(_) => {
                warn!(topic = topic_filter, "timed out waiting for SUBACK");
                self.remove_tentative_binding(&subscription).await;
                Err(SubscribeError::Timeout)
            }
        }
    }

    async fn remove_tentative_binding(&self, subscription: &LocalSubscription) {
        self.core
            .state
            .write()
            .await
            .registry
            .remove_binding(subscription);
    }

    /// Remove the (topic, callback) subscription. Broker filters that no
    /// remaining local subscription needs are unsubscribed, and any local
    /// subscription that was riding a removed filter is rebound to a
    /// remaining superset.
    pub async fn unsubscribe(
        &self,
        topic_filter: &str,
        callback: &MessageCallback,
    ) -> Result<(), SubscribeError> {
        let _ops = self.ops.lock().await;
        let mut state = self.core.state.write().await;
        state.registry.remove_bindings(topic_filter, callback);

        for (filter, connection_id) in state.registry.dead_filters() {
            let connection = state
                .connections
                .iter()
                .find(|c| c.id() == connection_id)
                .cloned();
            let Some(connection) = connection else {
                // Owning connection already reclaimed; nothing to tell the
                // broker.
                state.registry.remove_active(&filter);
                continue;
            };
            match connection.unsubscribe(filter.as_str()).await {
                Ok(()) => {
                    state.registry.remove_active(&filter);
                    state.registry.rebind_covered(&filter, connection_id);
                }
                Err(error) => {
                    error!(topic = %filter, %error, "error unsubscribing");
                    return Err(SubscribeError::Transport(error));
                }
            }
        }
        Ok(())
    }

    /// True when any pool connection is connected.
    pub async fn connected(&self) -> bool {
        let state = self.core.state.read().await;
        !state.connections.is_empty() && state.connections.iter().any(|c| c.connected())
    }

    /// Whether the broker link is currently considered up.
    pub fn online(&self) -> bool {
        self.core.online.load(Ordering::SeqCst)
    }

    pub fn operation_timeout(&self) -> Duration {
        self.core.config.operation_timeout()
    }

    /// Observe connection interruptions and resumptions.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.core.connectivity.subscribe()
    }

    /// Number of live pool connections (diagnostic).
    pub async fn connection_count(&self) -> usize {
        self.core.state.read().await.connections.len()
    }

    /// Shut down: stop the publisher loop, the dispatcher, and the
    /// reconfiguration controller, then close every connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down MQTT client");
        let _ = self.core.shutdown.send(true);
        if let Some(task) = self.core.spooler_task.lock().unwrap().take() {
            task.abort();
        }
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
        let state = self.core.state.read().await;
        self.core.pool.close_all(&state.connections).await;
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // Cannot run the async teardown here; just make sure background
        // tasks stop. Callers should close() for a graceful shutdown.
        let _ = self.core.shutdown.send(true);
        if let Some(task) = self.core.spooler_task.lock().unwrap().take() {
            task.abort();
        }
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
