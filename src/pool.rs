//! Dynamically sized pool of broker connections.
//!
//! Connections are created lazily: the first publish creates one, and a
//! subscribe that no existing connection can absorb creates another. When a
//! subscribe finds more than one connection with spare capacity, idle
//! connections are reclaimed, always leaving at least one alive for
//! publishing. The vector itself is guarded by the multiplexer's state
//! lock; this type owns only the counters and the factory.

use crate::config::ConfigStore;
use crate::connection::PooledConnection;
use crate::transport::{ClientEvent, TransportFactory};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub(crate) struct ConnectionPool {
    factory: Arc<dyn TransportFactory>,
    events: mpsc::Sender<ClientEvent>,
    config: ConfigStore,
    next_connection_id: AtomicU64,
    round_robin: AtomicUsize,
}

impl ConnectionPool {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events: mpsc::Sender<ClientEvent>,
        config: ConfigStore,
    ) -> Self {
        ConnectionPool {
            factory,
            events,
            config,
            next_connection_id: AtomicU64::new(1),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Connections are named `<thingName>` and then `<thingName>#2`, `#3`…
    fn create_connection(&self, existing: usize) -> Arc<PooledConnection> {
        let thing_name = self.config.get().thing_name;
        let client_id = if existing == 0 {
            thing_name
        } else {
            format!("{thing_name}#{}", existing + 1)
        };
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        debug!(client_id, "creating new MQTT connection");
        let transport = self.factory.create(id, &client_id, self.events.clone());
        Arc::new(PooledConnection::new(
            id,
            client_id,
            transport,
            self.config.operation_timeout(),
        ))
    }

    /// A connection with room for one more subscription, growing the pool
    /// when every existing connection is at its budget.
    pub async fn acquire_for_subscribe(
        &self,
        connections: &mut Vec<Arc<PooledConnection>>,
    ) -> Arc<PooledConnection> {
        if connections.is_empty()
            || !connections.iter().any(|c| c.can_accept_subscription())
        {
            let connection = self.create_connection(connections.len());
            connections.push(connection.clone());
            return connection;
        }

        let accepting = connections
            .iter()
            .filter(|c| c.can_accept_subscription())
            .count();
        if accepting > 1 {
            // More than one connection has spare capacity, so idle
            // duplicates are redundant. Keep at least one connection alive
            // for publishing.
            let closable: Vec<Arc<PooledConnection>> = connections
                .iter()
                .filter(|c| c.is_closable())
                .cloned()
                .collect();
            for connection in closable {
                if connections.len() == 1 {
                    break;
                }
                connection.close().await;
                connections.retain(|c| c.id() != connection.id());
            }
        } else {
            trace!("number of connections that can add subscriptions is 1");
        }

        match connections.iter().find(|c| c.can_accept_subscription()) {
            Some(connection) => connection.clone(),
            None => {
                // Reclamation can eat every connection with capacity when
                // the survivor is already full.
                let connection = self.create_connection(connections.len());
                connections.push(connection.clone());
                connection
            }
        }
    }

    /// Somewhat round-robin connection for publishing, creating the first
    /// one on demand.
    pub fn acquire_for_publish(
        &self,
        connections: &mut Vec<Arc<PooledConnection>>,
    ) -> Arc<PooledConnection> {
        if connections.is_empty() {
            let connection = self.create_connection(0);
            connections.push(connection.clone());
            return connection;
        }
        let index = self.round_robin.fetch_add(1, Ordering::SeqCst) % connections.len();
        connections[index].clone()
    }

    /// The pool member that could publish soonest under its throttle.
    pub fn min_throttling_wait(
        &self,
        connections: &[Arc<PooledConnection>],
    ) -> Option<(Arc<PooledConnection>, Duration)> {
        connections
            .iter()
            .map(|c| (c.clone(), c.throttling_wait()))
            .min_by_key(|(_, wait)| *wait)
    }

    pub async fn close_all(&self, connections: &[Arc<PooledConnection>]) {
        for connection in connections {
            connection.close_on_shutdown().await;
        }
    }
}
