//! Reaction to device configuration changes.
//!
//! Watches the config change stream; changes under the MQTT namespace or
//! the device identity nodes invalidate the live connections. The publish
//! limits are re-validated immediately, while the reconnect wave is
//! debounced so a burst of related changes produces a single pass over the
//! pool.

use crate::client::Core;
use crate::config::{
    ChangeKind, ConfigChange, PublishLimits, NODE_AWS_REGION, NODE_CERTIFICATE_FILE_PATH,
    NODE_IOT_DATA_ENDPOINT, NODE_MQTT_NAMESPACE, NODE_PRIVATE_KEY_PATH, NODE_ROOT_CA_PATH,
    NODE_THING_NAME,
};
use crate::transport::ProxyTlsContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) fn spawn(core: Arc<Core>, debounce: Duration) -> JoinHandle<()> {
    // Subscribe before the task is scheduled so no early change is missed.
    let changes = core.config.subscribe_changes();
    tokio::spawn(run(core, changes, debounce))
}

/// Does this change mandate reconnecting the pool?
///
/// Timestamp-only and interior-node events never do. The AWS region only
/// matters when a proxy is configured, because the proxy endpoint is
/// derived from it.
pub(crate) fn requires_reconnect(change: &ConfigChange, proxy_configured: bool) -> bool {
    if matches!(
        change.kind,
        ChangeKind::TimestampUpdated | ChangeKind::InteriorAdded
    ) {
        return false;
    }
    if change.node.is_empty() {
        return false;
    }

    if change.node_child_of(NODE_MQTT_NAMESPACE)
        || change.node_child_of(NODE_THING_NAME)
        || change.node_child_of(NODE_IOT_DATA_ENDPOINT)
        || change.node_child_of(NODE_PRIVATE_KEY_PATH)
        || change.node_child_of(NODE_CERTIFICATE_FILE_PATH)
        || change.node_child_of(NODE_ROOT_CA_PATH)
    {
        return true;
    }
    change.node_child_of(NODE_AWS_REGION) && proxy_configured
}

async fn run(
    core: Arc<Core>,
    mut changes: tokio::sync::broadcast::Receiver<ConfigChange>,
    debounce: Duration,
) {
    let mut shutdown = core.shutdown_rx();
    let mut pending: Option<JoinHandle<()>> = None;

    loop {
        let change = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            change = changes.recv() => match change {
                Ok(change) => change,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "missed configuration change events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        if !requires_reconnect(&change, core.config.is_proxy_configured()) {
            continue;
        }

        debug!(node = %change.node, kind = ?change.kind, "reconfiguring MQTT clients");
        *core.limits.write().unwrap() = PublishLimits::from_config(&core.config.mqtt());

        // Coalesce bursts: a new qualifying change replaces the pending
        // reconnect task.
        if let Some(task) = pending.take() {
            task.abort();
        }
        pending = Some(tokio::spawn(reconnect_after_debounce(
            core.clone(),
            debounce,
        )));
    }

    if let Some(task) = pending.take() {
        task.abort();
    }
}

async fn reconnect_after_debounce(core: Arc<Core>, debounce: Duration) {
    tokio::time::sleep(debounce).await;

    // If the root CA moved, the proxy TLS material must be rebuilt before
    // any connect attempt reads it.
    let root_ca_path = core.config.get().root_ca_path;
    {
        let mut tls = core.proxy_tls.lock().unwrap();
        if !tls.matches_path(root_ca_path.as_deref()) {
            *tls = ProxyTlsContext::load(root_ca_path.as_deref());
        }
    }

    // Keep reconnecting until every connection has come back.
    let mut broken = core.state.read().await.connections.clone();
    while !broken.is_empty() {
        if core.is_shutdown() {
            return;
        }
        let mut still_broken = Vec::new();
        for connection in broken {
            if core.is_shutdown() {
                return;
            }
            if let Err(err) = connection.reconnect().await {
                error!(
                    client_id = connection.client_id(),
                    error = %err,
                    "error while reconnecting MQTT client"
                );
                still_broken.push(connection);
            }
        }
        broken = still_broken;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(kind: ChangeKind, node: &str) -> ConfigChange {
        ConfigChange {
            kind,
            node: node.to_string(),
        }
    }

    #[test]
    fn mqtt_namespace_changes_reconnect() {
        assert!(requires_reconnect(
            &change(ChangeKind::Changed, "mqtt.operationTimeoutMs"),
            false
        ));
        assert!(requires_reconnect(&change(ChangeKind::Changed, "mqtt"), false));
    }

    #[test]
    fn identity_changes_reconnect() {
        for node in [
            NODE_THING_NAME,
            NODE_IOT_DATA_ENDPOINT,
            NODE_PRIVATE_KEY_PATH,
            NODE_CERTIFICATE_FILE_PATH,
            NODE_ROOT_CA_PATH,
        ] {
            assert!(requires_reconnect(&change(ChangeKind::Changed, node), false));
        }
    }

    #[test]
    fn region_only_matters_with_a_proxy() {
        let region = change(ChangeKind::Changed, NODE_AWS_REGION);
        assert!(!requires_reconnect(&region, false));
        assert!(requires_reconnect(&region, true));
    }

    #[test]
    fn noise_events_are_filtered() {
        assert!(!requires_reconnect(
            &change(ChangeKind::TimestampUpdated, "mqtt.port"),
            true
        ));
        assert!(!requires_reconnect(
            &change(ChangeKind::InteriorAdded, "mqtt"),
            true
        ));
        assert!(!requires_reconnect(&change(ChangeKind::Changed, ""), true));
    }

    #[test]
    fn unrelated_nodes_are_ignored() {
        assert!(!requires_reconnect(
            &change(ChangeKind::Changed, "spooler.spoolSizeInBytes"),
            true
        ));
        assert!(!requires_reconnect(
            &change(ChangeKind::Changed, "logging.level"),
            true
        ));
    }
}
