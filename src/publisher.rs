//! Publisher loop: drains the spool onto the least-throttled connection.
//!
//! A single task started by [`crate::client::trigger_spooler`] on every successful
//! enqueue and on each online transition. It bounds the number of in-flight
//! publishes with a semaphore, sleeps each connection's throttling wait
//! before dispatching to it, and re-enqueues failed publishes until the
//! retry budget is spent. The task exits when the device goes offline or
//! shuts down; the next trigger starts a fresh one.

use crate::client::Core;
use crate::connection::PooledConnection;
use crate::spool::SpoolMessage;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, trace, warn};

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

pub(crate) async fn run_spooler(core: Arc<Core>) {
    let mut shutdown = core.shutdown_rx();
    debug!("spooler task starting");
    loop {
        if *shutdown.borrow() {
            break;
        }

        // Make sure at least one connection is up before draining.
        let connection = {
            let mut state = core.state.write().await;
            core.pool.acquire_for_publish(&mut state.connections)
        };
        if let Err(error) = connection.connect().await {
            error!(%error, "error when publishing from spooler");
            let interrupted = tokio::select! {
                _ = shutdown.changed() => true,
                _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => false,
            };
            if interrupted && *shutdown.borrow() {
                break;
            }
            continue;
        }

        drain_while_online(&core, &mut shutdown).await;
        break;
    }
    debug!("spooler task exiting");
}

async fn drain_while_online(core: &Arc<Core>, shutdown: &mut watch::Receiver<bool>) {
    let limits = *core.limits.read().unwrap();
    let in_flight = Arc::new(Semaphore::new(limits.max_in_flight as usize));

    while core.online.load(Ordering::SeqCst) && !*shutdown.borrow() {
        // Wait for the number of outstanding publishes to drop below the
        // in-flight cap.
        let permit = tokio::select! {
            _ = shutdown.changed() => return,
            permit = in_flight.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        // Pick the connection that can publish soonest under its throttle,
        // and do the waiting here so the transport never blocks on it.
        let picked = {
            let state = core.state.read().await;
            core.pool.min_throttling_wait(&state.connections)
        };
        let Some((connection, wait)) = picked else {
            return;
        };
        if !wait.is_zero() {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let id = tokio::select! {
            _ = shutdown.changed() => return,
            id = core.spool.pop_id() => id,
        };
        if *shutdown.borrow() {
            // Surrender the popped id so the message is not lost across a
            // shutdown.
            core.spool.add_id(id);
            return;
        }
        let Some(message) = core.spool.get_message_by_id(id) else {
            warn!(id, "spooled message disappeared before publish");
            continue;
        };

        let core = core.clone();
        tokio::spawn(async move {
            publish_spooled_message(&core, connection, message, id).await;
            drop(permit);
        });
    }
}

async fn publish_spooled_message(
    core: &Arc<Core>,
    connection: Arc<PooledConnection>,
    message: Arc<SpoolMessage>,
    id: u64,
) {
    match connection.publish(&message.request).await {
        Ok(_packet_id) => {
            core.spool.remove_message_by_id(id);
            trace!(id, topic = %message.request.topic, "successfully published message");
        }
        Err(error) => {
            let limits = *core.limits.read().unwrap();
            let retried = i64::from(message.retried.fetch_add(1, Ordering::SeqCst));
            if limits.retries_unlimited() || retried < limits.max_retry {
                core.spool.add_id(id);
                error!(id, %error, "failed to publish the message via the spooler, will retry");
            } else {
                error!(
                    id,
                    retries = limits.max_retry,
                    %error,
                    "failed to publish the message after exhausting retries, dropping it"
                );
            }
        }
    }
}
