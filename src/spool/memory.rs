//! Memory-backed spool.

use super::{PublishRequest, Spool, SpoolConfig, SpoolError, SpoolMessage};
use crate::transport::QoS;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// FIFO spool held entirely in memory, bounded by payload bytes.
///
/// When an incoming message would exceed the byte cap, queued QoS 0
/// messages are evicted oldest-first to make room; if that is not enough
/// the add is rejected.
pub struct InMemorySpool {
    config: SpoolConfig,
    state: Mutex<SpoolState>,
    available: Notify,
    next_id: AtomicU64,
}

struct SpoolState {
    queue: VecDeque<u64>,
    messages: HashMap<u64, Arc<SpoolMessage>>,
    bytes_used: usize,
}

impl InMemorySpool {
    pub fn new(config: SpoolConfig) -> Self {
        InMemorySpool {
            config,
            state: Mutex::new(SpoolState {
                queue: VecDeque::new(),
                messages: HashMap::new(),
                bytes_used: 0,
            }),
            available: Notify::new(),
            next_id: AtomicU64::new(0),
        }
    }

    fn request_size(request: &PublishRequest) -> usize {
        request.topic.len() + request.payload.len()
    }

    fn remove_locked(state: &mut SpoolState, id: u64) {
        if let Some(message) = state.messages.remove(&id) {
            state.bytes_used = state
                .bytes_used
                .saturating_sub(Self::request_size(&message.request));
        }
    }
}

#[async_trait]
impl Spool for InMemorySpool {
    async fn add_message(&self, request: PublishRequest) -> Result<Arc<SpoolMessage>, SpoolError> {
        let size = Self::request_size(&request);
        if size > self.config.spool_size_in_bytes {
            return Err(SpoolError::Full(format!(
                "message of {size} bytes exceeds the spool capacity of {} bytes",
                self.config.spool_size_in_bytes
            )));
        }

        let message = {
            let mut state = self.state.lock().unwrap();

            // Make room by dropping the oldest queued QoS 0 messages.
            while state.bytes_used + size > self.config.spool_size_in_bytes {
                let oldest_qos0 = state.queue.iter().copied().find(|id| {
                    state
                        .messages
                        .get(id)
                        .is_some_and(|m| m.request.qos == QoS::AtMostOnce)
                });
                match oldest_qos0 {
                    Some(id) => {
                        debug!(id, "evicting QoS 0 message to make room in the spool");
                        state.queue.retain(|queued| *queued != id);
                        Self::remove_locked(&mut state, id);
                    }
                    None => {
                        return Err(SpoolError::Full(format!(
                            "spool is holding {} of {} bytes and no QoS 0 message can be evicted",
                            state.bytes_used, self.config.spool_size_in_bytes
                        )));
                    }
                }
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let message = Arc::new(SpoolMessage::new(id, request));
            state.messages.insert(id, message.clone());
            state.queue.push_back(id);
            state.bytes_used += size;
            message
        };

        self.available.notify_one();
        Ok(message)
    }

    async fn pop_id(&self) -> u64 {
        loop {
            if let Some(id) = self.state.lock().unwrap().queue.pop_front() {
                return id;
            }
            self.available.notified().await;
        }
    }

    fn add_id(&self, id: u64) {
        self.state.lock().unwrap().queue.push_front(id);
        self.available.notify_one();
    }

    fn get_message_by_id(&self, id: u64) -> Option<Arc<SpoolMessage>> {
        self.state.lock().unwrap().messages.get(&id).cloned()
    }

    fn remove_message_by_id(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        Self::remove_locked(&mut state, id);
    }

    fn pop_all_qos0(&self) {
        let mut state = self.state.lock().unwrap();
        let qos0: Vec<u64> = state
            .queue
            .iter()
            .copied()
            .filter(|id| {
                state
                    .messages
                    .get(id)
                    .is_some_and(|m| m.request.qos == QoS::AtMostOnce)
            })
            .collect();
        if !qos0.is_empty() {
            debug!(count = qos0.len(), "dropping queued QoS 0 messages");
        }
        for id in qos0 {
            state.queue.retain(|queued| *queued != id);
            Self::remove_locked(&mut state, id);
        }
    }

    fn config(&self) -> SpoolConfig {
        self.config
    }
}
