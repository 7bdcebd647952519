//! Persistent FIFO of outbound publish requests.
//!
//! The spool sits between the facade's `publish` and the publisher loop:
//! requests are accepted into the spool immediately and drained to the
//! broker asynchronously. The trait is the seam to pluggable storage; the
//! in-memory implementation lives in [`memory`].

use crate::config::{SpoolStorageType, SpoolerSection};
use crate::transport::QoS;
use async_trait::async_trait;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use thiserror::Error;

pub mod memory;

pub use memory::InMemorySpool;

/// An outbound publish as submitted by a local component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// Concrete topic; wildcards are rejected at validation.
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishRequest {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        PublishRequest {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// A spooled request plus its retry bookkeeping.
#[derive(Debug)]
pub struct SpoolMessage {
    pub id: u64,
    pub request: PublishRequest,
    /// Times the publisher has already retried this message.
    pub retried: AtomicU32,
}

impl SpoolMessage {
    pub fn new(id: u64, request: PublishRequest) -> Self {
        SpoolMessage {
            id,
            request,
            retried: AtomicU32::new(0),
        }
    }
}

/// Spooler behavior knobs, surfaced to the client for its offline policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpoolConfig {
    pub keep_qos0_when_offline: bool,
    pub spool_size_in_bytes: usize,
    pub storage_type: SpoolStorageType,
}

impl From<&SpoolerSection> for SpoolConfig {
    fn from(section: &SpoolerSection) -> Self {
        SpoolConfig {
            keep_qos0_when_offline: section.keep_qos0_when_offline,
            spool_size_in_bytes: section.spool_size_in_bytes,
            storage_type: section.storage_type,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SpoolError {
    #[error("spooler queue is full: {0}")]
    Full(String),
    #[error("interrupted while waiting on the spooler")]
    Interrupted,
}

/// Durable FIFO of publish requests.
///
/// Ids are monotonic per spool instance. `pop_id` removes the head id from
/// the queue but leaves the message retrievable by id until the publisher
/// confirms delivery; a failed publish re-enters the queue via `add_id`.
#[async_trait]
pub trait Spool: Send + Sync {
    /// Accept a request, or reject it when the spool cannot make room.
    async fn add_message(&self, request: PublishRequest) -> Result<Arc<SpoolMessage>, SpoolError>;

    /// Take the next id, waiting until one is available. Cancel-safe: a
    /// cancelled wait never loses an id.
    async fn pop_id(&self) -> u64;

    /// Put an id back at the head of the queue (retry or surrendered pop).
    fn add_id(&self, id: u64);

    fn get_message_by_id(&self, id: u64) -> Option<Arc<SpoolMessage>>;

    fn remove_message_by_id(&self, id: u64);

    /// Drop every queued QoS 0 message (offline purge).
    fn pop_all_qos0(&self);

    fn config(&self) -> SpoolConfig;
}
