//! Facade-level error types.
//!
//! Validation failures surface synchronously and are never retried or
//! spooled. Transport failures on subscribe surface to the caller;
//! transport failures on publish are retried by the publisher loop and
//! never reach these types.

use crate::spool::SpoolError;
use crate::topic::TopicError;
use crate::transport::TransportError;
use thiserror::Error;

/// Why a publish request was not accepted into the spool.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("cannot publish because device is configured to run offline")]
    NotConfigured,
    #[error("invalid publish request: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("publish payload of {size} bytes exceeds the limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("device is offline, dropping QoS 0 message")]
    OfflineDrop,
    #[error(transparent)]
    Spool(#[from] SpoolError),
}

/// Why a subscribe or unsubscribe did not take effect.
#[derive(Debug, Clone, Error)]
pub enum SubscribeError {
    #[error("invalid subscribe request: {0}")]
    InvalidTopic(#[from] TopicError),
    #[error("timed out waiting for the broker to acknowledge")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
