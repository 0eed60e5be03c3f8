//! Message queues connecting the pipeline stages.
//!
//! This module contains:
//! - `MessageQueue` trait: at-least-once publish/receive/ack/nack
//! - `QueueMessage` envelope: payload plus attempt bookkeeping
//! - Implementations: in-memory channel queue, Mock

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod channel;
pub mod mock;

pub use channel::{ChannelQueue, ChannelQueueConfig};
pub use mock::MockQueue;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Queue '{0}' is full")]
    Full(String),

    #[error("Queue '{0}' is closed")]
    Closed(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Connection failed: {0}")]
    Connection(String),
}

impl BusError {
    /// Whether publishing again later may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, BusError::Closed(_))
    }
}

/// Envelope for every queued payload.
///
/// Identity for idempotency is carried by the payload (the order number),
/// never by the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage<T> {
    pub payload: T,
    /// Poll attempts in the current pass through the pipeline.
    pub attempt: u32,
    /// Failures accumulated across dead-letter round trips.
    pub failures: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl<T> QueueMessage<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            attempt: 0,
            failures: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Same payload, one more attempt, fresh timestamp.
    pub fn next_attempt(&self) -> Self
    where
        T: Clone,
    {
        Self {
            payload: self.payload.clone(),
            attempt: self.attempt + 1,
            failures: self.failures,
            enqueued_at: Utc::now(),
        }
    }

    /// Carry this envelope's bookkeeping over to a different payload.
    pub fn with_payload<U>(&self, payload: U) -> QueueMessage<U> {
        QueueMessage {
            payload,
            attempt: self.attempt,
            failures: self.failures,
            enqueued_at: Utc::now(),
        }
    }
}

/// A received message awaiting `ack` or `nack`.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    /// Receipt handle for this delivery.
    pub id: u64,
    pub message: QueueMessage<T>,
}

/// At-least-once queue between two pipeline stages.
///
/// A received message stays invisible until it is acked, nacked, or its
/// visibility timeout lapses, at which point it is delivered again.
/// No ordering is guaranteed.
///
/// Implementations:
/// - `ChannelQueue`: in-process queue for standalone mode and tests
/// - `MockQueue`: records publishes, injects failures
#[async_trait]
pub trait MessageQueue<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Queue name, for logging.
    fn name(&self) -> &str;

    /// Make a message available for delivery immediately.
    async fn publish(&self, message: QueueMessage<T>) -> Result<()>;

    /// Make a message available once `delay` has elapsed.
    async fn publish_delayed(&self, message: QueueMessage<T>, delay: Duration) -> Result<()>;

    /// Wait up to `wait` for a message. `Ok(None)` on timeout.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery<T>>>;

    /// Acknowledge a delivery; it will not be delivered again.
    async fn ack(&self, delivery_id: u64) -> Result<()>;

    /// Return a delivery to the queue, visible again after `delay`.
    async fn nack(&self, delivery_id: u64, delay: Duration) -> Result<()>;

    /// Messages not yet acknowledged (ready, delayed and in flight).
    async fn depth(&self) -> usize;

    /// Stop accepting publishes. Backends without a notion of closing
    /// ignore it.
    async fn close(&self) {}
}

// ============================================================================
// Configuration
// ============================================================================

/// Queue configuration shared by all pipeline queues.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum unacknowledged messages per queue.
    pub capacity: usize,
    /// How long a received message stays invisible before redelivery.
    pub visibility_timeout_secs: u64,
    /// Upper bound on a single receive wait.
    pub receive_wait_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            visibility_timeout_secs: 30,
            receive_wait_ms: 500,
        }
    }
}

impl QueueConfig {
    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}
