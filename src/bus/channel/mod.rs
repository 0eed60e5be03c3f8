//! In-memory queue for standalone mode.
//!
//! Implements the at-least-once contract inside a single process: received
//! messages are tracked in flight until acked, and come back after the
//! visibility timeout if the consumer never answers.
//! Ideal for local development and testing without an external broker.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BusError, Delivery, MessageQueue, QueueConfig, QueueMessage, Result};

/// Configuration for a channel queue.
#[derive(Clone, Debug)]
pub struct ChannelQueueConfig {
    pub name: String,
    pub capacity: usize,
    pub visibility_timeout: Duration,
}

impl ChannelQueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let defaults = QueueConfig::default();
        Self {
            name: name.into(),
            capacity: defaults.capacity,
            visibility_timeout: defaults.visibility_timeout(),
        }
    }

    /// Build from the shared queue configuration.
    pub fn from_config(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            name: name.into(),
            capacity: config.capacity,
            visibility_timeout: config.visibility_timeout(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

struct InFlight<T> {
    deadline: Instant,
    message: QueueMessage<T>,
}

struct Inner<T> {
    ready: VecDeque<QueueMessage<T>>,
    delayed: Vec<(Instant, QueueMessage<T>)>,
    in_flight: HashMap<u64, InFlight<T>>,
    next_id: u64,
    closed: bool,
}

impl<T> Inner<T> {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.in_flight.len()
    }

    /// Move due delayed messages and expired in-flight messages to `ready`.
    fn promote(&mut self, now: Instant) -> usize {
        let mut redelivered = 0;

        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, message) = self.delayed.swap_remove(i);
                self.ready.push_back(message);
            } else {
                i += 1;
            }
        }

        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.in_flight.remove(&id) {
                self.ready.push_back(entry.message);
                redelivered += 1;
            }
        }

        redelivered
    }

    /// Earliest instant at which `promote` would change something.
    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let in_flight = self.in_flight.values().map(|entry| entry.deadline);
        delayed.chain(in_flight).min()
    }
}

/// In-memory at-least-once queue.
pub struct ChannelQueue<T> {
    config: ChannelQueueConfig,
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> ChannelQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: ChannelQueueConfig) -> Self {
        info!(
            queue = %config.name,
            capacity = config.capacity,
            visibility_timeout_ms = config.visibility_timeout.as_millis() as u64,
            "Channel queue initialized"
        );

        Self {
            config,
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                delayed: Vec::new(),
                in_flight: HashMap::new(),
                next_id: 1,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Create a queue with default capacity and visibility timeout.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(ChannelQueueConfig::new(name))
    }

    async fn enqueue(&self, message: QueueMessage<T>, delay: Duration) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(BusError::Closed(self.config.name.clone()));
            }
            if inner.len() >= self.config.capacity {
                warn!(
                    queue = %self.config.name,
                    capacity = self.config.capacity,
                    "Queue full, rejecting publish"
                );
                return Err(BusError::Full(self.config.name.clone()));
            }
            if delay.is_zero() {
                inner.ready.push_back(message);
            } else {
                inner.delayed.push((Instant::now() + delay, message));
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl<T> MessageQueue<T> for ChannelQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    #[tracing::instrument(name = "queue.publish", skip_all, fields(queue = %self.config.name))]
    async fn publish(&self, message: QueueMessage<T>) -> Result<()> {
        self.enqueue(message, Duration::ZERO).await
    }

    #[tracing::instrument(name = "queue.publish_delayed", skip_all, fields(queue = %self.config.name))]
    async fn publish_delayed(&self, message: QueueMessage<T>, delay: Duration) -> Result<()> {
        self.enqueue(message, delay).await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery<T>>> {
        let deadline = Instant::now() + wait;

        loop {
            let wake_at = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                let redelivered = inner.promote(now);
                if redelivered > 0 {
                    debug!(
                        queue = %self.config.name,
                        count = redelivered,
                        "Visibility timeout lapsed, redelivering"
                    );
                }

                if let Some(message) = inner.ready.pop_front() {
                    let id = inner.next_id;
                    inner.next_id += 1;
                    inner.in_flight.insert(
                        id,
                        InFlight {
                            deadline: now + self.config.visibility_timeout,
                            message: message.clone(),
                        },
                    );
                    // Leave a wakeup for a sibling consumer if more is ready.
                    if !inner.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Ok(Some(Delivery { id, message }));
                }

                if inner.closed && inner.delayed.is_empty() && inner.in_flight.is_empty() {
                    return Err(BusError::Closed(self.config.name.clone()));
                }

                if now >= deadline {
                    return Ok(None);
                }

                inner
                    .next_wakeup()
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery_id: u64) -> Result<()> {
        let removed = self.inner.lock().await.in_flight.remove(&delivery_id);
        if removed.is_none() {
            // Visibility lapsed and the message went back to the queue.
            debug!(
                queue = %self.config.name,
                delivery_id,
                "Ack for unknown delivery"
            );
        }
        Ok(())
    }

    async fn nack(&self, delivery_id: u64, delay: Duration) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.in_flight.remove(&delivery_id) else {
                debug!(
                    queue = %self.config.name,
                    delivery_id,
                    "Nack for unknown delivery"
                );
                return Ok(());
            };
            if delay.is_zero() {
                inner.ready.push_back(entry.message);
            } else {
                inner.delayed.push((Instant::now() + delay, entry.message));
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn depth(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Stop accepting publishes and wake every waiting consumer.
    ///
    /// Consumers still drain messages already queued; once empty,
    /// `receive` returns `BusError::Closed`.
    async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
        info!(queue = %self.config.name, "Channel queue closed");
    }
}
