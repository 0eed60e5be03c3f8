//! Mock queue implementation for testing.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, Delivery, MessageQueue, QueueMessage, Result};

/// A publish recorded by the mock, with its requested delay.
#[derive(Debug, Clone)]
pub struct Published<T> {
    pub message: QueueMessage<T>,
    pub delay: Duration,
}

/// Mock queue for testing.
///
/// Publishes are recorded rather than delivered. Tests stage deliveries
/// explicitly with [`MockQueue::push_delivery`].
pub struct MockQueue<T> {
    name: String,
    published: RwLock<Vec<Published<T>>>,
    staged: RwLock<VecDeque<QueueMessage<T>>>,
    acked: RwLock<Vec<u64>>,
    nacked: RwLock<Vec<(u64, Duration)>>,
    next_id: RwLock<u64>,
    /// Number of upcoming publishes to fail.
    fail_publishes: RwLock<usize>,
    fail_on_publish: RwLock<bool>,
}

impl<T> MockQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            published: RwLock::new(Vec::new()),
            staged: RwLock::new(VecDeque::new()),
            acked: RwLock::new(Vec::new()),
            nacked: RwLock::new(Vec::new()),
            next_id: RwLock::new(1),
            fail_publishes: RwLock::new(0),
            fail_on_publish: RwLock::new(false),
        }
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Fail the next `count` publishes, then succeed.
    pub async fn fail_next_publishes(&self, count: usize) {
        *self.fail_publishes.write().await = count;
    }

    pub async fn push_delivery(&self, message: QueueMessage<T>) {
        self.staged.write().await.push_back(message);
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<Published<T>> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn acked(&self) -> Vec<u64> {
        self.acked.read().await.clone()
    }

    pub async fn nacked(&self) -> Vec<(u64, Duration)> {
        self.nacked.read().await.clone()
    }

    async fn record(&self, message: QueueMessage<T>, delay: Duration) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Connection("Mock publish failure".to_string()));
        }
        {
            let mut remaining = self.fail_publishes.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Publish("Mock transient publish failure".to_string()));
            }
        }
        self.published
            .write()
            .await
            .push(Published { message, delay });
        Ok(())
    }
}

#[async_trait]
impl<T> MessageQueue<T> for MockQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: QueueMessage<T>) -> Result<()> {
        self.record(message, Duration::ZERO).await
    }

    async fn publish_delayed(&self, message: QueueMessage<T>, delay: Duration) -> Result<()> {
        self.record(message, delay).await
    }

    async fn receive(&self, _wait: Duration) -> Result<Option<Delivery<T>>> {
        let Some(message) = self.staged.write().await.pop_front() else {
            return Ok(None);
        };
        let mut next_id = self.next_id.write().await;
        let id = *next_id;
        *next_id += 1;
        Ok(Some(Delivery { id, message }))
    }

    async fn ack(&self, delivery_id: u64) -> Result<()> {
        self.acked.write().await.push(delivery_id);
        Ok(())
    }

    async fn nack(&self, delivery_id: u64, delay: Duration) -> Result<()> {
        self.nacked.write().await.push((delivery_id, delay));
        Ok(())
    }

    async fn depth(&self) -> usize {
        self.staged.read().await.len()
    }
}
