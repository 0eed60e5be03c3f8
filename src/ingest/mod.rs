//! Order ingest buffer.
//!
//! Accepts order numbers from the write path, persists them as NEW and
//! forwards them to the pending queue. The HTTP handler never waits on the
//! oracle: once the order is stored and enqueued, submit returns.

use std::sync::Arc;

use backon::Retryable;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{BusError, MessageQueue, QueueMessage};
use crate::model::{CreateOutcome, Order, OrderNumber, OrderNumberError};
use crate::stats::PipelineStats;
use crate::storage::{OrderStore, StorageError};
use crate::utils::retry::RetryPolicy;

mod sweep;

pub use sweep::StaleSweep;

/// Errors surfaced to the submitting caller.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid order number: {0}")]
    InvalidFormat(#[from] OrderNumberError),

    #[error("Order {0} belongs to another user")]
    Conflict(String),

    /// The order is stored as NEW; the stale sweep will enqueue it later.
    #[error("Pending queue unavailable for order {order_number}: {source}")]
    QueueUnavailable {
        order_number: String,
        #[source]
        source: BusError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Successful submit results.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Newly stored and enqueued.
    Accepted(Order),
    /// Already submitted by the same user; nothing changed.
    AlreadySubmitted(Order),
}

impl SubmitOutcome {
    pub fn order(&self) -> &Order {
        match self {
            SubmitOutcome::Accepted(order) | SubmitOutcome::AlreadySubmitted(order) => order,
        }
    }
}

/// Ingest and stale-sweep settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Backoff for enqueueing a freshly stored order.
    pub publish_retry: RetryPolicy,
    /// Non-terminal orders untouched for this long are re-enqueued.
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    /// Most orders re-enqueued per sweep.
    pub sweep_batch: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            publish_retry: RetryPolicy::new(50, 1000, 3),
            stale_after_secs: 600,
            sweep_interval_secs: 60,
            sweep_batch: 100,
        }
    }
}

/// Front door of the pipeline.
pub struct OrderIngest {
    orders: Arc<dyn OrderStore>,
    pending: Arc<dyn MessageQueue<String>>,
    config: IngestConfig,
    stats: Arc<PipelineStats>,
}

impl OrderIngest {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        pending: Arc<dyn MessageQueue<String>>,
        config: IngestConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            orders,
            pending,
            config,
            stats,
        }
    }

    /// Submit an order number on behalf of a user.
    #[tracing::instrument(name = "ingest.submit", skip_all, fields(order = %raw.trim(), user = %user_id))]
    pub async fn submit(&self, raw: &str, user_id: Uuid) -> Result<SubmitOutcome, IngestError> {
        let number = OrderNumber::parse(raw)?;

        let order = match self.orders.create_order(&number, user_id).await? {
            CreateOutcome::Existing(existing) if existing.user_id != user_id => {
                return Err(IngestError::Conflict(number.to_string()));
            }
            CreateOutcome::Existing(existing) => {
                return Ok(SubmitOutcome::AlreadySubmitted(existing));
            }
            CreateOutcome::Created(order) => order,
        };

        let published = (|| async {
            self.pending
                .publish(QueueMessage::new(number.to_string()))
                .await
        })
        .retry(self.config.publish_retry.backoff())
        .when(BusError::is_retryable)
        .notify(|err, delay| {
            warn!(error = %err, delay_ms = delay.as_millis() as u64, "Enqueue failed, retrying");
        })
        .await;

        if let Err(source) = published {
            warn!(error = %source, "Order stored as NEW but not enqueued");
            return Err(IngestError::QueueUnavailable {
                order_number: number.to_string(),
                source,
            });
        }

        PipelineStats::bump(&self.stats.submitted);
        info!("Order accepted");
        Ok(SubmitOutcome::Accepted(order))
    }
}

#[cfg(test)]
mod tests;
