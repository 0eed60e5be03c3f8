//! Order status reconciler: verdict queue consumer.
//!
//! Applies each verdict to the order store through its compare-and-set
//! transition. Verdicts for orders that are already terminal are duplicates
//! from at-least-once delivery and are dropped. A PROCESSED transition
//! credits the owner's balance in the same transaction, so replaying a
//! verdict never credits twice.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{BusError, Delivery, MessageQueue, QueueMessage};
use crate::dlq::{DeadLetter, FailureReason};
use crate::model::{OrderStatus, TransitionOutcome, Verdict};
use crate::stats::PipelineStats;
use crate::storage::{OrderStore, StorageError};
use crate::utils::retry::RetryPolicy;

/// Reconciler pool settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub workers: usize,
    /// Backoff for retryable storage failures.
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retry: RetryPolicy::new(50, 2000, 5),
        }
    }
}

/// What the reconciler did with one verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// Transition written. `finalized` when the order became terminal.
    Applied { finalized: bool },
    /// Order was already terminal; nothing written.
    Duplicate(OrderStatus),
    DeadLettered,
    /// Dead-letter publish failed; the verdict was returned for redelivery.
    Returned,
}

/// Verdict-queue consumer pool.
pub struct Reconciler {
    orders: Arc<dyn OrderStore>,
    verdicts: Arc<dyn MessageQueue<Verdict>>,
    dead_letters: Arc<dyn MessageQueue<DeadLetter>>,
    config: ReconcilerConfig,
    receive_wait: Duration,
    stats: Arc<PipelineStats>,
}

impl Reconciler {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        verdicts: Arc<dyn MessageQueue<Verdict>>,
        dead_letters: Arc<dyn MessageQueue<DeadLetter>>,
        config: ReconcilerConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            orders,
            verdicts,
            dead_letters,
            config,
            receive_wait: Duration::from_millis(500),
            stats,
        }
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Spawn `config.workers` consumers. They stop when `cancel` flips.
    pub fn spawn(self: Arc<Self>, cancel: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let reconciler = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move { reconciler.run_worker(worker, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, mut cancel: watch::Receiver<bool>) {
        debug!(worker, "Reconciler worker started");

        loop {
            if *cancel.borrow() {
                break;
            }

            let received = tokio::select! {
                received = self.verdicts.receive(self.receive_wait) => received,
                _ = cancel.changed() => break,
            };

            match received {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                }
                Ok(None) => {}
                Err(BusError::Closed(_)) => {
                    info!(worker, "Verdict queue closed");
                    break;
                }
                Err(e) => {
                    warn!(worker, error = %e, "Receive from verdict queue failed");
                    tokio::time::sleep(self.receive_wait).await;
                }
            }
        }

        debug!(worker, "Reconciler worker stopped");
    }

    /// Apply one verdict.
    #[tracing::instrument(
        name = "reconciler.handle",
        skip_all,
        fields(order = %delivery.message.payload.order_number)
    )]
    pub async fn handle(&self, delivery: Delivery<Verdict>) -> Reconciled {
        PipelineStats::bump(&self.stats.verdicts);
        let verdict = &delivery.message.payload;
        let transition = verdict.transition();
        let calls = AtomicU32::new(0);

        let result = (|| async {
            calls.fetch_add(1, Ordering::Relaxed);
            self.orders
                .apply_transition(&verdict.order_number, &transition)
                .await
        })
        .retry(self.config.retry.backoff())
        .when(StorageError::is_retryable)
        .notify(|err, delay| {
            warn!(error = %err, delay_ms = delay.as_millis() as u64, "Transition failed, retrying");
        })
        .await;

        match result {
            Ok(TransitionOutcome::Applied) => {
                let finalized = verdict.is_final();
                if finalized {
                    PipelineStats::bump(&self.stats.finalized);
                    info!(status = %transition.target(), "Order finalized");
                } else {
                    debug!("Order processing");
                }
                self.ack(delivery.id).await;
                Reconciled::Applied { finalized }
            }
            Ok(TransitionOutcome::AlreadyTerminal(status)) => {
                PipelineStats::bump(&self.stats.duplicates);
                debug!(status = %status, "Duplicate verdict for terminal order");
                self.ack(delivery.id).await;
                Reconciled::Duplicate(status)
            }
            Err(e) => {
                let attempts = delivery.message.failures + calls.load(Ordering::Relaxed);
                warn!(error = %e, attempts, "Verdict could not be applied");
                self.dead_letter(&delivery, attempts, e.to_string()).await
            }
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery<Verdict>,
        attempts: u32,
        detail: String,
    ) -> Reconciled {
        let letter = DeadLetter::new(
            delivery.message.payload.order_number.to_string(),
            FailureReason::ReconcileFailed,
            attempts,
            detail,
        );
        let message = QueueMessage {
            payload: letter,
            attempt: 0,
            failures: delivery.message.failures,
            enqueued_at: chrono::Utc::now(),
        };

        if let Err(e) = self.dead_letters.publish(message).await {
            warn!(error = %e, "Dead letter publish failed, returning verdict");
            if let Err(e) = self.verdicts.nack(delivery.id, self.receive_wait).await {
                warn!(delivery_id = delivery.id, error = %e, "Nack failed");
            }
            return Reconciled::Returned;
        }

        PipelineStats::bump(&self.stats.dead_lettered);
        self.ack(delivery.id).await;
        Reconciled::DeadLettered
    }

    async fn ack(&self, delivery_id: u64) {
        if let Err(e) = self.verdicts.ack(delivery_id).await {
            warn!(delivery_id, error = %e, "Ack failed; verdict will be redelivered");
        }
    }
}

#[cfg(test)]
mod tests;
