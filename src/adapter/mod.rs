//! Accrual adapter: pending queue consumer.
//!
//! Each worker takes an order number from the pending queue, asks the
//! accrual oracle about it and routes the answer:
//!
//! ```text
//! pending --> [adapter] --(INVALID / PROCESSED / PROCESSING)--> verdicts
//!                |  \
//!                |   \--(not final yet, delayed)--> pending
//!                \--(bad number / oracle exhausted)--> dead letters
//! ```
//!
//! A delivery is acked only after its onward publish succeeded. Anything
//! that fails in between is nacked and comes back.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{BusError, Delivery, MessageQueue, QueueMessage};
use crate::dlq::{DeadLetter, FailureReason};
use crate::model::{OrderNumber, Verdict};
use crate::oracle::{AccrualOracle, AccrualStatus, OracleError, OracleReply};
use crate::stats::PipelineStats;
use crate::utils::retry::{poll_delay, RetryPolicy};

mod throttle;

pub use throttle::Throttle;

/// Adapter pool settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Concurrent consumers of the pending queue.
    pub workers: usize,
    /// Upper bound on a single oracle call.
    pub call_timeout_ms: u64,
    /// Backoff for transient oracle failures within one delivery.
    pub oracle_retry: RetryPolicy,
    /// Base delay before re-polling a non-final order.
    pub poll_delay_ms: u64,
    pub max_poll_delay_ms: u64,
    /// Polls per pass before the order is dead-lettered.
    pub max_poll_attempts: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            call_timeout_ms: 2000,
            oracle_retry: RetryPolicy::new(100, 5000, 5),
            poll_delay_ms: 1000,
            max_poll_delay_ms: 60_000,
            max_poll_attempts: 10,
        }
    }
}

impl AdapterConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn max_poll_delay(&self) -> Duration {
        Duration::from_millis(self.max_poll_delay_ms)
    }
}

/// What the adapter did with one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// A final verdict went to the verdict queue.
    Verdict(Verdict),
    /// Not final yet; re-published to pending after `delay`.
    Polling { delay: Duration },
    /// Oracle asked us to back off; the delivery was returned untouched.
    RateLimited { retry_after: Duration },
    DeadLettered(FailureReason),
    /// An onward publish failed; the delivery was returned for redelivery.
    Returned,
}

/// Pending-queue consumer pool.
pub struct AccrualAdapter {
    oracle: Arc<dyn AccrualOracle>,
    pending: Arc<dyn MessageQueue<String>>,
    verdicts: Arc<dyn MessageQueue<Verdict>>,
    dead_letters: Arc<dyn MessageQueue<DeadLetter>>,
    throttle: Arc<Throttle>,
    config: AdapterConfig,
    receive_wait: Duration,
    stats: Arc<PipelineStats>,
}

impl AccrualAdapter {
    pub fn new(
        oracle: Arc<dyn AccrualOracle>,
        pending: Arc<dyn MessageQueue<String>>,
        verdicts: Arc<dyn MessageQueue<Verdict>>,
        dead_letters: Arc<dyn MessageQueue<DeadLetter>>,
        config: AdapterConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            oracle,
            pending,
            verdicts,
            dead_letters,
            throttle: Arc::new(Throttle::new()),
            config,
            receive_wait: Duration::from_millis(500),
            stats,
        }
    }

    /// Set how long one receive waits before re-checking for shutdown.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn throttle(&self) -> Arc<Throttle> {
        Arc::clone(&self.throttle)
    }

    /// Spawn `config.workers` consumers. They stop when `cancel` flips.
    pub fn spawn(self: Arc<Self>, cancel: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let adapter = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move { adapter.run_worker(worker, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, mut cancel: watch::Receiver<bool>) {
        debug!(worker, "Adapter worker started");

        loop {
            if *cancel.borrow() {
                break;
            }

            let received = tokio::select! {
                received = async {
                    self.throttle.wait().await;
                    self.pending.receive(self.receive_wait).await
                } => received,
                _ = cancel.changed() => break,
            };

            match received {
                Ok(Some(delivery)) => {
                    // A pause may have started while this worker sat in receive.
                    tokio::select! {
                        _ = self.throttle.wait() => {}
                        _ = cancel.changed() => break,
                    }
                    self.handle(delivery).await;
                }
                Ok(None) => {}
                Err(BusError::Closed(_)) => {
                    info!(worker, "Pending queue closed");
                    break;
                }
                Err(e) => {
                    warn!(worker, error = %e, "Receive from pending queue failed");
                    tokio::time::sleep(self.receive_wait).await;
                }
            }
        }

        debug!(worker, "Adapter worker stopped");
    }

    /// Process one delivery from the pending queue.
    #[tracing::instrument(
        name = "adapter.handle",
        skip_all,
        fields(order = %delivery.message.payload, attempt = delivery.message.attempt)
    )]
    pub async fn handle(&self, delivery: Delivery<String>) -> Routed {
        let number = match OrderNumber::parse(&delivery.message.payload) {
            Ok(number) => number,
            Err(e) => {
                warn!(error = %e, "Order number failed re-validation");
                let letter = DeadLetter::new(
                    delivery.message.payload.clone(),
                    FailureReason::InvalidFormat,
                    delivery.message.failures + 1,
                    e.to_string(),
                );
                return self.dead_letter(&delivery, letter).await;
            }
        };

        let (result, calls) = self.lookup(&number).await;

        match result {
            Ok(reply) => self.route_reply(&delivery, number, reply).await,
            Err(OracleError::RateLimited { retry_after }) => {
                PipelineStats::bump(&self.stats.rate_limited);
                warn!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Oracle rate limit, pausing adapter pool"
                );
                self.throttle.pause_for(retry_after).await;
                self.nack(delivery.id, retry_after).await;
                Routed::RateLimited { retry_after }
            }
            Err(e) => {
                warn!(error = %e, calls, "Oracle retries exhausted");
                let letter = DeadLetter::new(
                    number.to_string(),
                    FailureReason::OracleExhausted,
                    delivery.message.failures + calls,
                    e.to_string(),
                );
                self.dead_letter(&delivery, letter).await
            }
        }
    }

    /// Call the oracle with a per-call timeout, retrying transient failures.
    ///
    /// Returns the final result and the number of calls made.
    async fn lookup(&self, number: &OrderNumber) -> (Result<OracleReply, OracleError>, u32) {
        let calls = AtomicU32::new(0);
        let call_timeout = self.config.call_timeout();

        let result = (|| async {
            self.throttle.wait().await;
            calls.fetch_add(1, Ordering::Relaxed);
            PipelineStats::bump(&self.stats.lookups);
            match tokio::time::timeout(call_timeout, self.oracle.lookup(number)).await {
                Ok(result) => result,
                Err(_) => Err(OracleError::Timeout(call_timeout)),
            }
        })
        .retry(self.config.oracle_retry.backoff())
        .when(OracleError::is_transient)
        .notify(|err, delay| {
            debug!(error = %err, delay_ms = delay.as_millis() as u64, "Oracle call failed, retrying");
        })
        .await;

        (result, calls.load(Ordering::Relaxed))
    }

    async fn route_reply(
        &self,
        delivery: &Delivery<String>,
        number: OrderNumber,
        reply: OracleReply,
    ) -> Routed {
        match reply.status {
            AccrualStatus::Invalid => {
                self.forward(delivery, Verdict::invalid(number)).await
            }
            AccrualStatus::Processed => {
                let accrual = reply.accrual.unwrap_or(Decimal::ZERO);
                self.forward(delivery, Verdict::processed(number, accrual))
                    .await
            }
            AccrualStatus::Unregistered
            | AccrualStatus::Registered
            | AccrualStatus::Processing => {
                self.schedule_poll(delivery, number, reply.retry_after)
                    .await
            }
        }
    }

    /// Publish a final verdict, then ack.
    async fn forward(&self, delivery: &Delivery<String>, verdict: Verdict) -> Routed {
        let message = delivery.message.with_payload(verdict.clone());
        if let Err(e) = self.verdicts.publish(message).await {
            warn!(error = %e, "Verdict publish failed, returning delivery");
            return self.return_delivery(delivery.id).await;
        }
        debug!(verdict = ?verdict.outcome, "Verdict published");
        self.ack(delivery.id).await;
        Routed::Verdict(verdict)
    }

    /// Oracle has no final answer yet: mark the order PROCESSING and ask again
    /// later, or give up once the poll limit is reached.
    async fn schedule_poll(
        &self,
        delivery: &Delivery<String>,
        number: OrderNumber,
        retry_after: Option<Duration>,
    ) -> Routed {
        let message = &delivery.message;
        let polls = message.attempt + 1;

        if polls >= self.config.max_poll_attempts {
            warn!(polls, "Oracle never reached a final status");
            let letter = DeadLetter::new(
                number.to_string(),
                FailureReason::OracleExhausted,
                message.failures + polls,
                format!("no final status after {} polls", polls),
            );
            return self.dead_letter(delivery, letter).await;
        }

        let processing = message.with_payload(Verdict::processing(number));
        if let Err(e) = self.verdicts.publish(processing).await {
            warn!(error = %e, "Processing verdict publish failed, returning delivery");
            return self.return_delivery(delivery.id).await;
        }

        let delay = retry_after.unwrap_or_else(|| {
            poll_delay(
                self.config.poll_delay(),
                message.attempt,
                self.config.max_poll_delay(),
            )
        });

        if let Err(e) = self.pending.publish_delayed(message.next_attempt(), delay).await {
            warn!(error = %e, "Re-poll publish failed, returning delivery");
            return self.return_delivery(delivery.id).await;
        }

        PipelineStats::bump(&self.stats.polls_requeued);
        debug!(delay_ms = delay.as_millis() as u64, "Order not final, polling again");
        self.ack(delivery.id).await;
        Routed::Polling { delay }
    }

    async fn dead_letter(&self, delivery: &Delivery<String>, letter: DeadLetter) -> Routed {
        let reason = letter.reason;
        let message = QueueMessage {
            payload: letter,
            attempt: 0,
            failures: delivery.message.failures,
            enqueued_at: chrono::Utc::now(),
        };
        if let Err(e) = self.dead_letters.publish(message).await {
            warn!(error = %e, "Dead letter publish failed, returning delivery");
            return self.return_delivery(delivery.id).await;
        }
        PipelineStats::bump(&self.stats.dead_lettered);
        info!(reason = %reason, "Order dead-lettered");
        self.ack(delivery.id).await;
        Routed::DeadLettered(reason)
    }

    async fn return_delivery(&self, delivery_id: u64) -> Routed {
        self.nack(delivery_id, self.config.poll_delay()).await;
        Routed::Returned
    }

    async fn ack(&self, delivery_id: u64) {
        if let Err(e) = self.pending.ack(delivery_id).await {
            warn!(delivery_id, error = %e, "Ack failed; message will be redelivered");
        }
    }

    async fn nack(&self, delivery_id: u64, delay: Duration) {
        if let Err(e) = self.pending.nack(delivery_id, delay).await {
            warn!(delivery_id, error = %e, "Nack failed; visibility timeout will redeliver");
        }
    }
}
