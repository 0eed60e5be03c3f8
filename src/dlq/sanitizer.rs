//! Periodic DLQ sanitizer.
//!
//! Each cycle drains the DLQ channel into the dead-letter store, then walks
//! the pending entries and decides their fate with [`decide`]. A terminal
//! order is never revived.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeadLetter, DeadLetterEntry};
use crate::bus::{MessageQueue, QueueMessage};
use crate::model::{Order, OrderNumber, Transition};
use crate::stats::PipelineStats;
use crate::storage::{DeadLetterStore, OrderStore, Result};

/// Sanitizer settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    pub interval_ms: u64,
    /// Minimum time since the last failure before a replay.
    pub cooldown_ms: u64,
    /// Cumulative attempts after which an entry is quarantined.
    pub max_attempts: u32,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            cooldown_ms: 60_000,
            max_attempts: 30,
        }
    }
}

impl SanitizerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.cooldown_ms).unwrap_or(i64::MAX))
    }
}

/// Fate of one pending dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Drop the entry; nothing left to do for the order.
    Discard,
    /// Write INVALID to the order directly, then drop the entry.
    ForceInvalid,
    /// Park the entry for an operator.
    Quarantine(&'static str),
    /// Still cooling down; look again next cycle.
    Wait,
    /// Put the order number back on the pending queue.
    Requeue,
}

/// Decide what to do with a pending entry.
///
/// `order` is the current order record, `None` if it does not exist or the
/// stored number does not parse.
pub fn decide(
    entry: &DeadLetterEntry,
    order: Option<&Order>,
    now: DateTime<Utc>,
    config: &SanitizerConfig,
) -> Decision {
    if !entry.reason.is_replayable() {
        return match order {
            Some(order) if !order.status.is_terminal() => Decision::ForceInvalid,
            _ => Decision::Discard,
        };
    }

    let Some(order) = order else {
        return Decision::Quarantine("order not found");
    };
    if order.status.is_terminal() {
        return Decision::Discard;
    }
    if entry.attempts >= config.max_attempts {
        return Decision::Quarantine("retry ceiling reached");
    }
    if now - entry.last_failed_at < config.cooldown() {
        return Decision::Wait;
    }
    Decision::Requeue
}

/// Counts from one sanitizer cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Letters moved from the DLQ channel into the store.
    pub drained: usize,
    pub requeued: usize,
    pub waiting: usize,
    pub quarantined: usize,
    pub discarded: usize,
    pub forced_invalid: usize,
    /// Entries whose handling failed this cycle; retried next cycle.
    pub errors: usize,
}

impl SanitizeReport {
    fn changed_anything(&self) -> bool {
        self.drained
            + self.requeued
            + self.quarantined
            + self.discarded
            + self.forced_invalid
            + self.errors
            > 0
    }
}

/// DLQ drain and replay task.
pub struct Sanitizer {
    orders: Arc<dyn OrderStore>,
    store: Arc<dyn DeadLetterStore>,
    dead_letters: Arc<dyn MessageQueue<DeadLetter>>,
    pending: Arc<dyn MessageQueue<String>>,
    config: SanitizerConfig,
    stats: Arc<PipelineStats>,
}

impl Sanitizer {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        store: Arc<dyn DeadLetterStore>,
        dead_letters: Arc<dyn MessageQueue<DeadLetter>>,
        pending: Arc<dyn MessageQueue<String>>,
        config: SanitizerConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            orders,
            store,
            dead_letters,
            pending,
            config,
            stats,
        }
    }

    /// Run one drain-and-decide cycle.
    #[tracing::instrument(name = "sanitizer.cycle", skip_all)]
    pub async fn run_cycle(&self) -> Result<SanitizeReport> {
        let mut report = SanitizeReport {
            drained: self.drain().await?,
            ..SanitizeReport::default()
        };

        let now = Utc::now();
        for entry in self.store.list_pending().await? {
            if let Err(e) = self.settle(&entry, now, &mut report).await {
                warn!(order = %entry.order_number, error = %e, "Failed to settle dead letter");
                report.errors += 1;
            }
        }

        Ok(report)
    }

    /// Move every queued letter into the store, merging by order number.
    async fn drain(&self) -> Result<usize> {
        let mut drained = 0;
        loop {
            let delivery = match self.dead_letters.receive(Duration::ZERO).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "DLQ receive failed, stopping drain");
                    break;
                }
            };

            if let Err(e) = self.store.record(&delivery.message.payload).await {
                if let Err(nack_err) = self.dead_letters.nack(delivery.id, Duration::ZERO).await {
                    warn!(error = %nack_err, "DLQ nack failed");
                }
                return Err(e);
            }
            if let Err(e) = self.dead_letters.ack(delivery.id).await {
                warn!(error = %e, "DLQ ack failed; letter will be merged again");
            }
            drained += 1;
        }
        Ok(drained)
    }

    async fn settle(
        &self,
        entry: &DeadLetterEntry,
        now: DateTime<Utc>,
        report: &mut SanitizeReport,
    ) -> Result<()> {
        let order = match OrderNumber::parse(&entry.order_number) {
            Ok(number) => self.orders.get_order(&number).await?,
            Err(_) => None,
        };

        let decision = decide(entry, order.as_ref(), now, &self.config);
        debug!(
            order = %entry.order_number,
            reason = %entry.reason,
            attempts = entry.attempts,
            decision = ?decision,
            "Dead letter decision"
        );

        match decision {
            Decision::Discard => {
                self.store.remove(&entry.order_number).await?;
                PipelineStats::bump(&self.stats.discarded);
                report.discarded += 1;
            }
            Decision::ForceInvalid => {
                if let Some(order) = &order {
                    self.orders
                        .apply_transition(&order.number, &Transition::Invalid)
                        .await?;
                }
                self.store.remove(&entry.order_number).await?;
                PipelineStats::bump(&self.stats.forced_invalid);
                info!(order = %entry.order_number, "Order forced to INVALID");
                report.forced_invalid += 1;
            }
            Decision::Quarantine(note) => {
                self.store.quarantine(&entry.order_number, note).await?;
                PipelineStats::bump(&self.stats.quarantined);
                warn!(order = %entry.order_number, note, "Dead letter quarantined");
                report.quarantined += 1;
            }
            Decision::Wait => {
                report.waiting += 1;
            }
            Decision::Requeue => {
                let message = QueueMessage {
                    payload: entry.order_number.clone(),
                    attempt: 0,
                    failures: entry.attempts,
                    enqueued_at: Utc::now(),
                };
                match self.pending.publish(message).await {
                    Ok(()) => {
                        self.store.remove(&entry.order_number).await?;
                        PipelineStats::bump(&self.stats.sanitizer_requeued);
                        info!(order = %entry.order_number, attempts = entry.attempts, "Dead letter requeued");
                        report.requeued += 1;
                    }
                    Err(e) => {
                        warn!(order = %entry.order_number, error = %e, "Requeue failed, keeping entry");
                        report.errors += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawn the sanitizer as a background task that stops on `cancel`.
    pub fn spawn(self, mut cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                if *cancel.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.changed() => break,
                }

                match self.run_cycle().await {
                    Ok(report) if report.changed_anything() => {
                        info!(
                            drained = report.drained,
                            requeued = report.requeued,
                            waiting = report.waiting,
                            quarantined = report.quarantined,
                            discarded = report.discarded,
                            forced_invalid = report.forced_invalid,
                            errors = report.errors,
                            "Sanitizer cycle"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Sanitizer cycle failed");
                    }
                }
            }
            debug!("Sanitizer stopped");
        })
    }
}
