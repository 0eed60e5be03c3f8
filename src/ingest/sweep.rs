//! Re-enqueue orders the pipeline lost track of.
//!
//! An order can sit NEW without a queue message (enqueue failed at submit,
//! or the process died with the message in memory). The sweep finds
//! non-terminal orders untouched for `stale_after` and publishes them again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::IngestConfig;
use crate::bus::{MessageQueue, QueueMessage};
use crate::stats::PipelineStats;
use crate::storage::{DeadLetterStore, OrderStore};

/// Periodic stale-order sweep.
pub struct StaleSweep {
    orders: Arc<dyn OrderStore>,
    dead_letters: Arc<dyn DeadLetterStore>,
    pending: Arc<dyn MessageQueue<String>>,
    stale_after: Duration,
    interval: Duration,
    batch: usize,
    stats: Arc<PipelineStats>,
}

impl StaleSweep {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        dead_letters: Arc<dyn DeadLetterStore>,
        pending: Arc<dyn MessageQueue<String>>,
        config: &IngestConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            orders,
            dead_letters,
            pending,
            stale_after: Duration::from_secs(config.stale_after_secs),
            interval: Duration::from_secs(config.sweep_interval_secs),
            batch: config.sweep_batch,
            stats,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one sweep. Returns the number of orders re-enqueued.
    ///
    /// Orders with a dead-letter entry are left to the sanitizer.
    pub async fn run_once(&self) -> crate::storage::Result<usize> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - stale_after;

        let stale = self.orders.list_stale(cutoff, self.batch).await?;
        let mut requeued = 0;

        for order in stale {
            if self
                .dead_letters
                .get(order.number.as_str())
                .await?
                .is_some()
            {
                debug!(order = %order.number, "Skipping dead-lettered order");
                continue;
            }

            if let Err(e) = self
                .pending
                .publish(QueueMessage::new(order.number.to_string()))
                .await
            {
                warn!(order = %order.number, error = %e, "Sweep could not enqueue, stopping");
                break;
            }

            self.orders.touch(&order.number).await?;
            PipelineStats::bump(&self.stats.swept);
            requeued += 1;
        }

        Ok(requeued)
    }

    /// Spawn the sweep as a background task that stops on `cancel`.
    pub fn spawn(self, mut cancel: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                if *cancel.borrow() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = cancel.changed() => break,
                }

                match self.run_once().await {
                    Ok(count) if count > 0 => {
                        info!(requeued = count, "Stale sweep re-enqueued orders");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Stale sweep failed");
                    }
                }
            }
            debug!("Stale sweep stopped");
        })
    }
}
