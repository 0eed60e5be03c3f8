//! Pipeline assembly and lifecycle.
//!
//! Wires the stages together over three queues and owns their tasks:
//!
//! ```text
//! submit --> [ingest] --> pending --> [adapter] --> verdicts --> [reconciler]
//!                           ^             |                           |
//!                           |             v                           v
//!                      [sanitizer] <-- dead letters <-----------------+
//!                           ^
//!                     [stale sweep] --> pending
//! ```
//!
//! One watch channel stops every task. `shutdown` waits for them up to the
//! configured timeout, aborts whatever is still running, then closes the
//! queues so late submits fail instead of queueing into a dead pipeline.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::AccrualAdapter;
use crate::bus::{ChannelQueue, ChannelQueueConfig, MessageQueue, QueueConfig};
use crate::config::{Config, ConfigError};
use crate::dlq::{DeadLetter, Sanitizer};
use crate::ingest::{OrderIngest, StaleSweep};
use crate::model::Verdict;
use crate::oracle::AccrualOracle;
use crate::reconciler::Reconciler;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::storage::{DeadLetterStore, OrderStore};

/// Queue names, for logging.
pub const PENDING_QUEUE: &str = "pending";
pub const VERDICT_QUEUE: &str = "verdicts";
pub const DEAD_LETTER_QUEUE: &str = "dead-letters";

/// The three queues between the stages.
#[derive(Clone)]
pub struct Queues {
    pub pending: Arc<dyn MessageQueue<String>>,
    pub verdicts: Arc<dyn MessageQueue<Verdict>>,
    pub dead_letters: Arc<dyn MessageQueue<DeadLetter>>,
}

impl Queues {
    /// In-process channel queues.
    pub fn in_memory(config: &QueueConfig) -> Self {
        Self {
            pending: Arc::new(ChannelQueue::<String>::new(ChannelQueueConfig::from_config(
                PENDING_QUEUE,
                config,
            ))),
            verdicts: Arc::new(ChannelQueue::<Verdict>::new(ChannelQueueConfig::from_config(
                VERDICT_QUEUE,
                config,
            ))),
            dead_letters: Arc::new(ChannelQueue::<DeadLetter>::new(
                ChannelQueueConfig::from_config(DEAD_LETTER_QUEUE, config),
            )),
        }
    }
}

/// A running pipeline.
pub struct Pipeline {
    ingest: Arc<OrderIngest>,
    queues: Queues,
    stats: Arc<PipelineStats>,
    cancel: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Validate `config` and spawn every stage.
    pub fn start(
        config: &Config,
        orders: Arc<dyn OrderStore>,
        dead_letter_store: Arc<dyn DeadLetterStore>,
        oracle: Arc<dyn AccrualOracle>,
        queues: Queues,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let stats = Arc::new(PipelineStats::new());
        let (cancel, cancel_rx) = watch::channel(false);
        let receive_wait = config.queues.receive_wait();
        let mut handles = Vec::new();

        let ingest = Arc::new(OrderIngest::new(
            Arc::clone(&orders),
            Arc::clone(&queues.pending),
            config.ingest.clone(),
            Arc::clone(&stats),
        ));

        let adapter = Arc::new(
            AccrualAdapter::new(
                oracle,
                Arc::clone(&queues.pending),
                Arc::clone(&queues.verdicts),
                Arc::clone(&queues.dead_letters),
                config.adapter.clone(),
                Arc::clone(&stats),
            )
            .with_receive_wait(receive_wait),
        );
        handles.extend(adapter.spawn(cancel_rx.clone()));

        let reconciler = Arc::new(
            Reconciler::new(
                Arc::clone(&orders),
                Arc::clone(&queues.verdicts),
                Arc::clone(&queues.dead_letters),
                config.reconciler.clone(),
                Arc::clone(&stats),
            )
            .with_receive_wait(receive_wait),
        );
        handles.extend(reconciler.spawn(cancel_rx.clone()));

        let sanitizer = Sanitizer::new(
            Arc::clone(&orders),
            Arc::clone(&dead_letter_store),
            Arc::clone(&queues.dead_letters),
            Arc::clone(&queues.pending),
            config.sanitizer.clone(),
            Arc::clone(&stats),
        );
        handles.push(sanitizer.spawn(cancel_rx.clone()));

        let sweep = StaleSweep::new(
            orders,
            dead_letter_store,
            Arc::clone(&queues.pending),
            &config.ingest,
            Arc::clone(&stats),
        );
        handles.push(sweep.spawn(cancel_rx));

        info!(
            adapter_workers = config.adapter.workers,
            reconciler_workers = config.reconciler.workers,
            tasks = handles.len(),
            "Pipeline started"
        );

        Ok(Self {
            ingest,
            queues,
            stats,
            cancel,
            handles,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    /// Entry point for the write-path handler.
    pub fn ingest(&self) -> Arc<OrderIngest> {
        Arc::clone(&self.ingest)
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop every task and return the final counters.
    ///
    /// In-flight deliveries finish; anything unacked is redelivered by the
    /// queue on the next start.
    pub async fn shutdown(self) -> StatsSnapshot {
        let _ = self.cancel.send(true);

        let aborts: Vec<_> = self.handles.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(self.shutdown_timeout, join_all(self.handles)).await;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!(error = %e, "Pipeline task ended abnormally");
                    }
                }
                info!("Pipeline stopped");
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "Pipeline tasks did not stop in time, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        self.queues.pending.close().await;
        self.queues.verdicts.close().await;
        self.queues.dead_letters.close().await;

        let snapshot = self.stats.snapshot();
        snapshot.log_summary();
        snapshot
    }
}
