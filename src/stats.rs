//! Pipeline counters.
//!
//! Every stage shares one `PipelineStats` and bumps its own counters. A
//! snapshot is logged as a summary at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Counters for the whole pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Orders accepted by ingest.
    pub submitted: AtomicU64,
    /// Oracle calls made, including retries.
    pub lookups: AtomicU64,
    /// 429 responses seen.
    pub rate_limited: AtomicU64,
    /// Non-final replies that were scheduled for another poll.
    pub polls_requeued: AtomicU64,
    /// Verdicts consumed by the reconciler.
    pub verdicts: AtomicU64,
    /// Orders moved to INVALID or PROCESSED.
    pub finalized: AtomicU64,
    /// Verdicts for orders that were already terminal.
    pub duplicates: AtomicU64,
    /// Letters published to the DLQ.
    pub dead_lettered: AtomicU64,
    pub sanitizer_requeued: AtomicU64,
    pub quarantined: AtomicU64,
    pub discarded: AtomicU64,
    pub forced_invalid: AtomicU64,
    /// Orders re-enqueued by the stale sweep.
    pub swept: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub lookups: u64,
    pub rate_limited: u64,
    pub polls_requeued: u64,
    pub verdicts: u64,
    pub finalized: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub sanitizer_requeued: u64,
    pub quarantined: u64,
    pub discarded: u64,
    pub forced_invalid: u64,
    pub swept: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            polls_requeued: self.polls_requeued.load(Ordering::Relaxed),
            verdicts: self.verdicts.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            sanitizer_requeued: self.sanitizer_requeued.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            forced_invalid: self.forced_invalid.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Emit the summary as one structured event.
    pub fn log_summary(&self) {
        info!(
            submitted = self.submitted,
            lookups = self.lookups,
            rate_limited = self.rate_limited,
            polls_requeued = self.polls_requeued,
            verdicts = self.verdicts,
            finalized = self.finalized,
            duplicates = self.duplicates,
            dead_lettered = self.dead_lettered,
            sanitizer_requeued = self.sanitizer_requeued,
            quarantined = self.quarantined,
            discarded = self.discarded,
            forced_invalid = self.forced_invalid,
            swept = self.swept,
            "Pipeline summary"
        );
    }
}
