//! Pool-wide pause for oracle rate limiting.

use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Shared gate in front of every adapter worker's oracle call.
///
/// A 429 from the oracle pauses the whole pool, not only the worker that saw
/// it. Overlapping pauses keep the later resume time.
#[derive(Debug, Default)]
pub struct Throttle {
    resume_at: RwLock<Option<Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause the pool for `duration` from now.
    pub async fn pause_for(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut resume_at = self.resume_at.write().await;
        match *resume_at {
            Some(current) if current >= until => {}
            _ => *resume_at = Some(until),
        }
    }

    /// When the pool may resume, if it is currently paused.
    pub async fn resume_at(&self) -> Option<Instant> {
        let resume_at = *self.resume_at.read().await;
        resume_at.filter(|until| *until > Instant::now())
    }

    pub async fn is_paused(&self) -> bool {
        self.resume_at().await.is_some()
    }

    /// Sleep until the pause, if any, has elapsed.
    pub async fn wait(&self) {
        while let Some(until) = self.resume_at().await {
            tokio::time::sleep_until(until).await;
        }
    }
}
