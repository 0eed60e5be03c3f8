//! Dead Letter Queue (DLQ) types and the periodic sanitizer.
//!
//! Pipeline stages publish a [`DeadLetter`] to the DLQ channel when an order
//! cannot make progress. The [`Sanitizer`] drains that channel into the
//! dead-letter store and, on each cycle, decides per entry whether to
//! requeue it, wait for its cooldown, quarantine it for an operator, or
//! discard it.
//!
//! ## Reasons
//!
//! - `INVALID_FORMAT`: the order number failed re-validation in the adapter
//! - `ORACLE_EXHAUSTED`: the accrual service never produced a final answer
//!   within the adapter's retry and poll bounds
//! - `RECONCILE_FAILED`: the verdict could not be written to storage

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod sanitizer;

pub use sanitizer::{decide, Decision, SanitizeReport, Sanitizer, SanitizerConfig};

/// Why an order ended up in the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    InvalidFormat,
    OracleExhausted,
    ReconcileFailed,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::InvalidFormat => "INVALID_FORMAT",
            FailureReason::OracleExhausted => "ORACLE_EXHAUSTED",
            FailureReason::ReconcileFailed => "RECONCILE_FAILED",
        }
    }

    /// Whether entries with this reason may be requeued.
    pub fn is_replayable(self) -> bool {
        !matches!(self, FailureReason::InvalidFormat)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INVALID_FORMAT" => Ok(FailureReason::InvalidFormat),
            "ORACLE_EXHAUSTED" => Ok(FailureReason::OracleExhausted),
            "RECONCILE_FAILED" => Ok(FailureReason::ReconcileFailed),
            other => Err(format!("unknown failure reason: {}", other)),
        }
    }
}

/// Message published to the DLQ channel.
///
/// `order_number` is kept as the raw string: an `INVALID_FORMAT` letter
/// carries a token that never parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub order_number: String,
    pub reason: FailureReason,
    /// Cumulative attempts, including earlier DLQ round trips.
    pub attempts: u32,
    pub detail: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        order_number: impl Into<String>,
        reason: FailureReason,
        attempts: u32,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            order_number: order_number.into(),
            reason,
            attempts,
            detail: detail.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Lifecycle of a stored dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeadLetterState {
    /// Awaiting a sanitizer decision.
    Pending,
    /// Permanently failed; needs an operator.
    Quarantined,
}

impl DeadLetterState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterState::Pending => "PENDING",
            DeadLetterState::Quarantined => "QUARANTINED",
        }
    }
}

impl FromStr for DeadLetterState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DeadLetterState::Pending),
            "QUARANTINED" => Ok(DeadLetterState::Quarantined),
            other => Err(format!("unknown dead letter state: {}", other)),
        }
    }
}

/// Dead letter as held by the dead-letter store, one per order number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub order_number: String,
    pub reason: FailureReason,
    pub attempts: u32,
    pub detail: String,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    pub state: DeadLetterState,
}

impl DeadLetterEntry {
    pub fn from_letter(letter: &DeadLetter) -> Self {
        Self {
            order_number: letter.order_number.clone(),
            reason: letter.reason,
            attempts: letter.attempts,
            detail: letter.detail.clone(),
            first_failed_at: letter.failed_at,
            last_failed_at: letter.failed_at,
            state: DeadLetterState::Pending,
        }
    }

    /// Fold a newer failure of the same order into this entry.
    ///
    /// The first-failure timestamp and the quarantine state survive; attempts
    /// never decrease.
    pub fn merge(&mut self, letter: &DeadLetter) {
        self.reason = letter.reason;
        self.attempts = self.attempts.max(letter.attempts);
        self.detail = letter.detail.clone();
        if letter.failed_at > self.last_failed_at {
            self.last_failed_at = letter.failed_at;
        }
        if letter.failed_at < self.first_failed_at {
            self.first_failed_at = letter.failed_at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    // ============================================================================
    // Reason Tests
    // ============================================================================

    #[test]
    fn test_reason_roundtrip_str() {
        for reason in [
            FailureReason::InvalidFormat,
            FailureReason::OracleExhausted,
            FailureReason::ReconcileFailed,
        ] {
            assert_eq!(reason.as_str().parse::<FailureReason>().unwrap(), reason);
        }
        assert!("TIMEOUT".parse::<FailureReason>().is_err());
    }

    #[test]
    fn test_reason_serde() {
        let json = serde_json::to_string(&FailureReason::OracleExhausted).unwrap();
        assert_eq!(json, "\"ORACLE_EXHAUSTED\"");
    }

    #[test]
    fn test_invalid_format_not_replayable() {
        assert!(!FailureReason::InvalidFormat.is_replayable());
        assert!(FailureReason::OracleExhausted.is_replayable());
        assert!(FailureReason::ReconcileFailed.is_replayable());
    }

    // ============================================================================
    // Entry Merge Tests
    // ============================================================================

    #[test]
    fn test_entry_from_letter() {
        let letter = DeadLetter::new("12345678903", FailureReason::OracleExhausted, 6, "timeout");
        let entry = DeadLetterEntry::from_letter(&letter);

        assert_eq!(entry.order_number, "12345678903");
        assert_eq!(entry.attempts, 6);
        assert_eq!(entry.first_failed_at, letter.failed_at);
        assert_eq!(entry.last_failed_at, letter.failed_at);
        assert_eq!(entry.state, DeadLetterState::Pending);
    }

    #[test]
    fn test_merge_keeps_first_failure_and_max_attempts() {
        let first = DeadLetter::new("12345678903", FailureReason::OracleExhausted, 6, "timeout");
        let mut entry = DeadLetterEntry::from_letter(&first);

        let mut later = DeadLetter::new("12345678903", FailureReason::ReconcileFailed, 3, "locked");
        later.failed_at = first.failed_at + Duration::seconds(30);
        entry.merge(&later);

        assert_eq!(entry.reason, FailureReason::ReconcileFailed);
        assert_eq!(entry.attempts, 6);
        assert_eq!(entry.detail, "locked");
        assert_eq!(entry.first_failed_at, first.failed_at);
        assert_eq!(entry.last_failed_at, later.failed_at);
    }

    #[test]
    fn test_merge_preserves_quarantine() {
        let letter = DeadLetter::new("12345678903", FailureReason::OracleExhausted, 40, "x");
        let mut entry = DeadLetterEntry::from_letter(&letter);
        entry.state = DeadLetterState::Quarantined;

        entry.merge(&letter);
        assert_eq!(entry.state, DeadLetterState::Quarantined);
    }
}
