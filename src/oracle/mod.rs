//! Accrual oracle: the external service that computes loyalty points.
//!
//! The pipeline only ever polls it: `GET /api/orders/{number}` answers with
//! the order's current accrual status. Everything behind that endpoint is a
//! black box.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::model::OrderNumber;

mod http;

pub use http::{classify, parse_retry_after, HttpAccrualClient};

/// Accrual status reported by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    /// The oracle has not seen the order yet (HTTP 204).
    #[serde(skip_deserializing)]
    Unregistered,
    #[serde(alias = "registered")]
    Registered,
    #[serde(alias = "processing")]
    Processing,
    #[serde(alias = "invalid")]
    Invalid,
    #[serde(alias = "processed")]
    Processed,
}

/// One successful oracle answer.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub status: AccrualStatus,
    pub accrual: Option<Decimal>,
    /// Poll interval suggested by the oracle, if any.
    pub retry_after: Option<Duration>,
}

impl OracleReply {
    pub fn unregistered() -> Self {
        Self {
            status: AccrualStatus::Unregistered,
            accrual: None,
            retry_after: None,
        }
    }

    pub fn registered() -> Self {
        Self {
            status: AccrualStatus::Registered,
            accrual: None,
            retry_after: None,
        }
    }

    pub fn processing() -> Self {
        Self {
            status: AccrualStatus::Processing,
            accrual: None,
            retry_after: None,
        }
    }

    pub fn invalid() -> Self {
        Self {
            status: AccrualStatus::Invalid,
            accrual: None,
            retry_after: None,
        }
    }

    pub fn processed(accrual: Decimal) -> Self {
        Self {
            status: AccrualStatus::Processed,
            accrual: Some(accrual),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Errors that can occur while asking the oracle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OracleError {
    /// HTTP 429. Not a failure: the whole consumer pool pauses.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Oracle call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected oracle status: {0}")]
    UnexpectedStatus(u16),

    #[error("Malformed oracle response: {0}")]
    Malformed(String),
}

impl OracleError {
    /// Transient failures are retried with backoff. Rate limiting is not a
    /// failure and is handled by the throttle instead.
    pub fn is_transient(&self) -> bool {
        !matches!(self, OracleError::RateLimited { .. })
    }
}

/// Interface to the accrual service.
///
/// Implementations:
/// - `HttpAccrualClient`: the real HTTP service
/// - `ScriptedOracle` (test-utils): canned replies per order
#[async_trait]
pub trait AccrualOracle: Send + Sync {
    async fn lookup(&self, number: &OrderNumber) -> Result<OracleReply, OracleError>;
}

/// Accrual service configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Base address, e.g. `http://localhost:8080`.
    pub address: String,
    /// HTTP client timeout per request.
    pub timeout_ms: u64,
    /// Pause applied when a 429 carries no usable Retry-After.
    pub default_retry_after_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8080".to_string(),
            timeout_ms: 1000,
            default_retry_after_secs: 3,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }
}
