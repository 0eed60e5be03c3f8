//! Gophermart - order accrual reconciliation pipeline
//!
//! Takes submitted order numbers through an external accrual service and
//! converges the stored order and balance state to its verdicts, despite
//! at-least-once delivery and an unreliable oracle.

pub mod adapter;
pub mod bus;
pub mod config;
pub mod dlq;
pub mod ingest;
pub mod model;
pub mod oracle;
pub mod pipeline;
pub mod reconciler;
pub mod stats;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
