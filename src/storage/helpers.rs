//! Shared storage helper functions.
//!
//! Column encodings used by the SQL backends: timestamps as fixed-width
//! RFC3339 text so lexical order matches time order, and amounts as
//! decimal text so no precision is lost.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{Result, StorageError};

/// Encode a timestamp as RFC3339 UTC with microsecond precision.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a timestamp written by [`format_timestamp`].
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Decode(format!("timestamp {:?}: {}", raw, e)))
}

/// Amounts are stored with two decimal places.
pub fn format_amount(amount: Decimal) -> String {
    amount.round_dp(2).to_string()
}

pub fn parse_amount(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| StorageError::Decode(format!("amount {:?}: {}", raw, e)))
}

pub fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Decode(format!("uuid {:?}: {}", raw, e)))
}
