//! Order record, status state machine and balances.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::OrderNumber;

/// Order processing status.
///
/// Transitions only move forward: NEW -> PROCESSING -> {INVALID, PROCESSED}.
/// NEW may also go straight to a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    /// PROCESSED and INVALID admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PROCESSING" => Ok(OrderStatus::Processing),
            "INVALID" => Ok(OrderStatus::Invalid),
            "PROCESSED" => Ok(OrderStatus::Processed),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Persisted order record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub number: OrderNumber,
    pub user_id: Uuid,
    pub status: OrderStatus,
    /// Set once, on the transition into PROCESSED.
    pub accrual: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(number: OrderNumber, user_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            number,
            user_id,
            status: OrderStatus::New,
            accrual: None,
            submitted_at: now,
            updated_at: now,
        }
    }
}

/// Per-user loyalty balance.
///
/// `current` equals the sum of PROCESSED accruals minus `withdrawn`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: Uuid,
    pub current: Decimal,
    pub withdrawn: Decimal,
}

impl Balance {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            current: Decimal::ZERO,
            withdrawn: Decimal::ZERO,
        }
    }
}

/// A state change requested of the order store.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Oracle still working: NEW becomes PROCESSING, `updated_at` is refreshed.
    Processing,
    /// Oracle rejected the order.
    Invalid,
    /// Oracle finished; credit the owner's balance by the amount.
    Processed(Decimal),
}

impl Transition {
    pub fn target(&self) -> OrderStatus {
        match self {
            Transition::Processing => OrderStatus::Processing,
            Transition::Invalid => OrderStatus::Invalid,
            Transition::Processed(_) => OrderStatus::Processed,
        }
    }
}

/// Result of applying a [`Transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The order moved (or, for PROCESSING, was refreshed).
    Applied,
    /// The order was already terminal; nothing changed.
    AlreadyTerminal(OrderStatus),
}

/// Result of inserting a NEW order.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Order),
    /// An order with this number already exists, possibly for another user.
    Existing(Order),
}
