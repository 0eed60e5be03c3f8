//! Oracle verdicts routed from the adapter to the reconciler.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{OrderNumber, Transition};

/// The oracle's current judgment for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub order_number: OrderNumber,
    pub outcome: VerdictOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum VerdictOutcome {
    /// Registered or still being computed.
    Processing,
    Invalid,
    Processed { accrual: Decimal },
}

impl Verdict {
    pub fn processing(order_number: OrderNumber) -> Self {
        Self {
            order_number,
            outcome: VerdictOutcome::Processing,
        }
    }

    pub fn invalid(order_number: OrderNumber) -> Self {
        Self {
            order_number,
            outcome: VerdictOutcome::Invalid,
        }
    }

    pub fn processed(order_number: OrderNumber, accrual: Decimal) -> Self {
        Self {
            order_number,
            outcome: VerdictOutcome::Processed { accrual },
        }
    }

    /// The store transition this verdict asks for.
    pub fn transition(&self) -> Transition {
        match &self.outcome {
            VerdictOutcome::Processing => Transition::Processing,
            VerdictOutcome::Invalid => Transition::Invalid,
            VerdictOutcome::Processed { accrual } => Transition::Processed(*accrual),
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self.outcome, VerdictOutcome::Processing)
    }
}
