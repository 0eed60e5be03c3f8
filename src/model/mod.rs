//! Domain types shared by every pipeline stage.
//!
//! - `OrderNumber`: checksum-validated order identifier, the idempotency key
//! - `Order` / `OrderStatus`: the persisted order record and its state machine
//! - `Balance`: per-user accrual totals
//! - `Verdict`: oracle judgment carried on the processing queue

mod order;
mod order_number;
mod verdict;

pub use order::{Balance, CreateOutcome, Order, OrderStatus, Transition, TransitionOutcome};
pub use order_number::{OrderNumber, OrderNumberError};
pub use verdict::{Verdict, VerdictOutcome};
