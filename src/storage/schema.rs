//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Orders table schema.
#[derive(Iden)]
pub enum Orders {
    Table,
    #[iden = "number"]
    Number,
    #[iden = "user_id"]
    UserId,
    #[iden = "status"]
    Status,
    #[iden = "accrual"]
    Accrual,
    #[iden = "submitted_at"]
    SubmittedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Balances table schema.
#[derive(Iden)]
pub enum Balances {
    Table,
    #[iden = "user_id"]
    UserId,
    #[iden = "current"]
    Current,
    #[iden = "withdrawn"]
    Withdrawn,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// Accrual ledger schema, one row per PROCESSED order.
#[derive(Iden)]
pub enum Accruals {
    Table,
    #[iden = "order_number"]
    OrderNumber,
    #[iden = "user_id"]
    UserId,
    #[iden = "amount"]
    Amount,
    #[iden = "credited_at"]
    CreditedAt,
}

/// Dead letters table schema.
#[derive(Iden)]
pub enum DeadLetters {
    Table,
    #[iden = "order_number"]
    OrderNumber,
    #[iden = "reason"]
    Reason,
    #[iden = "attempts"]
    Attempts,
    #[iden = "detail"]
    Detail,
    #[iden = "first_failed_at"]
    FirstFailedAt,
    #[iden = "last_failed_at"]
    LastFailedAt,
    #[iden = "state"]
    State,
}
