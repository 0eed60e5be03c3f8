//! SQLite implementations of storage interfaces.
//!
//! Writes that read-then-modify run inside `BEGIN IMMEDIATE` transactions,
//! which take the write lock upfront and avoid deadlocks when concurrent
//! DEFERRED transactions race to upgrade from shared to exclusive.

mod dead_letter_store;
mod order_store;

pub use dead_letter_store::SqliteDeadLetterStore;
pub use order_store::SqliteOrderStore;
