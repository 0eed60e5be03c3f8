//! Storage for orders, balances and dead letters.
//!
//! This module contains:
//! - `OrderStore` trait: orders, balances and the accrual ledger
//! - `DeadLetterStore` trait: durable DLQ entries for the sanitizer
//! - Implementations: SQLite, Mock

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::dlq::{DeadLetter, DeadLetterEntry};
use crate::model::{Balance, CreateOutcome, Order, OrderNumber, Transition, TransitionOutcome};

pub mod helpers;
pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::{MockDeadLetterStore, MockOrderStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteDeadLetterStore, SqliteOrderStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        available: Decimal,
        requested: Decimal,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Corrupt row: {0}")]
    Decode(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    /// Whether the same operation may succeed if retried.
    ///
    /// Contention and connectivity failures are retryable; missing rows,
    /// business rule violations and corrupt data are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            #[cfg(feature = "sqlite")]
            StorageError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::TypeNotFound { .. }
                    | sqlx::Error::Configuration(_)
            ),
            _ => false,
        }
    }
}

/// One credit in the accrual ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualRecord {
    pub order_number: OrderNumber,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub credited_at: DateTime<Utc>,
}

/// Interface for order and balance persistence.
///
/// Every mutation of an order happens inside a single transactional unit
/// keyed by order number; balance changes are scoped by user id.
///
/// Implementations:
/// - `SqliteOrderStore`: SQLite storage
/// - `MockOrderStore`: In-memory mock for testing
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Insert a NEW order, or return the existing one with this number.
    async fn create_order(&self, number: &OrderNumber, user_id: Uuid) -> Result<CreateOutcome>;

    async fn get_order(&self, number: &OrderNumber) -> Result<Option<Order>>;

    /// Orders of one user, oldest submission first.
    async fn list_orders(&self, user_id: Uuid) -> Result<Vec<Order>>;

    /// Non-terminal orders last updated before `updated_before`, oldest first.
    async fn list_stale(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<Order>>;

    /// Refresh `updated_at` of a non-terminal order.
    async fn touch(&self, number: &OrderNumber) -> Result<()>;

    /// Compare-and-set transition.
    ///
    /// Loads the order inside the transaction. A terminal order is left
    /// untouched and reported as `AlreadyTerminal`. A PROCESSED transition
    /// sets the amount, credits the owner's balance and writes the ledger
    /// row in the same transaction.
    async fn apply_transition(
        &self,
        number: &OrderNumber,
        transition: &Transition,
    ) -> Result<TransitionOutcome>;

    /// Balance of a user; zero if nothing was ever credited.
    async fn get_balance(&self, user_id: Uuid) -> Result<Balance>;

    /// Debit `amount` from the current balance and add it to `withdrawn`.
    async fn withdraw(&self, user_id: Uuid, amount: Decimal) -> Result<Balance>;

    /// Ledger credits of one user, oldest first.
    async fn list_accruals(&self, user_id: Uuid) -> Result<Vec<AccrualRecord>>;
}

/// Interface for dead-letter persistence.
///
/// Implementations:
/// - `SqliteDeadLetterStore`: SQLite storage
/// - `MockDeadLetterStore`: In-memory mock for testing
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert or merge a dead letter; one entry per order number.
    async fn record(&self, letter: &DeadLetter) -> Result<DeadLetterEntry>;

    async fn get(&self, order_number: &str) -> Result<Option<DeadLetterEntry>>;

    /// Entries awaiting a sanitizer decision, oldest failure first.
    async fn list_pending(&self) -> Result<Vec<DeadLetterEntry>>;

    async fn list_quarantined(&self) -> Result<Vec<DeadLetterEntry>>;

    /// Mark an entry as permanently failed.
    async fn quarantine(&self, order_number: &str, note: &str) -> Result<()>;

    /// Delete an entry after it was requeued or discarded.
    async fn remove(&self, order_number: &str) -> Result<()>;
}

/// Initialize storage based on configuration.
///
/// Returns the order store and dead-letter store for the configured backend.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<(Arc<dyn OrderStore>, Arc<dyn DeadLetterStore>), Box<dyn std::error::Error>>
{
    info!("Storage: {} at {}", config.storage_type, config.path);

    match config.storage_type.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let orders = Arc::new(SqliteOrderStore::new(pool.clone()));
            orders.init().await?;

            let dead_letters = Arc::new(SqliteDeadLetterStore::new(pool));
            dead_letters.init().await?;

            Ok((orders, dead_letters))
        }
        #[cfg(not(feature = "sqlite"))]
        "sqlite" => {
            error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err("SQLite feature not enabled".into())
        }
        "memory" => Ok((
            Arc::new(MockOrderStore::new()),
            Arc::new(MockDeadLetterStore::new()),
        )),
        other => {
            error!("Unknown storage type: {}", other);
            Err(format!("Unknown storage type: {}", other).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_retryable() {
        assert!(StorageError::Unavailable("busy".into()).is_retryable());
    }

    #[test]
    fn test_business_errors_not_retryable() {
        assert!(!StorageError::OrderNotFound("1".into()).is_retryable());
        assert!(!StorageError::InvalidAmount(Decimal::ZERO).is_retryable());
        assert!(!StorageError::Decode("bad".into()).is_retryable());
        assert!(!StorageError::InsufficientFunds {
            available: Decimal::ZERO,
            requested: Decimal::ONE,
        }
        .is_retryable());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn test_sqlx_classification() {
        assert!(!StorageError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(StorageError::Database(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[tokio::test]
    async fn test_init_storage_memory() {
        let config = StorageConfig {
            storage_type: "memory".to_string(),
            path: String::new(),
        };
        assert!(init_storage(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_init_storage_unknown_type() {
        let config = StorageConfig {
            storage_type: "cassandra".to_string(),
            path: String::new(),
        };
        assert!(init_storage(&config).await.is_err());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_init_storage_sqlite_creates_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("gophermart.db");
        let config = StorageConfig {
            storage_type: "sqlite".to_string(),
            path: path.to_string_lossy().to_string(),
        };

        let (orders, _dead_letters) = init_storage(&config).await.unwrap();
        assert!(path.exists());

        let balance = orders.get_balance(Uuid::new_v4()).await.unwrap();
        assert_eq!(balance.current, Decimal::ZERO);
    }
}
