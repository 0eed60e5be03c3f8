//! SQLite DeadLetterStore implementation.

use async_trait::async_trait;
use sea_query::{ColumnDef, Expr, Index, OnConflict, Order as SortOrder, Query, SqliteQueryBuilder, Table};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::dlq::{DeadLetter, DeadLetterEntry, DeadLetterState, FailureReason};
use crate::storage::helpers::{format_timestamp, parse_timestamp};
use crate::storage::schema::DeadLetters;
use crate::storage::{DeadLetterStore, Result, StorageError};

/// SQLite implementation of DeadLetterStore.
pub struct SqliteDeadLetterStore {
    pool: SqlitePool,
}

impl SqliteDeadLetterStore {
    /// Create a new SQLite dead-letter store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the dead_letters table.
    pub async fn init(&self) -> Result<()> {
        let create_table = Table::create()
            .table(DeadLetters::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(DeadLetters::OrderNumber)
                    .text()
                    .not_null()
                    .primary_key(),
            )
            .col(ColumnDef::new(DeadLetters::Reason).text().not_null())
            .col(ColumnDef::new(DeadLetters::Attempts).integer().not_null())
            .col(ColumnDef::new(DeadLetters::Detail).text().not_null())
            .col(ColumnDef::new(DeadLetters::FirstFailedAt).text().not_null())
            .col(ColumnDef::new(DeadLetters::LastFailedAt).text().not_null())
            .col(ColumnDef::new(DeadLetters::State).text().not_null())
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = Index::create()
            .if_not_exists()
            .name("idx_dead_letters_state")
            .table(DeadLetters::Table)
            .col(DeadLetters::State)
            .col(DeadLetters::LastFailedAt)
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create_index).execute(&self.pool).await?;

        info!("Dead letter table initialized (SQLite)");
        Ok(())
    }

    fn select_entries() -> sea_query::SelectStatement {
        Query::select()
            .columns([
                DeadLetters::OrderNumber,
                DeadLetters::Reason,
                DeadLetters::Attempts,
                DeadLetters::Detail,
                DeadLetters::FirstFailedAt,
                DeadLetters::LastFailedAt,
                DeadLetters::State,
            ])
            .from(DeadLetters::Table)
            .to_owned()
    }

    fn entry_from_row(row: &SqliteRow) -> Result<DeadLetterEntry> {
        let reason: String = row.try_get("reason")?;
        let attempts: i64 = row.try_get("attempts")?;
        let first_failed_at: String = row.try_get("first_failed_at")?;
        let last_failed_at: String = row.try_get("last_failed_at")?;
        let state: String = row.try_get("state")?;

        Ok(DeadLetterEntry {
            order_number: row.try_get("order_number")?,
            reason: reason
                .parse::<FailureReason>()
                .map_err(StorageError::Decode)?,
            attempts: u32::try_from(attempts)
                .map_err(|_| StorageError::Decode(format!("attempts {}", attempts)))?,
            detail: row.try_get("detail")?,
            first_failed_at: parse_timestamp(&first_failed_at)?,
            last_failed_at: parse_timestamp(&last_failed_at)?,
            state: state
                .parse::<DeadLetterState>()
                .map_err(StorageError::Decode)?,
        })
    }

    async fn load(conn: &mut SqliteConnection, order_number: &str) -> Result<Option<DeadLetterEntry>> {
        let query = Self::select_entries()
            .and_where(Expr::col(DeadLetters::OrderNumber).eq(order_number))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn record_in_tx(conn: &mut SqliteConnection, letter: &DeadLetter) -> Result<DeadLetterEntry> {
        let entry = match Self::load(conn, &letter.order_number).await? {
            Some(mut existing) => {
                existing.merge(letter);
                existing
            }
            None => DeadLetterEntry::from_letter(letter),
        };

        let query = Query::insert()
            .into_table(DeadLetters::Table)
            .columns([
                DeadLetters::OrderNumber,
                DeadLetters::Reason,
                DeadLetters::Attempts,
                DeadLetters::Detail,
                DeadLetters::FirstFailedAt,
                DeadLetters::LastFailedAt,
                DeadLetters::State,
            ])
            .values_panic([
                entry.order_number.clone().into(),
                entry.reason.as_str().into(),
                i64::from(entry.attempts).into(),
                entry.detail.clone().into(),
                format_timestamp(entry.first_failed_at).into(),
                format_timestamp(entry.last_failed_at).into(),
                entry.state.as_str().into(),
            ])
            .on_conflict(
                OnConflict::column(DeadLetters::OrderNumber)
                    .update_columns([
                        DeadLetters::Reason,
                        DeadLetters::Attempts,
                        DeadLetters::Detail,
                        DeadLetters::FirstFailedAt,
                        DeadLetters::LastFailedAt,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(entry)
    }

    async fn list_by_state(&self, state: DeadLetterState) -> Result<Vec<DeadLetterEntry>> {
        let query = Self::select_entries()
            .and_where(Expr::col(DeadLetters::State).eq(state.as_str()))
            .order_by(DeadLetters::LastFailedAt, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::entry_from_row).collect()
    }
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetterStore {
    async fn record(&self, letter: &DeadLetter) -> Result<DeadLetterEntry> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::record_in_tx(&mut conn, letter).await;

        match result {
            Ok(entry) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(entry)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn get(&self, order_number: &str) -> Result<Option<DeadLetterEntry>> {
        let mut conn = self.pool.acquire().await?;
        Self::load(&mut conn, order_number).await
    }

    async fn list_pending(&self) -> Result<Vec<DeadLetterEntry>> {
        self.list_by_state(DeadLetterState::Pending).await
    }

    async fn list_quarantined(&self) -> Result<Vec<DeadLetterEntry>> {
        self.list_by_state(DeadLetterState::Quarantined).await
    }

    async fn quarantine(&self, order_number: &str, note: &str) -> Result<()> {
        let query = Query::update()
            .table(DeadLetters::Table)
            .value(DeadLetters::State, DeadLetterState::Quarantined.as_str())
            .value(DeadLetters::Detail, note)
            .and_where(Expr::col(DeadLetters::OrderNumber).eq(order_number))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn remove(&self, order_number: &str) -> Result<()> {
        let query = Query::delete()
            .from_table(DeadLetters::Table)
            .and_where(Expr::col(DeadLetters::OrderNumber).eq(order_number))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, SqliteDeadLetterStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dlq.db");
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .unwrap();
        let store = SqliteDeadLetterStore::new(pool);
        store.init().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_record_and_get() {
        let (_dir, store) = store().await;
        let letter = DeadLetter::new("12345678903", FailureReason::OracleExhausted, 6, "timeout");

        let entry = store.record(&letter).await.unwrap();
        assert_eq!(entry.state, DeadLetterState::Pending);

        let loaded = store.get("12345678903").await.unwrap().unwrap();
        assert_eq!(loaded.reason, FailureReason::OracleExhausted);
        assert_eq!(loaded.attempts, 6);
        assert_eq!(loaded.detail, "timeout");
    }

    #[tokio::test]
    async fn test_record_merges_by_order_number() {
        let (_dir, store) = store().await;
        let first = DeadLetter::new("12345678903", FailureReason::OracleExhausted, 6, "timeout");
        store.record(&first).await.unwrap();

        let mut second = DeadLetter::new("12345678903", FailureReason::ReconcileFailed, 9, "locked");
        second.failed_at = first.failed_at + chrono::Duration::seconds(10);
        store.record(&second).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        let entry = &pending[0];
        assert_eq!(entry.reason, FailureReason::ReconcileFailed);
        assert_eq!(entry.attempts, 9);
        assert!(entry.last_failed_at > entry.first_failed_at);
    }

    #[tokio::test]
    async fn test_quarantine_and_remove() {
        let (_dir, store) = store().await;
        store
            .record(&DeadLetter::new("12345678903", FailureReason::OracleExhausted, 6, "x"))
            .await
            .unwrap();
        store
            .record(&DeadLetter::new("79927398713", FailureReason::OracleExhausted, 6, "y"))
            .await
            .unwrap();

        store.quarantine("12345678903", "retry ceiling reached").await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].order_number, "79927398713");

        let quarantined = store.list_quarantined().await.unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].detail, "retry ceiling reached");

        // A later failure of a quarantined order stays quarantined.
        store
            .record(&DeadLetter::new("12345678903", FailureReason::OracleExhausted, 7, "z"))
            .await
            .unwrap();
        assert_eq!(store.list_quarantined().await.unwrap().len(), 1);

        store.remove("79927398713").await.unwrap();
        assert!(store.get("79927398713").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_format_token_stored_verbatim() {
        let (_dir, store) = store().await;
        store
            .record(&DeadLetter::new("12-34", FailureReason::InvalidFormat, 1, "non-digit"))
            .await
            .unwrap();

        let entry = store.get("12-34").await.unwrap().unwrap();
        assert_eq!(entry.reason, FailureReason::InvalidFormat);
    }
}
