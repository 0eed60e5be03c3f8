//! SQLite OrderStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_query::{
    ColumnDef, Expr, Index, OnConflict, Order as SortOrder, Query, SqliteQueryBuilder, Table,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{
    Balance, CreateOutcome, Order, OrderNumber, OrderStatus, Transition, TransitionOutcome,
};
use crate::storage::helpers::{
    format_amount, format_timestamp, parse_amount, parse_timestamp, parse_uuid,
};
use crate::storage::schema::{Accruals, Balances, Orders};
use crate::storage::{AccrualRecord, OrderStore, Result, StorageError};

const TERMINAL: [&str; 2] = ["INVALID", "PROCESSED"];

/// SQLite implementation of OrderStore.
pub struct SqliteOrderStore {
    pool: SqlitePool,
}

impl SqliteOrderStore {
    /// Create a new SQLite order store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the orders, balances and accruals tables.
    pub async fn init(&self) -> Result<()> {
        let statements = [
            Table::create()
                .table(Orders::Table)
                .if_not_exists()
                .col(ColumnDef::new(Orders::Number).text().not_null().primary_key())
                .col(ColumnDef::new(Orders::UserId).text().not_null())
                .col(ColumnDef::new(Orders::Status).text().not_null())
                .col(ColumnDef::new(Orders::Accrual).text())
                .col(ColumnDef::new(Orders::SubmittedAt).text().not_null())
                .col(ColumnDef::new(Orders::UpdatedAt).text().not_null())
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_orders_user_id")
                .table(Orders::Table)
                .col(Orders::UserId)
                .to_string(SqliteQueryBuilder),
            Index::create()
                .if_not_exists()
                .name("idx_orders_status_updated_at")
                .table(Orders::Table)
                .col(Orders::Status)
                .col(Orders::UpdatedAt)
                .to_string(SqliteQueryBuilder),
            Table::create()
                .table(Balances::Table)
                .if_not_exists()
                .col(ColumnDef::new(Balances::UserId).text().not_null().primary_key())
                .col(ColumnDef::new(Balances::Current).text().not_null())
                .col(ColumnDef::new(Balances::Withdrawn).text().not_null())
                .col(ColumnDef::new(Balances::UpdatedAt).text().not_null())
                .to_string(SqliteQueryBuilder),
            Table::create()
                .table(Accruals::Table)
                .if_not_exists()
                .col(
                    ColumnDef::new(Accruals::OrderNumber)
                        .text()
                        .not_null()
                        .primary_key(),
                )
                .col(ColumnDef::new(Accruals::UserId).text().not_null())
                .col(ColumnDef::new(Accruals::Amount).text().not_null())
                .col(ColumnDef::new(Accruals::CreditedAt).text().not_null())
                .to_string(SqliteQueryBuilder),
        ];

        for statement in statements {
            sqlx::query(&statement).execute(&self.pool).await?;
        }

        info!("Order tables initialized (SQLite)");
        Ok(())
    }

    fn select_orders() -> sea_query::SelectStatement {
        Query::select()
            .columns([
                Orders::Number,
                Orders::UserId,
                Orders::Status,
                Orders::Accrual,
                Orders::SubmittedAt,
                Orders::UpdatedAt,
            ])
            .from(Orders::Table)
            .to_owned()
    }

    fn order_from_row(row: &SqliteRow) -> Result<Order> {
        let number: String = row.try_get("number")?;
        let number = OrderNumber::parse(&number)
            .map_err(|e| StorageError::Decode(format!("order number {:?}: {}", number, e)))?;
        let user_id: String = row.try_get("user_id")?;
        let status: String = row.try_get("status")?;
        let accrual: Option<String> = row.try_get("accrual")?;
        let submitted_at: String = row.try_get("submitted_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Order {
            number,
            user_id: parse_uuid(&user_id)?,
            status: status.parse::<OrderStatus>().map_err(StorageError::Decode)?,
            accrual: accrual.as_deref().map(parse_amount).transpose()?,
            submitted_at: parse_timestamp(&submitted_at)?,
            updated_at: parse_timestamp(&updated_at)?,
        })
    }

    async fn load_order(conn: &mut SqliteConnection, number: &OrderNumber) -> Result<Option<Order>> {
        let query = Self::select_orders()
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.as_ref().map(Self::order_from_row).transpose()
    }

    async fn load_balance(conn: &mut SqliteConnection, user_id: Uuid) -> Result<Balance> {
        let query = Query::select()
            .columns([Balances::Current, Balances::Withdrawn])
            .from(Balances::Table)
            .and_where(Expr::col(Balances::UserId).eq(user_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;

        match row {
            Some(row) => {
                let current: String = row.try_get("current")?;
                let withdrawn: String = row.try_get("withdrawn")?;
                Ok(Balance {
                    user_id,
                    current: parse_amount(&current)?,
                    withdrawn: parse_amount(&withdrawn)?,
                })
            }
            None => Ok(Balance::empty(user_id)),
        }
    }

    async fn store_balance(
        conn: &mut SqliteConnection,
        balance: &Balance,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let query = Query::insert()
            .into_table(Balances::Table)
            .columns([
                Balances::UserId,
                Balances::Current,
                Balances::Withdrawn,
                Balances::UpdatedAt,
            ])
            .values_panic([
                balance.user_id.to_string().into(),
                format_amount(balance.current).into(),
                format_amount(balance.withdrawn).into(),
                format_timestamp(now).into(),
            ])
            .on_conflict(
                OnConflict::column(Balances::UserId)
                    .update_columns([
                        Balances::Current,
                        Balances::Withdrawn,
                        Balances::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        Ok(())
    }

    /// Apply a transition within an already-started transaction.
    async fn transition_in_tx(
        conn: &mut SqliteConnection,
        number: &OrderNumber,
        transition: &Transition,
    ) -> Result<TransitionOutcome> {
        let order = Self::load_order(conn, number)
            .await?
            .ok_or_else(|| StorageError::OrderNotFound(number.to_string()))?;

        if order.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(order.status));
        }

        let now = Utc::now();
        // The builder is not Send; render it before the first await.
        let query = {
            let mut update = Query::update();
            update
                .table(Orders::Table)
                .value(Orders::Status, transition.target().as_str())
                .value(Orders::UpdatedAt, format_timestamp(now))
                .and_where(Expr::col(Orders::Number).eq(number.as_str()));

            if let Transition::Processed(amount) = transition {
                update.value(Orders::Accrual, format_amount(*amount));
            }

            update.to_string(SqliteQueryBuilder)
        };
        sqlx::query(&query).execute(&mut *conn).await?;

        if let Transition::Processed(amount) = transition {
            let amount = amount.round_dp(2);

            let mut balance = Self::load_balance(conn, order.user_id).await?;
            balance.current += amount;
            Self::store_balance(conn, &balance, now).await?;

            let ledger = Query::insert()
                .into_table(Accruals::Table)
                .columns([
                    Accruals::OrderNumber,
                    Accruals::UserId,
                    Accruals::Amount,
                    Accruals::CreditedAt,
                ])
                .values_panic([
                    number.as_str().into(),
                    order.user_id.to_string().into(),
                    format_amount(amount).into(),
                    format_timestamp(now).into(),
                ])
                .to_string(SqliteQueryBuilder);
            sqlx::query(&ledger).execute(&mut *conn).await?;

            debug!(
                order = %number,
                user_id = %order.user_id,
                amount = %amount,
                "Balance credited"
            );
        }

        Ok(TransitionOutcome::Applied)
    }

    async fn withdraw_in_tx(
        conn: &mut SqliteConnection,
        user_id: Uuid,
        amount: Decimal,
    ) -> Result<Balance> {
        let mut balance = Self::load_balance(conn, user_id).await?;
        if balance.current < amount {
            return Err(StorageError::InsufficientFunds {
                available: balance.current,
                requested: amount,
            });
        }

        balance.current -= amount;
        balance.withdrawn += amount;
        Self::store_balance(conn, &balance, Utc::now()).await?;
        Ok(balance)
    }
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn create_order(&self, number: &OrderNumber, user_id: Uuid) -> Result<CreateOutcome> {
        let now = format_timestamp(Utc::now());

        let query = Query::insert()
            .into_table(Orders::Table)
            .columns([
                Orders::Number,
                Orders::UserId,
                Orders::Status,
                Orders::SubmittedAt,
                Orders::UpdatedAt,
            ])
            .values_panic([
                number.as_str().into(),
                user_id.to_string().into(),
                OrderStatus::New.as_str().into(),
                now.clone().into(),
                now.into(),
            ])
            .on_conflict(OnConflict::column(Orders::Number).do_nothing().to_owned())
            .to_string(SqliteQueryBuilder);

        let inserted = sqlx::query(&query).execute(&self.pool).await?.rows_affected() == 1;

        let order = self
            .get_order(number)
            .await?
            .ok_or_else(|| StorageError::OrderNotFound(number.to_string()))?;

        if inserted {
            Ok(CreateOutcome::Created(order))
        } else {
            Ok(CreateOutcome::Existing(order))
        }
    }

    async fn get_order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_order(&mut conn, number).await
    }

    async fn list_orders(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let query = Self::select_orders()
            .and_where(Expr::col(Orders::UserId).eq(user_id.to_string()))
            .order_by(Orders::SubmittedAt, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::order_from_row).collect()
    }

    async fn list_stale(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<Order>> {
        let query = Self::select_orders()
            .and_where(Expr::col(Orders::Status).is_not_in(TERMINAL))
            .and_where(Expr::col(Orders::UpdatedAt).lt(format_timestamp(updated_before)))
            .order_by(Orders::UpdatedAt, SortOrder::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::order_from_row).collect()
    }

    async fn touch(&self, number: &OrderNumber) -> Result<()> {
        let query = Query::update()
            .table(Orders::Table)
            .value(Orders::UpdatedAt, format_timestamp(Utc::now()))
            .and_where(Expr::col(Orders::Number).eq(number.as_str()))
            .and_where(Expr::col(Orders::Status).is_not_in(TERMINAL))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn apply_transition(
        &self,
        number: &OrderNumber,
        transition: &Transition,
    ) -> Result<TransitionOutcome> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::transition_in_tx(&mut conn, number, transition).await;

        match result {
            Ok(outcome) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn get_balance(&self, user_id: Uuid) -> Result<Balance> {
        let mut conn = self.pool.acquire().await?;
        Self::load_balance(&mut conn, user_id).await
    }

    async fn withdraw(&self, user_id: Uuid, amount: Decimal) -> Result<Balance> {
        let amount = amount.round_dp(2);
        if amount <= Decimal::ZERO {
            return Err(StorageError::InvalidAmount(amount));
        }

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::withdraw_in_tx(&mut conn, user_id, amount).await;

        match result {
            Ok(balance) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(balance)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn list_accruals(&self, user_id: Uuid) -> Result<Vec<AccrualRecord>> {
        let query = Query::select()
            .columns([
                Accruals::OrderNumber,
                Accruals::UserId,
                Accruals::Amount,
                Accruals::CreditedAt,
            ])
            .from(Accruals::Table)
            .and_where(Expr::col(Accruals::UserId).eq(user_id.to_string()))
            .order_by(Accruals::CreditedAt, SortOrder::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let number: String = row.try_get("order_number")?;
            let amount: String = row.try_get("amount")?;
            let credited_at: String = row.try_get("credited_at")?;
            records.push(AccrualRecord {
                order_number: OrderNumber::parse(&number)
                    .map_err(|e| StorageError::Decode(e.to_string()))?,
                user_id,
                amount: parse_amount(&amount)?,
                credited_at: parse_timestamp(&credited_at)?,
            });
        }
        Ok(records)
    }
}
