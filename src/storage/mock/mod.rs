//! Mock storage implementations for testing.
//!
//! Also backs the `memory` storage type. All state of a store sits behind one
//! lock, so each operation is atomic the way a SQL transaction would be.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{AccrualRecord, DeadLetterStore, OrderStore, Result, StorageError};
use crate::dlq::{DeadLetter, DeadLetterEntry, DeadLetterState};
use crate::model::{Balance, CreateOutcome, Order, OrderNumber, Transition, TransitionOutcome};

#[derive(Default)]
struct OrderState {
    orders: HashMap<OrderNumber, Order>,
    balances: HashMap<Uuid, Balance>,
    accruals: Vec<AccrualRecord>,
}

/// Mock order store that keeps everything in memory.
#[derive(Default)]
pub struct MockOrderStore {
    state: RwLock<OrderState>,
    /// Number of upcoming transitions to fail with a retryable error.
    fail_transitions: RwLock<usize>,
    fail_on_transition: RwLock<bool>,
    transition_calls: RwLock<usize>,
}

impl MockOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every transition with a retryable error.
    pub async fn set_fail_on_transition(&self, fail: bool) {
        *self.fail_on_transition.write().await = fail;
    }

    /// Fail the next `count` transitions, then succeed.
    pub async fn fail_next_transitions(&self, count: usize) {
        *self.fail_transitions.write().await = count;
    }

    pub async fn transition_calls(&self) -> usize {
        *self.transition_calls.read().await
    }

    /// Insert an order directly, bypassing ingest.
    pub async fn insert_order(&self, order: Order) {
        self.state
            .write()
            .await
            .orders
            .insert(order.number.clone(), order);
    }

    /// Backdate `updated_at` so the order looks stale.
    pub async fn set_updated_at(&self, number: &OrderNumber, updated_at: DateTime<Utc>) {
        if let Some(order) = self.state.write().await.orders.get_mut(number) {
            order.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl OrderStore for MockOrderStore {
    async fn create_order(&self, number: &OrderNumber, user_id: Uuid) -> Result<CreateOutcome> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.orders.get(number) {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }
        let order = Order::new(number.clone(), user_id, Utc::now());
        state.orders.insert(number.clone(), order.clone());
        Ok(CreateOutcome::Created(order))
    }

    async fn get_order(&self, number: &OrderNumber) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(number).cloned())
    }

    async fn list_orders(&self, user_id: Uuid) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.submitted_at);
        Ok(orders)
    }

    async fn list_stale(&self, updated_before: DateTime<Utc>, limit: usize) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal() && o.updated_at < updated_before)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.updated_at);
        orders.truncate(limit);
        Ok(orders)
    }

    async fn touch(&self, number: &OrderNumber) -> Result<()> {
        if let Some(order) = self.state.write().await.orders.get_mut(number) {
            if !order.status.is_terminal() {
                order.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn apply_transition(
        &self,
        number: &OrderNumber,
        transition: &Transition,
    ) -> Result<TransitionOutcome> {
        *self.transition_calls.write().await += 1;

        if *self.fail_on_transition.read().await {
            return Err(StorageError::Unavailable("Mock transition failure".to_string()));
        }
        {
            let mut remaining = self.fail_transitions.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Unavailable("database is locked".to_string()));
            }
        }

        let mut state = self.state.write().await;
        let now = Utc::now();

        let order = state
            .orders
            .get_mut(number)
            .ok_or_else(|| StorageError::OrderNotFound(number.to_string()))?;

        if order.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(order.status));
        }

        order.status = transition.target();
        order.updated_at = now;

        if let Transition::Processed(amount) = transition {
            let amount = amount.round_dp(2);
            order.accrual = Some(amount);
            let user_id = order.user_id;

            state
                .balances
                .entry(user_id)
                .or_insert_with(|| Balance::empty(user_id))
                .current += amount;
            state.accruals.push(AccrualRecord {
                order_number: number.clone(),
                user_id,
                amount,
                credited_at: now,
            });
        }

        Ok(TransitionOutcome::Applied)
    }

    async fn get_balance(&self, user_id: Uuid) -> Result<Balance> {
        Ok(self
            .state
            .read()
            .await
            .balances
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| Balance::empty(user_id)))
    }

    async fn withdraw(&self, user_id: Uuid, amount: Decimal) -> Result<Balance> {
        let amount = amount.round_dp(2);
        if amount <= Decimal::ZERO {
            return Err(StorageError::InvalidAmount(amount));
        }

        let mut state = self.state.write().await;
        let balance = state
            .balances
            .entry(user_id)
            .or_insert_with(|| Balance::empty(user_id));

        if balance.current < amount {
            return Err(StorageError::InsufficientFunds {
                available: balance.current,
                requested: amount,
            });
        }
        balance.current -= amount;
        balance.withdrawn += amount;
        Ok(balance.clone())
    }

    async fn list_accruals(&self, user_id: Uuid) -> Result<Vec<AccrualRecord>> {
        Ok(self
            .state
            .read()
            .await
            .accruals
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Mock dead-letter store that keeps entries in memory.
#[derive(Default)]
pub struct MockDeadLetterStore {
    entries: RwLock<HashMap<String, DeadLetterEntry>>,
    fail_on_record: RwLock<bool>,
}

impl MockDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_record(&self, fail: bool) {
        *self.fail_on_record.write().await = fail;
    }

    /// Insert an entry directly, e.g. with a backdated failure time.
    pub async fn insert_entry(&self, entry: DeadLetterEntry) {
        self.entries
            .write()
            .await
            .insert(entry.order_number.clone(), entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    async fn list_by_state(&self, state: DeadLetterState) -> Vec<DeadLetterEntry> {
        let mut entries: Vec<DeadLetterEntry> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.state == state)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.last_failed_at);
        entries
    }
}

#[async_trait]
impl DeadLetterStore for MockDeadLetterStore {
    async fn record(&self, letter: &DeadLetter) -> Result<DeadLetterEntry> {
        if *self.fail_on_record.read().await {
            return Err(StorageError::Unavailable("Mock record failure".to_string()));
        }
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(letter.order_number.clone())
            .and_modify(|existing| existing.merge(letter))
            .or_insert_with(|| DeadLetterEntry::from_letter(letter));
        Ok(entry.clone())
    }

    async fn get(&self, order_number: &str) -> Result<Option<DeadLetterEntry>> {
        Ok(self.entries.read().await.get(order_number).cloned())
    }

    async fn list_pending(&self) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.list_by_state(DeadLetterState::Pending).await)
    }

    async fn list_quarantined(&self) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.list_by_state(DeadLetterState::Quarantined).await)
    }

    async fn quarantine(&self, order_number: &str, note: &str) -> Result<()> {
        if let Some(entry) = self.entries.write().await.get_mut(order_number) {
            entry.state = DeadLetterState::Quarantined;
            entry.detail = note.to_string();
        }
        Ok(())
    }

    async fn remove(&self, order_number: &str) -> Result<()> {
        self.entries.write().await.remove(order_number);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
