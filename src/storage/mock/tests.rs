use super::*;
use crate::dlq::FailureReason;
use crate::model::OrderStatus;

fn number(raw: &str) -> OrderNumber {
    OrderNumber::parse(raw).unwrap()
}

// ============================================================================
// MockOrderStore Tests
// ============================================================================

#[tokio::test]
async fn test_create_then_existing() {
    let store = MockOrderStore::new();
    let user = Uuid::new_v4();

    let first = store.create_order(&number("12345678903"), user).await.unwrap();
    assert!(matches!(first, CreateOutcome::Created(_)));

    let second = store
        .create_order(&number("12345678903"), Uuid::new_v4())
        .await
        .unwrap();
    match second {
        CreateOutcome::Existing(order) => assert_eq!(order.user_id, user),
        CreateOutcome::Created(_) => panic!("expected Existing"),
    }
}

#[tokio::test]
async fn test_processed_is_idempotent() {
    let store = MockOrderStore::new();
    let user = Uuid::new_v4();
    let n = number("12345678903");
    store.create_order(&n, user).await.unwrap();

    let amount = Decimal::new(50000, 2);
    store
        .apply_transition(&n, &Transition::Processed(amount))
        .await
        .unwrap();
    let again = store
        .apply_transition(&n, &Transition::Processed(amount))
        .await
        .unwrap();

    assert_eq!(
        again,
        TransitionOutcome::AlreadyTerminal(OrderStatus::Processed)
    );
    assert_eq!(store.get_balance(user).await.unwrap().current, amount);
    assert_eq!(store.list_accruals(user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_fail_next_transitions() {
    let store = MockOrderStore::new();
    let n = number("12345678903");
    store.create_order(&n, Uuid::new_v4()).await.unwrap();
    store.fail_next_transitions(1).await;

    let first = store.apply_transition(&n, &Transition::Invalid).await;
    assert!(matches!(first, Err(ref e) if e.is_retryable()));

    let second = store.apply_transition(&n, &Transition::Invalid).await;
    assert_eq!(second.unwrap(), TransitionOutcome::Applied);
    assert_eq!(store.transition_calls().await, 2);
}

#[tokio::test]
async fn test_withdraw_respects_balance() {
    let store = MockOrderStore::new();
    let user = Uuid::new_v4();

    let result = store.withdraw(user, Decimal::ONE).await;
    assert!(matches!(result, Err(StorageError::InsufficientFunds { .. })));

    let n = number("12345678903");
    store.create_order(&n, user).await.unwrap();
    store
        .apply_transition(&n, &Transition::Processed(Decimal::new(10, 0)))
        .await
        .unwrap();

    let balance = store.withdraw(user, Decimal::new(4, 0)).await.unwrap();
    assert_eq!(balance.current, Decimal::new(6, 0));
    assert_eq!(balance.withdrawn, Decimal::new(4, 0));
}

#[tokio::test]
async fn test_withdraw_rejects_amount_rounding_to_zero() {
    let store = MockOrderStore::new();
    let user = Uuid::new_v4();
    let n = number("12345678903");
    store.create_order(&n, user).await.unwrap();
    store
        .apply_transition(&n, &Transition::Processed(Decimal::new(10, 0)))
        .await
        .unwrap();

    let result = store.withdraw(user, Decimal::new(1, 3)).await;
    assert!(matches!(result, Err(StorageError::InvalidAmount(_))));

    let balance = store.get_balance(user).await.unwrap();
    assert_eq!(balance.current, Decimal::new(10, 0));
    assert_eq!(balance.withdrawn, Decimal::ZERO);
}

#[tokio::test]
async fn test_list_stale() {
    let store = MockOrderStore::new();
    let n = number("12345678903");
    store.create_order(&n, Uuid::new_v4()).await.unwrap();
    store
        .set_updated_at(&n, Utc::now() - chrono::Duration::minutes(20))
        .await;

    let cutoff = Utc::now() - chrono::Duration::minutes(10);
    assert_eq!(store.list_stale(cutoff, 10).await.unwrap().len(), 1);

    store.touch(&n).await.unwrap();
    assert!(store.list_stale(cutoff, 10).await.unwrap().is_empty());
}

// ============================================================================
// MockDeadLetterStore Tests
// ============================================================================

#[tokio::test]
async fn test_dead_letter_merge() {
    let store = MockDeadLetterStore::new();
    store
        .record(&DeadLetter::new("12345678903", FailureReason::OracleExhausted, 6, "a"))
        .await
        .unwrap();
    let merged = store
        .record(&DeadLetter::new("12345678903", FailureReason::OracleExhausted, 4, "b"))
        .await
        .unwrap();

    assert_eq!(merged.attempts, 6);
    assert_eq!(merged.detail, "b");
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_dead_letter_quarantine() {
    let store = MockDeadLetterStore::new();
    store
        .record(&DeadLetter::new("12345678903", FailureReason::ReconcileFailed, 6, "a"))
        .await
        .unwrap();
    store.quarantine("12345678903", "order not found").await.unwrap();

    assert!(store.list_pending().await.unwrap().is_empty());
    let quarantined = store.list_quarantined().await.unwrap();
    assert_eq!(quarantined[0].detail, "order not found");
}

#[tokio::test]
async fn test_dead_letter_fail_on_record() {
    let store = MockDeadLetterStore::new();
    store.set_fail_on_record(true).await;

    let result = store
        .record(&DeadLetter::new("12345678903", FailureReason::ReconcileFailed, 1, "a"))
        .await;
    assert!(result.is_err());
    assert!(store.is_empty().await);
}
