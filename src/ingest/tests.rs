use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use super::*;
use crate::bus::MockQueue;
use crate::dlq::{DeadLetter, FailureReason};
use crate::model::{OrderStatus, Transition};
use crate::storage::{DeadLetterStore, MockDeadLetterStore, MockOrderStore};

struct Fixture {
    orders: Arc<MockOrderStore>,
    pending: Arc<MockQueue<String>>,
    ingest: OrderIngest,
}

fn fast_config() -> IngestConfig {
    IngestConfig {
        publish_retry: RetryPolicy::new(1, 5, 3),
        ..IngestConfig::default()
    }
}

fn fixture() -> Fixture {
    let orders = Arc::new(MockOrderStore::new());
    let pending = Arc::new(MockQueue::new("pending"));
    let ingest = OrderIngest::new(
        orders.clone(),
        pending.clone(),
        fast_config(),
        Arc::new(PipelineStats::new()),
    );
    Fixture {
        orders,
        pending,
        ingest,
    }
}

// ============================================================================
// submit
// ============================================================================

#[tokio::test]
async fn test_submit_accepts_and_enqueues() {
    let f = fixture();
    let user = Uuid::new_v4();

    let outcome = f.ingest.submit("12345678903", user).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Accepted(_)));
    assert_eq!(outcome.order().status, OrderStatus::New);

    let published = f.pending.take_published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message.payload, "12345678903");
    assert_eq!(published[0].message.attempt, 0);
}

#[tokio::test]
async fn test_submit_rejects_bad_checksum() {
    let f = fixture();

    let result = f.ingest.submit("12345678904", Uuid::new_v4()).await;
    assert!(matches!(
        result,
        Err(IngestError::InvalidFormat(OrderNumberError::Checksum))
    ));
    assert_eq!(f.pending.published_count().await, 0);
}

#[tokio::test]
async fn test_submit_rejects_all_zeros() {
    let f = fixture();

    let result = f.ingest.submit("00000000000", Uuid::new_v4()).await;
    assert!(matches!(
        result,
        Err(IngestError::InvalidFormat(OrderNumberError::AllZeros))
    ));
    assert_eq!(f.pending.published_count().await, 0);
}

#[tokio::test]
async fn test_submit_same_user_is_idempotent() {
    let f = fixture();
    let user = Uuid::new_v4();

    f.ingest.submit("12345678903", user).await.unwrap();
    let again = f.ingest.submit(" 12345678903 ", user).await.unwrap();

    assert!(matches!(again, SubmitOutcome::AlreadySubmitted(_)));
    assert_eq!(f.pending.published_count().await, 1);
}

#[tokio::test]
async fn test_submit_other_user_conflicts() {
    let f = fixture();

    f.ingest.submit("12345678903", Uuid::new_v4()).await.unwrap();
    let result = f.ingest.submit("12345678903", Uuid::new_v4()).await;

    assert!(matches!(result, Err(IngestError::Conflict(ref n)) if n == "12345678903"));
    assert_eq!(f.pending.published_count().await, 1);
}

#[tokio::test]
async fn test_submit_retries_transient_publish_failure() {
    let f = fixture();
    f.pending.fail_next_publishes(2).await;

    let outcome = f.ingest.submit("12345678903", Uuid::new_v4()).await.unwrap();
    assert!(matches!(outcome, SubmitOutcome::Accepted(_)));
    assert_eq!(f.pending.published_count().await, 1);
}

#[tokio::test]
async fn test_submit_queue_unavailable_leaves_order_new() {
    let f = fixture();
    f.pending.set_fail_on_publish(true).await;

    let result = f.ingest.submit("12345678903", Uuid::new_v4()).await;
    assert!(matches!(result, Err(IngestError::QueueUnavailable { .. })));

    let number = OrderNumber::parse("12345678903").unwrap();
    let order = f.orders.get_order(&number).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::New);
}

// ============================================================================
// StaleSweep
// ============================================================================

struct SweepFixture {
    orders: Arc<MockOrderStore>,
    dead_letters: Arc<MockDeadLetterStore>,
    pending: Arc<MockQueue<String>>,
    sweep: StaleSweep,
}

fn sweep_fixture() -> SweepFixture {
    let orders = Arc::new(MockOrderStore::new());
    let dead_letters = Arc::new(MockDeadLetterStore::new());
    let pending = Arc::new(MockQueue::new("pending"));
    let sweep = StaleSweep::new(
        orders.clone(),
        dead_letters.clone(),
        pending.clone(),
        &IngestConfig::default(),
        Arc::new(PipelineStats::new()),
    );
    SweepFixture {
        orders,
        dead_letters,
        pending,
        sweep,
    }
}

async fn stale_order(orders: &MockOrderStore, raw: &str) -> OrderNumber {
    let number = OrderNumber::parse(raw).unwrap();
    orders.create_order(&number, Uuid::new_v4()).await.unwrap();
    orders
        .set_updated_at(&number, Utc::now() - chrono::Duration::hours(1))
        .await;
    number
}

#[tokio::test]
async fn test_sweep_requeues_stale_orders_once() {
    let f = sweep_fixture();
    stale_order(&f.orders, "12345678903").await;

    assert_eq!(f.sweep.run_once().await.unwrap(), 1);
    assert_eq!(f.pending.published_count().await, 1);

    // Touched, so the next sweep leaves it alone.
    assert_eq!(f.sweep.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_sweep_skips_terminal_and_fresh_orders() {
    let f = sweep_fixture();
    let terminal = stale_order(&f.orders, "12345678903").await;
    f.orders
        .apply_transition(&terminal, &Transition::Invalid)
        .await
        .unwrap();
    f.orders
        .create_order(&OrderNumber::parse("79927398713").unwrap(), Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(f.sweep.run_once().await.unwrap(), 0);
    assert_eq!(f.pending.published_count().await, 0);
}

#[tokio::test]
async fn test_sweep_leaves_dead_lettered_orders_to_sanitizer() {
    let f = sweep_fixture();
    stale_order(&f.orders, "12345678903").await;
    f.dead_letters
        .record(&DeadLetter::new(
            "12345678903",
            FailureReason::OracleExhausted,
            6,
            "timeout",
        ))
        .await
        .unwrap();

    assert_eq!(f.sweep.run_once().await.unwrap(), 0);
}

#[tokio::test]
async fn test_sweep_stops_when_queue_down() {
    let f = sweep_fixture();
    let number = stale_order(&f.orders, "12345678903").await;
    f.pending.set_fail_on_publish(true).await;

    assert_eq!(f.sweep.run_once().await.unwrap(), 0);

    // Not touched: still stale for the next sweep.
    let cutoff = Utc::now() - chrono::Duration::minutes(10);
    let stale = f.orders.list_stale(cutoff, 10).await.unwrap();
    assert_eq!(stale[0].number, number);
}

#[tokio::test]
async fn test_sweep_spawn_stops_on_cancel() {
    let f = sweep_fixture();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handle = f.sweep.with_interval(Duration::from_millis(10)).spawn(cancel_rx);

    tokio::time::sleep(Duration::from_millis(30)).await;
    cancel_tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
    assert!(result.is_ok());
}
