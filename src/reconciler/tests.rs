use uuid::Uuid;

use super::*;
use crate::bus::{ChannelQueue, MockQueue};
use crate::model::{OrderNumber, Transition};
use crate::storage::MockOrderStore;
use crate::test_utils::{cents, order_number};

struct Fixture {
    orders: Arc<MockOrderStore>,
    verdicts: Arc<MockQueue<Verdict>>,
    dead_letters: Arc<MockQueue<DeadLetter>>,
    reconciler: Reconciler,
}

fn fixture() -> Fixture {
    let orders = Arc::new(MockOrderStore::new());
    let verdicts = Arc::new(MockQueue::new("verdicts"));
    let dead_letters = Arc::new(MockQueue::new("dead-letters"));
    let reconciler = Reconciler::new(
        orders.clone(),
        verdicts.clone(),
        dead_letters.clone(),
        ReconcilerConfig {
            workers: 1,
            retry: RetryPolicy::new(1, 2, 2),
        },
        Arc::new(PipelineStats::new()),
    );
    Fixture {
        orders,
        verdicts,
        dead_letters,
        reconciler,
    }
}

impl Fixture {
    async fn order(&self, raw: &str) -> (OrderNumber, Uuid) {
        let number = order_number(raw);
        let user = Uuid::new_v4();
        self.orders.create_order(&number, user).await.unwrap();
        (number, user)
    }

    async fn deliver(&self, verdict: Verdict) -> (u64, Reconciled) {
        self.verdicts.push_delivery(QueueMessage::new(verdict)).await;
        let delivery = self
            .verdicts
            .receive(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let id = delivery.id;
        (id, self.reconciler.handle(delivery).await)
    }
}

// ============================================================================
// Transitions
// ============================================================================

#[tokio::test]
async fn test_processed_credits_balance() {
    let f = fixture();
    let (number, user) = f.order("12345678903").await;

    let (id, outcome) = f.deliver(Verdict::processed(number.clone(), cents(50000))).await;

    assert_eq!(outcome, Reconciled::Applied { finalized: true });
    let order = f.orders.get_order(&number).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Processed);
    assert_eq!(order.accrual, Some(cents(50000)));
    assert_eq!(f.orders.get_balance(user).await.unwrap().current, cents(50000));
    assert_eq!(f.verdicts.acked().await, vec![id]);
}

#[tokio::test]
async fn test_duplicate_processed_does_not_double_credit() {
    let f = fixture();
    let (number, user) = f.order("12345678903").await;

    f.deliver(Verdict::processed(number.clone(), cents(50000))).await;
    let (id, outcome) = f.deliver(Verdict::processed(number.clone(), cents(50000))).await;

    assert_eq!(outcome, Reconciled::Duplicate(OrderStatus::Processed));
    assert_eq!(f.orders.get_balance(user).await.unwrap().current, cents(50000));
    assert_eq!(f.orders.list_accruals(user).await.unwrap().len(), 1);
    assert!(f.verdicts.acked().await.contains(&id));
}

#[tokio::test]
async fn test_processing_moves_new_forward() {
    let f = fixture();
    let (number, _) = f.order("12345678903").await;

    let (_, outcome) = f.deliver(Verdict::processing(number.clone())).await;

    assert_eq!(outcome, Reconciled::Applied { finalized: false });
    let order = f.orders.get_order(&number).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Processing);
    assert_eq!(order.accrual, None);
}

#[tokio::test]
async fn test_late_processing_never_regresses_terminal() {
    let f = fixture();
    let (number, _) = f.order("12345678903").await;
    f.orders
        .apply_transition(&number, &Transition::Invalid)
        .await
        .unwrap();

    let (_, outcome) = f.deliver(Verdict::processing(number.clone())).await;

    assert_eq!(outcome, Reconciled::Duplicate(OrderStatus::Invalid));
    let order = f.orders.get_order(&number).await.unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Invalid);
}

#[tokio::test]
async fn test_invalid_after_processed_is_duplicate() {
    let f = fixture();
    let (number, user) = f.order("12345678903").await;

    f.deliver(Verdict::processed(number.clone(), cents(1000))).await;
    let (_, outcome) = f.deliver(Verdict::invalid(number.clone())).await;

    assert_eq!(outcome, Reconciled::Duplicate(OrderStatus::Processed));
    assert_eq!(f.orders.get_balance(user).await.unwrap().current, cents(1000));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_transient_storage_failure_retried() {
    let f = fixture();
    let (number, _) = f.order("12345678903").await;
    f.orders.fail_next_transitions(2).await;

    let (_, outcome) = f.deliver(Verdict::invalid(number)).await;

    assert_eq!(outcome, Reconciled::Applied { finalized: true });
    assert_eq!(f.orders.transition_calls().await, 3);
    assert_eq!(f.dead_letters.published_count().await, 0);
}

#[tokio::test]
async fn test_persistent_storage_failure_dead_letters() {
    let f = fixture();
    let (number, _) = f.order("12345678903").await;
    f.orders.set_fail_on_transition(true).await;

    let (id, outcome) = f.deliver(Verdict::invalid(number)).await;

    assert_eq!(outcome, Reconciled::DeadLettered);
    let letters = f.dead_letters.take_published().await;
    let letter = &letters[0].message.payload;
    assert_eq!(letter.reason, FailureReason::ReconcileFailed);
    assert_eq!(letter.attempts, 3);
    assert_eq!(f.verdicts.acked().await, vec![id]);
}

#[tokio::test]
async fn test_unknown_order_dead_letters_without_retry() {
    let f = fixture();

    let (_, outcome) = f
        .deliver(Verdict::processed(order_number("79927398713"), cents(100)))
        .await;

    assert_eq!(outcome, Reconciled::DeadLettered);
    assert_eq!(f.orders.transition_calls().await, 1);
    let letters = f.dead_letters.take_published().await;
    assert_eq!(letters[0].message.payload.order_number, "79927398713");
}

#[tokio::test]
async fn test_dead_letter_publish_failure_returns_verdict() {
    let f = fixture();
    f.dead_letters.set_fail_on_publish(true).await;

    let (id, outcome) = f.deliver(Verdict::invalid(order_number("79927398713"))).await;

    assert_eq!(outcome, Reconciled::Returned);
    assert!(f.verdicts.acked().await.is_empty());
    assert_eq!(f.verdicts.nacked().await[0].0, id);
}

// ============================================================================
// Worker pool
// ============================================================================

#[tokio::test]
async fn test_workers_apply_and_stop_on_cancel() {
    let orders = Arc::new(MockOrderStore::new());
    let verdicts: Arc<ChannelQueue<Verdict>> = Arc::new(ChannelQueue::named("verdicts"));
    let dead_letters: Arc<ChannelQueue<DeadLetter>> = Arc::new(ChannelQueue::named("dlq"));
    let reconciler = Arc::new(
        Reconciler::new(
            orders.clone(),
            verdicts.clone(),
            dead_letters,
            ReconcilerConfig::default(),
            Arc::new(PipelineStats::new()),
        )
        .with_receive_wait(Duration::from_millis(10)),
    );

    let number = order_number("12345678903");
    let user = Uuid::new_v4();
    orders.create_order(&number, user).await.unwrap();
    verdicts
        .publish(QueueMessage::new(Verdict::processed(number.clone(), cents(2500))))
        .await
        .unwrap();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let handles = reconciler.spawn(cancel_rx);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let order = orders.get_order(&number).await.unwrap().unwrap();
            if order.status == OrderStatus::Processed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(orders.get_balance(user).await.unwrap().current, cents(2500));

    cancel_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
