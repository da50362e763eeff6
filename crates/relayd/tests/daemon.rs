use std::sync::Arc;
use std::time::Duration;

use domain::{ExecContext, Order, OrderLine, StateRepository, UnitOfWork};
use relay::InMemoryPublisher;
use relayd::Config;
use storage::{AggregateId, InMemoryStore, OutboxStatus};
use tokio_util::sync::CancellationToken;

fn fast_config() -> Config {
    Config {
        poll_interval: Duration::from_millis(10),
        ..Config::default()
    }
}

#[tokio::test(start_paused = true)]
async fn worker_relays_committed_events_until_shutdown() {
    let store = InMemoryStore::new();
    let publisher = Arc::new(InMemoryPublisher::new());
    let shutdown = CancellationToken::new();
    let handle = relayd::start_worker(
        store.clone(),
        &fast_config(),
        publisher.clone(),
        shutdown.clone(),
    );

    let uow = UnitOfWork::new(store.clone());
    let orders = StateRepository::<Order>::new();
    uow.execute(&ExecContext::new(), |scope| {
        let orders = &orders;
        async move {
            let mut order = Order::place(AggregateId::new(), vec![OrderLine::new("SKU-1", 2, 500)])?;
            order.pay()?;
            scope.save(orders, &mut order).await
        }
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let types: Vec<_> = publisher
        .published()
        .into_iter()
        .map(|m| m.event_type)
        .collect();
    assert_eq!(types, ["OrderPlaced", "OrderPaid"]);
    assert!(
        store
            .outbox_records()
            .await
            .iter()
            .all(|r| r.status == OutboxStatus::Published)
    );

    shutdown.cancel();
    handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn run_returns_after_shutdown() {
    let shutdown = CancellationToken::new();
    let daemon = tokio::spawn(relayd::run(fast_config(), shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!daemon.is_finished());

    shutdown.cancel();
    daemon.await.unwrap().unwrap();
}
