mod common;
use common::{QUEUE, cluster, consumer_config, encoded, endpoint, next_frame, wait_for};

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use mbus_client::{AckMode, BrokerFetcher, ConsumerConfig, Error};
use mbus_connection_memory::{MemoryConnector, Operation};

fn fetcher(connector: &MemoryConnector, config: ConsumerConfig) -> BrokerFetcher<MemoryConnector> {
    BrokerFetcher::new(endpoint(0), connector.clone(), Arc::new(config))
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_prefetches_and_credits() {
    let (connector, brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));

    assert!(fetcher.receive_last().await.is_none());

    fetcher.start();
    let id = brokers[0].publish(QUEUE, encoded("one"));

    let frame = next_frame(&fetcher).await;
    assert_eq!(frame.message_id(), Some(id.as_str()));
    assert_eq!(brokers[0].count(Operation::Credit), 1);

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_ack_without_delivery_fails() {
    let (connector, _brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    fetcher.start();

    assert_matches!(fetcher.ack().await, Err(Error::AckFailed(_)));
    assert_matches!(fetcher.nack().await, Err(Error::NackFailed(_)));

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_unstarted_fetcher_acks_without_subscribing() {
    let (connector, brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    let id = brokers[0].publish(QUEUE, encoded("elsewhere"));

    fetcher.ack_message(&id, Some("conn-9")).await.unwrap();

    assert!(!fetcher.is_started());
    assert!(fetcher.is_connected());
    assert_eq!(brokers[0].acked(), vec![id]);
    assert_eq!(brokers[0].count(Operation::Subscribe), 0);
    assert_eq!(brokers[0].queue_depth(QUEUE), 1);
    assert!(fetcher.receive_last().await.is_none());

    // Starting it later subscribes on a fresh connection.
    fetcher.start();
    let frame = next_frame(&fetcher).await;
    assert_eq!(frame.body, encoded("elsewhere"));
    assert_eq!(brokers[0].count(Operation::Subscribe), 1);
    assert_eq!(brokers[0].connection_count(), 1);

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_ack_reconnects_once_on_failure() {
    let (connector, brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    fetcher.start();

    let id = brokers[0].publish(QUEUE, encoded("one"));
    next_frame(&fetcher).await;

    brokers[0].fail_next(Operation::Ack, 1);
    fetcher.ack().await.unwrap();

    assert_eq!(brokers[0].acked(), vec![id]);
    assert_eq!(brokers[0].count(Operation::Ack), 2);
    assert!(brokers[0].count(Operation::Open) >= 2);

    // Nothing left to ack once the last delivery was acknowledged.
    assert_matches!(fetcher.ack().await, Err(Error::AckFailed(_)));

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_ack_fails_after_retry() {
    let (connector, brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    fetcher.start();

    brokers[0].publish(QUEUE, encoded("one"));
    next_frame(&fetcher).await;

    brokers[0].fail_next(Operation::Ack, 2);
    assert_matches!(fetcher.ack().await, Err(Error::AckFailed(_)));
    assert!(brokers[0].acked().is_empty());

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_ack_safe_waits_for_receipt() {
    let (connector, brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    fetcher.start();

    let first = brokers[0].publish(QUEUE, encoded("one"));
    next_frame(&fetcher).await;
    fetcher.ack_safe(Duration::from_secs(1)).await.unwrap();
    assert_eq!(brokers[0].acked(), vec![first]);

    brokers[0].publish(QUEUE, encoded("two"));
    next_frame(&fetcher).await;

    brokers[0].suppress_receipts(true);
    assert_matches!(
        fetcher.ack_safe(Duration::from_millis(100)).await,
        Err(Error::AckTimeout(timeout)) if timeout == Duration::from_millis(100)
    );

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_nack_requeues() {
    let (connector, brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    fetcher.start();

    let id = brokers[0].publish(QUEUE, encoded("one"));
    next_frame(&fetcher).await;

    fetcher.nack().await.unwrap();
    assert_eq!(brokers[0].nacked(), vec![id.clone()]);

    let again = next_frame(&fetcher).await;
    assert_eq!(again.message_id(), Some(id.as_str()));

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_auto_ack_acknowledges_on_receive() {
    let (connector, brokers) = cluster(1);
    let config = ConsumerConfig {
        ack_mode: AckMode::AutoClientAck,
        ..consumer_config(vec![endpoint(0)])
    };
    let fetcher = fetcher(&connector, config);
    fetcher.start();

    let id = brokers[0].publish(QUEUE, encoded("one"));
    next_frame(&fetcher).await;

    assert_eq!(brokers[0].acked(), vec![id]);

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let (connector, brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    fetcher.start();

    wait_for(|| brokers[0].connection_count() == 1).await;
    brokers[0].drop_connections();

    let id = brokers[0].publish(QUEUE, encoded("after restart"));
    let frame = next_frame(&fetcher).await;

    assert_eq!(frame.message_id(), Some(id.as_str()));
    assert!(brokers[0].count(Operation::Open) >= 2);

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_backs_off_while_unreachable() {
    let (connector, brokers) = cluster(1);
    brokers[0].set_reachable(false);

    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    fetcher.start();

    // Two full retry cycles with a cooldown in between.
    wait_for(|| brokers[0].count(Operation::Open) >= 4).await;
    assert!(!fetcher.is_connected());

    brokers[0].set_reachable(true);
    brokers[0].publish(QUEUE, encoded("finally"));
    next_frame(&fetcher).await;

    fetcher.close().await;
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_close_is_idempotent_and_requeues() {
    let (connector, brokers) = cluster(1);
    let fetcher = fetcher(&connector, consumer_config(vec![endpoint(0)]));
    fetcher.start();

    brokers[0].publish(QUEUE, encoded("one"));
    wait_for(|| brokers[0].in_flight() == 1).await;

    fetcher.close().await;
    fetcher.close().await;

    assert!(fetcher.is_closed());
    assert!(!fetcher.is_connected());
    assert_eq!(brokers[0].connection_count(), 0);
    assert_eq!(brokers[0].queue_depth(QUEUE), 1);
    assert!(fetcher.receive_last().await.is_none());
}
