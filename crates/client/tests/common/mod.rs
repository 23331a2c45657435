#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use mbus_api::{BrokerEndpoint, Destination, Message};
use mbus_client::{BrokerFetcher, ConsumerConfig, ProducerConfig};
use mbus_connection_memory::{MemoryBroker, MemoryConnector};

pub const QUEUE: &str = "jms.queue.orders";

pub fn endpoint(index: usize) -> BrokerEndpoint {
    BrokerEndpoint::new(format!("broker-{index}"), 61613)
}

/// A connector with `count` reachable brokers named `broker-0`, `broker-1`...
pub fn cluster(count: usize) -> (MemoryConnector, Vec<MemoryBroker>) {
    let connector = MemoryConnector::new();
    let brokers = (0..count)
        .map(|index| connector.add_broker(endpoint(index)))
        .collect();

    (connector, brokers)
}

pub fn encoded(text: &str) -> Bytes {
    Bytes::try_from(&Message::string(text)).unwrap()
}

pub fn consumer_config(brokers: Vec<BrokerEndpoint>) -> ConsumerConfig {
    ConsumerConfig {
        brokers,
        destination: Destination::queue(QUEUE),
        dynamic_membership: false,
        fetch_timeout: Duration::from_millis(200),
        connect_retry_delay: Duration::from_millis(10),
        reconnect_cooldown: Duration::from_millis(50),
        ..ConsumerConfig::default()
    }
}

pub fn producer_config(broker: BrokerEndpoint) -> ProducerConfig {
    ProducerConfig {
        broker,
        destination: Destination::queue(QUEUE),
        connect_retry_delay: Duration::from_millis(10),
        ..ProducerConfig::default()
    }
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Polls a fetcher until it hands over a prefetched frame.
pub async fn next_frame(fetcher: &BrokerFetcher<MemoryConnector>) -> mbus_api::Frame {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(frame) = fetcher.receive_last().await {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("no frame prefetched in time")
}
