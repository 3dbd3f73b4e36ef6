//! Shared helpers for the integration tests. Everything runs against the
//! in-memory broker, no Kafka needed.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kafka_pipeline::kafka::test_utils::InMemoryBroker;
use kafka_pipeline::pipelines::{handler_fn, Action};
use kafka_pipeline::subscription::{PayloadDecoder, SubscriptionManager, Utf8Decoder};
use kafka_pipeline::{Batch, Message};

pub const WAIT: Duration = Duration::from_secs(5);

/// Broker with `topic` created and a manager on top of it.
pub fn setup(topic: &str, partitions: usize) -> (Arc<InMemoryBroker>, SubscriptionManager) {
    let broker = InMemoryBroker::new();
    broker.create_topic(topic, partitions);
    let manager =
        SubscriptionManager::new(broker.factory()).with_query_timeout(Duration::from_millis(200));
    (broker, manager)
}

pub fn produce_n(broker: &InMemoryBroker, topic: &str, partitions: i32, n: usize) {
    for i in 0..n {
        let partition = i32::try_from(i).unwrap() % partitions;
        broker.produce(
            topic,
            partition,
            Some(format!("key-{i}").as_str()),
            &format!("msg-{i}"),
        );
    }
}

pub fn utf8() -> Arc<dyn PayloadDecoder<String>> {
    Arc::new(Utf8Decoder)
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub type Seen = Arc<Mutex<Vec<(i32, i64)>>>;
pub type SeenBatches = Arc<Mutex<Vec<Vec<(i32, i64)>>>>;

/// Per-message action recording (partition, offset).
pub fn recording_messages(seen: Seen) -> Action<String> {
    Action::PerMessage(Arc::new(handler_fn(move |message: Message<String>| {
        let seen = seen.clone();
        async move {
            seen.lock()
                .unwrap()
                .push((message.partition(), message.offset()));
            Ok(())
        }
    })))
}

/// Per-batch action recording the (partition, offset) of every batch member.
pub fn recording_batches(seen: SeenBatches) -> Action<String> {
    Action::PerBatch(Arc::new(handler_fn(move |batch: Batch<String>| {
        let seen = seen.clone();
        async move {
            seen.lock()
                .unwrap()
                .push(batch.iter().map(|m| (m.partition(), m.offset())).collect());
            Ok(())
        }
    })))
}

pub fn len<T>(items: &Mutex<Vec<T>>) -> usize {
    items.lock().unwrap().len()
}
