//! rdkafka transport - the `Transport` contract on top of a `StreamConsumer`
//!
//! Start offsets are seeded from the rebalance callback: once rdkafka has
//! assigned partitions (eager protocol), the assignment listener resolves the
//! offset policy against the consumer and the partitions are re-assigned with
//! explicit offsets before the first fetch. Partitions the listener leaves out
//! keep `Offset::Stored`, i.e. the committed position or `auto.offset.reset`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as KafkaMessage;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::kafka::transport::{
    AssignmentListener, Committer, OffsetSource, Transport, TransportFactory,
};
use crate::kafka::types::{Partition, RawRecord};

/// Consumer context forwarding rebalance events to the subscription's listener.
#[derive(Default)]
pub struct TransportContext {
    listener: RwLock<Option<Arc<dyn AssignmentListener>>>,
}

impl TransportContext {
    fn set_listener(&self, listener: Arc<dyn AssignmentListener>) {
        *self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn AssignmentListener>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ClientContext for TransportContext {}

impl ConsumerContext for TransportContext {
    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        let Some(listener) = self.listener() else {
            debug!("Rebalance before a listener was registered");
            return;
        };

        match rebalance {
            Rebalance::Assign(assigned) => {
                if assigned.count() == 0 {
                    return;
                }
                let partitions: Vec<Partition> =
                    assigned.elements().into_iter().map(Partition::from).collect();
                let seeds = listener.on_assigned(&ConsumerOffsets(base_consumer), &partitions);
                if seeds.is_empty() {
                    return;
                }

                let mut seeded = TopicPartitionList::new();
                for partition in &partitions {
                    let offset = seeds
                        .iter()
                        .find(|seed| seed.partition() == partition)
                        .map_or(Offset::Stored, |seed| Offset::Offset(seed.offset()));
                    if let Err(e) = seeded.add_partition_offset(
                        partition.topic(),
                        partition.partition_number(),
                        offset,
                    ) {
                        error!(partition = %partition, error = ?e, "Failed to add seeded offset");
                    }
                }

                match base_consumer.assign(&seeded) {
                    Ok(()) => info!(
                        seeded = seeds.len(),
                        "Seeded start offsets for assigned partitions"
                    ),
                    Err(e) => error!(
                        error = ?e,
                        "Failed to seed start offsets - keeping stored offsets"
                    ),
                }
            }
            Rebalance::Revoke(revoked) => {
                let partitions: Vec<Partition> =
                    revoked.elements().into_iter().map(Partition::from).collect();
                listener.on_revoked(&partitions);
            }
            Rebalance::Error(e) => {
                error!(error = ?e, "Rebalance error");
            }
        }
    }
}

/// Offset queries against any rdkafka consumer sharing our context.
struct ConsumerOffsets<'a, K>(&'a K);

impl<K> OffsetSource for ConsumerOffsets<'_, K>
where
    K: Consumer<TransportContext> + Sync,
{
    fn watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<(i64, i64), TransportError> {
        self.0
            .fetch_watermarks(partition.topic(), partition.partition_number(), timeout)
            .map_err(|e| query_error(e, "fetch_watermarks", partition))
    }

    fn committed(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Option<i64>, TransportError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(partition.topic(), partition.partition_number());
        let committed = self
            .0
            .committed_offsets(tpl, timeout)
            .map_err(|e| query_error(e, "committed_offsets", partition))?;

        Ok(committed
            .find_partition(partition.topic(), partition.partition_number())
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            }))
    }

    fn offset_for_timestamp(
        &self,
        partition: &Partition,
        timestamp_ms: i64,
        timeout: Duration,
    ) -> Result<Option<i64>, TransportError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(timestamp_ms),
        )?;
        let found = self
            .0
            .offsets_for_times(tpl, timeout)
            .map_err(|e| query_error(e, "offsets_for_times", partition))?;

        Ok(found
            .find_partition(partition.topic(), partition.partition_number())
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) => Some(offset),
                // no record at or after the timestamp
                _ => None,
            }))
    }
}

fn is_timeout_error(e: &KafkaError) -> bool {
    match e {
        KafkaError::Global(code) | KafkaError::MessageConsumption(code) => matches!(
            code,
            RDKafkaErrorCode::RequestTimedOut | RDKafkaErrorCode::OperationTimedOut
        ),
        _ => false,
    }
}

fn query_error(e: KafkaError, operation: &'static str, partition: &Partition) -> TransportError {
    if is_timeout_error(&e) {
        TransportError::Timeout {
            operation,
            partition: partition.partition_number(),
        }
    } else {
        TransportError::Kafka(e)
    }
}

/// One rdkafka group consumer serving one subscription.
pub struct KafkaTransport {
    consumer: StreamConsumer<TransportContext>,
    closed: AtomicBool,
}

impl KafkaTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let consumer: StreamConsumer<TransportContext> =
            config.create_with_context(TransportContext::default())?;
        Ok(Self {
            consumer,
            closed: AtomicBool::new(false),
        })
    }
}

impl Committer for KafkaTransport {
    fn commit(&self, partition: &Partition, offset: i64) -> Result<(), TransportError> {
        // Kafka stores the next offset to consume
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(offset + 1),
        )?;
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }
}

impl OffsetSource for KafkaTransport {
    fn watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<(i64, i64), TransportError> {
        ConsumerOffsets(&self.consumer).watermarks(partition, timeout)
    }

    fn committed(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Option<i64>, TransportError> {
        ConsumerOffsets(&self.consumer).committed(partition, timeout)
    }

    fn offset_for_timestamp(
        &self,
        partition: &Partition,
        timestamp_ms: i64,
        timeout: Duration,
    ) -> Result<Option<i64>, TransportError> {
        ConsumerOffsets(&self.consumer).offset_for_timestamp(partition, timestamp_ms, timeout)
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    fn topic_exists(&self, topic: &str, timeout: Duration) -> Result<bool, TransportError> {
        let metadata = self.consumer.fetch_metadata(Some(topic), timeout)?;
        Ok(metadata
            .topics()
            .iter()
            .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty()))
    }

    fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn AssignmentListener>,
    ) -> Result<(), TransportError> {
        self.consumer.context().set_listener(listener);
        self.consumer.subscribe(&[topic])?;
        info!(topic = topic, "Subscribed to topic");
        Ok(())
    }

    async fn consume(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<RawRecord>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            received = self.consumer.recv() => {
                let message = received?;
                Ok(Some(RawRecord {
                    partition: Partition::new(message.topic(), message.partition()),
                    offset: message.offset(),
                    key: message.key().map(<[u8]>::to_vec),
                    payload: message.payload().map(<[u8]>::to_vec),
                    timestamp_ms: message.timestamp().to_millis(),
                }))
            }
        }
    }

    fn assignment(&self) -> Result<Vec<Partition>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let assignment = self.consumer.assignment()?;
        Ok(assignment
            .elements()
            .into_iter()
            .map(Partition::from)
            .collect())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // leaving the group runs the revoke callback
        self.consumer.unsubscribe();
        info!("Kafka transport closed");
    }
}

/// Creates one `KafkaTransport` per subscription from a shared client config.
pub struct KafkaTransportFactory {
    config: ClientConfig,
}

impl KafkaTransportFactory {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for KafkaTransportFactory {
    fn create(&self) -> Result<Arc<dyn Transport>, TransportError> {
        match KafkaTransport::new(&self.config) {
            Ok(transport) => Ok(Arc::new(transport)),
            Err(e) => {
                warn!(error = ?e, "Failed to create Kafka consumer");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_errors_map_to_timeout() {
        let partition = Partition::new("orders", 3);
        let err = query_error(
            KafkaError::Global(RDKafkaErrorCode::OperationTimedOut),
            "fetch_watermarks",
            &partition,
        );
        assert!(matches!(
            err,
            TransportError::Timeout {
                operation: "fetch_watermarks",
                partition: 3
            }
        ));

        let err = query_error(
            KafkaError::Global(RDKafkaErrorCode::UnknownTopicOrPartition),
            "committed_offsets",
            &partition,
        );
        assert_eq!(err.error_type(), "kafka_error");
    }

    #[test]
    fn test_context_without_listener_has_none() {
        let context = TransportContext::default();
        assert!(context.listener().is_none());
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_transport_is_send_sync() {
        assert_send_sync::<KafkaTransport>();
        assert_send_sync::<KafkaTransportFactory>();
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let mut config = ClientConfig::new();
        config.set("not.a.real.property", "1");
        let factory = KafkaTransportFactory::new(config);
        assert!(factory.create().is_err());
    }
}
