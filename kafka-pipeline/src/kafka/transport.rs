//! Transport contract - the boundary between the pipeline core and a broker client.
//!
//! The core never talks to a broker directly. Everything it needs (consume,
//! commit, watermark/committed/timestamp queries and assignment callbacks) goes
//! through the traits in this module. `kafka::consumer` implements them on top of
//! rdkafka and `kafka::test_utils` provides the in-memory broker used in tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::kafka::types::{Partition, PartitionOffset, RawRecord};

/// Performs the broker-side commit for one partition.
///
/// `offset` is the offset of the last processed message. Adapters translate it to
/// whatever the broker expects (Kafka stores the next offset to consume).
pub trait Committer: Send + Sync {
    fn commit(&self, partition: &Partition, offset: i64) -> Result<(), TransportError>;
}

/// Offset queries used when resolving start offsets at assignment time.
#[cfg_attr(test, mockall::automock)]
pub trait OffsetSource: Send + Sync {
    /// Low and high watermark of a partition.
    fn watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<(i64, i64), TransportError>;

    /// Committed position (next offset to consume) for the consumer group, if any.
    fn committed(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<Option<i64>, TransportError>;

    /// Earliest offset whose timestamp is >= `timestamp_ms`, if any.
    fn offset_for_timestamp(
        &self,
        partition: &Partition,
        timestamp_ms: i64,
        timeout: Duration,
    ) -> Result<Option<i64>, TransportError>;
}

/// Receives partition assignment changes from a transport.
///
/// Called from within the transport's rebalance callbacks, so implementations
/// must stay fast: only short, timeout-bounded offset queries are allowed.
pub trait AssignmentListener: Send + Sync {
    /// Partitions were assigned. Returns the start offsets to seed consumption with;
    /// partitions left out of the result start from the transport default.
    fn on_assigned(&self, source: &dyn OffsetSource, partitions: &[Partition])
        -> Vec<PartitionOffset>;

    /// Partitions were revoked.
    fn on_revoked(&self, partitions: &[Partition]);
}

/// A client connection serving exactly one subscription.
#[async_trait]
pub trait Transport: Committer + OffsetSource {
    /// Whether the broker knows the topic.
    fn topic_exists(&self, topic: &str, timeout: Duration) -> Result<bool, TransportError>;

    /// Start following `topic`; assignment changes are reported to `listener`.
    fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn AssignmentListener>,
    ) -> Result<(), TransportError>;

    /// Wait for the next record. Returns `Ok(None)` once `cancel` fires or the
    /// transport has been closed.
    async fn consume(&self, cancel: &CancellationToken)
        -> Result<Option<RawRecord>, TransportError>;

    /// Partitions currently assigned to this client.
    fn assignment(&self) -> Result<Vec<Partition>, TransportError>;

    /// Release the client. Called once the consumption loop has fully drained.
    fn close(&self);
}

/// Creates one transport per subscription.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Adapts a shared transport handle to the `Committer` a message closes over.
pub struct TransportCommitter(pub Arc<dyn Transport>);

impl Committer for TransportCommitter {
    fn commit(&self, partition: &Partition, offset: i64) -> Result<(), TransportError> {
        self.0.commit(partition, offset)
    }
}
