//! Test utilities: a recording committer and an in-memory broker implementing the
//! transport contract, used by unit tests and by the integration tests in `tests/`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::transport::{AssignmentListener, Committer, OffsetSource, Transport, TransportFactory};
use super::types::{Partition, RawRecord};
use crate::error::TransportError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Committer that records every call and can be told to fail per partition.
#[derive(Default)]
pub struct RecordingCommitter {
    calls: Mutex<Vec<(i32, i64)>>,
    failing: Mutex<HashSet<i32>>,
}

impl RecordingCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// (partition, offset) pairs in call order, failed calls included.
    pub fn calls(&self) -> Vec<(i32, i64)> {
        lock(&self.calls).clone()
    }

    pub fn fail_partition(&self, partition: i32) {
        lock(&self.failing).insert(partition);
    }

    pub fn heal_partition(&self, partition: i32) {
        lock(&self.failing).remove(&partition);
    }
}

impl Committer for RecordingCommitter {
    fn commit(&self, partition: &Partition, offset: i64) -> Result<(), TransportError> {
        lock(&self.calls).push((partition.partition_number(), offset));
        if lock(&self.failing).contains(&partition.partition_number()) {
            return Err(TransportError::Other(anyhow!(
                "injected commit failure for {partition}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    timestamp_ms: i64,
}

#[derive(Default)]
struct PartitionLog {
    low: i64,
    next: i64,
    records: Vec<StoredRecord>,
}

impl PartitionLog {
    fn get(&self, offset: i64) -> Option<&StoredRecord> {
        if offset < self.low || offset >= self.next {
            return None;
        }
        self.records.iter().find(|r| r.offset == offset)
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<PartitionLog>>,
    /// Next offset to consume, Kafka style
    committed: HashMap<Partition, i64>,
    /// Processed offsets in commit order
    commit_log: Vec<(Partition, i64)>,
    failing_commits: HashSet<i32>,
    failing_offset_queries: bool,
    failing_consumes: usize,
}

/// A single-group in-memory broker. Every transport created from it is assigned
/// all partitions of the topic it subscribes to.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    transports_created: AtomicUsize,
    transports_closed: AtomicUsize,
    records_consumed: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        lock(&self.state).topics.insert(
            topic.to_string(),
            (0..partitions).map(|_| PartitionLog::default()).collect(),
        );
    }

    /// Append a record stamped with the current time. Returns its offset.
    pub fn produce(&self, topic: &str, partition: i32, key: Option<&str>, payload: &str) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.produce_at(topic, partition, key, payload, now)
    }

    pub fn produce_at(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&str>,
        payload: &str,
        timestamp_ms: i64,
    ) -> i64 {
        let offset = {
            let mut state = lock(&self.state);
            let log = state
                .topics
                .get_mut(topic)
                .and_then(|logs| logs.get_mut(partition as usize))
                .unwrap_or_else(|| panic!("unknown partition {topic}:{partition}"));

            let offset = log.next;
            log.records.push(StoredRecord {
                offset,
                key: key.map(|k| k.as_bytes().to_vec()),
                payload: payload.as_bytes().to_vec(),
                timestamp_ms,
            });
            log.next += 1;
            offset
        };
        self.notify.notify_waiters();
        offset
    }

    /// Drop every record below `low`, like retention would.
    pub fn truncate(&self, topic: &str, partition: i32, low: i64) {
        let mut state = lock(&self.state);
        if let Some(log) = state
            .topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
        {
            log.low = low.min(log.next);
            let low = log.low;
            log.records.retain(|r| r.offset >= low);
        }
    }

    /// Pre-set the group's committed position (next offset to consume).
    pub fn set_committed(&self, topic: &str, partition: i32, next_offset: i64) {
        lock(&self.state)
            .committed
            .insert(Partition::new(topic, partition), next_offset);
    }

    /// Committed position (next offset to consume), if any.
    pub fn committed_position(&self, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state)
            .committed
            .get(&Partition::new(topic, partition))
            .copied()
    }

    /// Successful commits as (partition, processed offset), in commit order.
    pub fn commits(&self) -> Vec<(i32, i64)> {
        lock(&self.state)
            .commit_log
            .iter()
            .map(|(p, offset)| (p.partition_number(), *offset))
            .collect()
    }

    pub fn fail_commits(&self, partition: i32) {
        lock(&self.state).failing_commits.insert(partition);
    }

    pub fn heal_commits(&self, partition: i32) {
        lock(&self.state).failing_commits.remove(&partition);
    }

    pub fn fail_offset_queries(&self, failing: bool) {
        lock(&self.state).failing_offset_queries = failing;
    }

    /// Make the next `count` consume calls return an error.
    pub fn fail_next_consumes(&self, count: usize) {
        lock(&self.state).failing_consumes = count;
        self.notify.notify_waiters();
    }

    pub fn transports_created(&self) -> usize {
        self.transports_created.load(Ordering::SeqCst)
    }

    pub fn transports_closed(&self) -> usize {
        self.transports_closed.load(Ordering::SeqCst)
    }

    /// Records handed out by all transports so far.
    pub fn records_consumed(&self) -> usize {
        self.records_consumed.load(Ordering::SeqCst)
    }

    pub fn factory(self: &Arc<Self>) -> Arc<MemoryTransportFactory> {
        Arc::new(MemoryTransportFactory {
            broker: self.clone(),
        })
    }

    fn watermarks(&self, partition: &Partition) -> Result<(i64, i64), TransportError> {
        let state = lock(&self.state);
        if state.failing_offset_queries {
            return Err(TransportError::Timeout {
                operation: "fetch_watermarks",
                partition: partition.partition_number(),
            });
        }
        state
            .topics
            .get(partition.topic())
            .and_then(|logs| logs.get(partition.partition_number() as usize))
            .map(|log| (log.low, log.next))
            .ok_or_else(|| TransportError::Other(anyhow!("unknown partition {partition}")))
    }
}

pub struct MemoryTransportFactory {
    broker: Arc<InMemoryBroker>,
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self) -> Result<Arc<dyn Transport>, TransportError> {
        self.broker.transports_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryTransport {
            broker: self.broker.clone(),
            state: Mutex::new(TransportState::default()),
        }))
    }
}

#[derive(Default)]
struct TransportState {
    positions: BTreeMap<Partition, i64>,
    cursor: usize,
    listener: Option<Arc<dyn AssignmentListener>>,
    closed: bool,
}

pub struct MemoryTransport {
    broker: Arc<InMemoryBroker>,
    state: Mutex<TransportState>,
}

impl MemoryTransport {
    fn next_record(&self) -> Result<Option<RawRecord>, TransportError> {
        let broker_state = lock(&self.broker.state);
        let mut state = lock(&self.state);
        let partitions: Vec<Partition> = state.positions.keys().cloned().collect();
        if partitions.is_empty() {
            return Ok(None);
        }

        for step in 0..partitions.len() {
            let index = (state.cursor + step) % partitions.len();
            let partition = &partitions[index];
            let Some(log) = broker_state
                .topics
                .get(partition.topic())
                .and_then(|logs| logs.get(partition.partition_number() as usize))
            else {
                continue;
            };

            let position = state.positions.get(partition).copied().unwrap_or(log.low);
            let position = position.max(log.low);
            if let Some(record) = log.get(position) {
                let record = RawRecord {
                    partition: partition.clone(),
                    offset: record.offset,
                    key: record.key.clone(),
                    payload: Some(record.payload.clone()),
                    timestamp_ms: Some(record.timestamp_ms),
                };
                state.positions.insert(partition.clone(), position + 1);
                state.cursor = index + 1;
                self.broker.records_consumed.fetch_add(1, Ordering::SeqCst);
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    fn take_injected_failure(&self) -> bool {
        let mut state = lock(&self.broker.state);
        if state.failing_consumes > 0 {
            state.failing_consumes -= 1;
            return true;
        }
        false
    }
}

impl Committer for MemoryTransport {
    fn commit(&self, partition: &Partition, offset: i64) -> Result<(), TransportError> {
        let mut state = lock(&self.broker.state);
        if state.failing_commits.contains(&partition.partition_number()) {
            return Err(TransportError::Other(anyhow!(
                "injected commit failure for {partition}"
            )));
        }
        state.committed.insert(partition.clone(), offset + 1);
        state.commit_log.push((partition.clone(), offset));
        Ok(())
    }
}

impl OffsetSource for MemoryTransport {
    fn watermarks(
        &self,
        partition: &Partition,
        _timeout: Duration,
    ) -> Result<(i64, i64), TransportError> {
        self.broker.watermarks(partition)
    }

    fn committed(
        &self,
        partition: &Partition,
        _timeout: Duration,
    ) -> Result<Option<i64>, TransportError> {
        let state = lock(&self.broker.state);
        if state.failing_offset_queries {
            return Err(TransportError::Timeout {
                operation: "committed_offsets",
                partition: partition.partition_number(),
            });
        }
        Ok(state.committed.get(partition).copied())
    }

    fn offset_for_timestamp(
        &self,
        partition: &Partition,
        timestamp_ms: i64,
        _timeout: Duration,
    ) -> Result<Option<i64>, TransportError> {
        let state = lock(&self.broker.state);
        if state.failing_offset_queries {
            return Err(TransportError::Timeout {
                operation: "offsets_for_times",
                partition: partition.partition_number(),
            });
        }
        Ok(state
            .topics
            .get(partition.topic())
            .and_then(|logs| logs.get(partition.partition_number() as usize))
            .and_then(|log| {
                log.records
                    .iter()
                    .find(|r| r.timestamp_ms >= timestamp_ms)
                    .map(|r| r.offset)
            }))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn topic_exists(&self, topic: &str, _timeout: Duration) -> Result<bool, TransportError> {
        Ok(lock(&self.broker.state).topics.contains_key(topic))
    }

    fn subscribe(
        &self,
        topic: &str,
        listener: Arc<dyn AssignmentListener>,
    ) -> Result<(), TransportError> {
        // default start: committed position, else the low watermark
        let mut positions = BTreeMap::new();
        {
            let broker_state = lock(&self.broker.state);
            let logs = broker_state
                .topics
                .get(topic)
                .ok_or_else(|| TransportError::Other(anyhow!("unknown topic {topic}")))?;
            for (index, log) in logs.iter().enumerate() {
                let partition = Partition::new(topic, index as i32);
                let start = broker_state
                    .committed
                    .get(&partition)
                    .copied()
                    .unwrap_or(log.low);
                positions.insert(partition, start);
            }
        }

        let partitions: Vec<Partition> = positions.keys().cloned().collect();
        for seed in listener.on_assigned(self, &partitions) {
            positions.insert(seed.partition().clone(), seed.offset());
        }

        let mut state = lock(&self.state);
        state.positions = positions;
        state.listener = Some(listener);
        Ok(())
    }

    async fn consume(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<RawRecord>, TransportError> {
        loop {
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() || lock(&self.state).closed {
                return Ok(None);
            }
            if self.take_injected_failure() {
                return Err(TransportError::Other(anyhow!("injected consume failure")));
            }
            if let Some(record) = self.next_record()? {
                return Ok(Some(record));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    fn assignment(&self) -> Result<Vec<Partition>, TransportError> {
        let state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(state.positions.keys().cloned().collect())
    }

    fn close(&self) {
        let (listener, partitions) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            let partitions: Vec<Partition> = state.positions.keys().cloned().collect();
            state.positions.clear();
            (state.listener.take(), partitions)
        };

        if let Some(listener) = listener {
            listener.on_revoked(&partitions);
        }
        self.broker.transports_closed.fetch_add(1, Ordering::SeqCst);
        self.broker.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::types::PartitionOffset;

    struct FixedSeeds(Vec<PartitionOffset>);

    impl AssignmentListener for FixedSeeds {
        fn on_assigned(&self, _: &dyn OffsetSource, _: &[Partition]) -> Vec<PartitionOffset> {
            self.0.clone()
        }

        fn on_revoked(&self, _: &[Partition]) {}
    }

    #[tokio::test]
    async fn test_memory_transport_starts_at_seeded_offset() {
        let broker = InMemoryBroker::new();
        broker.create_topic("orders", 1);
        for i in 0..5 {
            broker.produce("orders", 0, None, &format!("m{i}"));
        }

        let transport = broker.factory().create().unwrap();
        transport
            .subscribe(
                "orders",
                Arc::new(FixedSeeds(vec![PartitionOffset::new(
                    Partition::new("orders", 0),
                    3,
                )])),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let record = transport.consume(&cancel).await.unwrap().unwrap();
        assert_eq!(record.offset, 3);
        let record = transport.consume(&cancel).await.unwrap().unwrap();
        assert_eq!(record.offset, 4);
    }

    #[tokio::test]
    async fn test_memory_transport_commit_stores_next_offset() {
        let broker = InMemoryBroker::new();
        broker.create_topic("orders", 2);
        let transport = broker.factory().create().unwrap();

        transport.commit(&Partition::new("orders", 1), 9).unwrap();

        assert_eq!(broker.committed_position("orders", 1), Some(10));
        assert_eq!(broker.commits(), vec![(1, 9)]);
    }

    #[tokio::test]
    async fn test_memory_transport_consume_returns_none_on_cancel() {
        let broker = InMemoryBroker::new();
        broker.create_topic("orders", 1);
        let transport = broker.factory().create().unwrap();
        transport
            .subscribe("orders", Arc::new(FixedSeeds(vec![])))
            .unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            let transport = transport.clone();
            tokio::spawn(async move { transport.consume(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().unwrap().is_none());
    }

    #[test]
    fn test_truncate_moves_low_watermark() {
        let broker = InMemoryBroker::new();
        broker.create_topic("orders", 1);
        for i in 0..10 {
            broker.produce("orders", 0, None, &format!("m{i}"));
        }
        broker.truncate("orders", 0, 4);

        let transport = broker.factory().create().unwrap();
        let (low, high) = transport
            .watermarks(&Partition::new("orders", 0), Duration::from_secs(1))
            .unwrap();
        assert_eq!((low, high), (4, 10));
    }
}
