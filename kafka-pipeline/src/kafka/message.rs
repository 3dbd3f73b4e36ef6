use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::kafka::metrics_consts::COMMITS_TOTAL;
use crate::kafka::transport::Committer;
use crate::kafka::types::{Partition, PartitionOffset, RawRecord};

/// Commit state of a message. Clones of a message share one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Uncommitted,
    Committed(bool),
}

/// Anything a Commit stage can commit: a single message or a batch.
pub trait Committable: Send + Sync + 'static {
    /// Commit the processed position. Returns false when the broker commit failed,
    /// meaning at-least-once delivery is not currently guaranteed for that partition.
    fn commit(&self, force: bool) -> bool;

    /// The (partition, offset) pairs a commit would cover.
    fn commit_targets(&self) -> Vec<PartitionOffset>;
}

struct CommitHandle {
    committer: Arc<dyn Committer>,
    state: Mutex<CommitState>,
}

impl CommitHandle {
    fn commit(&self, partition: &Partition, offset: i64, force: bool) -> bool {
        // The lock is held across the broker call so concurrent commits of the
        // same message collapse into one call.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if let (CommitState::Committed(ok), false) = (*state, force) {
            return ok;
        }

        let ok = match self.committer.commit(partition, offset) {
            Ok(()) => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Committed offset"
                );
                metrics::counter!(COMMITS_TOTAL, "status" => "success").increment(1);
                true
            }
            Err(e) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    error = ?e,
                    "Commit failed - at-least-once delivery not guaranteed for partition"
                );
                metrics::counter!(COMMITS_TOTAL, "status" => "failure").increment(1);
                false
            }
        };

        *state = CommitState::Committed(ok);
        ok
    }
}

/// An immutable record flowing through a pipeline, with a deferred commit capability
/// bound to the client that received it.
pub struct Message<T> {
    partition: Partition,
    offset: i64,
    key: Option<String>,
    timestamp_ms: Option<i64>,
    value: Arc<T>,
    commit: Arc<CommitHandle>,
}

impl<T> Message<T> {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<String>,
        timestamp_ms: Option<i64>,
        value: T,
        committer: Arc<dyn Committer>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            timestamp_ms,
            value: Arc::new(value),
            commit: Arc::new(CommitHandle {
                committer,
                state: Mutex::new(CommitState::Uncommitted),
            }),
        }
    }

    /// Build a message from a transport record and its decoded payload.
    pub fn from_record(record: RawRecord, value: T, committer: Arc<dyn Committer>) -> Self {
        let key = record.key_string();
        Self::new(
            record.partition,
            record.offset,
            key,
            record.timestamp_ms,
            value,
            committer,
        )
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn topic_partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp_ms
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Commit this message's exact (partition, offset).
    ///
    /// The broker is called at most once; later calls return the cached result
    /// unless `force` is set. Committing out of order can move the committed
    /// position past a message that is still being processed elsewhere.
    pub fn commit(&self, force: bool) -> bool {
        self.commit.commit(&self.partition, self.offset, force)
    }

    pub fn commit_state(&self) -> CommitState {
        *self
            .commit
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for Message<T> {
    fn clone(&self) -> Self {
        Self {
            partition: self.partition.clone(),
            offset: self.offset,
            key: self.key.clone(),
            timestamp_ms: self.timestamp_ms,
            value: self.value.clone(),
            commit: self.commit.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("key", &self.key)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("value", &self.value)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Committable for Message<T> {
    fn commit(&self, force: bool) -> bool {
        Message::commit(self, force)
    }

    fn commit_targets(&self) -> Vec<PartitionOffset> {
        vec![PartitionOffset::new(self.partition.clone(), self.offset)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::test_utils::RecordingCommitter;

    fn create_test_message(
        committer: &Arc<RecordingCommitter>,
        partition: i32,
        offset: i64,
    ) -> Message<String> {
        Message::new(
            Partition::new("test-topic", partition),
            offset,
            Some("test-key".to_string()),
            Some(1_700_000_000_000),
            "test-payload".to_string(),
            committer.clone(),
        )
    }

    #[test]
    fn test_commit_calls_broker_once() {
        let committer = Arc::new(RecordingCommitter::new());
        let message = create_test_message(&committer, 0, 42);

        assert_eq!(message.commit_state(), CommitState::Uncommitted);
        assert!(message.commit(false));
        assert!(message.commit(false));
        assert!(message.clone().commit(false));

        assert_eq!(committer.calls(), vec![(0, 42)]);
        assert_eq!(message.commit_state(), CommitState::Committed(true));
    }

    #[test]
    fn test_force_commit_calls_broker_again() {
        let committer = Arc::new(RecordingCommitter::new());
        let message = create_test_message(&committer, 1, 10);

        assert!(message.commit(false));
        assert!(message.commit(true));

        assert_eq!(committer.calls(), vec![(1, 10), (1, 10)]);
    }

    #[test]
    fn test_failed_commit_is_cached_until_forced() {
        let committer = Arc::new(RecordingCommitter::new());
        committer.fail_partition(2);
        let message = create_test_message(&committer, 2, 5);

        assert!(!message.commit(false));
        assert!(!message.commit(false));
        assert_eq!(message.commit_state(), CommitState::Committed(false));
        assert_eq!(committer.calls().len(), 1);

        committer.heal_partition(2);
        assert!(message.commit(true));
        assert_eq!(message.commit_state(), CommitState::Committed(true));
        assert_eq!(committer.calls().len(), 2);
    }

    #[test]
    fn test_message_accessors() {
        let committer = Arc::new(RecordingCommitter::new());
        let message = create_test_message(&committer, 3, 99);

        assert_eq!(message.topic(), "test-topic");
        assert_eq!(message.partition(), 3);
        assert_eq!(message.offset(), 99);
        assert_eq!(message.key(), Some("test-key"));
        assert_eq!(message.value(), "test-payload");
        assert_eq!(
            message.commit_targets(),
            vec![PartitionOffset::new(Partition::new("test-topic", 3), 99)]
        );
    }
}
