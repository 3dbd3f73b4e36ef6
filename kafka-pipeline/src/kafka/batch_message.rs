use std::collections::BTreeMap;

use tracing::warn;

use crate::kafka::message::{Committable, Message};
use crate::kafka::types::{Partition, PartitionOffset};

/// An ordered group of messages emitted by a Batch stage.
///
/// Messages keep their arrival order. Committing a batch commits only the
/// highest offset of each partition it contains, since committing offset N
/// implies every offset up to N has been processed.
pub struct Batch<T> {
    messages: Vec<Message<T>>,
}

impl<T> Batch<T> {
    pub fn new(messages: Vec<Message<T>>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message<T>] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message<T>> {
        self.messages.iter()
    }

    // consume this Batch and return its messages
    pub fn into_messages(self) -> Vec<Message<T>> {
        self.messages
    }

    /// Distinct partitions present in the batch, ordered by partition.
    pub fn partitions(&self) -> Vec<Partition> {
        self.last_per_partition().into_keys().collect()
    }

    /// Highest offset per partition present in the batch.
    pub fn max_offsets(&self) -> Vec<PartitionOffset> {
        self.last_per_partition()
            .into_iter()
            .map(|(partition, message)| PartitionOffset::new(partition, message.offset()))
            .collect()
    }

    /// Commit one broker offset per partition: that partition's highest offset in
    /// the batch. Every partition is committed independently; the result is true
    /// only when all of them succeeded.
    pub fn commit(&self, force: bool) -> bool {
        let mut all_ok = true;
        for (partition, message) in self.last_per_partition() {
            if !message.commit(force) {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = message.offset(),
                    batch_size = self.messages.len(),
                    "Batch commit failed for partition"
                );
                all_ok = false;
            }
        }
        all_ok
    }

    fn last_per_partition(&self) -> BTreeMap<Partition, &Message<T>> {
        let mut highest: BTreeMap<Partition, &Message<T>> = BTreeMap::new();
        for message in &self.messages {
            highest
                .entry(message.topic_partition().clone())
                .and_modify(|current| {
                    if message.offset() > current.offset() {
                        *current = message;
                    }
                })
                .or_insert(message);
        }
        highest
    }
}

impl<T> Clone for Batch<T> {
    fn clone(&self) -> Self {
        Self {
            messages: self.messages.clone(),
        }
    }
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self::new(vec![])
    }
}

impl<T> IntoIterator for Batch<T> {
    type Item = Message<T>;
    type IntoIter = std::vec::IntoIter<Message<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<T: Send + Sync + 'static> Committable for Batch<T> {
    fn commit(&self, force: bool) -> bool {
        Batch::commit(self, force)
    }

    fn commit_targets(&self) -> Vec<PartitionOffset> {
        self.max_offsets()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::test_utils::RecordingCommitter;
    use std::sync::Arc;

    fn batch_of(committer: &Arc<RecordingCommitter>, coords: &[(i32, i64)]) -> Batch<String> {
        Batch::new(
            coords
                .iter()
                .map(|(partition, offset)| {
                    Message::new(
                        Partition::new("test-topic", *partition),
                        *offset,
                        None,
                        None,
                        format!("{partition}-{offset}"),
                        committer.clone(),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_batch_preserves_arrival_order() {
        let committer = Arc::new(RecordingCommitter::new());
        let batch = batch_of(&committer, &[(1, 5), (0, 3), (1, 6), (0, 4)]);

        let offsets: Vec<(i32, i64)> = batch.iter().map(|m| (m.partition(), m.offset())).collect();
        assert_eq!(offsets, vec![(1, 5), (0, 3), (1, 6), (0, 4)]);
        assert_eq!(batch.len(), 4);
    }

    #[test]
    fn test_commit_collapses_to_highest_offset_per_partition() {
        let committer = Arc::new(RecordingCommitter::new());
        let batch = batch_of(&committer, &[(1, 5), (0, 3), (1, 7), (0, 4), (2, 1), (1, 6)]);

        assert!(batch.commit(false));

        let mut calls = committer.calls();
        calls.sort();
        assert_eq!(calls, vec![(0, 4), (1, 7), (2, 1)]);
    }

    #[test]
    fn test_commit_is_conjunction_of_partition_results() {
        let committer = Arc::new(RecordingCommitter::new());
        committer.fail_partition(1);
        let batch = batch_of(&committer, &[(0, 1), (1, 2), (2, 3)]);

        assert!(!batch.commit(false));

        // every partition was still attempted
        let mut calls = committer.calls();
        calls.sort();
        assert_eq!(calls, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_commit_twice_uses_cached_results() {
        let committer = Arc::new(RecordingCommitter::new());
        let batch = batch_of(&committer, &[(0, 1), (0, 2)]);

        assert!(batch.commit(false));
        assert!(batch.commit(false));
        assert_eq!(committer.calls(), vec![(0, 2)]);

        assert!(batch.commit(true));
        assert_eq!(committer.calls(), vec![(0, 2), (0, 2)]);
    }

    #[test]
    fn test_max_offsets_and_partitions() {
        let committer = Arc::new(RecordingCommitter::new());
        let batch = batch_of(&committer, &[(3, 10), (1, 2), (3, 8)]);

        assert_eq!(
            batch.partitions(),
            vec![Partition::new("test-topic", 1), Partition::new("test-topic", 3)]
        );
        assert_eq!(
            batch.max_offsets(),
            vec![
                PartitionOffset::new(Partition::new("test-topic", 1), 2),
                PartitionOffset::new(Partition::new("test-topic", 3), 10),
            ]
        );
    }

    #[test]
    fn test_empty_batch_commit_is_trivially_true() {
        let committer = Arc::new(RecordingCommitter::new());
        let batch: Batch<String> = Batch::default();

        assert!(batch.is_empty());
        assert!(batch.commit(false));
        assert!(committer.calls().is_empty());
    }
}
